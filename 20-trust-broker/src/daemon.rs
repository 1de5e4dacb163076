//! Daemon startup: open the store, pick the trust anchor, bind the listener.

use std::net::TcpListener;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::anchor::{DeviceAnchor, TrustAnchor, UnavailableAnchor};
use crate::backing::{PsFile, StoreHandle};
use crate::config::{CorruptStorePolicy, DaemonConfig};
use crate::dispatcher::Dispatcher;
use crate::record::Layout;
use crate::store::{KeyStore, StoreError};

/// Opens and loads the system store named by `config`.
pub fn open_store(config: &DaemonConfig) -> Result<StoreHandle> {
    let mut file = PsFile::open(&config.store_path)?;
    let store = match file.load() {
        Ok(store) => store,
        Err(err @ StoreError::CorruptStore(_))
            if config.on_corrupt_store == CorruptStorePolicy::Empty =>
        {
            warn!(
                path = %file.path().display(),
                error = %err,
                "store file is corrupt, starting with an empty store"
            );
            KeyStore::new(Layout::Legacy)
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to load key store {}", config.store_path.display())
            });
        }
    };
    info!(
        path = %file.path().display(),
        layout = %store.layout(),
        keys = store.len(),
        "loaded key store"
    );
    Ok(StoreHandle::new(store, file, config.flush))
}

/// The configured device, or a stand-in that fails every command.
pub fn open_anchor(config: &DaemonConfig) -> Box<dyn TrustAnchor> {
    let Some(path) = &config.device else {
        info!("running without a trust anchor device");
        return Box::new(UnavailableAnchor);
    };
    match DeviceAnchor::open(path) {
        Ok(device) => {
            info!(path = %device.path().display(), "opened trust anchor device");
            Box::new(device)
        }
        Err(err) => {
            warn!(error = %err, "trust anchor unavailable, its commands will fail");
            Box::new(UnavailableAnchor)
        }
    }
}

/// Builds a ready-to-run dispatcher from `config`.
pub fn start(config: &DaemonConfig) -> Result<Dispatcher> {
    let store = Arc::new(open_store(config)?);
    let anchor = open_anchor(config);
    let listener = TcpListener::bind(config.listen)
        .with_context(|| format!("failed to bind {}", config.listen))?;
    Ok(Dispatcher::new(listener, store, anchor, config.dispatch()))
}
