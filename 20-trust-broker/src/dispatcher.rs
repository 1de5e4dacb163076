//! Connection dispatcher.
//!
//! The dispatcher thread does nothing but accept. Each accepted connection
//! is admitted against the [`WorkerPool`] or refused on the spot; admitted
//! ones get a dedicated worker thread that frames requests, routes them to
//! the key store, the context table, or the trust anchor, and writes one
//! response per request.
//!
//! Request-level failures (unknown handle, bad payload, store write error)
//! are answered with a result code and the connection stays up. Framing
//! failures close the connection. Nothing here affects other connections.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, info_span, warn};

use crate::anchor::{AnchorError, TrustAnchor};
use crate::backing::StoreHandle;
use crate::config::DispatchConfig;
use crate::context::{ContextError, ContextId, ContextTable};
use crate::packet::{
    FrameError, Operation, PacketFramer, RequestEnvelope, ResponseEnvelope, ResultCode,
    write_response,
};
use crate::pool::{ConnectionState, SlotGuard, SlotId, SlotLabel, WorkerPool};
use crate::record::{Handle, Layout, StoreReader, decode_record, encode_record};
use crate::store::StoreError;
use crate::transport::Connection;

const DRAIN_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Shared daemon state handed to every worker.
pub struct DaemonState {
    pub store: Arc<StoreHandle>,
    pub contexts: ContextTable,
    pub anchor: Box<dyn TrustAnchor>,
    pub config: DispatchConfig,
}

/// What a worker knows about the connection it serves.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub slot: SlotId,
    /// Peer is not on this machine; the remote allow-list applies.
    pub remote: bool,
}

impl DaemonState {
    pub fn new(
        store: Arc<StoreHandle>,
        anchor: Box<dyn TrustAnchor>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            contexts: ContextTable::new(),
            anchor,
            config,
        }
    }

    fn remote_permitted(&self, operation: Operation) -> bool {
        match operation {
            Operation::OpenContext | Operation::CloseContext => true,
            other => self.config.remote_ops.contains(&other.id()),
        }
    }

    /// Serves one request and builds its response.
    pub fn handle_request(&self, session: &Session, request: RequestEnvelope) -> ResponseEnvelope {
        let operation = Operation::from_id(request.operation);
        let context = request.context;

        if session.remote && !self.remote_permitted(operation) {
            warn!(op = request.operation, "operation not permitted for remote peers");
            return ResponseEnvelope::error(ResultCode::NotPermitted, context);
        }

        if operation != Operation::OpenContext {
            if let Err(err) = self.contexts.verify(session.slot, context) {
                debug!(
                    error = %err,
                    class = %err.class(),
                    "request on a foreign or closed context"
                );
                return ResponseEnvelope::error(ResultCode::UnknownContext, context);
            }
        }

        let result = match operation {
            Operation::OpenContext => return self.open_context(session.slot, context),
            Operation::CloseContext => self
                .contexts
                .close(session.slot, context)
                .map(|()| Vec::new())
                .map_err(|_| ResultCode::UnknownContext),
            Operation::RegisterKey => self.register_key(&request.payload),
            Operation::UnregisterKey => self.unregister_key(&request.payload),
            Operation::GetRegisteredKey => self.get_registered_key(&request.payload),
            Operation::EnumerateKeys => Ok(self.enumerate_keys()),
            Operation::FlushStore => self.store.flush().map(|()| Vec::new()).map_err(store_code),
            Operation::Anchor(ordinal) => self
                .anchor
                .execute(context, ordinal, &request.payload)
                .map_err(|err| anchor_code(ordinal, err)),
        };

        match result {
            Ok(payload) => ResponseEnvelope::ok(context, payload),
            Err(code) => ResponseEnvelope::error(code, context),
        }
    }

    fn open_context(&self, slot: SlotId, requested: ContextId) -> ResponseEnvelope {
        match self.contexts.open(slot) {
            Ok(opened) => {
                debug!(context = opened, "opened client context");
                ResponseEnvelope::ok(opened, Vec::new())
            }
            Err(ContextError::AlreadyOpen(existing)) => {
                ResponseEnvelope::error(ResultCode::ContextAlreadyOpen, existing)
            }
            Err(ContextError::Unknown(_)) => {
                ResponseEnvelope::error(ResultCode::UnknownContext, requested)
            }
        }
    }

    fn register_key(&self, payload: &[u8]) -> Result<Vec<u8>, ResultCode> {
        let mut reader = StoreReader::new(payload, payload.len() as u64);
        let record = decode_record(&mut reader, Layout::Versioned).map_err(|err| {
            debug!(error = %err, "malformed key record payload");
            ResultCode::BadPayload
        })?;
        if reader.remaining() != 0 {
            return Err(ResultCode::BadPayload);
        }
        self.store.register(record).map_err(store_code)?;
        Ok(Vec::new())
    }

    fn unregister_key(&self, payload: &[u8]) -> Result<Vec<u8>, ResultCode> {
        let handle = Handle::from_slice(payload).ok_or(ResultCode::BadPayload)?;
        self.store.unregister(&handle).map_err(store_code)?;
        Ok(Vec::new())
    }

    fn get_registered_key(&self, payload: &[u8]) -> Result<Vec<u8>, ResultCode> {
        let handle = Handle::from_slice(payload).ok_or(ResultCode::BadPayload)?;
        let record = self.store.lookup(&handle).ok_or(ResultCode::UnknownHandle)?;
        encode_record(&record, Layout::Versioned).map_err(|_| ResultCode::InvalidRecord)
    }

    fn enumerate_keys(&self) -> Vec<u8> {
        let handles = self.store.handles();
        let mut payload = Vec::with_capacity(4 + handles.len() * 16);
        payload.extend_from_slice(&(handles.len() as u32).to_be_bytes());
        for handle in &handles {
            payload.extend_from_slice(handle.as_bytes());
        }
        payload
    }
}

fn store_code(err: StoreError) -> ResultCode {
    let code = match &err {
        StoreError::DuplicateHandle(_) => ResultCode::DuplicateHandle,
        StoreError::UnknownParent { .. } => ResultCode::UnknownParent,
        StoreError::UnknownHandle(_) => ResultCode::UnknownHandle,
        StoreError::HasChildren { .. } => ResultCode::HasChildren,
        StoreError::RootKeyParent { .. } | StoreError::InvalidRecord { .. } => {
            ResultCode::InvalidRecord
        }
        StoreError::AmbiguousLayout | StoreError::CorruptStore(_) => ResultCode::StoreFormat,
        StoreError::ReadFailed(_) | StoreError::WriteFailed(_) => ResultCode::StoreIo,
    };
    debug!(error = %err, class = %err.class(), "store request failed");
    code
}

fn anchor_code(ordinal: u32, err: AnchorError) -> ResultCode {
    warn!(ordinal, error = %err, class = %err.class(), "trust anchor command failed");
    ResultCode::AnchorFailure
}

/// Stops a running [`Dispatcher`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    pool: Arc<WorkerPool>,
    wake: SocketAddr,
}

impl ShutdownHandle {
    /// Refuses new connections and closes every live one.
    ///
    /// [`Dispatcher::run`] returns once all workers have exited.
    pub fn shutdown(&self) {
        for (slot, peer) in self.pool.labels() {
            debug!(slot, %peer, "closing connection for shutdown");
        }
        let closed = self.pool.begin_shutdown();
        info!(closed, "shutdown requested");
        // The accept loop only notices the flag once accept returns.
        if let Err(err) = TcpStream::connect_timeout(&self.wake, Duration::from_secs(1)) {
            debug!(error = %err, "could not wake the accept loop");
        }
    }
}

pub struct Dispatcher {
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    state: Arc<DaemonState>,
}

impl Dispatcher {
    pub fn new(
        listener: TcpListener,
        store: Arc<StoreHandle>,
        anchor: Box<dyn TrustAnchor>,
        config: DispatchConfig,
    ) -> Self {
        let pool = WorkerPool::new(config.max_threads);
        Self {
            listener,
            pool,
            state: Arc::new(DaemonState::new(store, anchor, config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool)
    }

    pub fn state(&self) -> Arc<DaemonState> {
        Arc::clone(&self.state)
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let mut wake = self.listener.local_addr()?;
        if wake.ip().is_unspecified() {
            let loopback = match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            wake.set_ip(loopback);
        }
        Ok(ShutdownHandle {
            pool: Arc::clone(&self.pool),
            wake,
        })
    }

    /// Accepts connections until shutdown, then waits for every worker and
    /// flushes the store.
    pub fn run(self) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, max_threads = self.pool.max_threads(), "accepting connections");

        for stream in self.listener.incoming() {
            if self.pool.is_shutdown() {
                break;
            }
            match stream {
                Ok(stream) => {
                    self.admit(stream);
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }

        while !self.pool.wait_idle_timeout(DRAIN_REPORT_INTERVAL) {
            info!(active = self.pool.active_count(), "waiting for workers to finish");
        }
        self.state
            .store
            .flush()
            .context("failed to flush key store at shutdown")?;
        info!("dispatcher stopped");
        Ok(())
    }

    /// Admits `conn` and hands it to a new worker, or refuses it.
    ///
    /// Returns the state the connection reached: `Admitted` when a worker
    /// took it, `Rejected` when the pool refused it.
    pub fn admit<C: Connection>(&self, conn: C) -> ConnectionState {
        let accepted = ConnectionState::Accepted;
        let label = SlotLabel::new(&conn.peer_label());
        let closer = match conn.closer() {
            Ok(closer) => closer,
            Err(err) => {
                warn!(peer = %label, error = %err, "cannot track connection, refusing it");
                return transition(accepted, ConnectionState::Rejected);
            }
        };

        let guard = match self.pool.try_admit(label, closer) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(peer = %label, error = %err, class = %err.class(), "connection rejected");
                return transition(accepted, ConnectionState::Rejected);
            }
        };
        let admitted = transition(accepted, ConnectionState::Admitted);
        let slot = guard.id();
        info!(slot, peer = %label, "connection admitted");

        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name(format!("tcsd-worker-{slot}"))
            .spawn(move || serve_connection(conn, guard, admitted, state));
        match spawned {
            Ok(_) => admitted,
            Err(err) => {
                // The closure, and with it the slot guard, was dropped.
                error!(slot, error = %err, "failed to spawn worker thread");
                let closing = transition(admitted, ConnectionState::Closing);
                transition(closing, ConnectionState::Closed)
            }
        }
    }
}

/// Moves a connection along its lifecycle, refusing edges the state
/// machine does not allow.
fn transition(current: ConnectionState, next: ConnectionState) -> ConnectionState {
    match current.advance(next) {
        Ok(next) => {
            debug!(from = ?current, to = ?next, "connection state");
            next
        }
        Err(err) => {
            error!(error = %err, "refusing connection state change");
            current
        }
    }
}

/// Worker body: serve requests until the stream closes or fails.
fn serve_connection<C: Connection>(
    mut conn: C,
    guard: SlotGuard,
    admitted: ConnectionState,
    state: Arc<DaemonState>,
) {
    let slot = guard.id();
    let span = info_span!("worker", slot, peer = %guard.label());
    let _entered = span.enter();

    let mut current = transition(admitted, ConnectionState::Serving);
    if let Err(err) = conn.set_read_timeout(state.config.read_timeout) {
        warn!(error = %err, "failed to set read timeout");
    }
    let session = Session {
        slot,
        remote: !conn.is_local(),
    };
    let mut framer = PacketFramer::new(state.config.max_payload);

    let outcome = loop {
        match framer.read_packet(&mut conn) {
            Ok(request) => {
                let response = state.handle_request(&session, request);
                if let Err(err) = write_response(&mut conn, &response) {
                    break Err(FrameError::Io(err));
                }
            }
            Err(FrameError::IncompletePacket) => continue,
            Err(FrameError::Closed) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    current = transition(current, ConnectionState::Closing);
    match outcome {
        Ok(()) => debug!("client closed the connection"),
        Err(err @ FrameError::OversizedPacket { .. }) => {
            warn!(error = %err, class = %err.class(), "dropping client")
        }
        Err(err) => debug!(error = %err, "connection ended with error"),
    }
    if let Some(context) = state.contexts.release_slot(slot) {
        debug!(context, "released client context");
    }

    drop(conn);
    drop(guard);
    transition(current, ConnectionState::Closed);
    info!("connection closed");
}
