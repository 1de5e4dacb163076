//! Trust-anchor key broker daemon.
//!
//! Local clients connect over TCP and speak a small framed request/response
//! protocol. The daemon keeps a registry of key records arranged as a forest
//! under a well-known root, persists it to a single store file, and relays
//! every operation it does not serve itself to the hardware trust anchor.
//!
//! - [`record`] and [`detect`] define the store file encoding and tell the
//!   legacy and versioned layouts apart.
//! - [`store`] holds the in-memory hierarchy and enforces its invariants.
//! - [`backing`] locks the store file and serializes all access to the
//!   hierarchy behind one handle.
//! - [`packet`] frames requests and responses on a client stream.
//! - [`pool`] bounds concurrent connections and tracks their state.
//! - [`context`] maps client contexts to the connection that owns them.
//! - [`anchor`] is the passthrough to the trust-anchor device.
//! - [`dispatcher`] accepts connections and routes requests.
//! - [`daemon`], [`config`], and [`cli`] assemble a running daemon.

pub mod anchor;
pub mod backing;
pub mod cli;
pub mod config;
pub mod context;
pub mod daemon;
pub mod detect;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod pool;
pub mod record;
pub mod store;
pub mod transport;
