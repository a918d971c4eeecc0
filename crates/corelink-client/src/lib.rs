//! Asynchronous RPC client for a remote computing agent.
//!
//! One [`ConnectionManager`] owns at most one live bridge; each bridge
//! runs a worker task that talks the agent's XML GUI-RPC protocol over
//! TCP and a dispatch task that feeds results back to registered
//! observers and data receivers. All public operations enqueue and
//! return immediately; results arrive through the callback traits.
//!
//! Protocol types and the wire codec live in [`corelink_proto`],
//! re-exported here as [`proto`].

pub mod bridge;
pub mod cache;
pub mod error;
pub mod manager;
pub mod options;
pub mod scheduler;
pub mod transport;
pub mod worker;

pub use corelink_proto as proto;

pub use bridge::{ClientHandle, ClientReplyReceiver, ConnectionStatusObserver, Lifecycle};
pub use error::{ClientError, Result};
pub use manager::ConnectionManager;
pub use options::{ClientOptions, ConnectivityStatus};
pub use transport::{RpcStream, TcpTransport, TcpTransportFactory, Transport, TransportFactory};
