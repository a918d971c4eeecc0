//! Protocol layer for the core-client GUI RPC: typed records for
//! everything the remote agent reports (projects, tasks, transfers,
//! messages, host info, modes) and a tolerant XML codec for its
//! request/reply documents.
//!
//! This crate performs no I/O. The transport and connection lifecycle
//! live in `corelink-client`.

pub mod codec;
pub mod error;
pub mod types;

pub use error::{CodecError, DisconnectCause, UnsupportedOpError};
pub use types::{
    AppRecord, CcState, CcStatus, DataKind, HostInfo, MessageRecord, ProgressStage, ProjectOp,
    ProjectRecord, RemoteEndpoint, ResultInfo, RunMode, TaskOp, TaskRecord, TransferOp,
    TransferRecord, VersionInfo, WorkunitRecord, apply_share_fractions,
};
