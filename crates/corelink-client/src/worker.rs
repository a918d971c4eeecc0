//! Worker engine: one tokio task per bridge that owns the transport
//! and the state cache and processes requests strictly in FIFO order.
//!
//! All network traffic happens here, at most one RPC in flight. Callers
//! enqueue [`WorkerRequest`]s and receive results as [`WorkerEvent`]s
//! on a separate channel consumed by the bridge dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use corelink_proto::{
    CcStatus, CodecError, DataKind, DisconnectCause, HostInfo, MessageRecord, ProgressStage,
    ProjectOp, ProjectRecord, RemoteEndpoint, RunMode, TaskOp, TaskRecord, TransferOp,
    TransferRecord, VersionInfo,
};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cache::{MergeOutcome, StateCache};
use crate::error::{ClientError, Result};
use crate::options::ClientOptions;
use crate::transport::{Transport, TransportFactory};

/// Identity of a registered data receiver: the address of its `Arc`
/// allocation. Stable for the lifetime of the registration.
pub type ReceiverId = usize;

/// Which agent mode a mode-change request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelector {
    Run,
    Network,
    Gpu,
}

/// Cancellation epoch captured when a request is enqueued. The worker
/// drops the request if the receiver's epoch moved on before it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStamp {
    pub receiver: ReceiverId,
    pub epoch: u64,
}

/// Per-receiver cancellation epochs, shared between the bridge handle
/// (which bumps them) and the worker (which checks queued requests
/// against them). In-flight operations are never preempted.
#[derive(Default)]
pub struct CancelLedger {
    epochs: Mutex<HashMap<ReceiverId, u64>>,
}

impl CancelLedger {
    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<ReceiverId, u64>> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current stamp for a receiver, captured at enqueue time.
    pub fn stamp(&self, receiver: ReceiverId) -> EpochStamp {
        let epoch = self.guard().get(&receiver).copied().unwrap_or(0);
        EpochStamp { receiver, epoch }
    }

    /// Invalidates every request the receiver has queued so far.
    /// Requests enqueued afterwards capture the new epoch and run.
    pub fn cancel(&self, receiver: ReceiverId) {
        *self.guard().entry(receiver).or_insert(0) += 1;
    }

    pub fn is_current(&self, stamp: EpochStamp) -> bool {
        self.guard().get(&stamp.receiver).copied().unwrap_or(0) == stamp.epoch
    }

    /// Drops the bookkeeping for an unregistered receiver.
    pub fn forget(&self, receiver: ReceiverId) {
        self.guard().remove(&receiver);
    }
}

/// One queued unit of work for the worker task.
pub struct WorkerRequest {
    pub kind: RequestKind,
    pub stamp: Option<EpochStamp>,
}

impl WorkerRequest {
    pub fn new(kind: RequestKind) -> Self {
        Self { kind, stamp: None }
    }

    pub fn stamped(kind: RequestKind, stamp: EpochStamp) -> Self {
        Self {
            kind,
            stamp: Some(stamp),
        }
    }
}

pub enum RequestKind {
    Connect {
        endpoint: RemoteEndpoint,
        retrieve_initial_data: bool,
    },
    Disconnect,
    ShutdownCore,
    Update {
        kind: DataKind,
        target: Option<ReceiverId>,
    },
    SetMode {
        selector: ModeSelector,
        mode: RunMode,
        duration: f64,
        target: Option<ReceiverId>,
    },
    RunBenchmarks,
    NetworkAvailable,
    ProjectOp {
        op: ProjectOp,
        url: String,
        target: Option<ReceiverId>,
    },
    TaskOp {
        op: TaskOp,
        url: String,
        name: String,
        target: Option<ReceiverId>,
    },
    TransferOp {
        op: TransferOp,
        url: String,
        name: String,
        target: Option<ReceiverId>,
    },
}

/// Result of a processed request, consumed by the bridge dispatcher.
/// `target = None` means broadcast to every registered receiver.
pub enum WorkerEvent {
    Progress(ProgressStage),
    Connected {
        endpoint_id: String,
        version: Option<VersionInfo>,
    },
    Disconnected {
        endpoint_id: String,
        cause: DisconnectCause,
    },
    ClientMode {
        status: CcStatus,
        target: Option<ReceiverId>,
    },
    HostInfo {
        info: HostInfo,
        target: Option<ReceiverId>,
    },
    Projects {
        projects: Vec<ProjectRecord>,
        target: Option<ReceiverId>,
    },
    Tasks {
        tasks: Vec<TaskRecord>,
        target: Option<ReceiverId>,
    },
    Transfers {
        transfers: Vec<TransferRecord>,
        target: Option<ReceiverId>,
    },
    Messages {
        messages: Vec<MessageRecord>,
        target: Option<ReceiverId>,
    },
}

struct Session {
    transport: Box<dyn Transport + Send>,
    endpoint: RemoteEndpoint,
    version: Option<VersionInfo>,
}

pub struct Worker {
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    factory: Arc<dyn TransportFactory>,
    options: ClientOptions,
    ledger: Arc<CancelLedger>,
    /// GPU presence reported by the last full state fetch, shared with
    /// the bridge handle. Cleared on disconnect.
    have_gpu: Arc<AtomicBool>,
    session: Option<Session>,
    cache: StateCache,
}

impl Worker {
    /// Spawns the worker task; returns the request queue and the event
    /// stream. The task exits when the queue closes.
    pub fn spawn(
        factory: Arc<dyn TransportFactory>,
        options: ClientOptions,
        ledger: Arc<CancelLedger>,
        have_gpu: Arc<AtomicBool>,
    ) -> (
        mpsc::UnboundedSender<WorkerRequest>,
        mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = Self {
            requests: request_rx,
            events: event_tx,
            factory,
            options,
            ledger,
            have_gpu,
            session: None,
            cache: StateCache::default(),
        };
        tokio::spawn(worker.run());
        (request_tx, event_rx)
    }

    async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            if let Some(stamp) = request.stamp {
                if !self.ledger.is_current(stamp) {
                    debug!(receiver = stamp.receiver, "skipping cancelled request");
                    continue;
                }
            }
            self.handle(request.kind).await;
        }
        // Bridge handle dropped; tear down quietly.
        if let Some(mut session) = self.session.take() {
            session.transport.close().await;
        }
    }

    async fn handle(&mut self, kind: RequestKind) {
        match kind {
            RequestKind::Connect {
                endpoint,
                retrieve_initial_data,
            } => self.connect(endpoint, retrieve_initial_data).await,
            RequestKind::Disconnect => self.disconnect(DisconnectCause::Normal).await,
            RequestKind::ShutdownCore => self.shutdown_core().await,
            RequestKind::Update { kind, target } => self.update(kind, target).await,
            RequestKind::SetMode {
                selector,
                mode,
                duration,
                target,
            } => {
                let Ok(transport) = self.transport() else {
                    debug!("skipping mode change without a session");
                    return;
                };
                let result = match selector {
                    ModeSelector::Run => transport.set_run_mode(mode, duration).await,
                    ModeSelector::Network => transport.set_network_mode(mode, duration).await,
                    ModeSelector::Gpu => transport.set_gpu_mode(mode, duration).await,
                };
                self.after_control(result, DataKind::ClientMode, target)
                    .await;
            }
            RequestKind::RunBenchmarks => {
                let Ok(transport) = self.transport() else {
                    debug!("skipping benchmark request without a session");
                    return;
                };
                let result = transport.run_benchmarks().await;
                self.after_control(result, DataKind::ClientMode, None).await;
            }
            RequestKind::NetworkAvailable => {
                let Ok(transport) = self.transport() else {
                    debug!("skipping network notice without a session");
                    return;
                };
                let result = transport.network_available().await;
                self.after_control(result, DataKind::Transfers, None).await;
            }
            RequestKind::ProjectOp { op, url, target } => {
                let Ok(transport) = self.transport() else {
                    debug!("skipping project operation without a session");
                    return;
                };
                let result = transport.project_op(op, &url).await;
                self.after_control(result, DataKind::Projects, target).await;
            }
            RequestKind::TaskOp {
                op,
                url,
                name,
                target,
            } => {
                let Ok(transport) = self.transport() else {
                    debug!("skipping task operation without a session");
                    return;
                };
                let result = transport.result_op(op, &url, &name).await;
                self.after_control(result, DataKind::Tasks, target).await;
            }
            RequestKind::TransferOp {
                op,
                url,
                name,
                target,
            } => {
                let Ok(transport) = self.transport() else {
                    debug!("skipping transfer operation without a session");
                    return;
                };
                let result = transport.transfer_op(op, &url, &name).await;
                self.after_control(result, DataKind::Transfers, target).await;
            }
        }
    }

    async fn connect(&mut self, endpoint: RemoteEndpoint, retrieve_initial_data: bool) {
        if self.session.is_some() {
            self.disconnect(DisconnectCause::Normal).await;
        }
        info!(endpoint = %endpoint.id(), "connecting");
        self.send(WorkerEvent::Progress(ProgressStage::Connecting));

        let mut transport = self.factory.create();
        if let Err(err) = transport.open(&endpoint).await {
            self.fail_connect(transport, &endpoint, err).await;
            return;
        }
        if endpoint.has_password() {
            self.send(WorkerEvent::Progress(ProgressStage::Authorizing));
            if let Err(err) = transport.authorize(&endpoint.password).await {
                self.fail_connect(transport, &endpoint, err).await;
                return;
            }
        }
        // Older agents answer <exchange_versions/> with an empty reply;
        // the version then comes from the first full-state fetch.
        let version = match transport.exchange_versions().await {
            Ok(version) => version,
            Err(err) => {
                self.fail_connect(transport, &endpoint, err).await;
                return;
            }
        };

        self.session = Some(Session {
            transport,
            endpoint,
            version,
        });

        if retrieve_initial_data {
            self.send(WorkerEvent::Progress(ProgressStage::RetrievingInitialData));
            if let Err(err) = self.retrieve_initial_data().await {
                self.fail(err).await;
                return;
            }
        }

        let Some(session) = &self.session else { return };
        info!(
            endpoint = %session.endpoint.id(),
            version = %session.version.unwrap_or_default(),
            "connected"
        );
        self.send(WorkerEvent::Connected {
            endpoint_id: session.endpoint.id(),
            version: session.version,
        });
        if retrieve_initial_data {
            self.send(WorkerEvent::Projects {
                projects: self.cache.projects().to_vec(),
                target: None,
            });
            self.send(WorkerEvent::Tasks {
                tasks: self.cache.tasks(),
                target: None,
            });
            self.send(WorkerEvent::Transfers {
                transfers: self.cache.transfers().to_vec(),
                target: None,
            });
            self.send(WorkerEvent::Messages {
                messages: self.cache.messages(),
                target: None,
            });
        }
    }

    async fn retrieve_initial_data(&mut self) -> Result<()> {
        self.fetch_full_state().await?;
        let transfers = self.transport()?.get_file_transfers().await?;
        self.cache.update_transfers(transfers);
        self.fetch_messages().await?;
        Ok(())
    }

    async fn update(&mut self, kind: DataKind, target: Option<ReceiverId>) {
        if self.session.is_none() {
            debug!(?kind, "skipping update without a session");
            return;
        }
        if let Err(err) = self.try_update(kind, target).await {
            self.fail(err).await;
        }
    }

    async fn try_update(&mut self, kind: DataKind, target: Option<ReceiverId>) -> Result<()> {
        match kind {
            DataKind::ClientMode => {
                let status = self.transport()?.get_cc_status().await?;
                self.send(WorkerEvent::ClientMode { status, target });
            }
            DataKind::HostInfo => {
                let info = self.transport()?.get_host_info().await?;
                self.send(WorkerEvent::HostInfo { info, target });
            }
            DataKind::Projects => {
                let projects = self.transport()?.get_project_status().await?;
                self.cache.update_projects(projects);
                self.send(WorkerEvent::Projects {
                    projects: self.cache.projects().to_vec(),
                    target,
                });
            }
            DataKind::Tasks => {
                self.update_tasks().await?;
                self.send(WorkerEvent::Tasks {
                    tasks: self.cache.tasks(),
                    target,
                });
            }
            DataKind::Transfers => {
                let transfers = self.transport()?.get_file_transfers().await?;
                self.cache.update_transfers(transfers);
                self.send(WorkerEvent::Transfers {
                    transfers: self.cache.transfers().to_vec(),
                    target,
                });
            }
            DataKind::Messages => {
                self.fetch_messages().await?;
                self.send(WorkerEvent::Messages {
                    messages: self.cache.messages(),
                    target,
                });
            }
        }
        Ok(())
    }

    /// Incremental merge when possible. Any result name missing from
    /// the cache means the agent's tables moved under us; refetch the
    /// full state to rebuild the join.
    async fn update_tasks(&mut self) -> Result<()> {
        if !self.cache.full_state_fetched() {
            self.fetch_full_state().await?;
            return Ok(());
        }
        let results = self.transport()?.get_results().await?;
        if self.cache.merge_results(&results) == MergeOutcome::NeedsFullRefresh {
            debug!("incremental task merge aborted, refetching full state");
            self.fetch_full_state().await?;
        }
        Ok(())
    }

    async fn fetch_full_state(&mut self) -> Result<()> {
        let state = self.transport()?.get_state().await?;
        if let Some(session) = &mut self.session {
            if session.version.is_none() {
                session.version = state.version;
            }
        }
        self.have_gpu.store(state.have_gpu, Ordering::Relaxed);
        self.cache.apply_full_state(state);
        Ok(())
    }

    /// Cursor is the highest cached seqno. On the first fetch of a
    /// session the cursor is clamped to the newest `message_window`
    /// entries via the remote total count.
    async fn fetch_messages(&mut self) -> Result<()> {
        let mut since = self.cache.message_cursor();
        if since == 0 && self.options.message_window > 0 {
            let total = self.transport()?.get_message_count().await?;
            let window = i32::try_from(self.options.message_window).unwrap_or(i32::MAX);
            since = total.saturating_sub(window).max(0);
        }
        let messages = self.transport()?.get_messages(since).await?;
        self.cache.merge_messages(messages);
        Ok(())
    }

    /// Ran the control RPC; now refresh the data kind it affects,
    /// targeted at the requester. A failed op on a live connection is
    /// logged and still refreshed. A dropped connection turns into
    /// disconnect notifications instead.
    async fn after_control(
        &mut self,
        result: Result<()>,
        refresh: DataKind,
        target: Option<ReceiverId>,
    ) {
        match result {
            Ok(()) => {}
            Err(
                err @ (ClientError::ConnectFailed(_)
                | ClientError::ConnectionDropped(_)
                | ClientError::AuthRejected),
            ) => {
                self.fail(err).await;
                return;
            }
            Err(err @ ClientError::Codec(CodecError::Unauthorized)) => {
                self.fail(err).await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "control operation rejected by agent");
            }
        }
        self.update(refresh, target).await;
    }

    /// Asks the agent process to exit, then probes the socket. An
    /// orderly close within the window is a normal disconnect; a still
    /// open socket leaves the session up so the caller may retry.
    async fn shutdown_core(&mut self) {
        let Ok(transport) = self.transport() else {
            debug!("skipping shutdown request without a session");
            return;
        };
        if let Err(err) = transport.quit().await {
            debug!(error = %err, "quit request failed to send");
        }
        for _ in 0..self.options.shutdown_poll_attempts {
            sleep(self.options.shutdown_poll_interval).await;
            let alive = match self.transport() {
                Ok(transport) => transport.connection_alive().await,
                Err(_) => false,
            };
            if !alive {
                self.disconnect(DisconnectCause::Normal).await;
                return;
            }
        }
        info!("agent still running after shutdown request, leaving connection open");
    }

    /// Idempotent session teardown. At most one disconnected
    /// notification per session; later calls see no session and return.
    async fn disconnect(&mut self, cause: DisconnectCause) {
        let Some(mut session) = self.session.take() else {
            debug!("skipping disconnect without a session");
            return;
        };
        session.transport.close().await;
        self.cache.clear();
        self.have_gpu.store(false, Ordering::Relaxed);
        info!(endpoint = %session.endpoint.id(), ?cause, "disconnected");
        self.send(WorkerEvent::Disconnected {
            endpoint_id: session.endpoint.id(),
            cause,
        });
    }

    async fn fail(&mut self, err: ClientError) {
        let Some(session) = &self.session else { return };
        warn!(endpoint = %session.endpoint.id(), error = %err, "session failed");
        let cause = err.disconnect_cause(session.endpoint.has_password());
        self.disconnect(cause).await;
    }

    async fn fail_connect(
        &mut self,
        mut transport: Box<dyn Transport + Send>,
        endpoint: &RemoteEndpoint,
        err: ClientError,
    ) {
        warn!(endpoint = %endpoint.id(), error = %err, "connection attempt failed");
        transport.close().await;
        self.cache.clear();
        self.send(WorkerEvent::Disconnected {
            endpoint_id: endpoint.id(),
            cause: err.disconnect_cause(endpoint.has_password()),
        });
    }

    fn transport(&mut self) -> Result<&mut (dyn Transport + Send)> {
        match &mut self.session {
            Some(session) => Ok(session.transport.as_mut()),
            None => Err(ClientError::ConnectionDropped("no live session".into())),
        }
    }

    fn send(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("event channel closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_cancel_invalidates_only_earlier_stamps() {
        let ledger = CancelLedger::default();
        let before = ledger.stamp(7);
        assert!(ledger.is_current(before));

        ledger.cancel(7);
        assert!(!ledger.is_current(before));

        // Auto-clearing: a request enqueued after the cancel runs.
        let after = ledger.stamp(7);
        assert!(ledger.is_current(after));
    }

    #[test]
    fn ledger_is_per_receiver() {
        let ledger = CancelLedger::default();
        let a = ledger.stamp(1);
        let b = ledger.stamp(2);
        ledger.cancel(1);
        assert!(!ledger.is_current(a));
        assert!(ledger.is_current(b));
    }

    #[test]
    fn ledger_forget_resets_epoch() {
        let ledger = CancelLedger::default();
        ledger.cancel(3);
        ledger.forget(3);
        assert_eq!(ledger.stamp(3).epoch, 0);
    }
}
