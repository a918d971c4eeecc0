//! Connection bridge: the callback-facing side of one connection.
//!
//! A dispatch task owns the observer/receiver registries and the
//! auto-refresh scheduler, consuming bridge commands and worker events
//! from a select loop. Callbacks run inline on that task, so every
//! registered party sees notifications serialized in event order.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use corelink_proto::{
    CcStatus, DataKind, DisconnectCause, HostInfo, MessageRecord, ProgressStage, ProjectOp,
    ProjectRecord, RemoteEndpoint, RunMode, TaskOp, TaskRecord, TransferOp, TransferRecord,
    VersionInfo,
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::options::{ClientOptions, ConnectivityStatus};
use crate::scheduler::AutoRefreshScheduler;
use crate::transport::TransportFactory;
use crate::worker::{
    CancelLedger, ModeSelector, ReceiverId, RequestKind, Worker, WorkerEvent, WorkerRequest,
};

/// Receives cached-data deliveries. The `updated_*` return value means
/// "keep refreshing this kind for me periodically".
pub trait ClientReplyReceiver: Send + Sync {
    fn client_connected(&self, handle: &ClientHandle);
    fn client_disconnected(&self);
    fn updated_client_mode(&self, status: &CcStatus) -> bool;
    fn updated_host_info(&self, info: &HostInfo) -> bool;
    fn updated_projects(&self, projects: &[ProjectRecord]) -> bool;
    fn updated_tasks(&self, tasks: &[TaskRecord]) -> bool;
    fn updated_transfers(&self, transfers: &[TransferRecord]) -> bool;
    fn updated_messages(&self, messages: &[MessageRecord]) -> bool;
}

/// Receives connection lifecycle notifications.
pub trait ConnectionStatusObserver: Send + Sync {
    fn connection_progress(&self, stage: ProgressStage);
    fn client_connected(&self, endpoint_id: &str, version: Option<&VersionInfo>);
    fn client_disconnected(&self, endpoint_id: &str, cause: DisconnectCause);
}

/// Registration identity: the address of the party's `Arc` allocation.
pub(crate) fn party_id<T: ?Sized>(party: &Arc<T>) -> ReceiverId {
    Arc::as_ptr(party).cast::<()>() as usize
}

/// Coarse lifecycle of one bridge, published on a watch channel so the
/// connection manager can wait for teardown before reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Connected,
    Down,
}

enum BridgeCommand {
    RegisterObserver(Arc<dyn ConnectionStatusObserver>),
    UnregisterObserver(ReceiverId),
    RegisterReceiver(Arc<dyn ClientReplyReceiver>),
    UnregisterReceiver(ReceiverId),
    Unschedule(ReceiverId),
    Detach,
}

/// Cloneable handle to one bridge. All operations enqueue and return;
/// results arrive through the registered callbacks.
#[derive(Clone)]
pub struct ClientHandle {
    endpoint: RemoteEndpoint,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    commands: mpsc::UnboundedSender<BridgeCommand>,
    ledger: Arc<CancelLedger>,
    have_gpu: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Whether the agent reported a GPU coprocessor in its most recent
    /// full state fetch. False before the first fetch and after
    /// disconnect.
    pub fn agent_has_gpu(&self) -> bool {
        self.have_gpu.load(Ordering::Relaxed)
    }

    pub fn register_status_observer(&self, observer: Arc<dyn ConnectionStatusObserver>) {
        self.command(BridgeCommand::RegisterObserver(observer));
    }

    pub fn unregister_status_observer(&self, observer: &Arc<dyn ConnectionStatusObserver>) {
        self.command(BridgeCommand::UnregisterObserver(party_id(observer)));
    }

    pub fn register_data_receiver(&self, receiver: Arc<dyn ClientReplyReceiver>) {
        self.command(BridgeCommand::RegisterReceiver(receiver));
    }

    pub fn unregister_data_receiver(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.command(BridgeCommand::UnregisterReceiver(party_id(receiver)));
    }

    pub fn update_client_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.targeted_update(DataKind::ClientMode, receiver);
    }

    pub fn update_host_info(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.targeted_update(DataKind::HostInfo, receiver);
    }

    pub fn update_projects(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.targeted_update(DataKind::Projects, receiver);
    }

    pub fn update_tasks(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.targeted_update(DataKind::Tasks, receiver);
    }

    pub fn update_transfers(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.targeted_update(DataKind::Transfers, receiver);
    }

    pub fn update_messages(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        self.targeted_update(DataKind::Messages, receiver);
    }

    pub fn set_run_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>, mode: RunMode) {
        self.set_mode(ModeSelector::Run, receiver, mode);
    }

    pub fn set_network_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>, mode: RunMode) {
        self.set_mode(ModeSelector::Network, receiver, mode);
    }

    pub fn set_gpu_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>, mode: RunMode) {
        self.set_mode(ModeSelector::Gpu, receiver, mode);
    }

    pub fn run_benchmarks(&self) {
        self.submit(WorkerRequest::new(RequestKind::RunBenchmarks));
    }

    pub fn do_network_communication(&self) {
        self.submit(WorkerRequest::new(RequestKind::NetworkAvailable));
    }

    pub fn shutdown_core(&self) {
        self.submit(WorkerRequest::new(RequestKind::ShutdownCore));
    }

    pub fn project_operation(
        &self,
        receiver: &Arc<dyn ClientReplyReceiver>,
        op: ProjectOp,
        url: &str,
    ) {
        let id = party_id(receiver);
        self.submit(WorkerRequest::stamped(
            RequestKind::ProjectOp {
                op,
                url: url.to_owned(),
                target: Some(id),
            },
            self.ledger.stamp(id),
        ));
    }

    pub fn task_operation(
        &self,
        receiver: &Arc<dyn ClientReplyReceiver>,
        op: TaskOp,
        url: &str,
        name: &str,
    ) {
        let id = party_id(receiver);
        self.submit(WorkerRequest::stamped(
            RequestKind::TaskOp {
                op,
                url: url.to_owned(),
                name: name.to_owned(),
                target: Some(id),
            },
            self.ledger.stamp(id),
        ));
    }

    pub fn transfer_operation(
        &self,
        receiver: &Arc<dyn ClientReplyReceiver>,
        op: TransferOp,
        url: &str,
        name: &str,
    ) {
        let id = party_id(receiver);
        self.submit(WorkerRequest::stamped(
            RequestKind::TransferOp {
                op,
                url: url.to_owned(),
                name: name.to_owned(),
                target: Some(id),
            },
            self.ledger.stamp(id),
        ));
    }

    /// Drops everything this receiver has queued but not yet started,
    /// plus its pending auto-refresh timers. In-flight operations
    /// complete. Requests enqueued afterwards run normally.
    pub fn cancel_scheduled_updates(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        let id = party_id(receiver);
        self.ledger.cancel(id);
        self.command(BridgeCommand::Unschedule(id));
    }

    pub(crate) fn connect(&self, retrieve_initial_data: bool) {
        self.submit(WorkerRequest::new(RequestKind::Connect {
            endpoint: self.endpoint.clone(),
            retrieve_initial_data,
        }));
    }

    pub(crate) fn disconnect(&self) {
        self.submit(WorkerRequest::new(RequestKind::Disconnect));
    }

    /// Stops the dispatcher: synthesizes disconnect notifications to
    /// every registered party, then no further callbacks ever fire.
    pub(crate) fn detach(&self) {
        self.command(BridgeCommand::Detach);
    }

    fn targeted_update(&self, kind: DataKind, receiver: &Arc<dyn ClientReplyReceiver>) {
        let id = party_id(receiver);
        self.submit(WorkerRequest::stamped(
            RequestKind::Update {
                kind,
                target: Some(id),
            },
            self.ledger.stamp(id),
        ));
    }

    fn set_mode(
        &self,
        selector: ModeSelector,
        receiver: &Arc<dyn ClientReplyReceiver>,
        mode: RunMode,
    ) {
        let id = party_id(receiver);
        self.submit(WorkerRequest::stamped(
            RequestKind::SetMode {
                selector,
                mode,
                // Zero duration makes the change permanent.
                duration: 0.0,
                target: Some(id),
            },
            self.ledger.stamp(id),
        ));
    }

    fn submit(&self, request: WorkerRequest) {
        if self.requests.send(request).is_err() {
            debug!("worker queue closed, dropping request");
        }
    }

    fn command(&self, command: BridgeCommand) {
        if self.commands.send(command).is_err() {
            debug!("bridge dispatcher gone, dropping command");
        }
    }
}

struct Dispatcher {
    commands: mpsc::UnboundedReceiver<BridgeCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    handle: ClientHandle,
    observers: HashMap<ReceiverId, Arc<dyn ConnectionStatusObserver>>,
    receivers: HashMap<ReceiverId, Arc<dyn ClientReplyReceiver>>,
    scheduler: AutoRefreshScheduler,
    ledger: Arc<CancelLedger>,
    /// Set once the worker reports a live session; drives synthetic
    /// connected notifications for late registrations.
    connected: Option<(String, Option<VersionInfo>)>,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            // Commands enqueued before a worker event must be applied
            // first, so a registration always beats the connect events
            // that follow it.
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            return;
                        }
                    }
                    None => {
                        self.detach();
                        return;
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).is_break() {
                            return;
                        }
                    }
                    None => {
                        self.detach();
                        return;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: BridgeCommand) -> ControlFlow<()> {
        match command {
            BridgeCommand::RegisterObserver(observer) => {
                let id = party_id(&observer);
                if self.observers.contains_key(&id) {
                    return ControlFlow::Continue(());
                }
                if let Some((endpoint_id, version)) = &self.connected {
                    observer.client_connected(endpoint_id, version.as_ref());
                }
                self.observers.insert(id, observer);
            }
            BridgeCommand::UnregisterObserver(id) => {
                self.observers.remove(&id);
            }
            BridgeCommand::RegisterReceiver(receiver) => {
                let id = party_id(&receiver);
                if self.receivers.contains_key(&id) {
                    return ControlFlow::Continue(());
                }
                if self.connected.is_some() {
                    receiver.client_connected(&self.handle);
                }
                self.receivers.insert(id, receiver);
            }
            BridgeCommand::UnregisterReceiver(id) => {
                // Unknown id is a no-op.
                self.receivers.remove(&id);
                self.scheduler.unschedule(id);
                self.ledger.forget(id);
            }
            BridgeCommand::Unschedule(id) => self.scheduler.unschedule(id),
            BridgeCommand::Detach => {
                self.detach();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_event(&mut self, event: WorkerEvent) -> ControlFlow<()> {
        match event {
            WorkerEvent::Progress(stage) => {
                for observer in self.observers.values() {
                    observer.connection_progress(stage);
                }
            }
            WorkerEvent::Connected {
                endpoint_id,
                version,
            } => {
                self.connected = Some((endpoint_id.clone(), version));
                self.lifecycle.send_replace(Lifecycle::Connected);
                for observer in self.observers.values() {
                    observer.client_connected(&endpoint_id, version.as_ref());
                }
                for receiver in self.receivers.values() {
                    receiver.client_connected(&self.handle);
                }
            }
            WorkerEvent::Disconnected { endpoint_id, cause } => {
                self.connected = None;
                self.scheduler.cleanup();
                for observer in self.observers.values() {
                    observer.client_disconnected(&endpoint_id, cause);
                }
                for receiver in self.receivers.values() {
                    receiver.client_disconnected();
                }
                self.lifecycle.send_replace(Lifecycle::Down);
                // One bridge per connection; the manager spawns a new
                // one for the next attempt.
                return ControlFlow::Break(());
            }
            WorkerEvent::ClientMode { status, target } => {
                self.deliver(DataKind::ClientMode, target, |receiver| {
                    receiver.updated_client_mode(&status)
                });
            }
            WorkerEvent::HostInfo { info, target } => {
                self.deliver(DataKind::HostInfo, target, |receiver| {
                    receiver.updated_host_info(&info)
                });
            }
            WorkerEvent::Projects { projects, target } => {
                self.deliver(DataKind::Projects, target, |receiver| {
                    receiver.updated_projects(&projects)
                });
            }
            WorkerEvent::Tasks { tasks, target } => {
                self.deliver(DataKind::Tasks, target, |receiver| {
                    receiver.updated_tasks(&tasks)
                });
            }
            WorkerEvent::Transfers { transfers, target } => {
                self.deliver(DataKind::Transfers, target, |receiver| {
                    receiver.updated_transfers(&transfers)
                });
            }
            WorkerEvent::Messages { messages, target } => {
                self.deliver(DataKind::Messages, target, |receiver| {
                    receiver.updated_messages(&messages)
                });
            }
        }
        ControlFlow::Continue(())
    }

    /// Targeted delivery goes to one receiver if it is still
    /// registered; broadcast goes to all. A `true` return arms the
    /// auto-refresh timer for that (receiver, kind) pair.
    fn deliver(
        &mut self,
        kind: DataKind,
        target: Option<ReceiverId>,
        notify: impl Fn(&dyn ClientReplyReceiver) -> bool,
    ) {
        let parties: Vec<(ReceiverId, Arc<dyn ClientReplyReceiver>)> = match target {
            Some(id) => self
                .receivers
                .get(&id)
                .map(|receiver| (id, Arc::clone(receiver)))
                .into_iter()
                .collect(),
            None => self
                .receivers
                .iter()
                .map(|(id, receiver)| (*id, Arc::clone(receiver)))
                .collect(),
        };
        for (id, receiver) in parties {
            if notify(receiver.as_ref()) {
                self.scheduler.schedule(id, kind);
            }
        }
    }

    /// Final teardown: every registered party gets one synthesized
    /// disconnect, then the registries are dropped and no callback
    /// ever fires again. Worker teardown proceeds asynchronously.
    fn detach(&mut self) {
        self.scheduler.cleanup();
        let endpoint_id = self.handle.endpoint().id();
        for observer in self.observers.values() {
            observer.client_disconnected(&endpoint_id, DisconnectCause::Normal);
        }
        for receiver in self.receivers.values() {
            receiver.client_disconnected();
        }
        self.observers.clear();
        self.receivers.clear();
        self.lifecycle.send_replace(Lifecycle::Down);
    }
}

/// Builds the worker task and the dispatch task for one connection.
pub(crate) fn spawn_bridge(
    endpoint: RemoteEndpoint,
    options: &ClientOptions,
    factory: Arc<dyn TransportFactory>,
    connectivity: watch::Receiver<ConnectivityStatus>,
) -> (ClientHandle, watch::Receiver<Lifecycle>) {
    let ledger = Arc::new(CancelLedger::default());
    let have_gpu = Arc::new(AtomicBool::new(false));
    let (requests, events) = Worker::spawn(
        factory,
        options.clone(),
        Arc::clone(&ledger),
        Arc::clone(&have_gpu),
    );
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Starting);

    let handle = ClientHandle {
        endpoint,
        requests: requests.clone(),
        commands: command_tx,
        ledger: Arc::clone(&ledger),
        have_gpu,
    };
    let scheduler = AutoRefreshScheduler::new(requests, Arc::clone(&ledger), connectivity, options);
    let dispatcher = Dispatcher {
        commands: command_rx,
        events,
        handle: handle.clone(),
        observers: HashMap::new(),
        receivers: HashMap::new(),
        scheduler,
        ledger,
        connected: None,
        lifecycle: lifecycle_tx,
    };
    tokio::spawn(dispatcher.run());
    (handle, lifecycle_rx)
}
