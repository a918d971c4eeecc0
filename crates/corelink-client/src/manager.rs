//! Connection manager: the process-wide facade over at most one live
//! bridge.
//!
//! Observers and receivers register here once; the manager re-registers
//! them with each bridge it creates, so callers never see the bridge
//! turnover that happens on reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corelink_proto::{
    DisconnectCause, ProjectOp, RemoteEndpoint, RunMode, TaskOp, TransferOp,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bridge::{
    ClientHandle, ClientReplyReceiver, ConnectionStatusObserver, Lifecycle, party_id, spawn_bridge,
};
use crate::options::{ClientOptions, ConnectivityStatus};
use crate::transport::{TcpTransportFactory, TransportFactory};
use crate::worker::ReceiverId;

struct ActiveBridge {
    id: u64,
    handle: ClientHandle,
    lifecycle: watch::Receiver<Lifecycle>,
}

#[derive(Default)]
struct ManagerInner {
    bridge: Option<ActiveBridge>,
    observers: HashMap<ReceiverId, Arc<dyn ConnectionStatusObserver>>,
    receivers: HashMap<ReceiverId, Arc<dyn ClientReplyReceiver>>,
    detached: bool,
}

pub struct ConnectionManager {
    options: ClientOptions,
    factory: Arc<dyn TransportFactory>,
    connectivity: watch::Receiver<ConnectivityStatus>,
    next_bridge_id: AtomicU64,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
        connectivity: watch::Receiver<ConnectivityStatus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            factory,
            connectivity,
            next_bridge_id: AtomicU64::new(0),
            inner: Mutex::new(ManagerInner::default()),
        })
    }

    /// Production construction over TCP.
    pub fn over_tcp(
        options: ClientOptions,
        connectivity: watch::Receiver<ConnectivityStatus>,
    ) -> Arc<Self> {
        let factory = Arc::new(TcpTransportFactory::new(options.clone()));
        Self::new(options, factory, connectivity)
    }

    /// Opens a connection to `endpoint`. When a bridge is already up,
    /// it is torn down first and the connect re-runs once its lifecycle
    /// reaches `Down`. With no network connectivity, only the calling
    /// observer is told and no bridge is created.
    pub fn connect(
        self: &Arc<Self>,
        observer: &Arc<dyn ConnectionStatusObserver>,
        endpoint: RemoteEndpoint,
        retrieve_initial_data: bool,
    ) {
        if *self.connectivity.borrow() == ConnectivityStatus::None {
            debug!(endpoint = %endpoint.id(), "refusing connect without connectivity");
            observer.client_disconnected(&endpoint.id(), DisconnectCause::NoConnectivity);
            return;
        }

        let mut inner = self.lock();
        if inner.detached {
            return;
        }
        if let Some(bridge) = &inner.bridge {
            if *bridge.lifecycle.borrow() != Lifecycle::Down {
                info!(endpoint = %endpoint.id(), "bridge busy, deferring connect");
                bridge.handle.disconnect();
                let mut lifecycle = bridge.lifecycle.clone();
                let manager = Arc::clone(self);
                let observer = Arc::clone(observer);
                tokio::spawn(async move {
                    while *lifecycle.borrow() != Lifecycle::Down {
                        if lifecycle.changed().await.is_err() {
                            break;
                        }
                    }
                    manager.connect(&observer, endpoint, retrieve_initial_data);
                });
                return;
            }
            inner.bridge = None;
        }

        inner
            .observers
            .entry(party_id(observer))
            .or_insert_with(|| Arc::clone(observer));

        let (handle, lifecycle) = spawn_bridge(
            endpoint,
            &self.options,
            Arc::clone(&self.factory),
            self.connectivity.clone(),
        );
        for stored in inner.observers.values() {
            handle.register_status_observer(Arc::clone(stored));
        }
        for stored in inner.receivers.values() {
            handle.register_data_receiver(Arc::clone(stored));
        }
        handle.connect(retrieve_initial_data);

        let id = self.next_bridge_id.fetch_add(1, Ordering::Relaxed);
        inner.bridge = Some(ActiveBridge {
            id,
            handle,
            lifecycle: lifecycle.clone(),
        });
        drop(inner);

        // Clear the slot once this bridge goes down so a stale handle
        // never shadows the next connect.
        let manager = Arc::clone(self);
        let mut lifecycle = lifecycle;
        tokio::spawn(async move {
            while *lifecycle.borrow() != Lifecycle::Down {
                if lifecycle.changed().await.is_err() {
                    break;
                }
            }
            let mut inner = manager.lock();
            if inner.bridge.as_ref().is_some_and(|bridge| bridge.id == id) {
                inner.bridge = None;
            }
        });
    }

    pub fn disconnect(&self) {
        if let Some(handle) = self.live_handle() {
            handle.disconnect();
        }
    }

    /// Endpoint of the currently connected agent, if any.
    pub fn client_id(&self) -> Option<RemoteEndpoint> {
        let inner = self.lock();
        inner.bridge.as_ref().and_then(|bridge| {
            (*bridge.lifecycle.borrow() == Lifecycle::Connected)
                .then(|| bridge.handle.endpoint().clone())
        })
    }

    pub fn register_status_observer(&self, observer: Arc<dyn ConnectionStatusObserver>) {
        let mut inner = self.lock();
        if inner.detached {
            return;
        }
        inner
            .observers
            .entry(party_id(&observer))
            .or_insert_with(|| Arc::clone(&observer));
        if let Some(bridge) = &inner.bridge {
            bridge.handle.register_status_observer(observer);
        }
    }

    pub fn unregister_status_observer(&self, observer: &Arc<dyn ConnectionStatusObserver>) {
        let mut inner = self.lock();
        inner.observers.remove(&party_id(observer));
        if let Some(bridge) = &inner.bridge {
            bridge.handle.unregister_status_observer(observer);
        }
    }

    pub fn register_data_receiver(&self, receiver: Arc<dyn ClientReplyReceiver>) {
        let mut inner = self.lock();
        if inner.detached {
            return;
        }
        inner
            .receivers
            .entry(party_id(&receiver))
            .or_insert_with(|| Arc::clone(&receiver));
        if let Some(bridge) = &inner.bridge {
            bridge.handle.register_data_receiver(receiver);
        }
    }

    pub fn unregister_data_receiver(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        let mut inner = self.lock();
        inner.receivers.remove(&party_id(receiver));
        if let Some(bridge) = &inner.bridge {
            bridge.handle.unregister_data_receiver(receiver);
        }
    }

    /// Whether the connected agent reported a GPU in its most recent
    /// full state fetch.
    pub fn agent_has_gpu(&self) -> bool {
        self.live_handle()
            .is_some_and(|handle| handle.agent_has_gpu())
    }

    pub fn update_client_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.update_client_mode(receiver);
        }
    }

    pub fn update_host_info(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.update_host_info(receiver);
        }
    }

    pub fn update_projects(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.update_projects(receiver);
        }
    }

    pub fn update_tasks(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.update_tasks(receiver);
        }
    }

    pub fn update_transfers(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.update_transfers(receiver);
        }
    }

    pub fn update_messages(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.update_messages(receiver);
        }
    }

    pub fn set_run_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>, mode: RunMode) {
        if let Some(handle) = self.live_handle() {
            handle.set_run_mode(receiver, mode);
        }
    }

    pub fn set_network_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>, mode: RunMode) {
        if let Some(handle) = self.live_handle() {
            handle.set_network_mode(receiver, mode);
        }
    }

    pub fn set_gpu_mode(&self, receiver: &Arc<dyn ClientReplyReceiver>, mode: RunMode) {
        if let Some(handle) = self.live_handle() {
            handle.set_gpu_mode(receiver, mode);
        }
    }

    pub fn run_benchmarks(&self) {
        if let Some(handle) = self.live_handle() {
            handle.run_benchmarks();
        }
    }

    pub fn do_network_communication(&self) {
        if let Some(handle) = self.live_handle() {
            handle.do_network_communication();
        }
    }

    pub fn shutdown_core(&self) {
        if let Some(handle) = self.live_handle() {
            handle.shutdown_core();
        }
    }

    pub fn project_operation(
        &self,
        receiver: &Arc<dyn ClientReplyReceiver>,
        op: ProjectOp,
        url: &str,
    ) {
        if let Some(handle) = self.live_handle() {
            handle.project_operation(receiver, op, url);
        }
    }

    pub fn task_operation(
        &self,
        receiver: &Arc<dyn ClientReplyReceiver>,
        op: TaskOp,
        url: &str,
        name: &str,
    ) {
        if let Some(handle) = self.live_handle() {
            handle.task_operation(receiver, op, url, name);
        }
    }

    pub fn transfer_operation(
        &self,
        receiver: &Arc<dyn ClientReplyReceiver>,
        op: TransferOp,
        url: &str,
        name: &str,
    ) {
        if let Some(handle) = self.live_handle() {
            handle.transfer_operation(receiver, op, url, name);
        }
    }

    pub fn cancel_scheduled_updates(&self, receiver: &Arc<dyn ClientReplyReceiver>) {
        if let Some(handle) = self.live_handle() {
            handle.cancel_scheduled_updates(receiver);
        }
    }

    /// Final shutdown of the whole layer. Every registered party gets
    /// one synthesized disconnect, all registrations are released, and
    /// the manager refuses further work. The worker tears the socket
    /// down asynchronously with no further notifications.
    pub fn cleanup(&self) {
        let bridge = {
            let mut inner = self.lock();
            inner.detached = true;
            inner.observers.clear();
            inner.receivers.clear();
            inner.bridge.take()
        };
        if let Some(bridge) = bridge {
            bridge.handle.detach();
            bridge.handle.disconnect();
        }
    }

    fn live_handle(&self) -> Option<ClientHandle> {
        let inner = self.lock();
        inner.bridge.as_ref().map(|bridge| bridge.handle.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
