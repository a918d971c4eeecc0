//! Connection establishment scenarios over a scripted transport.

mod common;

use std::sync::Arc;

use corelink_client::proto::RemoteEndpoint;
use corelink_client::{
    ClientReplyReceiver, ConnectionManager, ConnectionStatusObserver, ConnectivityStatus,
};

use common::{
    EventLog, MockAgent, MockFactory, RecordingObserver, RecordingReceiver, connectivity, endpoint,
    fast_options,
};

fn manager_for(
    agent: &Arc<MockAgent>,
    status: ConnectivityStatus,
) -> Arc<ConnectionManager> {
    let (_tx, rx) = connectivity(status);
    ConnectionManager::new(
        fast_options(),
        Arc::new(MockFactory {
            agent: Arc::clone(agent),
        }),
        rx,
    )
}

fn observer(label: &'static str, log: &Arc<EventLog>) -> Arc<dyn ConnectionStatusObserver> {
    Arc::new(RecordingObserver {
        label,
        log: Arc::clone(log),
    })
}

#[tokio::test]
async fn eager_connect_broadcasts_initial_data_in_order() {
    let agent = MockAgent::new();
    let manager = manager_for(&agent, ConnectivityStatus::Unmetered);
    let log = Arc::new(EventLog::default());

    let obs = observer("obs", &log);
    let rcv: Arc<dyn ClientReplyReceiver> = RecordingReceiver::new("rcv", &log);
    manager.register_data_receiver(Arc::clone(&rcv));
    manager.connect(&obs, endpoint(""), true);

    log.wait_for("rcv: messages").await;
    assert_eq!(
        log.snapshot(),
        vec![
            "obs: progress Connecting",
            "obs: progress RetrievingInitialData",
            "obs: connected agent.example:31416 v7.16.3",
            "rcv: connected",
            "rcv: projects 1",
            "rcv: tasks 1",
            "rcv: transfers 1",
            "rcv: messages 2",
        ]
    );
    assert_eq!(manager.client_id().map(|e| e.id()), Some(endpoint("").id()));
}

#[tokio::test]
async fn password_endpoint_reports_authorizing_stage() {
    let agent = MockAgent::with_password("sekrit");
    let manager = manager_for(&agent, ConnectivityStatus::Unmetered);
    let log = Arc::new(EventLog::default());

    let obs = observer("obs", &log);
    manager.connect(&obs, endpoint("sekrit"), false);

    log.wait_for("obs: connected").await;
    assert_eq!(
        log.snapshot(),
        vec![
            "obs: progress Connecting",
            "obs: progress Authorizing",
            "obs: connected agent.example:31416 v7.16.3",
        ]
    );
    assert!(agent.calls().contains(&"authorize".to_string()));
}

#[tokio::test]
async fn duplicate_registration_does_not_duplicate_deliveries() {
    let agent = MockAgent::new();
    let manager = manager_for(&agent, ConnectivityStatus::Unmetered);
    let log = Arc::new(EventLog::default());

    let rcv: Arc<dyn ClientReplyReceiver> = RecordingReceiver::new("rcv", &log);
    manager.register_data_receiver(Arc::clone(&rcv));
    manager.register_data_receiver(Arc::clone(&rcv));

    let obs = observer("obs", &log);
    manager.connect(&obs, endpoint(""), true);

    log.wait_for("rcv: messages").await;
    assert_eq!(log.count_matching("rcv: connected"), 1);
    assert_eq!(log.count_matching("rcv: projects"), 1);
}

#[tokio::test]
async fn unregistering_unknown_receiver_is_a_no_op() {
    let agent = MockAgent::new();
    let manager = manager_for(&agent, ConnectivityStatus::Unmetered);
    let log = Arc::new(EventLog::default());

    let registered: Arc<dyn ClientReplyReceiver> = RecordingReceiver::new("rcv", &log);
    let stranger: Arc<dyn ClientReplyReceiver> = RecordingReceiver::new("stranger", &log);
    manager.register_data_receiver(Arc::clone(&registered));
    manager.unregister_data_receiver(&stranger);

    let obs = observer("obs", &log);
    manager.connect(&obs, endpoint(""), true);

    log.wait_for("rcv: messages").await;
    assert_eq!(log.count_matching("rcv: projects"), 1);
    assert_eq!(log.count_matching("stranger:"), 0);
}

#[tokio::test]
async fn no_connectivity_refuses_connect_to_calling_observer_only() {
    let agent = MockAgent::new();
    let manager = manager_for(&agent, ConnectivityStatus::None);
    let log = Arc::new(EventLog::default());

    let bystander = observer("bystander", &log);
    manager.register_status_observer(Arc::clone(&bystander));

    let caller = observer("caller", &log);
    manager.connect(&caller, endpoint(""), true);

    assert_eq!(
        log.snapshot(),
        vec!["caller: disconnected agent.example:31416 NoConnectivity"]
    );
    // No bridge, no socket: nothing ever reached the transport.
    assert!(agent.calls().is_empty());
    assert!(manager.client_id().is_none());
}

#[tokio::test]
async fn gpu_presence_surfaces_after_full_state_fetch() {
    let agent = MockAgent::new();
    agent.state.lock().unwrap().have_gpu = true;
    let manager = manager_for(&agent, ConnectivityStatus::Unmetered);
    let log = Arc::new(EventLog::default());

    let obs = observer("obs", &log);
    assert!(!manager.agent_has_gpu());
    manager.connect(&obs, endpoint(""), true);
    log.wait_for("obs: connected").await;
    assert!(manager.agent_has_gpu());

    manager.disconnect();
    log.wait_for("obs: disconnected").await;
    assert!(!manager.agent_has_gpu());
}

#[tokio::test]
async fn connect_while_connected_tears_down_then_retries() {
    let agent = MockAgent::new();
    let manager = manager_for(&agent, ConnectivityStatus::Unmetered);
    let log = Arc::new(EventLog::default());

    let obs = observer("obs", &log);
    manager.connect(&obs, endpoint(""), false);
    log.wait_for("obs: connected agent.example:31416").await;

    let second = RemoteEndpoint {
        port: 31_417,
        ..endpoint("")
    };
    manager.connect(&obs, second.clone(), false);

    log.wait_for("obs: connected agent.example:31417").await;
    let entries = log.snapshot();
    let down = entries
        .iter()
        .position(|e| e.contains("disconnected agent.example:31416 Normal"))
        .unwrap();
    let up = entries
        .iter()
        .position(|e| e.contains("connected agent.example:31417"))
        .unwrap();
    assert!(down < up, "old bridge must come down first: {entries:#?}");
    assert_eq!(manager.client_id().map(|e| e.id()), Some(second.id()));
}
