//! Shared harness: a scripted in-memory agent behind the `Transport`
//! seam, plus recording observers/receivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use corelink_client::proto::{
    AppRecord, CcState, CcStatus, CodecError, DisconnectCause, HostInfo, MessageRecord,
    ProgressStage, ProjectOp, ProjectRecord, RemoteEndpoint, ResultInfo, RunMode, TaskOp,
    TaskRecord, TransferOp, TransferRecord, VersionInfo, WorkunitRecord,
};
use corelink_client::{
    ClientError, ClientHandle, ClientOptions, ClientReplyReceiver, ConnectionStatusObserver,
    ConnectivityStatus, Transport, TransportFactory,
};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted agent state shared by every transport the factory creates.
pub struct MockAgent {
    /// Password the agent demands; `None` accepts unauthenticated use.
    pub password: Option<String>,
    pub version: Option<VersionInfo>,
    pub state: Mutex<CcState>,
    pub cc_status: Mutex<CcStatus>,
    pub host_info: Mutex<HostInfo>,
    pub projects: Mutex<Vec<ProjectRecord>>,
    pub results: Mutex<Vec<ResultInfo>>,
    pub transfers: Mutex<Vec<TransferRecord>>,
    pub messages: Mutex<Vec<MessageRecord>>,
    /// Next call with this name fails once with a dropped connection.
    pub fail_next: Mutex<Option<&'static str>>,
    pub calls: Mutex<Vec<String>>,
    pub quit_requested: AtomicBool,
    /// When set the socket stays open after a quit request.
    pub survive_quit: AtomicBool,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_password(password: &str) -> Arc<Self> {
        Self::build(Some(password.to_owned()))
    }

    fn build(password: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            password,
            version: Some(VersionInfo {
                major: 7,
                minor: 16,
                release: 3,
            }),
            state: Mutex::new(sample_state()),
            cc_status: Mutex::new(CcStatus::default()),
            host_info: Mutex::new(HostInfo {
                domain_name: "crunchbox".into(),
                p_ncpus: 8,
                ..HostInfo::default()
            }),
            projects: Mutex::new(sample_state().projects),
            results: Mutex::new(sample_state().results),
            transfers: Mutex::new(vec![TransferRecord {
                name: "upload_1".into(),
                project_url: PROJECT_URL.into(),
                is_upload: true,
                nbytes: 1000.0,
                ..TransferRecord::default()
            }]),
            messages: Mutex::new(messages(1..=2)),
            fail_next: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            quit_requested: AtomicBool::new(false),
            survive_quit: AtomicBool::new(false),
        })
    }

    pub fn fail_next(&self, call: &'static str) {
        *lock(&self.fail_next) = Some(call);
    }

    pub fn set_messages(&self, range: std::ops::RangeInclusive<i32>) {
        *lock(&self.messages) = messages(range);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

pub const PROJECT_URL: &str = "http://proj.example/";

pub fn sample_state() -> CcState {
    CcState {
        version: Some(VersionInfo {
            major: 7,
            minor: 16,
            release: 3,
        }),
        host_info: Some(HostInfo::default()),
        have_gpu: false,
        projects: vec![ProjectRecord {
            master_url: PROJECT_URL.into(),
            project_name: "Proj".into(),
            resource_share: 100.0,
            share_fraction: 1.0,
            ..ProjectRecord::default()
        }],
        apps: vec![AppRecord {
            name: "app_a".into(),
            user_friendly_name: "App A".into(),
        }],
        workunits: vec![WorkunitRecord {
            name: "wu_1".into(),
            app_name: "app_a".into(),
            rsc_fpops_est: 1.0e12,
        }],
        results: vec![ResultInfo {
            name: "task_1".into(),
            wu_name: "wu_1".into(),
            project_url: PROJECT_URL.into(),
            active_task: true,
            fraction_done: 0.5,
            ..ResultInfo::default()
        }],
    }
}

pub fn messages(range: std::ops::RangeInclusive<i32>) -> Vec<MessageRecord> {
    range
        .map(|seqno| MessageRecord {
            seqno,
            project: String::new(),
            priority: 1,
            timestamp: i64::from(seqno) * 60,
            body: format!("message {seqno}"),
        })
        .collect()
}

pub fn endpoint(password: &str) -> RemoteEndpoint {
    RemoteEndpoint {
        address: "agent.example".into(),
        port: 31_416,
        nickname: "test agent".into(),
        password: password.to_owned(),
    }
}

/// Fast timings so shutdown polling and timeouts stay test-sized.
pub fn fast_options() -> ClientOptions {
    ClientOptions {
        connect_timeout: Duration::from_secs(1),
        shutdown_poll_attempts: 3,
        shutdown_poll_interval: Duration::from_millis(5),
        ..ClientOptions::default()
    }
}

pub fn connectivity(
    status: ConnectivityStatus,
) -> (
    watch::Sender<ConnectivityStatus>,
    watch::Receiver<ConnectivityStatus>,
) {
    watch::channel(status)
}

pub struct MockTransport {
    agent: Arc<MockAgent>,
    authorized: bool,
}

impl MockTransport {
    fn record(&self, call: String) {
        lock(&self.agent.calls).push(call);
    }

    fn check(&self, call: &'static str) -> Result<(), ClientError> {
        if lock(&self.agent.fail_next).take_if(|f| *f == call).is_some() {
            return Err(ClientError::ConnectionDropped("scripted failure".into()));
        }
        if self.agent.password.is_some() && !self.authorized {
            return Err(ClientError::Codec(CodecError::Unauthorized));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, endpoint: &RemoteEndpoint) -> Result<(), ClientError> {
        self.record(format!("open {}", endpoint.id()));
        if lock(&self.agent.fail_next).take_if(|f| *f == "open").is_some() {
            return Err(ClientError::ConnectFailed("scripted refusal".into()));
        }
        Ok(())
    }

    async fn authorize(&mut self, password: &str) -> Result<(), ClientError> {
        self.record("authorize".into());
        match &self.agent.password {
            Some(expected) if expected == password => {
                self.authorized = true;
                Ok(())
            }
            Some(_) => Err(ClientError::AuthRejected),
            None => {
                self.authorized = true;
                Ok(())
            }
        }
    }

    async fn exchange_versions(&mut self) -> Result<Option<VersionInfo>, ClientError> {
        self.record("exchange_versions".into());
        self.check("exchange_versions")?;
        Ok(self.agent.version)
    }

    async fn get_state(&mut self) -> Result<CcState, ClientError> {
        self.record("get_state".into());
        self.check("get_state")?;
        Ok(lock(&self.agent.state).clone())
    }

    async fn get_cc_status(&mut self) -> Result<CcStatus, ClientError> {
        self.record("get_cc_status".into());
        self.check("get_cc_status")?;
        Ok(lock(&self.agent.cc_status).clone())
    }

    async fn get_host_info(&mut self) -> Result<HostInfo, ClientError> {
        self.record("get_host_info".into());
        self.check("get_host_info")?;
        Ok(lock(&self.agent.host_info).clone())
    }

    async fn get_project_status(&mut self) -> Result<Vec<ProjectRecord>, ClientError> {
        self.record("get_project_status".into());
        self.check("get_project_status")?;
        Ok(lock(&self.agent.projects).clone())
    }

    async fn get_results(&mut self) -> Result<Vec<ResultInfo>, ClientError> {
        self.record("get_results".into());
        self.check("get_results")?;
        Ok(lock(&self.agent.results).clone())
    }

    async fn get_file_transfers(&mut self) -> Result<Vec<TransferRecord>, ClientError> {
        self.record("get_file_transfers".into());
        self.check("get_file_transfers")?;
        Ok(lock(&self.agent.transfers).clone())
    }

    async fn get_message_count(&mut self) -> Result<i32, ClientError> {
        self.record("get_message_count".into());
        self.check("get_message_count")?;
        Ok(lock(&self.agent.messages)
            .iter()
            .map(|m| m.seqno)
            .max()
            .unwrap_or(0))
    }

    async fn get_messages(&mut self, since_seq: i32) -> Result<Vec<MessageRecord>, ClientError> {
        self.record(format!("get_messages since={since_seq}"));
        self.check("get_messages")?;
        Ok(lock(&self.agent.messages)
            .iter()
            .filter(|m| m.seqno > since_seq)
            .cloned()
            .collect())
    }

    async fn set_run_mode(&mut self, mode: RunMode, duration: f64) -> Result<(), ClientError> {
        self.record(format!("set_run_mode {mode:?} {duration}"));
        self.check("set_run_mode")
    }

    async fn set_network_mode(&mut self, mode: RunMode, duration: f64) -> Result<(), ClientError> {
        self.record(format!("set_network_mode {mode:?} {duration}"));
        self.check("set_network_mode")
    }

    async fn set_gpu_mode(&mut self, mode: RunMode, duration: f64) -> Result<(), ClientError> {
        self.record(format!("set_gpu_mode {mode:?} {duration}"));
        self.check("set_gpu_mode")
    }

    async fn run_benchmarks(&mut self) -> Result<(), ClientError> {
        self.record("run_benchmarks".into());
        self.check("run_benchmarks")
    }

    async fn network_available(&mut self) -> Result<(), ClientError> {
        self.record("network_available".into());
        self.check("network_available")
    }

    async fn quit(&mut self) -> Result<(), ClientError> {
        self.record("quit".into());
        self.agent.quit_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn project_op(&mut self, op: ProjectOp, url: &str) -> Result<(), ClientError> {
        self.record(format!("project_op {} {url}", op.rpc_tag()));
        self.check("project_op")
    }

    async fn result_op(&mut self, op: TaskOp, url: &str, name: &str) -> Result<(), ClientError> {
        self.record(format!("result_op {} {url} {name}", op.rpc_tag()));
        self.check("result_op")
    }

    async fn transfer_op(&mut self, op: TransferOp, url: &str, name: &str) -> Result<(), ClientError> {
        self.record(format!("transfer_op {} {url} {name}", op.rpc_tag()));
        self.check("transfer_op")
    }

    async fn connection_alive(&mut self) -> bool {
        if self.agent.quit_requested.load(Ordering::SeqCst) {
            self.agent.survive_quit.load(Ordering::SeqCst)
        } else {
            true
        }
    }

    async fn close(&mut self) {
        self.record("close".into());
    }
}

pub struct MockFactory {
    pub agent: Arc<MockAgent>,
}

impl TransportFactory for MockFactory {
    fn create(&self) -> Box<dyn Transport + Send> {
        Box::new(MockTransport {
            agent: Arc::clone(&self.agent),
            authorized: false,
        })
    }
}

/// Append-only log shared by every recording party in a test, so the
/// relative order of callbacks across parties is visible.
#[derive(Default)]
pub struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    pub fn push(&self, entry: String) {
        lock(&self.0).push(entry);
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|entry| entry.contains(needle))
            .count()
    }

    /// Polls until the predicate holds; panics after five seconds.
    pub async fn wait_until(&self, what: &str, pred: impl Fn(&[String]) -> bool) {
        let poll = async {
            loop {
                if pred(&self.snapshot()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), poll).await.is_err() {
            panic!("timed out waiting for {what}; log = {:#?}", self.snapshot());
        }
    }

    pub async fn wait_for(&self, needle: &str) {
        self.wait_until(needle, |entries| {
            entries.iter().any(|entry| entry.contains(needle))
        })
        .await;
    }
}

pub struct RecordingObserver {
    pub label: &'static str,
    pub log: Arc<EventLog>,
}

impl ConnectionStatusObserver for RecordingObserver {
    fn connection_progress(&self, stage: ProgressStage) {
        self.log.push(format!("{}: progress {stage:?}", self.label));
    }

    fn client_connected(&self, endpoint_id: &str, version: Option<&VersionInfo>) {
        let version = version.map_or_else(|| "unknown".to_owned(), ToString::to_string);
        self.log
            .push(format!("{}: connected {endpoint_id} v{version}", self.label));
    }

    fn client_disconnected(&self, endpoint_id: &str, cause: DisconnectCause) {
        self.log
            .push(format!("{}: disconnected {endpoint_id} {cause:?}", self.label));
    }
}

pub struct RecordingReceiver {
    pub label: &'static str,
    pub log: Arc<EventLog>,
    /// Return value for every `updated_*` callback ("keep refreshing").
    pub periodic: AtomicBool,
}

impl RecordingReceiver {
    pub fn new(label: &'static str, log: &Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            periodic: AtomicBool::new(false),
        })
    }

    fn answer(&self) -> bool {
        self.periodic.load(Ordering::SeqCst)
    }
}

impl ClientReplyReceiver for RecordingReceiver {
    fn client_connected(&self, _handle: &ClientHandle) {
        self.log.push(format!("{}: connected", self.label));
    }

    fn client_disconnected(&self) {
        self.log.push(format!("{}: disconnected", self.label));
    }

    fn updated_client_mode(&self, status: &CcStatus) -> bool {
        self.log
            .push(format!("{}: client_mode {:?}", self.label, status.task_mode));
        self.answer()
    }

    fn updated_host_info(&self, info: &HostInfo) -> bool {
        self.log
            .push(format!("{}: host_info {}", self.label, info.domain_name));
        self.answer()
    }

    fn updated_projects(&self, projects: &[ProjectRecord]) -> bool {
        self.log
            .push(format!("{}: projects {}", self.label, projects.len()));
        self.answer()
    }

    fn updated_tasks(&self, tasks: &[TaskRecord]) -> bool {
        self.log.push(format!("{}: tasks {}", self.label, tasks.len()));
        self.answer()
    }

    fn updated_transfers(&self, transfers: &[TransferRecord]) -> bool {
        self.log
            .push(format!("{}: transfers {}", self.label, transfers.len()));
        self.answer()
    }

    fn updated_messages(&self, messages: &[MessageRecord]) -> bool {
        self.log
            .push(format!("{}: messages {}", self.label, messages.len()));
        self.answer()
    }
}
