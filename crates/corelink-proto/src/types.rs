//! Typed records for the core-client GUI RPC protocol surface.

use std::fmt;

use crate::error::UnsupportedOpError;

/// Immutable identity of a remote agent, owned by the caller and
/// passed into `connect`.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub address: String,
    pub port: u16,
    pub nickname: String,
    pub password: String,
}

impl RemoteEndpoint {
    /// Stable identifier used in observer notifications.
    pub fn id(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("nickname", &self.nickname)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Negotiated agent version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: i32,
    pub minor: i32,
    pub release: i32,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.release)
    }
}

/// Run/network/GPU mode of the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    Always,
    #[default]
    Auto,
    Never,
    Restore,
}

impl RunMode {
    /// Wire integer as reported inside `cc_status`. Unknown values are
    /// not representable; callers warn and fall back to the default.
    pub fn from_wire(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Always),
            2 => Some(Self::Auto),
            3 => Some(Self::Never),
            4 => Some(Self::Restore),
            _ => None,
        }
    }

    /// Element name used in `set_run_mode` / `set_network_mode` /
    /// `set_gpu_mode` requests.
    pub fn xml_tag(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Auto => "auto",
            Self::Never => "never",
            Self::Restore => "restore",
        }
    }
}

/// Operation on an attached project. Closed set; anything else is
/// rejected at the boundary with [`UnsupportedOpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectOp {
    Update,
    Suspend,
    Resume,
    NoMoreWork,
    AllowMoreWork,
    Reset,
    Detach,
}

impl ProjectOp {
    pub fn rpc_tag(self) -> &'static str {
        match self {
            Self::Update => "project_update",
            Self::Suspend => "project_suspend",
            Self::Resume => "project_resume",
            Self::NoMoreWork => "project_nomorework",
            Self::AllowMoreWork => "project_allowmorework",
            Self::Reset => "project_reset",
            Self::Detach => "project_detach",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, UnsupportedOpError> {
        match code {
            "project_update" => Ok(Self::Update),
            "project_suspend" => Ok(Self::Suspend),
            "project_resume" => Ok(Self::Resume),
            "project_nomorework" => Ok(Self::NoMoreWork),
            "project_allowmorework" => Ok(Self::AllowMoreWork),
            "project_reset" => Ok(Self::Reset),
            "project_detach" => Ok(Self::Detach),
            other => Err(UnsupportedOpError {
                code: other.to_string(),
            }),
        }
    }
}

/// Operation on a task (result).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
    Suspend,
    Resume,
    Abort,
}

impl TaskOp {
    pub fn rpc_tag(self) -> &'static str {
        match self {
            Self::Suspend => "suspend_result",
            Self::Resume => "resume_result",
            Self::Abort => "abort_result",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, UnsupportedOpError> {
        match code {
            "suspend_result" => Ok(Self::Suspend),
            "resume_result" => Ok(Self::Resume),
            "abort_result" => Ok(Self::Abort),
            other => Err(UnsupportedOpError {
                code: other.to_string(),
            }),
        }
    }
}

/// Operation on a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Retry,
    Abort,
}

impl TransferOp {
    pub fn rpc_tag(self) -> &'static str {
        match self {
            Self::Retry => "retry_file_transfer",
            Self::Abort => "abort_file_transfer",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, UnsupportedOpError> {
        match code {
            "retry_file_transfer" => Ok(Self::Retry),
            "abort_file_transfer" => Ok(Self::Abort),
            other => Err(UnsupportedOpError {
                code: other.to_string(),
            }),
        }
    }
}

/// Kind of cached data an update operation refreshes. One pending
/// auto-refresh exists per (receiver, kind) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    ClientMode,
    HostInfo,
    Projects,
    Tasks,
    Transfers,
    Messages,
}

/// Stage of an in-flight connection attempt, forwarded to status
/// observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Connecting,
    Authorizing,
    RetrievingInitialData,
}

/// Snapshot of the agent's run/network/GPU modes and suspend reasons
/// (`cc_status` reply).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CcStatus {
    pub task_mode: RunMode,
    pub task_mode_perm: RunMode,
    pub task_suspend_reason: i32,
    pub network_mode: RunMode,
    pub network_mode_perm: RunMode,
    pub network_suspend_reason: i32,
    pub network_status: i32,
    pub gpu_mode: RunMode,
    pub gpu_mode_perm: RunMode,
    pub gpu_suspend_reason: i32,
}

/// Static description of the host the agent runs on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub domain_name: String,
    pub ip_addr: String,
    pub host_cpid: String,
    pub p_ncpus: i32,
    pub p_vendor: String,
    pub p_model: String,
    pub p_fpops: f64,
    pub p_iops: f64,
    pub p_membw: f64,
    pub os_name: String,
    pub os_version: String,
    pub m_nbytes: f64,
    pub m_swap: f64,
    pub d_total: f64,
    pub d_free: f64,
}

/// A work-provider the agent is attached to. Keyed by master URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectRecord {
    pub master_url: String,
    pub project_name: String,
    pub resource_share: f64,
    /// This project's share of the summed resource share across all
    /// current projects. Derived once per full projects fetch, not
    /// carried on the wire.
    pub share_fraction: f64,
    pub user_total_credit: f64,
    pub user_expavg_credit: f64,
    pub host_total_credit: f64,
    pub host_expavg_credit: f64,
    pub min_rpc_time: f64,
    pub suspended: bool,
    pub dont_request_more_work: bool,
    pub sched_rpc_pending: bool,
}

/// Recomputes [`ProjectRecord::share_fraction`] over one full fetch.
pub fn apply_share_fractions(projects: &mut [ProjectRecord]) {
    let total: f64 = projects.iter().map(|p| p.resource_share).sum();
    for p in projects.iter_mut() {
        p.share_fraction = if total > 0.0 {
            p.resource_share / total
        } else {
            0.0
        };
    }
}

/// Application lookup record; join-only, never exposed to receivers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppRecord {
    pub name: String,
    pub user_friendly_name: String,
}

/// Workunit lookup record; join-only, never exposed to receivers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkunitRecord {
    pub name: String,
    pub app_name: String,
    pub rsc_fpops_est: f64,
}

/// Raw result entry as it appears on the wire, before joining with its
/// workunit, app and project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultInfo {
    pub name: String,
    pub wu_name: String,
    pub project_url: String,
    pub state: i32,
    pub scheduler_state: i32,
    pub active_task: bool,
    pub active_task_state: i32,
    pub fraction_done: f64,
    pub current_cpu_time: f64,
    pub final_cpu_time: f64,
    pub estimated_cpu_time_remaining: f64,
    pub report_deadline: f64,
    pub received_time: f64,
    pub ready_to_report: bool,
    pub suspended_via_gui: bool,
}

/// One unit of computation, joined across Result, Workunit, App and
/// Project for display. Constructed only when all three joins resolve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRecord {
    pub name: String,
    pub wu_name: String,
    pub project_url: String,
    pub project_name: String,
    pub app_name: String,
    pub state: i32,
    pub scheduler_state: i32,
    pub active_task: bool,
    pub active_task_state: i32,
    pub fraction_done: f64,
    pub cpu_time: f64,
    pub estimated_cpu_time_remaining: f64,
    pub report_deadline: f64,
    pub received_time: f64,
    pub ready_to_report: bool,
    pub suspended_via_gui: bool,
    pub rsc_fpops_est: f64,
}

impl TaskRecord {
    /// Joins a wire result with its resolved workunit, app and project.
    pub fn from_parts(
        result: &ResultInfo,
        workunit: &WorkunitRecord,
        app: &AppRecord,
        project: &ProjectRecord,
    ) -> Self {
        let mut task = Self {
            name: result.name.clone(),
            wu_name: result.wu_name.clone(),
            project_url: project.master_url.clone(),
            project_name: project.project_name.clone(),
            app_name: app.user_friendly_name.clone(),
            rsc_fpops_est: workunit.rsc_fpops_est,
            ..Self::default()
        };
        task.update_from(result);
        task
    }

    /// Refreshes the volatile fields from a newer wire result, keeping
    /// the joined identity intact.
    pub fn update_from(&mut self, result: &ResultInfo) {
        self.state = result.state;
        self.scheduler_state = result.scheduler_state;
        self.active_task = result.active_task;
        self.active_task_state = result.active_task_state;
        self.fraction_done = result.fraction_done;
        self.cpu_time = if result.active_task {
            result.current_cpu_time
        } else {
            result.final_cpu_time
        };
        self.estimated_cpu_time_remaining = result.estimated_cpu_time_remaining;
        self.report_deadline = result.report_deadline;
        self.received_time = result.received_time;
        self.ready_to_report = result.ready_to_report;
        self.suspended_via_gui = result.suspended_via_gui;
    }
}

/// An in-progress upload/download of a project file. The transfer list
/// is always replaced wholesale on refresh, never merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferRecord {
    pub name: String,
    pub project_url: String,
    pub is_upload: bool,
    pub nbytes: f64,
    pub bytes_xferred: f64,
    pub xfer_active: bool,
    pub xfer_speed: f64,
    pub time_so_far: f64,
    pub next_request_time: f64,
    pub status: i32,
    pub project_backoff: f64,
}

/// A sequence-numbered log entry emitted by the agent. Once cached, a
/// sequence number's content never changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRecord {
    pub seqno: i32,
    pub project: String,
    pub priority: i32,
    pub timestamp: i64,
    pub body: String,
}

/// Full agent state (`get_state` reply): versioned snapshot of host
/// info plus the project/app/workunit/result tables the task join is
/// built from.
#[derive(Debug, Clone, Default)]
pub struct CcState {
    pub version: Option<VersionInfo>,
    pub host_info: Option<HostInfo>,
    pub have_gpu: bool,
    pub projects: Vec<ProjectRecord>,
    pub apps: Vec<AppRecord>,
    pub workunits: Vec<WorkunitRecord>,
    pub results: Vec<ResultInfo>,
}
