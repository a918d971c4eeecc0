//! Worker-owned cache of the remote agent's state.
//!
//! A full `get_state` fetch seeds the project/app/workunit tables the
//! task join is built from. Subsequent incremental fetches merge into
//! the cache; when a merge cannot be completed from cached lookup data
//! the caller falls back to another full fetch.

use std::collections::{BTreeMap, HashMap, HashSet};

use corelink_proto::{
    AppRecord, CcState, MessageRecord, ProjectRecord, ResultInfo, TaskRecord, TransferRecord,
    WorkunitRecord, apply_share_fractions,
};
use tracing::debug;

/// Whether an incremental result merge succeeded, or the cache lacks
/// the lookup rows to join a new result and a full refresh is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    NeedsFullRefresh,
}

#[derive(Default)]
pub struct StateCache {
    projects: Vec<ProjectRecord>,
    apps: HashMap<String, AppRecord>,
    workunits: HashMap<String, WorkunitRecord>,
    tasks: BTreeMap<String, TaskRecord>,
    active_tasks: HashSet<String>,
    transfers: Vec<TransferRecord>,
    messages: BTreeMap<i32, MessageRecord>,
    full_state_fetched: bool,
}

impl StateCache {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True once a full state fetch has seeded the lookup tables.
    /// Incremental task refreshes are meaningless before that.
    pub fn full_state_fetched(&self) -> bool {
        self.full_state_fetched
    }

    /// Replaces the cache contents from a full `get_state` reply.
    /// Messages survive; they are cursor-merged, never refetched whole.
    pub fn apply_full_state(&mut self, state: CcState) {
        self.projects = state.projects;
        self.apps = state
            .apps
            .into_iter()
            .map(|app| (app.name.clone(), app))
            .collect();
        self.workunits = state
            .workunits
            .into_iter()
            .map(|wu| (wu.name.clone(), wu))
            .collect();
        self.tasks.clear();
        for result in &state.results {
            match self.build_task(result) {
                Some(task) => {
                    self.tasks.insert(task.name.clone(), task);
                }
                None => {
                    debug!(result = %result.name, "dropping result with unresolved join");
                }
            }
        }
        self.rebuild_active_tasks();
        self.full_state_fetched = true;
    }

    /// Replaces the project table from a `get_project_status` reply.
    pub fn update_projects(&mut self, mut projects: Vec<ProjectRecord>) {
        apply_share_fractions(&mut projects);
        self.projects = projects;
    }

    /// Merges a `get_results` reply into the task table. Tasks whose
    /// name is absent from the reply are evicted. A result name not
    /// already in the cache aborts the whole merge; its join tables may
    /// be stale, so the caller refetches the full state instead.
    pub fn merge_results(&mut self, results: &[ResultInfo]) -> MergeOutcome {
        let mut merged: BTreeMap<String, TaskRecord> = BTreeMap::new();
        for result in results {
            let Some(task) = self.tasks.get(&result.name) else {
                debug!(result = %result.name, "result not in task cache");
                return MergeOutcome::NeedsFullRefresh;
            };
            let mut task = task.clone();
            task.update_from(result);
            merged.insert(task.name.clone(), task);
        }
        self.tasks = merged;
        self.rebuild_active_tasks();
        MergeOutcome::Merged
    }

    pub fn update_transfers(&mut self, transfers: Vec<TransferRecord>) {
        self.transfers = transfers;
    }

    /// Highest cached message sequence number, or 0 when empty. Used
    /// as the `since` cursor for the next message fetch.
    pub fn message_cursor(&self) -> i32 {
        self.messages.keys().next_back().copied().unwrap_or(0)
    }

    /// Appends newly fetched messages. A sequence number already in
    /// the cache keeps its existing content.
    pub fn merge_messages(&mut self, messages: Vec<MessageRecord>) {
        for message in messages {
            self.messages.entry(message.seqno).or_insert(message);
        }
    }

    pub fn projects(&self) -> &[ProjectRecord] {
        &self.projects
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.values().cloned().collect()
    }

    pub fn transfers(&self) -> &[TransferRecord] {
        &self.transfers
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.values().cloned().collect()
    }

    /// Names of tasks with a live execution slot on the agent. Rebuilt
    /// from scratch on every task update, never maintained in place.
    pub fn active_task_names(&self) -> &HashSet<String> {
        &self.active_tasks
    }

    fn rebuild_active_tasks(&mut self) {
        self.active_tasks = self
            .tasks
            .values()
            .filter(|task| task.active_task)
            .map(|task| task.name.clone())
            .collect();
    }

    fn build_task(&self, result: &ResultInfo) -> Option<TaskRecord> {
        let workunit = self.workunits.get(&result.wu_name)?;
        let app = self.apps.get(&workunit.app_name)?;
        let project = self
            .projects
            .iter()
            .find(|p| p.master_url == result.project_url)?;
        Some(TaskRecord::from_parts(result, workunit, app, project))
    }
}
