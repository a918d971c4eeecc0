//! Tolerant XML codec for GUI RPC reply documents, plus request
//! rendering.
//!
//! Parsing policy: the `<unauthorized/>` marker is checked before
//! anything else in every reply; a document that is not well-formed or
//! lacks the reply envelope is [`CodecError::Malformed`]; an absent or
//! empty list element yields an empty collection; a single field that
//! fails numeric/boolean conversion is logged and left at its default;
//! entities missing their minimum fields are dropped rather than
//! included half-populated.

use roxmltree::{Document, Node};
use tracing::{debug, warn};

use crate::error::{CodecError, Result};
use crate::types::{
    AppRecord, CcState, CcStatus, HostInfo, MessageRecord, ProjectRecord, ResultInfo, RunMode,
    TransferRecord, VersionInfo, WorkunitRecord,
};

/// Terminator byte after each document, both directions.
pub const DOCUMENT_TERMINATOR: u8 = 0x03;

/// Wraps a request body in the GUI RPC envelope, terminator included.
pub fn render_request(body: &str) -> String {
    format!("<boinc_gui_rpc_request>\n{body}\n</boinc_gui_rpc_request>\n\u{3}")
}

/// Escapes text for embedding in a request document.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn parse_document<'a>(xml: &'a str, entity: &'static str) -> Result<Document<'a>> {
    Document::parse(xml).map_err(|err| CodecError::malformed(entity, err.to_string()))
}

/// Locates the reply envelope and performs the unauthorized check.
fn envelope<'a, 'input>(
    doc: &'a Document<'input>,
    entity: &'static str,
) -> Result<Node<'a, 'input>> {
    let root = envelope_unchecked(doc, entity)?;
    if root
        .descendants()
        .any(|n| n.is_element() && n.has_tag_name("unauthorized"))
    {
        return Err(CodecError::Unauthorized);
    }
    Ok(root)
}

fn envelope_unchecked<'a, 'input>(
    doc: &'a Document<'input>,
    entity: &'static str,
) -> Result<Node<'a, 'input>> {
    let root = doc.root_element();
    if !root.has_tag_name("boinc_gui_rpc_reply") {
        return Err(CodecError::malformed(
            entity,
            "missing boinc_gui_rpc_reply envelope",
        ));
    }
    Ok(root)
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.has_tag_name(tag))
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    child(node, tag).and_then(|n| n.text())
}

fn string_field(node: Node<'_, '_>, tag: &str) -> String {
    child_text(node, tag).map(str::trim).unwrap_or("").to_string()
}

fn f64_field(node: Node<'_, '_>, tag: &str, entity: &'static str) -> f64 {
    match child_text(node, tag) {
        None => 0.0,
        Some(text) => match text.trim().parse::<f64>() {
            Ok(value) => value,
            Err(err) => {
                warn!(entity, field = tag, value = text.trim(), error = %err, "bad numeric field, using default");
                0.0
            }
        },
    }
}

fn i64_field(node: Node<'_, '_>, tag: &str, entity: &'static str) -> i64 {
    match child_text(node, tag) {
        None => 0,
        Some(text) => {
            // Agents occasionally emit integers in float notation.
            let trimmed = text.trim();
            match trimmed.parse::<i64>() {
                Ok(value) => value,
                Err(_) => match trimmed.parse::<f64>() {
                    Ok(value) => value as i64,
                    Err(err) => {
                        warn!(entity, field = tag, value = trimmed, error = %err, "bad integer field, using default");
                        0
                    }
                },
            }
        }
    }
}

fn i32_field(node: Node<'_, '_>, tag: &str, entity: &'static str) -> i32 {
    i64_field(node, tag, entity) as i32
}

/// Boolean flags are `"0"`/non-`"0"` text; a bare self-closed element
/// also reads as true, an absent one as false.
fn bool_field(node: Node<'_, '_>, tag: &str) -> bool {
    match child(node, tag) {
        None => false,
        Some(n) => match n.text().map(str::trim) {
            None | Some("") => true,
            Some(text) => text != "0",
        },
    }
}

fn mode_field(node: Node<'_, '_>, tag: &str, entity: &'static str) -> RunMode {
    if child(node, tag).is_none() {
        return RunMode::default();
    }
    let code = i64_field(node, tag, entity);
    match RunMode::from_wire(code) {
        Some(mode) => mode,
        None => {
            warn!(entity, field = tag, code, "unknown mode code, using default");
            RunMode::default()
        }
    }
}

// --- Authentication ---------------------------------------------------

/// `<auth1/>` reply: the server nonce for the challenge-response.
pub fn parse_auth_nonce(xml: &str) -> Result<String> {
    const ENTITY: &str = "auth nonce";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    child_text(env, "nonce")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodecError::malformed(ENTITY, "missing nonce element"))
}

/// `<auth2>` reply: explicit authorized/unauthorized verdict. The
/// generic unauthorized check is deliberately bypassed here — an
/// `<unauthorized/>` in this reply means "wrong hash", not a broken
/// session.
pub fn parse_auth_reply(xml: &str) -> Result<bool> {
    const ENTITY: &str = "auth reply";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope_unchecked(&doc, ENTITY)?;
    if child(env, "authorized").is_some() {
        Ok(true)
    } else if child(env, "unauthorized").is_some() {
        Ok(false)
    } else {
        Err(CodecError::malformed(
            ENTITY,
            "neither authorized nor unauthorized present",
        ))
    }
}

// --- Simple replies ----------------------------------------------------

/// Acknowledgement reply for control operations: requires `<success/>`.
pub fn parse_ack(xml: &str, entity: &'static str) -> Result<()> {
    let doc = parse_document(xml, entity)?;
    let env = envelope(&doc, entity)?;
    if child(env, "success").is_some() {
        return Ok(());
    }
    let detail = child_text(env, "error")
        .or_else(|| child_text(env, "failure"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("missing success element");
    Err(CodecError::malformed(entity, detail.to_string()))
}

/// `exchange_versions` reply. Older agents do not recognize the call
/// and answer without a `server_version`; that is `Ok(None)` and the
/// caller falls back to extracting the version from a full state fetch.
pub fn parse_version(xml: &str) -> Result<Option<VersionInfo>> {
    const ENTITY: &str = "version";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    let Some(server_version) = child(env, "server_version") else {
        debug!("agent does not support exchange_versions");
        return Ok(None);
    };
    Ok(Some(VersionInfo {
        major: i32_field(server_version, "major", ENTITY),
        minor: i32_field(server_version, "minor", ENTITY),
        release: i32_field(server_version, "release", ENTITY),
    }))
}

/// `get_message_count` reply: the highest sequence number known to the
/// agent.
pub fn parse_message_count(xml: &str) -> Result<i32> {
    const ENTITY: &str = "message count";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    match child_text(env, "seqno") {
        Some(text) => text
            .trim()
            .parse::<i32>()
            .map_err(|err| CodecError::malformed(ENTITY, err.to_string())),
        None => Err(CodecError::malformed(ENTITY, "missing seqno element")),
    }
}

// --- Status & host info -----------------------------------------------

pub fn parse_cc_status(xml: &str) -> Result<CcStatus> {
    const ENTITY: &str = "cc_status";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    let status = child(env, "cc_status")
        .ok_or_else(|| CodecError::malformed(ENTITY, "missing cc_status element"))?;
    Ok(CcStatus {
        task_mode: mode_field(status, "task_mode", ENTITY),
        task_mode_perm: mode_field(status, "task_mode_perm", ENTITY),
        task_suspend_reason: i32_field(status, "task_suspend_reason", ENTITY),
        network_mode: mode_field(status, "network_mode", ENTITY),
        network_mode_perm: mode_field(status, "network_mode_perm", ENTITY),
        network_suspend_reason: i32_field(status, "network_suspend_reason", ENTITY),
        network_status: i32_field(status, "network_status", ENTITY),
        gpu_mode: mode_field(status, "gpu_mode", ENTITY),
        gpu_mode_perm: mode_field(status, "gpu_mode_perm", ENTITY),
        gpu_suspend_reason: i32_field(status, "gpu_suspend_reason", ENTITY),
    })
}

pub fn parse_host_info(xml: &str) -> Result<HostInfo> {
    const ENTITY: &str = "host info";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    let node = child(env, "host_info")
        .ok_or_else(|| CodecError::malformed(ENTITY, "missing host_info element"))?;
    Ok(host_info_from(node))
}

fn host_info_from(node: Node<'_, '_>) -> HostInfo {
    const ENTITY: &str = "host info";
    HostInfo {
        domain_name: string_field(node, "domain_name"),
        ip_addr: string_field(node, "ip_addr"),
        host_cpid: string_field(node, "host_cpid"),
        p_ncpus: i32_field(node, "p_ncpus", ENTITY),
        p_vendor: string_field(node, "p_vendor"),
        p_model: string_field(node, "p_model"),
        p_fpops: f64_field(node, "p_fpops", ENTITY),
        p_iops: f64_field(node, "p_iops", ENTITY),
        p_membw: f64_field(node, "p_membw", ENTITY),
        os_name: string_field(node, "os_name"),
        os_version: string_field(node, "os_version"),
        m_nbytes: f64_field(node, "m_nbytes", ENTITY),
        m_swap: f64_field(node, "m_swap", ENTITY),
        d_total: f64_field(node, "d_total", ENTITY),
        d_free: f64_field(node, "d_free", ENTITY),
    }
}

// --- Entity parsers ----------------------------------------------------

/// Minimum field: non-empty master URL.
fn project_from(node: Node<'_, '_>) -> Option<ProjectRecord> {
    const ENTITY: &str = "project";
    let master_url = string_field(node, "master_url");
    if master_url.is_empty() {
        debug!("dropping project entity without master_url");
        return None;
    }
    Some(ProjectRecord {
        master_url,
        project_name: string_field(node, "project_name"),
        resource_share: f64_field(node, "resource_share", ENTITY),
        share_fraction: 0.0,
        user_total_credit: f64_field(node, "user_total_credit", ENTITY),
        user_expavg_credit: f64_field(node, "user_expavg_credit", ENTITY),
        host_total_credit: f64_field(node, "host_total_credit", ENTITY),
        host_expavg_credit: f64_field(node, "host_expavg_credit", ENTITY),
        min_rpc_time: f64_field(node, "min_rpc_time", ENTITY),
        suspended: bool_field(node, "suspended_via_gui"),
        dont_request_more_work: bool_field(node, "dont_request_more_work"),
        sched_rpc_pending: bool_field(node, "sched_rpc_pending"),
    })
}

/// Minimum field: non-empty app name.
fn app_from(node: Node<'_, '_>) -> Option<AppRecord> {
    let name = string_field(node, "name");
    if name.is_empty() {
        debug!("dropping app entity without name");
        return None;
    }
    let user_friendly_name = {
        let friendly = string_field(node, "user_friendly_name");
        if friendly.is_empty() { name.clone() } else { friendly }
    };
    Some(AppRecord {
        name,
        user_friendly_name,
    })
}

/// Minimum field: non-empty workunit name.
fn workunit_from(node: Node<'_, '_>) -> Option<WorkunitRecord> {
    const ENTITY: &str = "workunit";
    let name = string_field(node, "name");
    if name.is_empty() {
        debug!("dropping workunit entity without name");
        return None;
    }
    Some(WorkunitRecord {
        name,
        app_name: string_field(node, "app_name"),
        rsc_fpops_est: f64_field(node, "rsc_fpops_est", ENTITY),
    })
}

/// Minimum field: non-empty result name.
fn result_from(node: Node<'_, '_>) -> Option<ResultInfo> {
    const ENTITY: &str = "result";
    let name = string_field(node, "name");
    if name.is_empty() {
        debug!("dropping result entity without name");
        return None;
    }
    let active = child(node, "active_task");
    let mut info = ResultInfo {
        name,
        wu_name: string_field(node, "wu_name"),
        project_url: string_field(node, "project_url"),
        state: i32_field(node, "state", ENTITY),
        scheduler_state: 0,
        active_task: active.is_some(),
        active_task_state: 0,
        fraction_done: 0.0,
        current_cpu_time: 0.0,
        final_cpu_time: f64_field(node, "final_cpu_time", ENTITY),
        estimated_cpu_time_remaining: f64_field(node, "estimated_cpu_time_remaining", ENTITY),
        report_deadline: f64_field(node, "report_deadline", ENTITY),
        received_time: f64_field(node, "received_time", ENTITY),
        ready_to_report: bool_field(node, "ready_to_report"),
        suspended_via_gui: bool_field(node, "suspended_via_gui"),
    };
    if let Some(active) = active {
        info.scheduler_state = i32_field(active, "scheduler_state", ENTITY);
        info.active_task_state = i32_field(active, "active_task_state", ENTITY);
        info.fraction_done = f64_field(active, "fraction_done", ENTITY);
        info.current_cpu_time = f64_field(active, "current_cpu_time", ENTITY);
    }
    Some(info)
}

/// Minimum field: non-empty file name.
fn transfer_from(node: Node<'_, '_>) -> Option<TransferRecord> {
    const ENTITY: &str = "file transfer";
    let name = string_field(node, "name");
    if name.is_empty() {
        debug!("dropping file transfer entity without name");
        return None;
    }
    let xfer = child(node, "file_xfer");
    let persistent = child(node, "persistent_file_xfer");
    let mut record = TransferRecord {
        name,
        project_url: string_field(node, "project_url"),
        is_upload: bool_field(node, "generated_locally") || bool_field(node, "is_upload"),
        nbytes: f64_field(node, "nbytes", ENTITY),
        bytes_xferred: 0.0,
        xfer_active: xfer.is_some(),
        xfer_speed: 0.0,
        time_so_far: 0.0,
        next_request_time: 0.0,
        status: i32_field(node, "status", ENTITY),
        project_backoff: f64_field(node, "project_backoff", ENTITY),
    };
    if let Some(xfer) = xfer {
        record.bytes_xferred = f64_field(xfer, "bytes_xferred", ENTITY);
        record.xfer_speed = f64_field(xfer, "xfer_speed", ENTITY);
    }
    if let Some(persistent) = persistent {
        record.time_so_far = f64_field(persistent, "time_so_far", ENTITY);
        record.next_request_time = f64_field(persistent, "next_request_time", ENTITY);
        if record.bytes_xferred == 0.0 {
            record.bytes_xferred = f64_field(persistent, "last_bytes_xferred", ENTITY);
        }
    }
    Some(record)
}

/// Minimum field: seqno > 0.
fn message_from(node: Node<'_, '_>) -> Option<MessageRecord> {
    const ENTITY: &str = "message";
    let seqno = i32_field(node, "seqno", ENTITY);
    if seqno <= 0 {
        debug!("dropping message entity without seqno");
        return None;
    }
    Some(MessageRecord {
        seqno,
        project: string_field(node, "project"),
        priority: i32_field(node, "pri", ENTITY),
        timestamp: i64_field(node, "time", ENTITY),
        body: string_field(node, "body"),
    })
}

// --- List replies ------------------------------------------------------

fn collect<'a, 'input, T>(
    env: Node<'a, 'input>,
    container: &str,
    element: &str,
    build: impl Fn(Node<'a, 'input>) -> Option<T>,
) -> Vec<T> {
    // An absent container reads the same as an empty one.
    let Some(list) = child(env, container) else {
        return Vec::new();
    };
    list.children()
        .filter(|n| n.is_element() && n.has_tag_name(element))
        .filter_map(build)
        .collect()
}

pub fn parse_projects(xml: &str) -> Result<Vec<ProjectRecord>> {
    const ENTITY: &str = "project list";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    Ok(collect(env, "projects", "project", project_from))
}

pub fn parse_results(xml: &str) -> Result<Vec<ResultInfo>> {
    const ENTITY: &str = "result list";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    Ok(collect(env, "results", "result", result_from))
}

pub fn parse_transfers(xml: &str) -> Result<Vec<TransferRecord>> {
    const ENTITY: &str = "transfer list";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    Ok(collect(env, "file_transfers", "file_transfer", transfer_from))
}

/// Message replies get one extra chance: agents forward log lines
/// verbatim, so a `<body>` may embed unescaped markup that breaks the
/// document. Sanitize body spans and re-attempt before giving up.
pub fn parse_messages(xml: &str) -> Result<Vec<MessageRecord>> {
    match try_parse_messages(xml) {
        Err(CodecError::Malformed { .. }) if xml.contains("<body>") => {
            debug!("message reply malformed, retrying with sanitized bodies");
            try_parse_messages(&sanitize_message_bodies(xml))
        }
        other => other,
    }
}

fn try_parse_messages(xml: &str) -> Result<Vec<MessageRecord>> {
    const ENTITY: &str = "message list";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    Ok(collect(env, "msgs", "msg", message_from))
}

/// Escapes markup inside `<body>…</body>` spans, leaving the rest of
/// the document untouched.
pub fn sanitize_message_bodies(xml: &str) -> String {
    const OPEN: &str = "<body>";
    const CLOSE: &str = "</body>";
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;
    while let Some(start) = rest.find(OPEN) {
        let body_start = start + OPEN.len();
        out.push_str(&rest[..body_start]);
        let Some(len) = rest[body_start..].find(CLOSE) else {
            // Unterminated body: escape everything that follows.
            out.push_str(&escape_text(&rest[body_start..]));
            return out;
        };
        out.push_str(&escape_text(&rest[body_start..body_start + len]));
        out.push_str(CLOSE);
        rest = &rest[body_start + len + CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

// --- Full state --------------------------------------------------------

pub fn parse_state(xml: &str) -> Result<CcState> {
    const ENTITY: &str = "client state";
    let doc = parse_document(xml, ENTITY)?;
    let env = envelope(&doc, ENTITY)?;
    let state = child(env, "client_state")
        .ok_or_else(|| CodecError::malformed(ENTITY, "missing client_state element"))?;

    let major = i32_field(state, "core_client_major_version", ENTITY);
    let minor = i32_field(state, "core_client_minor_version", ENTITY);
    let release = i32_field(state, "core_client_release", ENTITY);
    let version = if major > 0 {
        Some(VersionInfo {
            major,
            minor,
            release,
        })
    } else {
        None
    };

    let host_info = child(state, "host_info").map(host_info_from);
    let have_gpu = child(state, "host_info").is_some_and(|hi| {
        hi.descendants()
            .any(|n| n.is_element() && n.tag_name().name().starts_with("coproc_"))
    });

    // In a state dump projects, apps, workunits and results are all
    // direct children of client_state, interleaved by project.
    let mut projects: Vec<ProjectRecord> = state
        .children()
        .filter(|n| n.is_element() && n.has_tag_name("project"))
        .filter_map(project_from)
        .collect();
    crate::types::apply_share_fractions(&mut projects);

    let apps = state
        .children()
        .filter(|n| n.is_element() && n.has_tag_name("app"))
        .filter_map(app_from)
        .collect();
    let workunits = state
        .children()
        .filter(|n| n.is_element() && n.has_tag_name("workunit"))
        .filter_map(workunit_from)
        .collect();
    let results = state
        .children()
        .filter(|n| n.is_element() && n.has_tag_name("result"))
        .filter_map(result_from)
        .collect();

    Ok(CcState {
        version,
        host_info,
        have_gpu,
        projects,
        apps,
        workunits,
        results,
    })
}
