//! Periodic auto-refresh: one pending sleep-then-fire timer per
//! (receiver, data kind) pair.
//!
//! A timer fires exactly once, enqueueing the targeted update on the
//! worker; a receiver that answers "continue periodically" from the
//! resulting delivery gets the pair rescheduled by the dispatcher.
//! Rescheduling a pending pair replaces it, last write wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use corelink_proto::DataKind;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::options::{ClientOptions, ConnectivityStatus};
use crate::worker::{CancelLedger, ReceiverId, RequestKind, WorkerRequest};

pub struct AutoRefreshScheduler {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    ledger: Arc<CancelLedger>,
    connectivity: watch::Receiver<ConnectivityStatus>,
    interval_metered: Duration,
    interval_unmetered: Duration,
    entries: HashMap<(ReceiverId, DataKind), JoinHandle<()>>,
    inert: bool,
}

impl AutoRefreshScheduler {
    pub fn new(
        requests: mpsc::UnboundedSender<WorkerRequest>,
        ledger: Arc<CancelLedger>,
        connectivity: watch::Receiver<ConnectivityStatus>,
        options: &ClientOptions,
    ) -> Self {
        Self {
            requests,
            ledger,
            connectivity,
            interval_metered: options.refresh_interval_metered,
            interval_unmetered: options.refresh_interval_unmetered,
            entries: HashMap::new(),
            inert: false,
        }
    }

    /// Arms (or re-arms) the timer for one pair. A zero interval for
    /// the current connectivity class disables scheduling entirely.
    pub fn schedule(&mut self, receiver: ReceiverId, kind: DataKind) {
        if self.inert {
            return;
        }
        if interval_for(
            *self.connectivity.borrow(),
            self.interval_metered,
            self.interval_unmetered,
        )
        .is_none()
        {
            return;
        }
        let handle = tokio::spawn(refresh_timer(
            self.requests.clone(),
            Arc::clone(&self.ledger),
            self.connectivity.clone(),
            self.interval_metered,
            self.interval_unmetered,
            receiver,
            kind,
        ));
        if let Some(old) = self.entries.insert((receiver, kind), handle) {
            old.abort();
        }
    }

    /// Drops every pending timer for one receiver.
    pub fn unschedule(&mut self, receiver: ReceiverId) {
        self.entries.retain(|(owner, _), handle| {
            if *owner == receiver {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Aborts everything and refuses all future scheduling. Called on
    /// disconnect and on bridge teardown.
    pub fn cleanup(&mut self) {
        self.inert = true;
        for (_, handle) in self.entries.drain() {
            handle.abort();
        }
    }
}

impl Drop for AutoRefreshScheduler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn interval_for(
    status: ConnectivityStatus,
    metered: Duration,
    unmetered: Duration,
) -> Option<Duration> {
    let interval = match status {
        ConnectivityStatus::None => return None,
        ConnectivityStatus::Metered => metered,
        ConnectivityStatus::Unmetered => unmetered,
    };
    if interval.is_zero() { None } else { Some(interval) }
}

/// Sleeps for the interval of the current connectivity class, restarts
/// the sleep when the class changes, then fires one targeted update.
async fn refresh_timer(
    requests: mpsc::UnboundedSender<WorkerRequest>,
    ledger: Arc<CancelLedger>,
    mut connectivity: watch::Receiver<ConnectivityStatus>,
    metered: Duration,
    unmetered: Duration,
    receiver: ReceiverId,
    kind: DataKind,
) {
    loop {
        let Some(interval) = interval_for(*connectivity.borrow(), metered, unmetered) else {
            return;
        };
        tokio::select! {
            () = sleep(interval) => break,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    // Connectivity source gone; keep the last interval.
                    sleep(interval).await;
                    break;
                }
            }
        }
    }
    debug!(receiver, ?kind, "auto-refresh timer fired");
    let stamp = ledger.stamp(receiver);
    let request = WorkerRequest::stamped(
        RequestKind::Update {
            kind,
            target: Some(receiver),
        },
        stamp,
    );
    if requests.send(request).is_err() {
        debug!("worker queue closed, dropping auto-refresh");
    }
}
