//! Process-wide download deduplication.
//!
//! At most one download per track id runs at a time. The first caller gets a
//! [`DownloadTicket`]; everyone else gets a [`DownloadWaiter`] on the same
//! completion signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Completion state of one in-flight download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Pending,
    Committed,
    Failed,
}

type InFlight = Arc<Mutex<HashMap<String, watch::Receiver<DownloadOutcome>>>>;

#[derive(Clone, Default)]
pub struct DownloadDedup {
    in_flight: InFlight,
}

pub enum DownloadClaim {
    /// Caller owns the fetch and must complete the ticket.
    Ticket(DownloadTicket),
    /// Another caller is already fetching this id.
    InFlight(DownloadWaiter),
}

impl DownloadDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the download of `track_id`, or join the one already running.
    pub fn claim(&self, track_id: &str) -> DownloadClaim {
        let mut map = self.in_flight.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(rx) = map.get(track_id) {
            return DownloadClaim::InFlight(DownloadWaiter { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(DownloadOutcome::Pending);
        map.insert(track_id.to_string(), rx);
        DownloadClaim::Ticket(DownloadTicket {
            track_id: track_id.to_string(),
            tx: Some(tx),
            in_flight: self.in_flight.clone(),
        })
    }

    /// Track ids with a download currently running.
    pub fn in_flight(&self) -> Vec<String> {
        let map = self.in_flight.lock().unwrap_or_else(|err| err.into_inner());
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Exclusive right to download one track id.
///
/// Dropping the ticket without calling [`DownloadTicket::complete`] releases
/// waiters with [`DownloadOutcome::Failed`].
pub struct DownloadTicket {
    track_id: String,
    tx: Option<watch::Sender<DownloadOutcome>>,
    in_flight: InFlight,
}

impl DownloadTicket {
    pub fn complete(mut self, committed: bool) {
        let outcome = if committed {
            DownloadOutcome::Committed
        } else {
            DownloadOutcome::Failed
        };
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: DownloadOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Remove first so a waiter that re-claims after a failure gets a fresh ticket.
        self.in_flight
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&self.track_id);
        let _ = tx.send(outcome);
    }
}

impl Drop for DownloadTicket {
    fn drop(&mut self) {
        self.finish(DownloadOutcome::Failed);
    }
}

pub struct DownloadWaiter {
    rx: watch::Receiver<DownloadOutcome>,
}

impl DownloadWaiter {
    /// Wait for the owning download to finish.
    pub async fn wait(mut self) -> DownloadOutcome {
        match self
            .rx
            .wait_for(|outcome| *outcome != DownloadOutcome::Pending)
            .await
        {
            Ok(outcome) => *outcome,
            Err(_) => DownloadOutcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_joins_first() {
        let dedup = DownloadDedup::new();
        let first = dedup.claim("abc");
        let second = dedup.claim("abc");
        assert!(matches!(first, DownloadClaim::Ticket(_)));
        assert!(matches!(second, DownloadClaim::InFlight(_)));
        assert_eq!(dedup.in_flight(), vec!["abc".to_string()]);
    }

    #[test]
    fn different_ids_do_not_collide() {
        let dedup = DownloadDedup::new();
        assert!(matches!(dedup.claim("a"), DownloadClaim::Ticket(_)));
        assert!(matches!(dedup.claim("b"), DownloadClaim::Ticket(_)));
    }

    #[tokio::test]
    async fn waiter_sees_commit() {
        let dedup = DownloadDedup::new();
        let DownloadClaim::Ticket(ticket) = dedup.claim("abc") else {
            panic!("expected ticket");
        };
        let DownloadClaim::InFlight(waiter) = dedup.claim("abc") else {
            panic!("expected waiter");
        };
        let handle = tokio::spawn(waiter.wait());
        ticket.complete(true);
        assert_eq!(handle.await.unwrap(), DownloadOutcome::Committed);
        assert!(dedup.in_flight().is_empty());
    }

    #[tokio::test]
    async fn dropped_ticket_releases_waiters_as_failed() {
        let dedup = DownloadDedup::new();
        let ticket = dedup.claim("abc");
        let DownloadClaim::InFlight(waiter) = dedup.claim("abc") else {
            panic!("expected waiter");
        };
        drop(ticket);
        assert_eq!(waiter.wait().await, DownloadOutcome::Failed);
        assert!(matches!(dedup.claim("abc"), DownloadClaim::Ticket(_)));
    }
}
