//! Replay Guard
//!
//! Freshness window plus per-session request de-duplication. Each session
//! has a ledger of request ids in one of two states:
//!
//! - `Pending`: admitted and still being handled
//! - `Completed`: handled, response cached for redelivery
//!
//! Admission is a single check-and-set under the session's map shard lock,
//! so two deliveries of the same id can never both be admitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::protocol::{Request, Response};
use crate::types::{unix_now, Result, SiloError};

/// Maximum accepted distance between a request's timestamp and the local clock (seconds)
pub const REQUEST_TIME_TOLERANCE: i64 = 120;

/// How long completed requests stay cached (seconds)
pub const REPLAY_RETENTION: i64 = REQUEST_TIME_TOLERANCE * 10;

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Completed(Response),
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    state: EntryState,
    recorded_at: i64,
}

type Ledgers = DashMap<String, HashMap<String, LedgerEntry>>;

/// Outcome of admitting a request
#[derive(Debug)]
pub enum Admission {
    /// First sighting; the caller owns the pending mark
    Fresh(PendingTicket),
    /// Already handled; replay the cached response
    Cached(Response),
}

/// Fail with `InvalidRequestTime` unless `request` is within tolerance of `now`.
/// The boundary itself is accepted.
pub fn check_request_time(request: &Request, now: i64) -> Result<()> {
    if now.abs_diff(request.unix_seconds) > REQUEST_TIME_TOLERANCE.unsigned_abs() {
        return Err(SiloError::InvalidRequestTime {
            unix_seconds: request.unix_seconds,
            now,
        });
    }
    Ok(())
}

/// Seconds until `request` falls out of tolerance, zero if it already has
pub fn time_until_stale(request: &Request, now: i64) -> Duration {
    let deadline = request.unix_seconds.saturating_add(REQUEST_TIME_TOLERANCE);
    Duration::from_secs(u64::try_from(deadline.saturating_sub(now)).unwrap_or(0))
}

/// Request de-duplication table shared by all handlers
#[derive(Debug, Clone, Default)]
pub struct ReplayGuard {
    ledgers: Arc<Ledgers>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a request against the local clock
    pub fn admit(&self, session_id: &str, request: &Request) -> Result<Admission> {
        self.admit_at(session_id, request, unix_now())
    }

    /// Admit a request as of `now` (unix seconds)
    pub fn admit_at(&self, session_id: &str, request: &Request, now: i64) -> Result<Admission> {
        if let Err(e) = check_request_time(request, now) {
            warn!(
                session_id = %session_id,
                request_id = %request.id,
                unix_seconds = request.unix_seconds,
                now,
                "Request outside time tolerance"
            );
            return Err(e);
        }

        let mut ledger = self.ledgers.entry(session_id.to_string()).or_default();

        // Pending entries are owned by a live ticket and never aged out
        ledger.retain(|_, entry| {
            matches!(entry.state, EntryState::Pending) || now - entry.recorded_at <= REPLAY_RETENTION
        });

        match ledger.get(&request.id).map(|entry| entry.state.clone()) {
            Some(EntryState::Pending) => {
                debug!(session_id = %session_id, request_id = %request.id, "Duplicate in-flight request");
                Err(SiloError::RequestPending(request.id.clone()))
            }
            Some(EntryState::Completed(response)) => {
                debug!(session_id = %session_id, request_id = %request.id, "Replaying cached response");
                Ok(Admission::Cached(response))
            }
            None => {
                ledger.insert(
                    request.id.clone(),
                    LedgerEntry {
                        state: EntryState::Pending,
                        recorded_at: now,
                    },
                );
                Ok(Admission::Fresh(PendingTicket {
                    ledgers: Arc::clone(&self.ledgers),
                    session_id: session_id.to_string(),
                    request_id: request.id.clone(),
                    done: false,
                }))
            }
        }
    }

    /// Drop every entry for a session
    pub fn forget(&self, session_id: &str) {
        if self.ledgers.remove(session_id).is_some() {
            debug!(session_id = %session_id, "Forgot replay ledger");
        }
    }

    /// Age out completed entries across all sessions
    pub fn cleanup(&self) {
        let now = unix_now();
        for mut ledger in self.ledgers.iter_mut() {
            ledger.retain(|_, entry| {
                matches!(entry.state, EntryState::Pending)
                    || now - entry.recorded_at <= REPLAY_RETENTION
            });
        }
        self.ledgers.retain(|_, ledger| !ledger.is_empty());
    }

    /// Number of tracked requests for a session
    pub fn tracked(&self, session_id: &str) -> usize {
        self.ledgers.get(session_id).map(|l| l.len()).unwrap_or(0)
    }
}

/// Ownership of a `Pending` mark.
///
/// Completing caches the response; dropping without completing releases the
/// mark so the request can be retried.
#[derive(Debug)]
pub struct PendingTicket {
    ledgers: Arc<Ledgers>,
    session_id: String,
    request_id: String,
    done: bool,
}

impl PendingTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Mark the request completed with its response
    pub fn complete(mut self, response: &Response) {
        self.done = true;
        // A forgotten session stays forgotten
        if let Some(mut ledger) = self.ledgers.get_mut(&self.session_id) {
            if let Some(entry) = ledger.get_mut(&self.request_id) {
                entry.state = EntryState::Completed(response.clone());
            }
        }
    }

    /// Release the pending mark explicitly
    pub fn release(self) {}
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(mut ledger) = self.ledgers.get_mut(&self.session_id) {
            let pending = matches!(
                ledger.get(&self.request_id).map(|e| &e.state),
                Some(EntryState::Pending)
            );
            if pending {
                ledger.remove(&self.request_id);
                debug!(session_id = %self.session_id, request_id = %self.request_id, "Released pending request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckResponse, ResponseBody};

    const NOW: i64 = 1_700_000_000;

    fn request(id: &str, unix_seconds: i64) -> Request {
        Request::new(id, unix_seconds, false)
    }

    fn ack(id: &str) -> Response {
        Response::new(id, "endpoint", ResponseBody::Ack(AckResponse {}))
    }

    #[test]
    fn test_fresh_then_pending_then_cached() {
        let guard = ReplayGuard::new();
        let req = request("r1", NOW);

        let ticket = match guard.admit_at("s1", &req, NOW).unwrap() {
            Admission::Fresh(ticket) => ticket,
            other => panic!("expected fresh, got {other:?}"),
        };
        assert!(matches!(
            guard.admit_at("s1", &req, NOW),
            Err(SiloError::RequestPending(_))
        ));

        ticket.complete(&ack("r1"));
        match guard.admit_at("s1", &req, NOW).unwrap() {
            Admission::Cached(response) => assert_eq!(response.request_id, "r1"),
            other => panic!("expected cached, got {other:?}"),
        }
    }

    #[test]
    fn test_dropped_ticket_releases_pending() {
        let guard = ReplayGuard::new();
        let req = request("r1", NOW);

        match guard.admit_at("s1", &req, NOW).unwrap() {
            Admission::Fresh(ticket) => ticket.release(),
            other => panic!("expected fresh, got {other:?}"),
        }
        assert_eq!(guard.tracked("s1"), 0);
        assert!(matches!(
            guard.admit_at("s1", &req, NOW).unwrap(),
            Admission::Fresh(_)
        ));
    }

    #[test]
    fn test_sessions_are_independent() {
        let guard = ReplayGuard::new();
        let req = request("r1", NOW);

        let _a = guard.admit_at("s1", &req, NOW).unwrap();
        assert!(matches!(
            guard.admit_at("s2", &req, NOW).unwrap(),
            Admission::Fresh(_)
        ));
    }

    #[test]
    fn test_time_tolerance_boundary() {
        let guard = ReplayGuard::new();

        for (id, offset) in [("past", -REQUEST_TIME_TOLERANCE), ("future", REQUEST_TIME_TOLERANCE)] {
            assert!(guard.admit_at("s1", &request(id, NOW + offset), NOW).is_ok());
        }
        for (id, offset) in [
            ("stale", -REQUEST_TIME_TOLERANCE - 1),
            ("ahead", REQUEST_TIME_TOLERANCE + 1),
            ("old", -3 * REQUEST_TIME_TOLERANCE),
        ] {
            assert!(matches!(
                guard.admit_at("s1", &request(id, NOW + offset), NOW),
                Err(SiloError::InvalidRequestTime { .. })
            ));
        }
    }

    #[test]
    fn test_time_until_stale() {
        let req = request("r1", NOW - 100);
        assert_eq!(time_until_stale(&req, NOW), Duration::from_secs(20));
        assert_eq!(time_until_stale(&req, NOW + 20), Duration::ZERO);
        assert_eq!(time_until_stale(&req, NOW + 500), Duration::ZERO);
        assert!(check_request_time(&req, NOW + 20).is_ok());
        assert!(check_request_time(&req, NOW + 21).is_err());

        let ahead = request("r2", NOW + 30);
        assert_eq!(time_until_stale(&ahead, NOW), Duration::from_secs(150));
        assert_eq!(time_until_stale(&request("max", i64::MAX), NOW), Duration::from_secs((i64::MAX - NOW) as u64));
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let guard = ReplayGuard::new();
        assert!(guard.admit_at("s1", &request("min", i64::MIN), NOW).is_err());
        assert!(guard.admit_at("s1", &request("max", i64::MAX), NOW).is_err());
    }

    #[test]
    fn test_completed_entries_age_out() {
        let guard = ReplayGuard::new();
        let req = request("r1", NOW);
        if let Admission::Fresh(ticket) = guard.admit_at("s1", &req, NOW).unwrap() {
            ticket.complete(&ack("r1"));
        }

        // A different request after the retention window prunes the old one
        let later = NOW + REPLAY_RETENTION + 1;
        let _next = guard.admit_at("s1", &request("r2", later), later).unwrap();
        assert_eq!(guard.tracked("s1"), 1);
    }

    #[test]
    fn test_forget_discards_ledger() {
        let guard = ReplayGuard::new();
        let req = request("r1", NOW);
        let ticket = match guard.admit_at("s1", &req, NOW).unwrap() {
            Admission::Fresh(ticket) => ticket,
            other => panic!("expected fresh, got {other:?}"),
        };

        guard.forget("s1");
        ticket.complete(&ack("r1"));
        assert_eq!(guard.tracked("s1"), 0);
    }

    #[test]
    fn test_concurrent_admission_has_one_winner() {
        let guard = ReplayGuard::new();
        let req = request("r1", NOW);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let req = req.clone();
                std::thread::spawn(move || match guard.admit_at("s1", &req, NOW) {
                    Ok(Admission::Fresh(ticket)) => {
                        // Hold the mark so the losers observe it
                        std::mem::forget(ticket);
                        1
                    }
                    Err(SiloError::RequestPending(_)) => 0,
                    other => panic!("unexpected admission: {other:?}"),
                })
            })
            .collect();

        let winners: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }
}
