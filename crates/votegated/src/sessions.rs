//! Per-caller liveness sessions.
//!
//! Each `BeginLiveness` call gets its own blink state machine, so
//! concurrent users never see each other's blinks. A session is bound to
//! the first identity that presents it, and a verification consumes its
//! blink.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use votegate_core::liveness::{self, LivenessState};

struct Session {
    state: LivenessState,
    identity: Option<String>,
    last_seen: Instant,
}

/// Why a session cannot vouch for an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    Unknown,
    /// Already presented for a different identity.
    OtherIdentity,
}

pub struct SessionRegistry {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Sessions untouched for longer than `ttl` are dropped.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new session and return its id.
    pub fn begin(&self) -> String {
        self.begin_at(Instant::now())
    }

    /// Current state of a live session.
    pub fn state(&self, id: &str) -> Option<LivenessState> {
        self.state_at(id, Instant::now())
    }

    /// Bind a session to `identity` on first use and return its state.
    /// Presenting it for any other identity afterwards fails.
    pub fn claim(&self, id: &str, identity: &str) -> Result<LivenessState, ClaimError> {
        self.claim_at(id, identity, Instant::now())
    }

    /// Forget the session's last blink so it cannot authorize again
    /// without a fresh one. False if the session does not exist.
    pub fn consume_blink(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.lock(now);
        match sessions.get_mut(id) {
            Some(session) => {
                session.state.last_blink = None;
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Feed one eye observation into a session.
    /// Returns whether it completed a blink and the running blink count.
    pub fn step(&self, id: &str, eyes_detected: bool) -> Option<(bool, u32)> {
        self.step_at(id, eyes_detected, Instant::now(), SystemTime::now())
    }

    /// Zero a session's blink counter; returns the count that was cleared.
    pub fn reset(&self, id: &str) -> Option<u32> {
        self.reset_at(id, Instant::now())
    }

    /// Close a session. False if it did not exist.
    pub fn end(&self, id: &str) -> bool {
        let mut sessions = self.lock(Instant::now());
        sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock(Instant::now()).len()
    }

    fn begin_at(&self, now: Instant) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.lock(now);
        sessions.insert(
            id.clone(),
            Session {
                state: LivenessState::default(),
                identity: None,
                last_seen: now,
            },
        );
        tracing::debug!(session = %id, active = sessions.len(), "liveness session opened");
        id
    }

    fn state_at(&self, id: &str, now: Instant) -> Option<LivenessState> {
        let mut sessions = self.lock(now);
        let session = sessions.get_mut(id)?;
        session.last_seen = now;
        Some(session.state)
    }

    fn claim_at(&self, id: &str, identity: &str, now: Instant) -> Result<LivenessState, ClaimError> {
        let mut sessions = self.lock(now);
        let session = sessions.get_mut(id).ok_or(ClaimError::Unknown)?;
        match session.identity.as_deref() {
            Some(bound) if bound != identity => {
                tracing::warn!(session = id, "liveness session presented for a second identity");
                return Err(ClaimError::OtherIdentity);
            }
            Some(_) => {}
            None => session.identity = Some(identity.to_string()),
        }
        session.last_seen = now;
        Ok(session.state)
    }

    fn step_at(&self, id: &str, eyes_detected: bool, now: Instant, wall: SystemTime) -> Option<(bool, u32)> {
        let mut sessions = self.lock(now);
        let session = sessions.get_mut(id)?;
        let (next, blink) = liveness::step(session.state, eyes_detected, wall);
        session.state = next;
        session.last_seen = now;
        if blink {
            tracing::debug!(session = id, count = next.blink_count, "blink detected");
        }
        Some((blink, next.blink_count))
    }

    fn reset_at(&self, id: &str, now: Instant) -> Option<u32> {
        let mut sessions = self.lock(now);
        let session = sessions.get_mut(id)?;
        let cleared = session.state.blink_count;
        session.state = liveness::reset(session.state);
        session.last_seen = now;
        Some(cleared)
    }

    /// Lock the map and drop expired sessions.
    fn lock(&self, now: Instant) -> MutexGuard<'_, HashMap<String, Session>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| now.saturating_duration_since(s.last_seen) <= self.ttl);
        let pruned = before - sessions.len();
        if pruned > 0 {
            tracing::debug!(pruned, "expired liveness sessions dropped");
        }
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use votegate_core::EyeState;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(60))
    }

    #[test]
    fn test_unknown_session_rejected() {
        let reg = registry();
        assert!(reg.step("nope", true).is_none());
        assert!(reg.reset("nope").is_none());
        assert!(reg.state("nope").is_none());
        assert!(!reg.end("nope"));
    }

    #[test]
    fn test_blink_counts_within_session() {
        let reg = registry();
        let id = reg.begin();
        assert_eq!(reg.step(&id, true), Some((false, 0)));
        assert_eq!(reg.step(&id, false), Some((false, 0)));
        assert_eq!(reg.step(&id, true), Some((true, 1)));
        assert!(reg.state(&id).unwrap().last_blink.is_some());
    }

    #[test]
    fn test_sessions_do_not_share_state() {
        let reg = registry();
        let a = reg.begin();
        let b = reg.begin();
        assert_ne!(a, b);

        reg.step(&a, false);
        // b never closed its eyes, so reopening is not a blink for b
        assert_eq!(reg.step(&b, true), Some((false, 0)));
        assert_eq!(reg.step(&a, true), Some((true, 1)));
        assert_eq!(reg.state(&b).unwrap().blink_count, 0);
    }

    #[test]
    fn test_reset_keeps_eye_state() {
        let reg = registry();
        let id = reg.begin();
        reg.step(&id, false);
        reg.step(&id, true);
        reg.step(&id, false);

        assert_eq!(reg.reset(&id), Some(1));
        let state = reg.state(&id).unwrap();
        assert_eq!(state.blink_count, 0);
        assert_eq!(state.eyes, EyeState::Closed);
    }

    #[test]
    fn test_session_binds_to_first_identity() {
        let reg = registry();
        let id = reg.begin();
        assert!(reg.claim(&id, "alice").is_ok());
        assert!(reg.claim(&id, "alice").is_ok());
        assert_eq!(reg.claim(&id, "bob"), Err(ClaimError::OtherIdentity));
        assert_eq!(reg.claim("nope", "alice"), Err(ClaimError::Unknown));
    }

    #[test]
    fn test_consumed_blink_is_gone() {
        let reg = registry();
        let id = reg.begin();
        reg.step(&id, false);
        reg.step(&id, true);
        assert!(reg.state(&id).unwrap().last_blink.is_some());

        assert!(reg.consume_blink(&id));
        let state = reg.state(&id).unwrap();
        assert!(state.last_blink.is_none());
        assert_eq!(state.blink_count, 1);
        assert!(!reg.consume_blink("nope"));
    }

    #[test]
    fn test_end_removes_session() {
        let reg = registry();
        let id = reg.begin();
        assert_eq!(reg.len(), 1);
        assert!(reg.end(&id));
        assert!(reg.step(&id, true).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_idle_sessions_expire() {
        let reg = registry();
        let start = Instant::now();
        let stale = reg.begin_at(start);
        let fresh = reg.begin_at(start + Duration::from_secs(50));

        let later = start + Duration::from_secs(90);
        assert!(reg.state_at(&stale, later).is_none());
        assert!(reg.state_at(&fresh, later).is_some());
    }

    #[test]
    fn test_activity_extends_session() {
        let reg = registry();
        let start = Instant::now();
        let id = reg.begin_at(start);
        assert!(reg
            .step_at(&id, true, start + Duration::from_secs(45), SystemTime::now())
            .is_some());
        assert!(reg.reset_at(&id, start + Duration::from_secs(100)).is_some());
    }
}
