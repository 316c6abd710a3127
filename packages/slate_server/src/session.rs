//! Session state and the message admission policy.
//!
//! Everything a client sends passes through [`AdmissionPolicy::admit`]
//! before it can touch the relay. The policy is pure (caller supplies the
//! clock) so every branch is unit-testable.

use chrono::{DateTime, Utc};
use slate_protocol::{ERROR_STATUS_FORBIDDEN, Envelope, EnvelopeKind, Role};
use uuid::Uuid;

/// One authenticated WebSocket session on one channel.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: String,
    pub channel_id: String,
    pub principal: String,
    /// Resolved once at admission, before the session joins the relay.
    /// `None` means the lookup came back empty: the session may listen
    /// but every send is rejected.
    pub role: Option<Role>,
    pub opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(channel_id: impl Into<String>, principal: impl Into<String>, role: Option<Role>) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            principal: principal.into(),
            role,
            opened_at: Utc::now(),
        }
    }

    pub fn can_publish(&self) -> bool {
        self.role.is_some_and(|r| r.can_publish())
    }
}

/// What the gate decided about one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Broadcast it (user id already stamped from the session principal).
    Forward(Envelope),
    /// Send this ERROR back to the sender only.
    Reject(Envelope),
    /// Drop it without telling anyone.
    Discard(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// CONNECTION and ERROR are synthesized locally by each side and are
    /// never relayed on a client's behalf.
    ReservedKind,
    /// High-frequency envelope older than the staleness cutoff; the state
    /// it describes has been superseded.
    Stale { age_ms: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    stale_threshold_ms: i64,
}

impl AdmissionPolicy {
    pub fn new(stale_threshold_ms: i64) -> Self {
        Self { stale_threshold_ms }
    }

    /// Gate one client envelope.
    ///
    /// Order matters: reserved kinds are dropped before the role check so
    /// a viewer's stray CONNECTION frame does not earn an ERROR, and the
    /// principal is stamped last so a forwarded envelope can never carry a
    /// spoofed user id.
    pub fn admit(&self, session: &Session, mut event: Envelope, now: i64) -> Admission {
        if matches!(event.kind(), EnvelopeKind::Connection | EnvelopeKind::Error) {
            return Admission::Discard(DiscardReason::ReservedKind);
        }

        if !session.can_publish() {
            return Admission::Reject(Envelope::error(
                ERROR_STATUS_FORBIDDEN,
                "insufficient role for channel",
            ));
        }

        if event.is_high_frequency() {
            let age_ms = event.age_ms(now);
            if age_ms > self.stale_threshold_ms {
                return Admission::Discard(DiscardReason::Stale { age_ms });
            }
        }

        event.set_user_id(&session.principal);
        Admission::Forward(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_protocol::{ConnectionStatus, CursorPayload, ElementPayload};

    const NOW: i64 = 1_700_000_000_000;

    fn session(role: Option<Role>) -> Session {
        Session::new("board-1", "alice", role)
    }

    fn policy() -> AdmissionPolicy {
        AdmissionPolicy::new(5000)
    }

    fn shape_update(timestamp: i64, user_id: Option<&str>) -> Envelope {
        Envelope::ShapeUpdate {
            timestamp,
            user_id: user_id.map(String::from),
            payload: ElementPayload {
                id: "e1".into(),
                body: serde_json::Map::new(),
            },
        }
    }

    fn cursor(timestamp: i64) -> Envelope {
        Envelope::CursorSync {
            timestamp,
            user_id: None,
            payload: CursorPayload { x: 0.0, y: 0.0 },
        }
    }

    #[test]
    fn editor_envelope_forwarded_with_stamped_principal() {
        let result = policy().admit(&session(Some(Role::Editor)), shape_update(NOW, Some("mallory")), NOW);
        match result {
            Admission::Forward(env) => assert_eq!(env.user_id(), Some("alice")),
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn viewer_rejected_with_forbidden_error() {
        let result = policy().admit(&session(Some(Role::Viewer)), shape_update(NOW, None), NOW);
        match result {
            Admission::Reject(Envelope::Error { payload, .. }) => {
                assert_eq!(payload.status, ERROR_STATUS_FORBIDDEN);
            }
            other => panic!("expected Reject, got {other:?}"),
        }
    }

    #[test]
    fn missing_role_rejected() {
        let result = policy().admit(&session(None), cursor(NOW), NOW);
        assert!(matches!(result, Admission::Reject(_)));
    }

    #[test]
    fn stale_cursor_discarded() {
        let result = policy().admit(&session(Some(Role::Owner)), cursor(NOW - 5001), NOW);
        assert_eq!(result, Admission::Discard(DiscardReason::Stale { age_ms: 5001 }));
    }

    #[test]
    fn cursor_at_threshold_still_forwarded() {
        let result = policy().admit(&session(Some(Role::Owner)), cursor(NOW - 5000), NOW);
        assert!(matches!(result, Admission::Forward(_)));
    }

    #[test]
    fn future_timestamp_never_stale() {
        // Producer clock ahead of the server's.
        let result = policy().admit(&session(Some(Role::Editor)), cursor(NOW + 60_000), NOW);
        assert!(matches!(result, Admission::Forward(_)));
    }

    #[test]
    fn stale_durable_still_forwarded() {
        // Staleness only applies to high-frequency kinds; a shape edit made
        // offline an hour ago is still state.
        let result = policy().admit(
            &session(Some(Role::Editor)),
            shape_update(NOW - 3_600_000, None),
            NOW,
        );
        assert!(matches!(result, Admission::Forward(_)));
    }

    #[test]
    fn client_connection_frames_silently_dropped() {
        let event = Envelope::connection(ConnectionStatus::Connected);
        for role in [None, Some(Role::Viewer), Some(Role::Owner)] {
            let result = policy().admit(&session(role), event.clone(), NOW);
            assert_eq!(result, Admission::Discard(DiscardReason::ReservedKind));
        }
    }

    #[test]
    fn client_error_frames_silently_dropped() {
        let result = policy().admit(&session(Some(Role::Owner)), Envelope::error(500, "fake"), NOW);
        assert_eq!(result, Admission::Discard(DiscardReason::ReservedKind));
    }

    #[test]
    fn session_publish_rights() {
        assert!(!session(None).can_publish());
        assert!(!session(Some(Role::Viewer)).can_publish());
        assert!(session(Some(Role::Editor)).can_publish());
        assert!(session(Some(Role::Owner)).can_publish());
    }
}
