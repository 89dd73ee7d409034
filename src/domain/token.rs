//! Token data model and the queue state machine

use crate::domain::types::{CounterId, ServiceId, TokenId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Generate an opaque proof code (rendered as a QR by the excluded UI)
pub fn new_proof_code() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Lifecycle state of a token
///
/// CREATED is transient: it exists only inside the issuing transaction
/// and is advanced to WAITING before the token becomes observable.
/// DONE, MISSED and EXPIRED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Created,
    Waiting,
    Near,
    Confirming,
    Confirmed,
    Called,
    Serving,
    Done,
    Missed,
    Expired,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Created => "CREATED",
            TokenState::Waiting => "WAITING",
            TokenState::Near => "NEAR",
            TokenState::Confirming => "CONFIRMING",
            TokenState::Confirmed => "CONFIRMED",
            TokenState::Called => "CALLED",
            TokenState::Serving => "SERVING",
            TokenState::Done => "DONE",
            TokenState::Missed => "MISSED",
            TokenState::Expired => "EXPIRED",
        }
    }

    /// States where the holder is still "in the system"; at most one
    /// token per (service, user) may be in any of these.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Done | TokenState::Missed | TokenState::Expired)
    }

    /// States counted when computing how many people are ahead of a token
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            TokenState::Waiting | TokenState::Near | TokenState::Confirming | TokenState::Confirmed
        )
    }

    /// Whether the transition `self -> to` is permitted
    ///
    /// WAITING and NEAR are the same dispatch tier; NEAR only adds a UI
    /// urgency hint. Any active state may be cancelled to MISSED, but
    /// only WAITING/NEAR age out to EXPIRED.
    pub fn can_transition(&self, to: TokenState) -> bool {
        use TokenState::*;
        matches!(
            (self, to),
            (Created, Waiting)
                | (Created, Missed)
                | (Waiting, Near)
                | (Waiting, Confirming)
                | (Waiting, Called)
                | (Waiting, Missed)
                | (Waiting, Expired)
                | (Near, Confirming)
                | (Near, Called)
                | (Near, Missed)
                | (Near, Expired)
                | (Confirming, Confirmed)
                | (Confirming, Waiting)
                | (Confirming, Near)
                | (Confirming, Missed)
                | (Confirmed, Called)
                | (Confirmed, Missed)
                | (Called, Serving)
                | (Called, Missed)
                | (Serving, Done)
                | (Serving, Missed)
        )
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer's place in a service's queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub service_id: ServiceId,
    /// Opaque owner identifier (device or account ID)
    pub user_id: String,
    /// Strictly increasing per service, never reused; the sole ordering key
    pub token_number: u64,
    pub state: TokenState,
    /// Proof presented at service start (admin scans the holder's QR)
    pub entry_code: String,
    /// Proof presented at service end (holder scans the desk QR)
    pub exit_code: String,
    pub issued_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    /// Current counter while CALLED/SERVING; authoritative copy lives in
    /// the ledger's assignment table
    pub counter_id: Option<CounterId>,
}

impl Token {
    /// Build a freshly issued token in CREATED state.
    ///
    /// The ledger advances it to WAITING inside the same transaction, so
    /// CREATED is never observable from outside.
    pub fn issue(service_id: ServiceId, user_id: &str, token_number: u64) -> Self {
        let now = Utc::now();
        Self {
            id: TokenId::new(),
            service_id,
            user_id: user_id.to_string(),
            token_number,
            state: TokenState::Created,
            entry_code: new_proof_code(),
            exit_code: new_proof_code(),
            issued_at: now,
            state_changed_at: now,
            counter_id: None,
        }
    }

    /// Seconds the token has been in its current state
    pub fn seconds_in_state(&self, now: DateTime<Utc>) -> i64 {
        (now - self.state_changed_at).num_seconds()
    }

    /// Seconds since the token was issued
    pub fn seconds_waited(&self, now: DateTime<Utc>) -> i64 {
        (now - self.issued_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_starts_created() {
        let service_id = ServiceId::new();
        let token = Token::issue(service_id, "device-1", 7);

        assert_eq!(token.service_id, service_id);
        assert_eq!(token.token_number, 7);
        assert_eq!(token.state, TokenState::Created);
        assert!(token.counter_id.is_none());
        assert_ne!(token.entry_code, token.exit_code);
    }

    #[test]
    fn test_active_and_terminal() {
        for state in [
            TokenState::Created,
            TokenState::Waiting,
            TokenState::Near,
            TokenState::Confirming,
            TokenState::Confirmed,
            TokenState::Called,
            TokenState::Serving,
        ] {
            assert!(state.is_active(), "{state} should be active");
        }
        for state in [TokenState::Done, TokenState::Missed, TokenState::Expired] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use TokenState::*;
        assert!(Created.can_transition(Waiting));
        assert!(Waiting.can_transition(Near));
        assert!(Near.can_transition(Confirming));
        assert!(Confirming.can_transition(Confirmed));
        assert!(Confirmed.can_transition(Called));
        assert!(Called.can_transition(Serving));
        assert!(Serving.can_transition(Done));
    }

    #[test]
    fn test_confirming_reverts_to_prior_state_only() {
        use TokenState::*;
        assert!(Confirming.can_transition(Waiting));
        assert!(Confirming.can_transition(Near));
        assert!(!Confirming.can_transition(Called));
        assert!(!Confirming.can_transition(Expired));
    }

    #[test]
    fn test_every_active_state_can_be_missed() {
        use TokenState::*;
        for state in [Created, Waiting, Near, Confirming, Confirmed, Called, Serving] {
            assert!(state.can_transition(Missed), "{state} -> MISSED should be allowed");
        }
    }

    #[test]
    fn test_only_unconfirmed_states_expire() {
        use TokenState::*;
        assert!(Waiting.can_transition(Expired));
        assert!(Near.can_transition(Expired));
        assert!(!Confirmed.can_transition(Expired));
        assert!(!Called.can_transition(Expired));
        assert!(!Serving.can_transition(Expired));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use TokenState::*;
        for from in [Done, Missed, Expired] {
            for to in [Created, Waiting, Near, Confirming, Confirmed, Called, Serving, Done, Missed, Expired] {
                assert!(!from.can_transition(to), "{from} -> {to} should be rejected");
            }
        }
    }

    #[test]
    fn test_no_waiting_shortcut_to_confirmed() {
        // Confirmation must pass through the CONFIRMING guard
        assert!(!TokenState::Waiting.can_transition(TokenState::Confirmed));
        assert!(!TokenState::Near.can_transition(TokenState::Confirmed));
    }

    #[test]
    fn test_state_serialization_matches_wire_format() {
        let json = serde_json::to_string(&TokenState::Confirming).unwrap();
        assert_eq!(json, "\"CONFIRMING\"");
        let back: TokenState = serde_json::from_str("\"WAITING\"").unwrap();
        assert_eq!(back, TokenState::Waiting);
    }
}
