//! Short-lived, single-use authorization tokens
//!
//! A token binds one decision to one permitted execution. Signatures are
//! keyed MACs over the token's immutable fields with a process-local secret;
//! validation recomputes the MAC and compares in constant time.
//!
//! Validation and consumption are a single atomic check-and-set under one
//! lock, so two concurrent presentations of the same token yield exactly one
//! success and one replay error. Persistence is an event log
//! (issued/consumed/expired); the logical token looks mutable but the file
//! only ever appends.

use crate::store::AppendLog;
use causeway_core::{DecisionId, EngineError, Result, TimeSource, TokenId};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// An issued authorization token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Identity of this token.
    pub token_id: TokenId,
    /// Decision this token authorizes.
    pub decision_id: DecisionId,
    /// Scope the token is valid for.
    pub scope: String,
    /// Issue time (milliseconds since epoch).
    pub issued_at_ms: u64,
    /// Expiry instant, exclusive: presentation at exactly this time fails.
    pub expires_at_ms: u64,
    /// Hex-encoded keyed MAC over the fields above.
    pub signature: String,
}

/// Lifecycle state of a token, derived by folding the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Issued and not yet consumed or expired.
    Issued,
    /// Consumed at the given time; any further presentation is a replay.
    Consumed {
        /// Consumption time (milliseconds since epoch).
        at_ms: u64,
    },
    /// Recorded as expired after a late presentation.
    Expired,
}

/// One line in the append-only token ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum TokenEvent {
    /// Token was issued.
    Issued(AuthToken),
    /// Token was consumed.
    Consumed {
        token_id: TokenId,
        at_ms: u64,
    },
    /// Token was presented after expiry.
    Expired {
        token_id: TokenId,
        at_ms: u64,
    },
}

struct TokenState {
    token: AuthToken,
    status: TokenStatus,
}

/// Issues and consumes authorization tokens.
pub struct TokenService {
    secret: Vec<u8>,
    ttl_ms: u64,
    time: Arc<dyn TimeSource>,
    log: AppendLog<TokenEvent>,
    state: Mutex<HashMap<TokenId, TokenState>>,
}

impl TokenService {
    /// Partition name under which the token set appears in the digest tree.
    pub const PARTITION: &'static str = "tokens";

    /// Open the token ledger under `dir` and fold existing events.
    pub fn open(
        dir: impl AsRef<Path>,
        secret: Vec<u8>,
        ttl_ms: u64,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let log: AppendLog<TokenEvent> = AppendLog::open(dir.as_ref().join("tokens.ndjson"))?;
        let mut state: HashMap<TokenId, TokenState> = HashMap::new();
        for event in log.load()? {
            match event {
                TokenEvent::Issued(token) => {
                    state.insert(
                        token.token_id,
                        TokenState {
                            token,
                            status: TokenStatus::Issued,
                        },
                    );
                }
                TokenEvent::Consumed { token_id, at_ms } => {
                    if let Some(entry) = state.get_mut(&token_id) {
                        entry.status = TokenStatus::Consumed { at_ms };
                    }
                }
                TokenEvent::Expired { token_id, .. } => {
                    if let Some(entry) = state.get_mut(&token_id) {
                        entry.status = TokenStatus::Expired;
                    }
                }
            }
        }
        Ok(Self {
            secret,
            ttl_ms,
            time,
            log,
            state: Mutex::new(state),
        })
    }

    fn sign(&self, token_id: &TokenId, decision_id: &DecisionId, scope: &str, expires_at_ms: u64) -> String {
        // Key length is unrestricted for HMAC; new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(token_id.to_string().as_bytes());
        mac.update(b"|");
        mac.update(decision_id.to_string().as_bytes());
        mac.update(b"|");
        mac.update(scope.as_bytes());
        mac.update(b"|");
        mac.update(&expires_at_ms.to_le_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a token bound to `decision_id` with the service's fixed TTL.
    pub fn issue(&self, decision_id: DecisionId, scope: impl Into<String>) -> Result<AuthToken> {
        let scope = scope.into();
        let token_id = TokenId::new();
        let issued_at_ms = self.time.now_millis();
        let expires_at_ms = issued_at_ms + self.ttl_ms;
        let signature = self.sign(&token_id, &decision_id, &scope, expires_at_ms);
        let token = AuthToken {
            token_id,
            decision_id,
            scope,
            issued_at_ms,
            expires_at_ms,
            signature,
        };

        let mut state = self.state.lock();
        self.log.append(&TokenEvent::Issued(token.clone()))?;
        state.insert(
            token_id,
            TokenState {
                token: token.clone(),
                status: TokenStatus::Issued,
            },
        );
        debug!(token_id = %token_id, decision_id = %decision_id, "token issued");
        Ok(token)
    }

    /// Atomically validate and consume a token.
    ///
    /// Exactly one presentation can ever succeed. On success returns the
    /// consumed token and the consumption timestamp so the caller can write
    /// the metering entry.
    pub fn validate_and_consume(
        &self,
        token_id: TokenId,
        presented_signature: &str,
    ) -> Result<(AuthToken, u64)> {
        let mut state = self.state.lock();
        let now = self.time.now_millis();

        let entry = state
            .get_mut(&token_id)
            .ok_or(EngineError::UnknownToken { token_id })?;

        if now >= entry.token.expires_at_ms {
            if entry.status == TokenStatus::Issued {
                self.log
                    .append(&TokenEvent::Expired { token_id, at_ms: now })?;
                entry.status = TokenStatus::Expired;
            }
            warn!(token_id = %token_id, "expired token presented");
            return Err(EngineError::ExpiredToken { token_id });
        }

        if let TokenStatus::Consumed { .. } = entry.status {
            warn!(token_id = %token_id, "token replay rejected");
            return Err(EngineError::ReplayedToken { token_id });
        }

        let expected = self.sign(
            &entry.token.token_id,
            &entry.token.decision_id,
            &entry.token.scope,
            entry.token.expires_at_ms,
        );
        let matches: bool = expected
            .as_bytes()
            .ct_eq(presented_signature.as_bytes())
            .into();
        if !matches {
            warn!(token_id = %token_id, "forged token rejected");
            return Err(EngineError::ForgedToken { token_id });
        }

        self.log
            .append(&TokenEvent::Consumed { token_id, at_ms: now })?;
        entry.status = TokenStatus::Consumed { at_ms: now };
        debug!(token_id = %token_id, "token consumed");
        Ok((entry.token.clone(), now))
    }

    /// Current lifecycle status of a token.
    pub fn status(&self, token_id: &TokenId) -> Option<TokenStatus> {
        self.state.lock().get(token_id).map(|entry| entry.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use causeway_core::ManualTimeSource;

    fn service(time: Arc<ManualTimeSource>) -> (TokenService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let service =
            TokenService::open(dir.path(), b"test-secret".to_vec(), 30_000, time).unwrap();
        (service, dir)
    }

    #[test]
    fn issue_then_consume_succeeds_once() {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let (service, _dir) = service(time);
        let token = service.issue(DecisionId::new(), "write:tasks").unwrap();

        let (consumed, at_ms) = service
            .validate_and_consume(token.token_id, &token.signature)
            .unwrap();
        assert_eq!(consumed.decision_id, token.decision_id);
        assert_eq!(at_ms, 1_000);

        let replay = service
            .validate_and_consume(token.token_id, &token.signature)
            .unwrap_err();
        assert_matches!(replay, EngineError::ReplayedToken { .. });
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let time = Arc::new(ManualTimeSource::new(0));
        let (service, _dir) = service(time.clone());
        let token = service.issue(DecisionId::new(), "scope").unwrap();
        assert_eq!(token.expires_at_ms, 30_000);

        // Exactly at expires_at: expired.
        time.set(30_000);
        let err = service
            .validate_and_consume(token.token_id, &token.signature)
            .unwrap_err();
        assert_matches!(err, EngineError::ExpiredToken { .. });
        assert_eq!(service.status(&token.token_id), Some(TokenStatus::Expired));
    }

    #[test]
    fn one_millisecond_before_expiry_is_valid() {
        let time = Arc::new(ManualTimeSource::new(0));
        let (service, _dir) = service(time.clone());
        let token = service.issue(DecisionId::new(), "scope").unwrap();
        time.set(29_999);
        assert!(service
            .validate_and_consume(token.token_id, &token.signature)
            .is_ok());
    }

    #[test]
    fn bad_signature_is_forged() {
        let time = Arc::new(ManualTimeSource::new(0));
        let (service, _dir) = service(time);
        let token = service.issue(DecisionId::new(), "scope").unwrap();
        let err = service
            .validate_and_consume(token.token_id, "deadbeef")
            .unwrap_err();
        assert_matches!(err, EngineError::ForgedToken { .. });
        // A failed validation does not consume the token.
        assert!(service
            .validate_and_consume(token.token_id, &token.signature)
            .is_ok());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let time = Arc::new(ManualTimeSource::new(0));
        let (service, _dir) = service(time);
        let err = service
            .validate_and_consume(TokenId::new(), "sig")
            .unwrap_err();
        assert_matches!(err, EngineError::UnknownToken { .. });
    }

    #[test]
    fn concurrent_consumption_yields_one_success() {
        let time = Arc::new(ManualTimeSource::new(0));
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(
            TokenService::open(dir.path(), b"secret".to_vec(), 30_000, time).unwrap(),
        );
        let token = service.issue(DecisionId::new(), "scope").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let token = token.clone();
            handles.push(std::thread::spawn(move || {
                service
                    .validate_and_consume(token.token_id, &token.signature)
                    .is_ok()
            }));
        }
        let successes = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(false))
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn consumed_state_survives_reload() {
        let time = Arc::new(ManualTimeSource::new(0));
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let service =
                TokenService::open(dir.path(), b"secret".to_vec(), 30_000, time.clone()).unwrap();
            let token = service.issue(DecisionId::new(), "scope").unwrap();
            service
                .validate_and_consume(token.token_id, &token.signature)
                .unwrap();
            token
        };

        let reopened =
            TokenService::open(dir.path(), b"secret".to_vec(), 30_000, time).unwrap();
        assert_matches!(
            reopened.status(&token.token_id),
            Some(TokenStatus::Consumed { .. })
        );
        let err = reopened
            .validate_and_consume(token.token_id, &token.signature)
            .unwrap_err();
        assert_matches!(err, EngineError::ReplayedToken { .. });
    }
}
