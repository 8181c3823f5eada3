//! Authorization, rate limiting, lockout, and reputation.
//!
//! Session establishment is challenge/response: the keeper mints a nonce
//! bound to the identity and a timestamp, the caller signs the challenge
//! message with the Ed25519 key its identity encodes, and a session token
//! with a per-minute quota comes back. Signatures are verified in every
//! network environment.
//!
//! Everything in this module is process-local; none of it survives a
//! restart.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{RateScope, ServiceError};
use crate::types::{TimestampNs, NANOS_PER_SEC};

const RATE_WINDOW_NS: u64 = 60 * NANOS_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    /// Query subscriptions, metadata you own, health, and metrics.
    ReadState,
    /// Mutate subscriptions whose subscriber address is your identity.
    ManageOwnSubscriptions,
    /// Mutate any subscription.
    ManageAllSubscriptions,
    /// Delete or list encrypted metadata regardless of owner.
    ManageMetadata,
    /// Manage the admin and read-only principal sets.
    ManageAdmins,
    /// Emergency pause/resume and cleanup.
    EmergencyControl,
}

/// What a role may be granted at authentication.
pub fn role_permissions(is_admin: bool, is_read_only: bool) -> BTreeSet<Permission> {
    use Permission::*;
    if is_admin {
        BTreeSet::from([
            ReadState,
            ManageOwnSubscriptions,
            ManageAllSubscriptions,
            ManageMetadata,
            ManageAdmins,
            EmergencyControl,
        ])
    } else if is_read_only {
        BTreeSet::from([ReadState])
    } else {
        // Unlisted identities may still run their own subscriptions.
        BTreeSet::from([ReadState, ManageOwnSubscriptions])
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub global_requests_per_minute: u32,
    pub identity_requests_per_minute: u32,
    pub session_ttl_seconds: u64,
    pub challenge_ttl_seconds: u64,
    pub max_failed_attempts_before_backoff: u32,
    pub backoff_base_seconds: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            global_requests_per_minute: 300,
            identity_requests_per_minute: 60,
            session_ttl_seconds: 3_600,
            challenge_ttl_seconds: 300,
            max_failed_attempts_before_backoff: 5,
            backoff_base_seconds: 2,
            backoff_multiplier: 2.0,
            backoff_max_seconds: 3_600,
        }
    }
}

impl AuthConfig {
    /// Per-origin windows get half the per-identity cap.
    fn origin_requests_per_minute(&self) -> u32 {
        (self.identity_requests_per_minute / 2).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub identity: String,
    pub nonce: String,
    pub message: String,
    pub expires_at: TimestampNs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub token: String,
    pub expires_at: TimestampNs,
    pub permissions: BTreeSet<Permission>,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    permissions: BTreeSet<Permission>,
    expires_at: TimestampNs,
    quota_remaining: u32,
    window_start: TimestampNs,
    last_request: TimestampNs,
}

#[derive(Debug, Clone, Copy, Default)]
struct RateWindow {
    count: u32,
    window_start: TimestampNs,
}

impl RateWindow {
    /// One-minute tumbling window; returns false when the cap is hit.
    fn admit(&mut self, cap: u32, now: TimestampNs) -> bool {
        if now.saturating_sub(self.window_start) >= RATE_WINDOW_NS {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= cap {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BackoffState {
    failed_attempts: u32,
    blocked_until: TimestampNs,
    backoff_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reputation {
    pub successful_auths: u64,
    pub failed_auths: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_requests: u64,
    pub score: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub identity: String,
    #[serde(default)]
    pub requested_permissions: Vec<Permission>,
    pub nonce: String,
    /// Hex-encoded 64-byte Ed25519 signature over the challenge message.
    pub signature: String,
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Debug)]
pub struct AuthManager {
    cfg: AuthConfig,
    challenges: HashMap<String, Challenge>,
    sessions: HashMap<String, Session>,
    global_window: RateWindow,
    origin_windows: HashMap<String, RateWindow>,
    backoff: HashMap<String, BackoffState>,
    reputation: HashMap<String, Reputation>,
}

impl AuthManager {
    pub fn new(cfg: AuthConfig) -> Self {
        Self {
            cfg,
            challenges: HashMap::new(),
            sessions: HashMap::new(),
            global_window: RateWindow::default(),
            origin_windows: HashMap::new(),
            backoff: HashMap::new(),
            reputation: HashMap::new(),
        }
    }

    pub fn generate_challenge(&mut self, identity: &str, now: TimestampNs) -> Challenge {
        // Opportunistic prune so abandoned challenges do not pile up.
        self.challenges.retain(|_, c| c.expires_at > now);

        let nonce = random_hex(32);
        let message = format!("metronome:auth:{identity}:{nonce}:{now}");
        let challenge = Challenge {
            identity: identity.to_string(),
            nonce: nonce.clone(),
            message,
            expires_at: now + self.cfg.challenge_ttl_seconds * NANOS_PER_SEC,
        };
        self.challenges.insert(nonce, challenge.clone());
        challenge
    }

    /// Establish a session.
    ///
    /// Check order is fixed: global window, origin window, lockout, nonce,
    /// signature. Nonce and signature failures feed the lockout counter; a
    /// rejection by a window or an existing lockout does not.
    pub fn authenticate(
        &mut self,
        request: &AuthenticateRequest,
        allowed: BTreeSet<Permission>,
        now: TimestampNs,
    ) -> Result<SessionGrant, ServiceError> {
        self.check_windows(request.origin.as_deref(), now)?;
        self.check_backoff(&request.identity, now)?;

        let challenge = match self.challenges.remove(&request.nonce) {
            Some(c) if c.identity == request.identity && c.expires_at > now => c,
            // A reused nonce lands here too: the first use consumed it.
            _ => {
                self.note_auth_failure(&request.identity, now);
                return Err(ServiceError::NonceInvalid);
            }
        };

        if !verify_identity_signature(&request.identity, &challenge.message, &request.signature) {
            self.note_auth_failure(&request.identity, now);
            return Err(ServiceError::InvalidSignature);
        }

        self.backoff.remove(&request.identity);
        let rep = self.reputation.entry(request.identity.clone()).or_default();
        rep.successful_auths += 1;
        rep.total_requests += 1;
        rep.score += 2;

        let permissions: BTreeSet<Permission> = if request.requested_permissions.is_empty() {
            allowed
        } else {
            request
                .requested_permissions
                .iter()
                .copied()
                .filter(|p| allowed.contains(p))
                .collect()
        };

        let grant = SessionGrant {
            token: random_hex(32),
            expires_at: now + self.cfg.session_ttl_seconds * NANOS_PER_SEC,
            permissions: permissions.clone(),
        };
        self.sessions.insert(
            request.identity.clone(),
            Session {
                token: grant.token.clone(),
                permissions,
                expires_at: grant.expires_at,
                quota_remaining: self.cfg.identity_requests_per_minute,
                window_start: now,
                last_request: now,
            },
        );
        Ok(grant)
    }

    /// Gate one privileged operation.
    pub fn validate_request(
        &mut self,
        identity: &str,
        session_token: &str,
        required: Permission,
        origin: Option<&str>,
        now: TimestampNs,
    ) -> Result<(), ServiceError> {
        let outcome = self.validate_request_inner(identity, session_token, required, origin, now);
        let rep = self.reputation.entry(identity.to_string()).or_default();
        rep.total_requests += 1;
        match &outcome {
            Ok(()) => {
                rep.successful_operations += 1;
                rep.score += 2;
            }
            Err(_) => {
                rep.failed_operations += 1;
                rep.score -= 5;
            }
        }
        outcome
    }

    fn validate_request_inner(
        &mut self,
        identity: &str,
        session_token: &str,
        required: Permission,
        origin: Option<&str>,
        now: TimestampNs,
    ) -> Result<(), ServiceError> {
        self.check_windows(origin, now)?;
        self.check_backoff(identity, now)?;

        let session = self
            .sessions
            .get_mut(identity)
            .ok_or(ServiceError::SessionExpired)?;
        if session.expires_at <= now {
            self.sessions.remove(identity);
            return Err(ServiceError::SessionExpired);
        }
        if session.token != session_token {
            return Err(ServiceError::Unauthorized);
        }

        if now.saturating_sub(session.window_start) >= RATE_WINDOW_NS {
            session.window_start = now;
            session.quota_remaining = self.cfg.identity_requests_per_minute;
        }
        if session.quota_remaining == 0 {
            return Err(ServiceError::RateLimited {
                scope: RateScope::Identity,
            });
        }
        session.quota_remaining -= 1;
        session.last_request = now;

        if !session.permissions.contains(&required) {
            return Err(ServiceError::InsufficientPermissions { required });
        }
        Ok(())
    }

    /// Drop expired sessions; part of periodic housekeeping.
    pub fn prune_sessions(&mut self, now: TimestampNs) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before - self.sessions.len()
    }

    pub fn reputation(&self, identity: &str) -> Reputation {
        self.reputation.get(identity).copied().unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn check_windows(&mut self, origin: Option<&str>, now: TimestampNs) -> Result<(), ServiceError> {
        if !self
            .global_window
            .admit(self.cfg.global_requests_per_minute, now)
        {
            return Err(ServiceError::RateLimited {
                scope: RateScope::Global,
            });
        }
        if let Some(origin) = origin {
            let cap = self.cfg.origin_requests_per_minute();
            let window = self.origin_windows.entry(origin.to_string()).or_default();
            if !window.admit(cap, now) {
                return Err(ServiceError::RateLimited {
                    scope: RateScope::Origin,
                });
            }
        }
        Ok(())
    }

    fn check_backoff(&self, identity: &str, now: TimestampNs) -> Result<(), ServiceError> {
        if let Some(state) = self.backoff.get(identity) {
            if now < state.blocked_until {
                let remaining_ns = state.blocked_until - now;
                return Err(ServiceError::TemporarilyBlocked {
                    remaining_seconds: remaining_ns.div_ceil(NANOS_PER_SEC),
                });
            }
        }
        Ok(())
    }

    fn note_auth_failure(&mut self, identity: &str, now: TimestampNs) {
        let rep = self.reputation.entry(identity.to_string()).or_default();
        rep.failed_auths += 1;
        rep.total_requests += 1;
        rep.score -= 5;

        let state = self.backoff.entry(identity.to_string()).or_default();
        state.failed_attempts += 1;

        let threshold = self.cfg.max_failed_attempts_before_backoff;
        if state.failed_attempts >= threshold {
            let exponent = state.failed_attempts - threshold;
            let factor = self.cfg.backoff_multiplier.powi(exponent as i32);
            let seconds = ((self.cfg.backoff_base_seconds as f64) * factor)
                .min(self.cfg.backoff_max_seconds as f64) as u64;
            state.backoff_seconds = seconds.max(1);
            state.blocked_until = now + state.backoff_seconds * NANOS_PER_SEC;
            tracing::warn!(
                identity,
                failed_attempts = state.failed_attempts,
                backoff_s = state.backoff_seconds,
                "authentication lockout engaged"
            );
        }
    }
}

/// Verify a hex signature over `message` against the Ed25519 key the
/// identity encodes (base58, 32 bytes). Malformed identities and
/// signatures verify as false.
fn verify_identity_signature(identity: &str, message: &str, signature_hex: &str) -> bool {
    let Ok(key_bytes) = bs58::decode(identity).into_vec() else {
        return false;
    };
    let key_bytes: [u8; 32] = match key_bytes.as_slice().try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let sig_bytes: [u8; 64] = match sig_bytes.as_slice().try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message.as_bytes(), &signature).is_ok()
}

fn random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
