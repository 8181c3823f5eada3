//! Durable keeper state: the subscription map, encrypted metadata, role
//! sets, and network selection.
//!
//! Exactly this state survives a restart; sessions, rate windows, backoff,
//! and reputation are rebuilt empty. Saves are atomic (temp file + rename)
//! so an interrupted process cannot leave a half-written snapshot.

use eyre::{eyre, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{ServiceError, ValidationError};
use crate::types::{
    CreateSubscriptionRequest, DerivedKeys, EncryptedMetadata, NetworkEnv, Subscription,
    SubscriptionStatus, TimestampNs, MAX_SUBSCRIPTIONS,
};

/// Cap on persisted failure-reason strings.
const MAX_ERROR_LEN: usize = 240;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub network: Option<NetworkEnv>,

    /// Cached once derived; derivation is deterministic, so this is a
    /// convenience, not a source of truth.
    #[serde(default)]
    pub derived_keys: Option<DerivedKeys>,

    #[serde(default)]
    pub subscriptions: BTreeMap<String, Subscription>,

    #[serde(default)]
    pub encrypted_metadata: BTreeMap<String, EncryptedMetadata>,

    #[serde(default)]
    pub admins: BTreeSet<String>,

    #[serde(default)]
    pub read_only_users: BTreeSet<String>,
}

#[derive(Debug)]
pub struct Store {
    state: PersistedState,
    path: PathBuf,
    /// Exclusive advisory lock beside the snapshot; held for the store's
    /// lifetime when opened via [`Store::open_exclusive`].
    lock: Option<File>,
}

impl Store {
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| eyre!("failed to read state file {}: {e}", path.display()))?;
            let state: PersistedState = serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse state file {}: {e}", path.display()))?;
            return Ok(Self {
                state,
                path,
                lock: None,
            });
        }

        let store = Self {
            state: PersistedState::default(),
            path,
            lock: None,
        };
        store.save()?;
        Ok(store)
    }

    /// Load the snapshot and take an exclusive advisory lock beside it.
    ///
    /// Two keepers pointed at one snapshot would each arm timers and
    /// double-trigger every subscription, so a second open fails instead.
    /// The lock releases when the store is dropped.
    pub fn open_exclusive(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let lock_path = path.with_extension("lock");
        ensure_parent_dir(&lock_path)?;
        let lock = File::options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| eyre!("failed to open {}: {e}", lock_path.display()))?;
        if let Err(err) = lock.try_lock_exclusive() {
            return Err(eyre!(
                "another keeper holds {}; a second instance on the same state would \
                 double-trigger subscriptions ({err})",
                lock_path.display()
            ));
        }

        let mut store = Self::load_or_init(path)?;
        store.lock = Some(lock);
        Ok(store)
    }

    /// In-memory store for tests and tooling; `save` becomes a no-op.
    pub fn ephemeral() -> Self {
        Self {
            state: PersistedState::default(),
            path: PathBuf::new(),
            lock: None,
        }
    }

    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        ensure_parent_dir(&self.path)?;

        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| eyre!("failed to serialize keeper state: {e}"))?;

        // Write to a temp file then rename, so a crash mid-write leaves the
        // previous snapshot intact.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| eyre!("failed to write temp state file {}: {e}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path).map_err(|e| {
                    eyre!("failed to replace state file {}: {e}", self.path.display())
                })?;
            } else {
                return Err(eyre!(
                    "failed to replace state file {}: {err}",
                    self.path.display()
                ));
            }
        }
        Ok(())
    }

    /// Pre-restart hook: the full durable snapshot.
    pub fn snapshot(&self) -> PersistedState {
        self.state.clone()
    }

    /// Post-restart hook: replace in-memory state with a snapshot. The
    /// caller re-arms timers for Active subscriptions afterwards.
    pub fn restore(&mut self, snapshot: PersistedState) {
        self.state = snapshot;
    }

    // ── Network / keys ───────────────────────────────────────────────────────

    pub fn network(&self) -> Option<NetworkEnv> {
        self.state.network
    }

    pub fn set_network(&mut self, env: NetworkEnv) {
        self.state.network = Some(env);
    }

    pub fn derived_keys(&self) -> Option<&DerivedKeys> {
        self.state.derived_keys.as_ref()
    }

    pub fn set_derived_keys(&mut self, keys: DerivedKeys) {
        self.state.derived_keys = Some(keys);
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    pub fn subscription(&self, id: &str) -> Option<&Subscription> {
        self.state.subscriptions.get(id)
    }

    pub fn subscription_mut(&mut self, id: &str) -> Option<&mut Subscription> {
        self.state.subscriptions.get_mut(id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.state.subscriptions.values()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.len()
    }

    /// Admission checks for a create request, in their contractual order:
    /// quota, then field validation, then duplicate id. (`NotInitialized`
    /// is checked by the service after these, last.)
    pub fn check_admissible(&self, request: &CreateSubscriptionRequest) -> Result<(), ServiceError> {
        if self.state.subscriptions.len() >= MAX_SUBSCRIPTIONS {
            return Err(ValidationError::QuotaExceeded.into());
        }
        request.validate()?;
        if self.state.subscriptions.contains_key(&request.id) {
            return Err(ServiceError::DuplicateId {
                id: request.id.clone(),
            });
        }
        Ok(())
    }

    /// Admission checks plus insertion.
    pub fn admit(
        &mut self,
        request: &CreateSubscriptionRequest,
        now: TimestampNs,
    ) -> Result<Subscription, ServiceError> {
        self.check_admissible(request)?;

        let next_execution = request
            .start_time
            .unwrap_or(now + request.interval_seconds * crate::types::NANOS_PER_SEC);
        let subscription = Subscription {
            id: request.id.clone(),
            contract_address: request.contract_address.clone(),
            payment_token_mint: request.payment_token_mint.clone(),
            subscriber_address: request.subscriber_address.clone(),
            merchant_address: request.merchant_address.clone(),
            interval_seconds: request.interval_seconds,
            amount: request.amount,
            reminder_days_before_payment: request.reminder_days_before_payment,
            next_execution,
            status: SubscriptionStatus::Active,
            created_at: now,
            last_triggered: None,
            trigger_count: 0,
            failed_payment_count: 0,
            last_failure_time: None,
            last_error: None,
        };
        self.state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    /// Remove terminal records whose `next_execution` is older than
    /// `now - older_than`. Returns the removed ids so the caller can drop
    /// any timers.
    pub fn cleanup_terminal(&mut self, older_than_ns: u64, now: TimestampNs) -> Vec<String> {
        let cutoff = now.saturating_sub(older_than_ns);
        let removed: Vec<String> = self
            .state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.status.is_terminal() && sub.next_execution < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            self.state.subscriptions.remove(id);
            self.state.encrypted_metadata.remove(id);
        }
        removed
    }

    /// Record a trigger failure, truncating oversized reasons so one bad
    /// error string cannot bloat the snapshot.
    pub fn record_failure(sub: &mut Subscription, now: TimestampNs, reason: &str) {
        sub.failed_payment_count = sub.failed_payment_count.saturating_add(1);
        sub.last_failure_time = Some(now);
        let mut reason_owned: String = reason.chars().take(MAX_ERROR_LEN).collect();
        if reason_owned.len() < reason.len() {
            reason_owned.push_str("...");
        }
        sub.last_error = Some(reason_owned);
    }

    // ── Encrypted metadata ───────────────────────────────────────────────────

    pub fn metadata(&self, id: &str) -> Option<&EncryptedMetadata> {
        self.state.encrypted_metadata.get(id)
    }

    pub fn metadata_entries(&self) -> impl Iterator<Item = (&String, &EncryptedMetadata)> {
        self.state.encrypted_metadata.iter()
    }

    pub fn put_metadata(&mut self, id: String, metadata: EncryptedMetadata) {
        self.state.encrypted_metadata.insert(id, metadata);
    }

    pub fn delete_metadata(&mut self, id: &str) -> bool {
        self.state.encrypted_metadata.remove(id).is_some()
    }

    // ── Roles ────────────────────────────────────────────────────────────────

    pub fn admins(&self) -> &BTreeSet<String> {
        &self.state.admins
    }

    pub fn read_only_users(&self) -> &BTreeSet<String> {
        &self.state.read_only_users
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        self.state.admins.contains(identity)
    }

    pub fn is_read_only_user(&self, identity: &str) -> bool {
        self.state.read_only_users.contains(identity)
    }

    pub fn add_admin(&mut self, identity: String) -> bool {
        self.state.admins.insert(identity)
    }

    pub fn remove_admin(&mut self, identity: &str) -> bool {
        self.state.admins.remove(identity)
    }

    pub fn add_read_only_user(&mut self, identity: String) -> bool {
        self.state.read_only_users.insert(identity)
    }

    pub fn remove_read_only_user(&mut self, identity: &str) -> bool {
        self.state.read_only_users.remove(identity)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }
    Ok(())
}
