//! The keeper service: a single task that owns every piece of mutable
//! state and serializes all mutations.
//!
//! API handlers talk to it over a command channel; the scheduler feeds it
//! timer events; trigger tasks report outcomes back on a third channel.
//! Trigger execution itself runs in spawned tasks so a slow node or signer
//! never stalls the control surface, but all bookkeeping happens here,
//! against a fresh read of the store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use metronome_tx::pubkey::Pubkey;
use metronome_tx::rpc::{Commitment, NodeRpc, SendOptions};
use metronome_tx::signer::{fee_collection_path, main_key_path, ThresholdSigner};

use crate::auth::{
    role_permissions, AuthConfig, AuthManager, AuthenticateRequest, Challenge, Permission,
    SessionGrant,
};
use crate::clock::Clock;
use crate::error::{ServiceError, ValidationError};
use crate::scheduler::{SchedulerHandle, TimerEvent};
use crate::store::Store;
use crate::trigger::{self, TriggerEnv, TriggerJob, TriggerKind, TriggerOutcome};
use crate::types::{
    CreateSubscriptionRequest, DegradationReason, DerivedKeys, EncryptedMetadata, HealthReport,
    HealthStatus, NetworkEnv, Subscription, SubscriptionStatus, SystemMetrics, TimestampNs,
    AUTO_PAUSE_FAILURE_THRESHOLD, MAX_SUBSCRIPTIONS, NANOS_PER_SEC,
};

const SECONDS_PER_DAY: u64 = 86_400;

/// Tunables the actor needs at runtime.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub commitment: Commitment,
    pub send_options: SendOptions,
    pub dry_run: bool,
    pub low_balance_lamports: u64,
    pub critical_balance_lamports: u64,
    /// Spread window for re-arming overdue timers after a restart.
    pub rehydrate_spread_seconds: u64,
    pub housekeeping_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            commitment: Commitment::Confirmed,
            send_options: SendOptions::default(),
            dry_run: false,
            low_balance_lamports: 100_000_000,
            critical_balance_lamports: 10_000_000,
            rehydrate_spread_seconds: 30,
            housekeeping_interval: Duration::from_secs(300),
        }
    }
}

/// Caller identification attached to privileged operations.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub identity: String,
    pub session_token: String,
    #[serde(default)]
    pub origin: Option<String>,
}

type Reply<T> = oneshot::Sender<T>;
type FallibleReply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Everything the admin API can ask the service to do.
#[derive(Debug)]
pub enum ApiCommand {
    GenerateChallenge {
        identity: String,
        reply: Reply<Challenge>,
    },
    Authenticate {
        request: AuthenticateRequest,
        reply: FallibleReply<SessionGrant>,
    },
    SetNetwork {
        auth: AuthContext,
        env: NetworkEnv,
        reply: FallibleReply<()>,
    },
    Initialize {
        auth: AuthContext,
        reply: FallibleReply<DerivedKeys>,
    },
    CreateSubscription {
        auth: AuthContext,
        request: Box<CreateSubscriptionRequest>,
        reply: FallibleReply<String>,
    },
    PauseSubscription {
        auth: AuthContext,
        id: String,
        reply: FallibleReply<()>,
    },
    ResumeSubscription {
        auth: AuthContext,
        id: String,
        reply: FallibleReply<()>,
    },
    CancelSubscription {
        auth: AuthContext,
        id: String,
        reply: FallibleReply<()>,
    },
    ListSubscriptions {
        auth: AuthContext,
        reply: FallibleReply<Vec<Subscription>>,
    },
    GetSubscription {
        auth: AuthContext,
        id: String,
        reply: FallibleReply<Subscription>,
    },
    CleanupOldSubscriptions {
        auth: AuthContext,
        older_than_seconds: u64,
        reply: FallibleReply<usize>,
    },
    AddAdmin {
        auth: AuthContext,
        identity: String,
        reply: FallibleReply<()>,
    },
    RemoveAdmin {
        auth: AuthContext,
        identity: String,
        reply: FallibleReply<()>,
    },
    AddReadOnlyUser {
        auth: AuthContext,
        identity: String,
        reply: FallibleReply<()>,
    },
    RemoveReadOnlyUser {
        auth: AuthContext,
        identity: String,
        reply: FallibleReply<()>,
    },
    GetAdmins {
        auth: AuthContext,
        reply: FallibleReply<Vec<String>>,
    },
    GetReadOnlyUsers {
        auth: AuthContext,
        reply: FallibleReply<Vec<String>>,
    },
    InitializeFirstAdmin {
        identity: String,
        reply: FallibleReply<()>,
    },
    Ping {
        reply: Reply<String>,
    },
    GetHealth {
        reply: Reply<HealthReport>,
    },
    GetSystemMetrics {
        auth: AuthContext,
        reply: FallibleReply<SystemMetrics>,
    },
    GetOverdueSubscriptions {
        auth: AuthContext,
        reply: FallibleReply<Vec<Subscription>>,
    },
    EmergencyPauseAll {
        auth: AuthContext,
        reply: FallibleReply<usize>,
    },
    ResumeOperations {
        auth: AuthContext,
        reply: FallibleReply<usize>,
    },
    StoreEncryptedMetadata {
        auth: AuthContext,
        id: String,
        data: String,
        iv: String,
        data_hash: String,
        version: u32,
        reply: FallibleReply<()>,
    },
    GetEncryptedMetadata {
        auth: AuthContext,
        id: String,
        reply: FallibleReply<EncryptedMetadata>,
    },
    DeleteEncryptedMetadata {
        auth: AuthContext,
        id: String,
        reply: FallibleReply<()>,
    },
    ListEncryptedMetadata {
        auth: AuthContext,
        reply: FallibleReply<Vec<(String, EncryptedMetadata)>>,
    },
}

pub struct Service {
    cfg: ServiceConfig,
    clock: Clock,
    store: Store,
    scheduler: SchedulerHandle,
    auth: AuthManager,
    signer: Arc<dyn ThresholdSigner>,
    rpc: Arc<dyn NodeRpc>,
    /// Parsed (trigger authority, fee collection) once initialized.
    keys: Option<(Pubkey, Pubkey)>,
    /// Ids with a payment trigger between firing and outcome; such an id
    /// has no armed timer and must not get one until the outcome lands.
    in_flight: HashSet<String>,
    emergency_paused: bool,
    started_at: TimestampNs,
    triggers_succeeded: u64,
    triggers_failed: u64,
    reminders_sent: u64,
    outcome_tx: mpsc::UnboundedSender<TriggerOutcome>,
    outcome_rx: Option<mpsc::UnboundedReceiver<TriggerOutcome>>,
}

impl Service {
    pub fn new(
        cfg: ServiceConfig,
        clock: Clock,
        store: Store,
        scheduler: SchedulerHandle,
        auth_cfg: AuthConfig,
        signer: Arc<dyn ThresholdSigner>,
        rpc: Arc<dyn NodeRpc>,
    ) -> Self {
        let started_at = clock.now_ns();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let keys = store.derived_keys().and_then(|k| {
            match (Pubkey::parse(&k.main_address), Pubkey::parse(&k.fee_address)) {
                (Ok(main), Ok(fee)) => Some((main, fee)),
                _ => {
                    tracing::warn!("persisted derived keys are unparseable; re-derive required");
                    None
                }
            }
        });
        Self {
            cfg,
            clock,
            store,
            scheduler,
            auth: AuthManager::new(auth_cfg),
            signer,
            rpc,
            keys,
            in_flight: HashSet::new(),
            emergency_paused: false,
            started_at,
            triggers_succeeded: 0,
            triggers_failed: 0,
            reminders_sent: 0,
            outcome_tx,
            outcome_rx: Some(outcome_rx),
        }
    }

    /// Post-restart hook: arm one payment timer per Active subscription.
    ///
    /// Overdue subscriptions (the keeper was down past their deadline) are
    /// spread over a small deterministic per-id window instead of all
    /// firing in the same instant.
    pub fn rehydrate(&mut self) -> usize {
        let now = self.clock.now_ns();
        let to_arm: Vec<Subscription> = self
            .store
            .subscriptions()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .cloned()
            .collect();

        let mut armed = 0;
        for sub in &to_arm {
            if sub.next_execution <= now {
                let at = now + id_spread(&sub.id, self.cfg.rehydrate_spread_seconds);
                self.scheduler.schedule(&sub.id, at);
            } else {
                self.arm(sub, now);
            }
            armed += 1;
        }
        tracing::info!(armed, total = self.store.subscription_count(), "timers re-armed");
        armed
    }

    /// Event loop; runs until the API channel closes.
    pub async fn run(
        mut self,
        mut api_rx: mpsc::Receiver<ApiCommand>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        let mut outcome_rx = match self.outcome_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut housekeeping = tokio::time::interval(self.cfg.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = api_rx.recv() => match maybe {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = timer_rx.recv() => self.handle_timer(event),
                Some(outcome) = outcome_rx.recv() => self.apply_outcome(outcome),
                _ = housekeeping.tick() => {
                    let pruned = self.auth.prune_sessions(self.clock.now_ns());
                    if pruned > 0 {
                        tracing::debug!(pruned, "expired sessions dropped");
                    }
                }
            }
        }
        self.persist();
    }

    // ── Timer path ───────────────────────────────────────────────────────────

    fn handle_timer(&mut self, event: TimerEvent) {
        if self.emergency_paused {
            return;
        }
        let now = self.clock.now_ns();
        let Some(sub) = self.store.subscription(&event.id) else {
            return;
        };
        if sub.status != SubscriptionStatus::Active {
            return;
        }

        // The single timer fires either at the reminder lead instant or at
        // the payment due instant; which one this was falls out of the
        // current `next_execution`.
        let kind = if now < sub.next_execution {
            TriggerKind::Reminder
        } else {
            TriggerKind::Payment
        };

        if kind == TriggerKind::Payment && self.in_flight.contains(&event.id) {
            // A previous trigger has not resolved; its outcome re-arms.
            return;
        }

        let Some((authority, fee)) = self.keys else {
            tracing::error!(
                subscription_id = %event.id,
                "timer fired before keys were initialized; deferring one interval"
            );
            let interval_ns = sub.interval_seconds * NANOS_PER_SEC;
            self.scheduler.schedule(&event.id, now + interval_ns);
            return;
        };

        // A reminder firing keeps the lifecycle moving regardless of how
        // the notification itself goes: re-arm at the payment instant now.
        if kind == TriggerKind::Reminder {
            self.scheduler.schedule(&event.id, sub.next_execution);
        }

        if self.cfg.dry_run {
            tracing::info!(
                subscription_id = %event.id,
                kind = ?kind,
                "DRY RUN: would submit trigger"
            );
            if kind == TriggerKind::Payment {
                let interval_ns = sub.interval_seconds * NANOS_PER_SEC;
                self.scheduler.schedule(&event.id, now + interval_ns);
            }
            return;
        }

        let job = TriggerJob::from_subscription(sub, kind, self.clock.now_secs());
        if kind == TriggerKind::Payment {
            self.in_flight.insert(event.id.clone());
        }
        let env = TriggerEnv {
            signer: self.signer.clone(),
            rpc: self.rpc.clone(),
            trigger_authority: authority,
            fee_collection: fee,
            commitment: self.cfg.commitment,
            send_options: self.cfg.send_options.clone(),
        };
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = trigger::execute(&env, &job).await;
            let _ = outcome_tx.send(TriggerOutcome {
                id: job.id,
                kind: job.kind,
                result,
            });
        });
    }

    fn apply_outcome(&mut self, outcome: TriggerOutcome) {
        if outcome.kind == TriggerKind::Payment {
            self.in_flight.remove(&outcome.id);
        }
        let now = self.clock.now_ns();

        // Re-read: the record may have been cancelled, paused, or cleaned
        // up while the trigger was in flight.
        let Some(sub) = self.store.subscription(&outcome.id) else {
            tracing::warn!(subscription_id = %outcome.id, "outcome for a removed subscription");
            return;
        };
        let still_active = sub.status == SubscriptionStatus::Active && !self.emergency_paused;

        if outcome.kind == TriggerKind::Reminder {
            match outcome.result {
                Ok(tx) => {
                    self.reminders_sent += 1;
                    tracing::info!(subscription_id = %outcome.id, tx = %tx, "reminder sent");
                }
                // Reminder failures never touch the payment failure counters.
                Err(err) => {
                    tracing::warn!(subscription_id = %outcome.id, error = %err, "reminder failed");
                }
            }
            return;
        }

        match outcome.result {
            Ok(tx) => {
                self.triggers_succeeded += 1;
                let snapshot = {
                    let sub = self
                        .store
                        .subscription_mut(&outcome.id)
                        .expect("checked above");
                    sub.failed_payment_count = 0;
                    sub.last_failure_time = None;
                    sub.last_error = None;
                    sub.last_triggered = Some(now);
                    sub.trigger_count += 1;
                    if still_active {
                        sub.next_execution = now + sub.interval_seconds * NANOS_PER_SEC;
                    }
                    sub.clone()
                };
                tracing::info!(subscription_id = %outcome.id, tx = %tx, "payment triggered");
                if still_active {
                    self.arm(&snapshot, now);
                }
            }
            Err(err) => {
                self.triggers_failed += 1;
                let reason = err.to_string();
                let (failed_count, interval_ns) = {
                    let sub = self
                        .store
                        .subscription_mut(&outcome.id)
                        .expect("checked above");
                    Store::record_failure(sub, now, &reason);
                    (sub.failed_payment_count, sub.interval_seconds * NANOS_PER_SEC)
                };

                if failed_count >= AUTO_PAUSE_FAILURE_THRESHOLD {
                    // Park the subscription; failure fields stay for the
                    // operator to inspect.
                    let sub = self
                        .store
                        .subscription_mut(&outcome.id)
                        .expect("checked above");
                    if sub.status == SubscriptionStatus::Active {
                        sub.status = SubscriptionStatus::Paused;
                    }
                    self.scheduler.cancel(&outcome.id);
                    tracing::warn!(
                        subscription_id = %outcome.id,
                        failed_count,
                        error = %reason,
                        "auto-paused after repeated failures"
                    );
                } else if still_active {
                    let multiplier = trigger::backoff_multiplier(failed_count);
                    let next = now + interval_ns * multiplier;
                    let snapshot = {
                        let sub = self
                            .store
                            .subscription_mut(&outcome.id)
                            .expect("checked above");
                        sub.next_execution = next;
                        sub.clone()
                    };
                    self.arm(&snapshot, now);
                    tracing::warn!(
                        subscription_id = %outcome.id,
                        failed_count,
                        backoff_multiplier = multiplier,
                        error = %reason,
                        "trigger failed; backing off"
                    );
                }
            }
        }
        self.persist();
    }

    /// Arm the subscription's single timer at its next wake instant.
    fn arm(&self, sub: &Subscription, now: TimestampNs) {
        self.scheduler.schedule(
            &sub.id,
            next_wake(sub.next_execution, sub.reminder_days_before_payment, now),
        );
    }

    fn persist(&self) {
        if let Err(err) = self.store.save() {
            tracing::error!(error = %err, "failed to persist keeper state");
        }
    }

    // ── Auth helpers ─────────────────────────────────────────────────────────

    fn gate(&mut self, auth: &AuthContext, required: Permission) -> Result<(), ServiceError> {
        self.auth.validate_request(
            &auth.identity,
            &auth.session_token,
            required,
            auth.origin.as_deref(),
            self.clock.now_ns(),
        )
    }

    /// Admins may mutate any subscription; everyone else only their own.
    fn gate_mutation(&mut self, auth: &AuthContext, subscriber: &str) -> Result<(), ServiceError> {
        if self.store.is_admin(&auth.identity) {
            self.gate(auth, Permission::ManageAllSubscriptions)
        } else {
            self.gate(auth, Permission::ManageOwnSubscriptions)?;
            if subscriber != auth.identity {
                return Err(ServiceError::Unauthorized);
            }
            Ok(())
        }
    }

    // ── Command dispatch ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: ApiCommand) {
        match cmd {
            ApiCommand::GenerateChallenge { identity, reply } => {
                let challenge = self.auth.generate_challenge(&identity, self.clock.now_ns());
                let _ = reply.send(challenge);
            }
            ApiCommand::Authenticate { request, reply } => {
                let allowed = role_permissions(
                    self.store.is_admin(&request.identity),
                    self.store.is_read_only_user(&request.identity),
                );
                let result = self
                    .auth
                    .authenticate(&request, allowed, self.clock.now_ns());
                let _ = reply.send(result);
            }
            ApiCommand::SetNetwork { auth, env, reply } => {
                let _ = reply.send(self.set_network(&auth, env));
            }
            ApiCommand::Initialize { auth, reply } => {
                let _ = reply.send(self.initialize(&auth).await);
            }
            ApiCommand::CreateSubscription { auth, request, reply } => {
                let _ = reply.send(self.create_subscription(&auth, &request));
            }
            ApiCommand::PauseSubscription { auth, id, reply } => {
                let _ = reply.send(self.pause_subscription(&auth, &id));
            }
            ApiCommand::ResumeSubscription { auth, id, reply } => {
                let _ = reply.send(self.resume_subscription(&auth, &id));
            }
            ApiCommand::CancelSubscription { auth, id, reply } => {
                let _ = reply.send(self.cancel_subscription(&auth, &id));
            }
            ApiCommand::ListSubscriptions { auth, reply } => {
                let result = self
                    .gate(&auth, Permission::ReadState)
                    .map(|()| self.store.subscriptions().cloned().collect());
                let _ = reply.send(result);
            }
            ApiCommand::GetSubscription { auth, id, reply } => {
                let result = self.gate(&auth, Permission::ReadState).and_then(|()| {
                    self.store
                        .subscription(&id)
                        .cloned()
                        .ok_or_else(|| ServiceError::not_found(format!("subscription {id}")))
                });
                let _ = reply.send(result);
            }
            ApiCommand::CleanupOldSubscriptions { auth, older_than_seconds, reply } => {
                let _ = reply.send(self.cleanup(&auth, older_than_seconds));
            }
            ApiCommand::AddAdmin { auth, identity, reply } => {
                let result = self.gate(&auth, Permission::ManageAdmins).map(|()| {
                    if self.store.add_admin(identity.clone()) {
                        tracing::info!(identity, "admin added");
                        self.persist();
                    }
                });
                let _ = reply.send(result);
            }
            ApiCommand::RemoveAdmin { auth, identity, reply } => {
                let _ = reply.send(self.remove_admin(&auth, &identity));
            }
            ApiCommand::AddReadOnlyUser { auth, identity, reply } => {
                let result = self.gate(&auth, Permission::ManageAdmins).map(|()| {
                    if self.store.add_read_only_user(identity.clone()) {
                        self.persist();
                    }
                });
                let _ = reply.send(result);
            }
            ApiCommand::RemoveReadOnlyUser { auth, identity, reply } => {
                let result = self.gate(&auth, Permission::ManageAdmins).and_then(|()| {
                    if self.store.remove_read_only_user(&identity) {
                        self.persist();
                        Ok(())
                    } else {
                        Err(ServiceError::not_found(format!("read-only user {identity}")))
                    }
                });
                let _ = reply.send(result);
            }
            ApiCommand::GetAdmins { auth, reply } => {
                let result = self
                    .gate(&auth, Permission::ReadState)
                    .map(|()| self.store.admins().iter().cloned().collect());
                let _ = reply.send(result);
            }
            ApiCommand::GetReadOnlyUsers { auth, reply } => {
                let result = self
                    .gate(&auth, Permission::ReadState)
                    .map(|()| self.store.read_only_users().iter().cloned().collect());
                let _ = reply.send(result);
            }
            ApiCommand::InitializeFirstAdmin { identity, reply } => {
                let result = if self.store.admins().is_empty() {
                    self.store.add_admin(identity.clone());
                    tracing::info!(identity, "first admin initialized");
                    self.persist();
                    Ok(())
                } else {
                    Err(ServiceError::Unauthorized)
                };
                let _ = reply.send(result);
            }
            ApiCommand::Ping { reply } => {
                let _ = reply.send("pong".to_string());
            }
            ApiCommand::GetHealth { reply } => {
                let _ = reply.send(self.health().await);
            }
            ApiCommand::GetSystemMetrics { auth, reply } => {
                let result = match self.gate(&auth, Permission::ReadState) {
                    Ok(()) => Ok(self.metrics().await),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            ApiCommand::GetOverdueSubscriptions { auth, reply } => {
                let now = self.clock.now_ns();
                let result = self.gate(&auth, Permission::ReadState).map(|()| {
                    self.store
                        .subscriptions()
                        .filter(|s| s.status == SubscriptionStatus::Active && s.next_execution < now)
                        .cloned()
                        .collect()
                });
                let _ = reply.send(result);
            }
            ApiCommand::EmergencyPauseAll { auth, reply } => {
                let _ = reply.send(self.emergency_pause_all(&auth));
            }
            ApiCommand::ResumeOperations { auth, reply } => {
                let _ = reply.send(self.resume_operations(&auth));
            }
            ApiCommand::StoreEncryptedMetadata { auth, id, data, iv, data_hash, version, reply } => {
                let _ = reply.send(self.store_metadata(&auth, id, data, iv, data_hash, version));
            }
            ApiCommand::GetEncryptedMetadata { auth, id, reply } => {
                let _ = reply.send(self.get_metadata(&auth, &id));
            }
            ApiCommand::DeleteEncryptedMetadata { auth, id, reply } => {
                let result = self.gate(&auth, Permission::ManageMetadata).and_then(|()| {
                    if self.store.delete_metadata(&id) {
                        tracing::info!(subscription_id = %id, "encrypted metadata erased");
                        self.persist();
                        Ok(())
                    } else {
                        Err(ServiceError::not_found(format!("metadata for {id}")))
                    }
                });
                let _ = reply.send(result);
            }
            ApiCommand::ListEncryptedMetadata { auth, reply } => {
                let result = self.gate(&auth, Permission::ManageMetadata).map(|()| {
                    self.store
                        .metadata_entries()
                        .map(|(id, m)| (id.clone(), m.clone()))
                        .collect()
                });
                let _ = reply.send(result);
            }
        }
    }

    // ── Operations ───────────────────────────────────────────────────────────

    fn set_network(&mut self, auth: &AuthContext, env: NetworkEnv) -> Result<(), ServiceError> {
        self.gate(auth, Permission::EmergencyControl)?;
        if self.keys.is_some() || self.store.derived_keys().is_some() {
            return Err(ServiceError::NetworkLocked);
        }
        self.store.set_network(env);
        self.persist();
        tracing::info!(network = ?env, "network environment set");
        Ok(())
    }

    async fn initialize(&mut self, auth: &AuthContext) -> Result<DerivedKeys, ServiceError> {
        self.gate(auth, Permission::EmergencyControl)?;
        if let Some(keys) = self.store.derived_keys() {
            return Ok(keys.clone());
        }

        let main = self.signer.derive_public_key(&main_key_path()).await?;
        let fee = self.signer.derive_public_key(&fee_collection_path()).await?;
        let derived = DerivedKeys {
            main_address: main.to_base58(),
            fee_address: fee.to_base58(),
        };
        self.keys = Some((main, fee));
        self.store.set_derived_keys(derived.clone());
        self.persist();
        tracing::info!(
            main = %derived.main_address,
            fee = %derived.fee_address,
            "threshold keys derived"
        );
        Ok(derived)
    }

    fn create_subscription(
        &mut self,
        auth: &AuthContext,
        request: &CreateSubscriptionRequest,
    ) -> Result<String, ServiceError> {
        self.gate_mutation(auth, &request.subscriber_address)?;
        self.store.check_admissible(request)?;
        if self.keys.is_none() {
            return Err(ServiceError::NotInitialized);
        }

        let now = self.clock.now_ns();
        let sub = self.store.admit(request, now)?;
        self.arm(&sub, now);
        self.persist();
        tracing::info!(
            subscription_id = %sub.id,
            interval_s = sub.interval_seconds,
            amount = sub.amount,
            next_execution = sub.next_execution,
            "subscription created"
        );
        Ok(sub.id)
    }

    fn pause_subscription(&mut self, auth: &AuthContext, id: &str) -> Result<(), ServiceError> {
        let subscriber = self.subscriber_of(id)?;
        self.gate_mutation(auth, &subscriber)?;
        let sub = self
            .store
            .subscription_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("subscription {id}")))?;
        match sub.status {
            SubscriptionStatus::Active => {
                sub.status = SubscriptionStatus::Paused;
                self.scheduler.cancel(id);
                self.persist();
                tracing::info!(subscription_id = %id, "subscription paused");
                Ok(())
            }
            SubscriptionStatus::Paused => Ok(()),
            status => Err(ValidationError::InvalidTransition { from: status }.into()),
        }
    }

    fn resume_subscription(&mut self, auth: &AuthContext, id: &str) -> Result<(), ServiceError> {
        let subscriber = self.subscriber_of(id)?;
        self.gate_mutation(auth, &subscriber)?;
        let now = self.clock.now_ns();
        let sub = self
            .store
            .subscription_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("subscription {id}")))?;
        if sub.status != SubscriptionStatus::Paused {
            return Err(ValidationError::InvalidTransition { from: sub.status }.into());
        }
        sub.status = SubscriptionStatus::Active;
        sub.next_execution = now + sub.interval_seconds * NANOS_PER_SEC;
        let snapshot = sub.clone();
        self.arm(&snapshot, now);
        self.persist();
        tracing::info!(subscription_id = %id, next_execution = snapshot.next_execution, "subscription resumed");
        Ok(())
    }

    fn cancel_subscription(&mut self, auth: &AuthContext, id: &str) -> Result<(), ServiceError> {
        let subscriber = self.subscriber_of(id)?;
        self.gate_mutation(auth, &subscriber)?;
        let sub = self
            .store
            .subscription_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("subscription {id}")))?;
        if sub.status != SubscriptionStatus::Cancelled {
            sub.status = SubscriptionStatus::Cancelled;
            self.scheduler.cancel(id);
            self.persist();
            tracing::info!(subscription_id = %id, "subscription cancelled");
        }
        Ok(())
    }

    fn cleanup(&mut self, auth: &AuthContext, older_than_seconds: u64) -> Result<usize, ServiceError> {
        self.gate(auth, Permission::EmergencyControl)?;
        let now = self.clock.now_ns();
        let removed = self
            .store
            .cleanup_terminal(older_than_seconds * NANOS_PER_SEC, now);
        for id in &removed {
            self.scheduler.cancel(id);
        }
        if !removed.is_empty() {
            self.persist();
            tracing::info!(removed = removed.len(), "terminal subscriptions cleaned up");
        }
        Ok(removed.len())
    }

    fn remove_admin(&mut self, auth: &AuthContext, identity: &str) -> Result<(), ServiceError> {
        self.gate(auth, Permission::ManageAdmins)?;
        if identity == auth.identity {
            // An admin cannot lock themselves out mid-session.
            return Err(ServiceError::Unauthorized);
        }
        if self.store.remove_admin(identity) {
            self.persist();
            tracing::info!(identity, "admin removed");
            Ok(())
        } else {
            Err(ServiceError::not_found(format!("admin {identity}")))
        }
    }

    fn emergency_pause_all(&mut self, auth: &AuthContext) -> Result<usize, ServiceError> {
        self.gate(auth, Permission::EmergencyControl)?;
        self.emergency_paused = true;
        self.scheduler.cancel_all();
        let affected = self
            .store
            .subscriptions()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .count();
        tracing::warn!(affected, "emergency pause engaged; all timers cancelled");
        Ok(affected)
    }

    fn resume_operations(&mut self, auth: &AuthContext) -> Result<usize, ServiceError> {
        self.gate(auth, Permission::EmergencyControl)?;
        self.emergency_paused = false;
        let armed = self.rehydrate();
        tracing::info!(armed, "operations resumed");
        Ok(armed)
    }

    fn store_metadata(
        &mut self,
        auth: &AuthContext,
        id: String,
        data: String,
        iv: String,
        data_hash: String,
        version: u32,
    ) -> Result<(), ServiceError> {
        let subscriber = self.subscriber_of(&id)?;
        self.gate_mutation(auth, &subscriber)?;
        let metadata = EncryptedMetadata {
            data,
            iv,
            data_hash,
            encrypted_by: auth.identity.clone(),
            version,
            created_at: self.clock.now_ns(),
        };
        self.store.put_metadata(id, metadata);
        self.persist();
        Ok(())
    }

    fn get_metadata(&mut self, auth: &AuthContext, id: &str) -> Result<EncryptedMetadata, ServiceError> {
        let subscriber = self.subscriber_of(id)?;
        if self.store.is_admin(&auth.identity) {
            self.gate(auth, Permission::ManageMetadata)?;
        } else {
            self.gate(auth, Permission::ReadState)?;
            if subscriber != auth.identity {
                return Err(ServiceError::Unauthorized);
            }
        }
        self.store
            .metadata(id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("metadata for {id}")))
    }

    fn subscriber_of(&self, id: &str) -> Result<String, ServiceError> {
        self.store
            .subscription(id)
            .map(|s| s.subscriber_address.clone())
            .ok_or_else(|| ServiceError::not_found(format!("subscription {id}")))
    }

    async fn health(&mut self) -> HealthReport {
        let payer_balance = match self.keys {
            Some((main, _)) => self.rpc.balance(&main).await.ok(),
            None => None,
        };

        let mut reasons = Vec::new();
        if let Some(balance) = payer_balance {
            if balance < self.cfg.critical_balance_lamports {
                reasons.push(DegradationReason::CriticalCycleBalance);
            } else if balance < self.cfg.low_balance_lamports {
                reasons.push(DegradationReason::LowCycleBalance);
            }
        }
        let failed_total: u64 = self
            .store
            .subscriptions()
            .map(|s| s.failed_payment_count as u64)
            .sum();
        if failed_total > 10 {
            reasons.push(DegradationReason::HighPaymentFailureRate);
        }
        if self.store.subscription_count() >= MAX_SUBSCRIPTIONS {
            reasons.push(DegradationReason::HighSubscriptionLoad);
        }

        let status = if self.emergency_paused {
            HealthStatus::Offline
        } else if reasons.contains(&DegradationReason::CriticalCycleBalance) {
            HealthStatus::Critical
        } else if !reasons.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            reasons,
            emergency_paused: self.emergency_paused,
            payer_balance,
        }
    }

    async fn metrics(&mut self) -> SystemMetrics {
        let mut active = 0;
        let mut paused = 0;
        let mut cancelled = 0;
        let mut expired = 0;
        let mut failed_total = 0u64;
        for sub in self.store.subscriptions() {
            match sub.status {
                SubscriptionStatus::Active => active += 1,
                SubscriptionStatus::Paused => paused += 1,
                SubscriptionStatus::Cancelled => cancelled += 1,
                SubscriptionStatus::Expired => expired += 1,
            }
            failed_total += sub.failed_payment_count as u64;
        }
        SystemMetrics {
            total_subscriptions: self.store.subscription_count(),
            active_subscriptions: active,
            paused_subscriptions: paused,
            cancelled_subscriptions: cancelled,
            expired_subscriptions: expired,
            armed_timers: self.scheduler.armed().await.len(),
            triggers_succeeded: self.triggers_succeeded,
            triggers_failed: self.triggers_failed,
            reminders_sent: self.reminders_sent,
            total_failed_payment_count: failed_total,
            uptime_seconds: (self.clock.now_ns() - self.started_at) / NANOS_PER_SEC,
        }
    }
}

/// Typed front door to the service task: one method per operation, each a
/// command send plus a oneshot reply.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    tx: mpsc::Sender<ApiCommand>,
}

impl ServiceClient {
    pub fn new(tx: mpsc::Sender<ApiCommand>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(FallibleReply<T>) -> ApiCommand,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ServiceError::internal("service is shutting down"))?;
        rx.await
            .map_err(|_| ServiceError::internal("service dropped the request"))?
    }

    async fn call_infallible<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ApiCommand,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ServiceError::internal("service is shutting down"))?;
        rx.await
            .map_err(|_| ServiceError::internal("service dropped the request"))
    }

    pub async fn generate_challenge(&self, identity: String) -> Result<Challenge, ServiceError> {
        self.call_infallible(|reply| ApiCommand::GenerateChallenge { identity, reply })
            .await
    }

    pub async fn authenticate(
        &self,
        request: AuthenticateRequest,
    ) -> Result<SessionGrant, ServiceError> {
        self.call(|reply| ApiCommand::Authenticate { request, reply })
            .await
    }

    pub async fn set_network(
        &self,
        auth: AuthContext,
        env: NetworkEnv,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::SetNetwork { auth, env, reply })
            .await
    }

    pub async fn initialize(&self, auth: AuthContext) -> Result<DerivedKeys, ServiceError> {
        self.call(|reply| ApiCommand::Initialize { auth, reply }).await
    }

    pub async fn create_subscription(
        &self,
        auth: AuthContext,
        request: CreateSubscriptionRequest,
    ) -> Result<String, ServiceError> {
        self.call(|reply| ApiCommand::CreateSubscription {
            auth,
            request: Box::new(request),
            reply,
        })
        .await
    }

    pub async fn pause_subscription(
        &self,
        auth: AuthContext,
        id: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::PauseSubscription { auth, id, reply })
            .await
    }

    pub async fn resume_subscription(
        &self,
        auth: AuthContext,
        id: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::ResumeSubscription { auth, id, reply })
            .await
    }

    pub async fn cancel_subscription(
        &self,
        auth: AuthContext,
        id: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::CancelSubscription { auth, id, reply })
            .await
    }

    pub async fn list_subscriptions(
        &self,
        auth: AuthContext,
    ) -> Result<Vec<Subscription>, ServiceError> {
        self.call(|reply| ApiCommand::ListSubscriptions { auth, reply })
            .await
    }

    pub async fn get_subscription(
        &self,
        auth: AuthContext,
        id: String,
    ) -> Result<Subscription, ServiceError> {
        self.call(|reply| ApiCommand::GetSubscription { auth, id, reply })
            .await
    }

    pub async fn cleanup_old_subscriptions(
        &self,
        auth: AuthContext,
        older_than_seconds: u64,
    ) -> Result<usize, ServiceError> {
        self.call(|reply| ApiCommand::CleanupOldSubscriptions {
            auth,
            older_than_seconds,
            reply,
        })
        .await
    }

    pub async fn add_admin(&self, auth: AuthContext, identity: String) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::AddAdmin { auth, identity, reply })
            .await
    }

    pub async fn remove_admin(
        &self,
        auth: AuthContext,
        identity: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::RemoveAdmin { auth, identity, reply })
            .await
    }

    pub async fn add_read_only_user(
        &self,
        auth: AuthContext,
        identity: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::AddReadOnlyUser { auth, identity, reply })
            .await
    }

    pub async fn remove_read_only_user(
        &self,
        auth: AuthContext,
        identity: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::RemoveReadOnlyUser { auth, identity, reply })
            .await
    }

    pub async fn get_admins(&self, auth: AuthContext) -> Result<Vec<String>, ServiceError> {
        self.call(|reply| ApiCommand::GetAdmins { auth, reply }).await
    }

    pub async fn get_read_only_users(
        &self,
        auth: AuthContext,
    ) -> Result<Vec<String>, ServiceError> {
        self.call(|reply| ApiCommand::GetReadOnlyUsers { auth, reply })
            .await
    }

    pub async fn initialize_first_admin(&self, identity: String) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::InitializeFirstAdmin { identity, reply })
            .await
    }

    pub async fn ping(&self) -> Result<String, ServiceError> {
        self.call_infallible(|reply| ApiCommand::Ping { reply }).await
    }

    pub async fn get_health(&self) -> Result<HealthReport, ServiceError> {
        self.call_infallible(|reply| ApiCommand::GetHealth { reply })
            .await
    }

    pub async fn get_system_metrics(
        &self,
        auth: AuthContext,
    ) -> Result<SystemMetrics, ServiceError> {
        self.call(|reply| ApiCommand::GetSystemMetrics { auth, reply })
            .await
    }

    pub async fn get_overdue_subscriptions(
        &self,
        auth: AuthContext,
    ) -> Result<Vec<Subscription>, ServiceError> {
        self.call(|reply| ApiCommand::GetOverdueSubscriptions { auth, reply })
            .await
    }

    pub async fn emergency_pause_all(&self, auth: AuthContext) -> Result<usize, ServiceError> {
        self.call(|reply| ApiCommand::EmergencyPauseAll { auth, reply })
            .await
    }

    pub async fn resume_operations(&self, auth: AuthContext) -> Result<usize, ServiceError> {
        self.call(|reply| ApiCommand::ResumeOperations { auth, reply })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
        data: String,
        iv: String,
        data_hash: String,
        version: u32,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::StoreEncryptedMetadata {
            auth,
            id,
            data,
            iv,
            data_hash,
            version,
            reply,
        })
        .await
    }

    pub async fn get_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
    ) -> Result<EncryptedMetadata, ServiceError> {
        self.call(|reply| ApiCommand::GetEncryptedMetadata { auth, id, reply })
            .await
    }

    pub async fn delete_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
    ) -> Result<(), ServiceError> {
        self.call(|reply| ApiCommand::DeleteEncryptedMetadata { auth, id, reply })
            .await
    }

    pub async fn list_encrypted_metadata(
        &self,
        auth: AuthContext,
    ) -> Result<Vec<(String, EncryptedMetadata)>, ServiceError> {
        self.call(|reply| ApiCommand::ListEncryptedMetadata { auth, reply })
            .await
    }
}

/// The instant a subscription's single timer should fire next: the
/// reminder lead instant when one is configured and still ahead, otherwise
/// the payment due instant. The firing handler classifies which one it got
/// by comparing against `next_execution`.
fn next_wake(next_execution: TimestampNs, reminder_days: u32, now: TimestampNs) -> TimestampNs {
    if reminder_days > 0 {
        let lead_ns = reminder_days as u64 * SECONDS_PER_DAY * NANOS_PER_SEC;
        if let Some(at) = next_execution.checked_sub(lead_ns) {
            if at > now {
                return at;
            }
        }
    }
    next_execution
}

/// Deterministic per-id spread in `[0, window_seconds)` nanoseconds, so a
/// restart with many overdue timers does not fire them all at once.
fn id_spread(id: &str, window_seconds: u64) -> u64 {
    if window_seconds == 0 {
        return 0;
    }
    let sum: u64 = id.bytes().map(u64::from).sum();
    (sum % window_seconds) * NANOS_PER_SEC
}
