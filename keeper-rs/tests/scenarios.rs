//! End-to-end scenarios against the service task on virtual time, with
//! in-memory node and signer capabilities.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};
use tokio::sync::mpsc;

use metronome_keeper::auth::{AuthConfig, AuthenticateRequest};
use metronome_keeper::clock::Clock;
use metronome_keeper::error::ServiceError;
use metronome_keeper::scheduler::{self, SchedulerHandle};
use metronome_keeper::service::{AuthContext, Service, ServiceClient, ServiceConfig};
use metronome_keeper::store::Store;
use metronome_keeper::types::{
    CreateSubscriptionRequest, DegradationReason, HealthStatus, SubscriptionStatus, NANOS_PER_SEC,
};

use metronome_tx::encoding::read_compact_u16;
use metronome_tx::message::decode_message;
use metronome_tx::pubkey::Pubkey;
use metronome_tx::rpc::{Commitment, NodeRpc, RpcError, SendOptions, TokenAccount};
use metronome_tx::signer::{DerivationPath, SignerError, ThresholdSigner};

const BASE_SECS: u64 = 1_700_000_000;
const PROGRAM: &str = "7c1tGePFVT3ztPEESfzG7gFqYiCJUDjFa7PCeyMSYtub";
const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const MERCHANT: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";

// ── Fakes ────────────────────────────────────────────────────────────────────

struct FakeSigner;

#[async_trait]
impl ThresholdSigner for FakeSigner {
    async fn derive_public_key(&self, path: &DerivationPath) -> Result<Pubkey, SignerError> {
        Ok(if path.is_empty() {
            Pubkey::new([3; 32])
        } else {
            Pubkey::new([4; 32])
        })
    }

    async fn sign_digest(
        &self,
        _path: &DerivationPath,
        digest: &[u8; 32],
    ) -> Result<[u8; 64], SignerError> {
        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(digest);
        sig[32..].copy_from_slice(digest);
        Ok(sig)
    }
}

struct FakeRpc {
    sent: Mutex<Vec<Vec<u8>>>,
    fail_sends: AtomicBool,
    payer_balance: AtomicU64,
    send_delay: Mutex<Option<Duration>>,
}

impl Default for FakeRpc {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            payer_balance: AtomicU64::new(1_000_000_000),
            send_delay: Mutex::new(None),
        }
    }
}

impl FakeRpc {
    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent_at(&self, index: usize) -> Vec<u8> {
        self.sent.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl NodeRpc for FakeRpc {
    async fn latest_blockhash(&self, _c: Commitment) -> Result<[u8; 32], RpcError> {
        Ok([0xbb; 32])
    }

    async fn balance(&self, _address: &Pubkey) -> Result<u64, RpcError> {
        Ok(self.payer_balance.load(Ordering::Relaxed))
    }

    async fn token_balance(&self, _account: &Pubkey) -> Result<u64, RpcError> {
        Ok(0)
    }

    async fn token_accounts_by_owner(
        &self,
        _owner: &Pubkey,
        _mint: Option<&Pubkey>,
    ) -> Result<Vec<TokenAccount>, RpcError> {
        Ok(Vec::new())
    }

    async fn send_transaction(
        &self,
        transaction: &[u8],
        _options: &SendOptions,
    ) -> Result<String, RpcError> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(RpcError::RemoteRejected {
                code: -32002,
                message: "transaction simulation failed".to_string(),
            });
        }
        self.sent.lock().unwrap().push(transaction.to_vec());
        Ok("sigA".to_string())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    client: ServiceClient,
    timers: SchedulerHandle,
    rpc: Arc<FakeRpc>,
    clock: Clock,
    admin_key: SigningKey,
    admin_identity: String,
    user_key: SigningKey,
    user_identity: String,
}

async fn start() -> Harness {
    start_with_store(Store::ephemeral()).await
}

async fn start_with_store(store: Store) -> Harness {
    let clock = Clock::fixed(BASE_SECS * NANOS_PER_SEC);
    let rpc = Arc::new(FakeRpc::default());

    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let timers = scheduler::spawn(clock.clone(), timer_tx);

    let auth_cfg = AuthConfig {
        global_requests_per_minute: 1_000_000,
        identity_requests_per_minute: 1_000_000,
        session_ttl_seconds: 10_000_000,
        challenge_ttl_seconds: 300,
        max_failed_attempts_before_backoff: 5,
        backoff_base_seconds: 2,
        backoff_multiplier: 2.0,
        backoff_max_seconds: 3_600,
    };

    let mut service = Service::new(
        ServiceConfig::default(),
        clock.clone(),
        store,
        timers.clone(),
        auth_cfg,
        Arc::new(FakeSigner),
        rpc.clone(),
    );
    service.rehydrate();

    let (api_tx, api_rx) = mpsc::channel(64);
    tokio::spawn(service.run(api_rx, timer_rx));

    let admin_key = SigningKey::from_bytes(&[1u8; 32]);
    let user_key = SigningKey::from_bytes(&[2u8; 32]);
    Harness {
        client: ServiceClient::new(api_tx),
        timers,
        rpc,
        clock,
        admin_identity: bs58::encode(admin_key.verifying_key().to_bytes()).into_string(),
        admin_key,
        user_identity: bs58::encode(user_key.verifying_key().to_bytes()).into_string(),
        user_key,
    }
}

impl Harness {
    async fn session(&self, key: &SigningKey, identity: &str) -> AuthContext {
        let challenge = self
            .client
            .generate_challenge(identity.to_string())
            .await
            .unwrap();
        let signature = hex::encode(key.sign(challenge.message.as_bytes()).to_bytes());
        let grant = self
            .client
            .authenticate(AuthenticateRequest {
                identity: identity.to_string(),
                requested_permissions: vec![],
                nonce: challenge.nonce,
                signature,
                origin: None,
            })
            .await
            .unwrap();
        AuthContext {
            identity: identity.to_string(),
            session_token: grant.token,
            origin: None,
        }
    }

    /// Bootstrap: first admin, session, keys derived.
    async fn admin(&self) -> AuthContext {
        self.client
            .initialize_first_admin(self.admin_identity.clone())
            .await
            .unwrap();
        let ctx = self.session(&self.admin_key, &self.admin_identity).await;
        self.client.initialize(ctx.clone()).await.unwrap();
        ctx
    }

    async fn user(&self) -> AuthContext {
        self.session(&self.user_key, &self.user_identity).await
    }

    fn request(&self, id: &str, interval: u64) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            id: id.to_string(),
            contract_address: PROGRAM.to_string(),
            payment_token_mint: MINT.to_string(),
            subscriber_address: self.user_identity.clone(),
            merchant_address: MERCHANT.to_string(),
            interval_seconds: interval,
            amount: 1_000_000,
            reminder_days_before_payment: 0,
            start_time: None,
        }
    }
}

/// Let every ready task run without letting virtual time move.
async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

async fn advance_to(clock: &Clock, target_ns: u64) {
    let now = clock.now_ns();
    if target_ns > now {
        tokio::time::advance(Duration::from_nanos(target_ns - now)).await;
    }
    settle().await;
}

fn decoded_instruction_data(tx: &[u8]) -> Vec<u8> {
    let (count, offset) = read_compact_u16(tx, 0).unwrap();
    assert_eq!(count, 1);
    let message = decode_message(&tx[offset + 64..]).unwrap();
    message.instructions[0].data.clone()
}

// ── Scenario 1: create → schedule → tick → succeed ───────────────────────────

#[tokio::test(start_paused = true)]
async fn create_schedule_tick_succeed() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    let mut request = h.request("sub_abcd", 3_600);
    request.start_time = Some(h.clock.now_ns() + 3_600 * NANOS_PER_SEC);
    h.client
        .create_subscription(user.clone(), request)
        .await
        .unwrap();

    // Exactly one timer armed, at the start time.
    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].at, h.clock.now_ns() + 3_600 * NANOS_PER_SEC);

    advance_to(&h.clock, BASE_SECS * NANOS_PER_SEC + 3_600 * NANOS_PER_SEC).await;

    assert_eq!(h.rpc.sent_count(), 1, "exactly one sendTransaction call");
    let data = decoded_instruction_data(&h.rpc.sent_at(0));
    assert_eq!(&data[..8], &[0xbd, 0x51, 0x1e, 0xc6, 0x8b, 0xba, 0x73, 0x17]);

    let now = h.clock.now_ns();
    let sub = h
        .client
        .get_subscription(admin.clone(), "sub_abcd".to_string())
        .await
        .unwrap();
    assert_eq!(sub.trigger_count, 1);
    assert_eq!(sub.failed_payment_count, 0);
    assert_eq!(sub.last_triggered, Some(now));
    assert_eq!(sub.next_execution, now + 3_600 * NANOS_PER_SEC);
    assert_eq!(sub.status, SubscriptionStatus::Active);

    // The timer for the next interval is re-armed.
    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].at, sub.next_execution);
}

// ── Scenario 2: failure backoff ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failure_backoff_multiplies_the_interval() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user, h.request("sub_abcd", 3_600))
        .await
        .unwrap();
    h.rpc.fail_sends.store(true, Ordering::Relaxed);

    for expected_count in 1..=3u32 {
        let sub = h
            .client
            .get_subscription(admin.clone(), "sub_abcd".to_string())
            .await
            .unwrap();
        advance_to(&h.clock, sub.next_execution).await;

        let sub = h
            .client
            .get_subscription(admin.clone(), "sub_abcd".to_string())
            .await
            .unwrap();
        assert_eq!(sub.failed_payment_count, expected_count);
    }

    let now = h.clock.now_ns();
    let sub = h
        .client
        .get_subscription(admin, "sub_abcd".to_string())
        .await
        .unwrap();
    assert_eq!(sub.failed_payment_count, 3);
    assert_eq!(sub.next_execution - now, 3_600 * 8 * NANOS_PER_SEC);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.last_error.is_some());
}

// ── Scenario 3: auto-pause after ten straight failures ───────────────────────

#[tokio::test(start_paused = true)]
async fn auto_pause_after_ten_failures() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user, h.request("sub_abcd", 3_600))
        .await
        .unwrap();
    h.rpc.fail_sends.store(true, Ordering::Relaxed);

    let mut rounds = 0;
    loop {
        let sub = h
            .client
            .get_subscription(admin.clone(), "sub_abcd".to_string())
            .await
            .unwrap();
        if sub.status != SubscriptionStatus::Active {
            break;
        }
        advance_to(&h.clock, sub.next_execution).await;
        rounds += 1;
        assert!(rounds <= 10, "auto-pause must engage by the tenth failure");
    }

    let sub = h
        .client
        .get_subscription(admin, "sub_abcd".to_string())
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Paused);
    assert_eq!(sub.failed_payment_count, 10);
    assert!(sub.last_error.as_deref().unwrap_or("").contains("-32002"));
    assert!(sub.last_failure_time.is_some());
    assert!(h.timers.armed().await.is_empty(), "no timer after auto-pause");
}

// ── Scenario 4: pause & resume ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pause_then_resume_rearms_from_resume_instant() {
    let h = start().await;
    let _admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user.clone(), h.request("sub_x", 7_200))
        .await
        .unwrap();
    h.client
        .pause_subscription(user.clone(), "sub_x".to_string())
        .await
        .unwrap();
    assert!(h.timers.armed().await.is_empty(), "paused: no timer");

    tokio::time::advance(Duration::from_secs(100)).await;
    settle().await;

    h.client
        .resume_subscription(user.clone(), "sub_x".to_string())
        .await
        .unwrap();
    let resume_instant = h.clock.now_ns();

    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].at, resume_instant + 7_200 * NANOS_PER_SEC);

    let sub = h
        .client
        .get_subscription(user, "sub_x".to_string())
        .await
        .unwrap();
    assert_eq!(sub.next_execution, resume_instant + 7_200 * NANOS_PER_SEC);
}

// ── Scenario 6: authentication lockout end to end ────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_auth_lockout_and_recovery() {
    let h = start().await;

    for _ in 0..5 {
        let challenge = h
            .client
            .generate_challenge(h.user_identity.clone())
            .await
            .unwrap();
        let err = h
            .client
            .authenticate(AuthenticateRequest {
                identity: h.user_identity.clone(),
                requested_permissions: vec![],
                nonce: challenge.nonce,
                signature: "00".repeat(64),
                origin: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::InvalidSignature);
    }

    // Sixth: locked out for ~2 seconds, immediately and again right after.
    let challenge = h
        .client
        .generate_challenge(h.user_identity.clone())
        .await
        .unwrap();
    let signature = hex::encode(h.user_key.sign(challenge.message.as_bytes()).to_bytes());
    let request = AuthenticateRequest {
        identity: h.user_identity.clone(),
        requested_permissions: vec![],
        nonce: challenge.nonce,
        signature,
        origin: None,
    };
    let err = h.client.authenticate(request.clone()).await.unwrap_err();
    assert_eq!(err, ServiceError::TemporarilyBlocked { remaining_seconds: 2 });
    let err = h.client.authenticate(request).await.unwrap_err();
    assert!(matches!(err, ServiceError::TemporarilyBlocked { .. }));

    // After the block expires a valid attempt succeeds.
    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;
    h.user().await;
}

// ── Lifecycle invariants ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn active_subscriptions_have_exactly_one_timer() {
    let h = start().await;
    let _admin = h.admin().await;
    let user = h.user().await;

    // A reminder lead does not add a second handle: the one timer just
    // fires earlier.
    let mut with_reminder = h.request("sub_aaaa", 3 * 86_400);
    with_reminder.reminder_days_before_payment = 1;
    h.client
        .create_subscription(user.clone(), with_reminder)
        .await
        .unwrap();
    for id in ["sub_bbbb", "sub_cccc"] {
        h.client
            .create_subscription(user.clone(), h.request(id, 3_600))
            .await
            .unwrap();
    }
    h.client
        .pause_subscription(user.clone(), "sub_bbbb".to_string())
        .await
        .unwrap();
    h.client
        .cancel_subscription(user.clone(), "sub_cccc".to_string())
        .await
        .unwrap();

    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].id, "sub_aaaa");
}

#[tokio::test(start_paused = true)]
async fn cancel_during_inflight_trigger_does_not_reschedule() {
    let h = start().await;
    let _admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user.clone(), h.request("sub_mid", 3_600))
        .await
        .unwrap();
    *h.rpc.send_delay.lock().unwrap() = Some(Duration::from_secs(10));

    let sub = h
        .client
        .get_subscription(user.clone(), "sub_mid".to_string())
        .await
        .unwrap();
    advance_to(&h.clock, sub.next_execution).await;

    // The trigger is sleeping inside sendTransaction; cancel wins the race.
    h.client
        .cancel_subscription(user.clone(), "sub_mid".to_string())
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;

    let sub = h
        .client
        .get_subscription(user, "sub_mid".to_string())
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    assert!(h.timers.armed().await.is_empty(), "no reschedule after cancel");
    // The chain-side transfer still happened; the bookkeeping records it.
    assert_eq!(h.rpc.sent_count(), 1);
    assert_eq!(sub.trigger_count, 1);
}

#[tokio::test(start_paused = true)]
async fn reminder_fires_ahead_of_payment_without_touching_counters() {
    let h = start().await;
    let _admin = h.admin().await;
    let user = h.user().await;

    let mut request = h.request("sub_remind", 3 * 86_400);
    request.reminder_days_before_payment = 1;
    h.client
        .create_subscription(user.clone(), request)
        .await
        .unwrap();

    let sub = h
        .client
        .get_subscription(user.clone(), "sub_remind".to_string())
        .await
        .unwrap();
    let reminder_at = sub.next_execution - 86_400 * NANOS_PER_SEC;

    // One handle, armed early at the reminder lead instant.
    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].at, reminder_at);

    advance_to(&h.clock, reminder_at).await;

    // One reminder transaction with opcode 1; payment counters untouched.
    assert_eq!(h.rpc.sent_count(), 1);
    let data = decoded_instruction_data(&h.rpc.sent_at(0));
    assert_eq!(data[8], 1);

    let sub = h
        .client
        .get_subscription(user, "sub_remind".to_string())
        .await
        .unwrap();
    assert_eq!(sub.trigger_count, 0);
    assert_eq!(sub.failed_payment_count, 0);
    assert_eq!(sub.last_triggered, None);

    // The handle was re-armed at the payment instant.
    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].at, sub.next_execution);
}

#[tokio::test(start_paused = true)]
async fn emergency_pause_cancels_everything_and_resume_rearms() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    for id in ["sub_aaaa", "sub_bbbb"] {
        h.client
            .create_subscription(user.clone(), h.request(id, 3_600))
            .await
            .unwrap();
    }

    let affected = h
        .client
        .emergency_pause_all(admin.clone())
        .await
        .unwrap();
    assert_eq!(affected, 2);
    assert!(h.timers.armed().await.is_empty());

    let health = h.client.get_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Offline);
    assert!(health.emergency_paused);

    let rearmed = h.client.resume_operations(admin).await.unwrap();
    assert_eq!(rearmed, 2);
    assert_eq!(h.timers.armed().await.len(), 2);
}

// ── Restart semantics ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn restart_rehydrates_one_timer_per_active_subscription() {
    // Build the durable snapshot a previous process would have left behind.
    let mut store = Store::ephemeral();
    let now = BASE_SECS * NANOS_PER_SEC;
    let user_identity =
        bs58::encode(SigningKey::from_bytes(&[2u8; 32]).verifying_key().to_bytes()).into_string();

    for (id, status) in [
        ("sub_live", SubscriptionStatus::Active),
        ("sub_idle", SubscriptionStatus::Paused),
        ("sub_gone", SubscriptionStatus::Cancelled),
    ] {
        store
            .admit(
                &CreateSubscriptionRequest {
                    id: id.to_string(),
                    contract_address: PROGRAM.to_string(),
                    payment_token_mint: MINT.to_string(),
                    subscriber_address: user_identity.clone(),
                    merchant_address: MERCHANT.to_string(),
                    interval_seconds: 3_600,
                    amount: 1_000_000,
                    reminder_days_before_payment: 0,
                    start_time: None,
                },
                now,
            )
            .unwrap();
        store.subscription_mut(id).unwrap().status = status;
    }

    let h = start_with_store(store).await;
    settle().await;

    let armed = h.timers.armed().await;
    assert_eq!(armed.len(), 1, "only the Active subscription gets a timer");
    assert_eq!(armed[0].id, "sub_live");
}

// ── Authorization surface ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn create_requires_initialized_keys() {
    let h = start().await;
    h.client
        .initialize_first_admin(h.admin_identity.clone())
        .await
        .unwrap();
    let admin = h.session(&h.admin_key, &h.admin_identity).await;

    // No initialize() yet: field validation passes, then NotInitialized.
    let err = h
        .client
        .create_subscription(admin.clone(), h.request("sub_abcd", 3_600))
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::NotInitialized);

    h.client.initialize(admin.clone()).await.unwrap();
    h.client
        .create_subscription(admin, h.request("sub_abcd", 3_600))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn set_network_locks_after_initialize() {
    use metronome_keeper::types::NetworkEnv;

    let h = start().await;
    h.client
        .initialize_first_admin(h.admin_identity.clone())
        .await
        .unwrap();
    let admin = h.session(&h.admin_key, &h.admin_identity).await;

    h.client
        .set_network(admin.clone(), NetworkEnv::Devnet)
        .await
        .unwrap();
    let keys = h.client.initialize(admin.clone()).await.unwrap();
    // Idempotent: same addresses come back.
    assert_eq!(h.client.initialize(admin.clone()).await.unwrap(), keys);

    let err = h
        .client
        .set_network(admin, NetworkEnv::Mainnet)
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::NetworkLocked);
}

#[tokio::test(start_paused = true)]
async fn users_cannot_touch_other_subscriptions() {
    let h = start().await;
    let _admin = h.admin().await;
    let user = h.user().await;

    // Subscriber is someone else entirely.
    let mut request = h.request("sub_abcd", 3_600);
    request.subscriber_address = MERCHANT.to_string();
    let err = h
        .client
        .create_subscription(user.clone(), request)
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Unauthorized);

    // Own subscription works, and a stranger cannot pause it.
    h.client
        .create_subscription(user.clone(), h.request("sub_abcd", 3_600))
        .await
        .unwrap();

    let stranger_key = SigningKey::from_bytes(&[9u8; 32]);
    let stranger_identity = bs58::encode(stranger_key.verifying_key().to_bytes()).into_string();
    let stranger = h.session(&stranger_key, &stranger_identity).await;
    let err = h
        .client
        .pause_subscription(stranger, "sub_abcd".to_string())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Unauthorized);
}

#[tokio::test(start_paused = true)]
async fn read_only_users_can_query_but_not_mutate() {
    let h = start().await;
    let admin = h.admin().await;

    let reader_key = SigningKey::from_bytes(&[8u8; 32]);
    let reader_identity = bs58::encode(reader_key.verifying_key().to_bytes()).into_string();
    h.client
        .add_read_only_user(admin.clone(), reader_identity.clone())
        .await
        .unwrap();

    let reader = h.session(&reader_key, &reader_identity).await;
    assert!(h
        .client
        .list_subscriptions(reader.clone())
        .await
        .unwrap()
        .is_empty());

    let err = h
        .client
        .create_subscription(reader, h.request("sub_abcd", 3_600))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientPermissions { .. }));
}

#[tokio::test(start_paused = true)]
async fn admin_set_rules() {
    let h = start().await;
    let admin = h.admin().await;

    // Bootstrap only works once.
    let err = h
        .client
        .initialize_first_admin(h.user_identity.clone())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Unauthorized);

    // An admin cannot remove itself.
    let err = h
        .client
        .remove_admin(admin.clone(), h.admin_identity.clone())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Unauthorized);

    h.client
        .add_admin(admin.clone(), h.user_identity.clone())
        .await
        .unwrap();
    let admins = h.client.get_admins(admin.clone()).await.unwrap();
    assert_eq!(admins.len(), 2);

    h.client
        .remove_admin(admin.clone(), h.user_identity.clone())
        .await
        .unwrap();
    assert_eq!(h.client.get_admins(admin).await.unwrap().len(), 1);
}

// ── Metadata ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn metadata_storage_and_admin_gated_erasure() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user.clone(), h.request("sub_abcd", 3_600))
        .await
        .unwrap();
    h.client
        .store_encrypted_metadata(
            user.clone(),
            "sub_abcd".to_string(),
            "ciphertext".to_string(),
            "iv01".to_string(),
            "deadbeef".to_string(),
            1,
        )
        .await
        .unwrap();

    let meta = h
        .client
        .get_encrypted_metadata(user.clone(), "sub_abcd".to_string())
        .await
        .unwrap();
    assert_eq!(meta.data, "ciphertext");
    assert_eq!(meta.encrypted_by, h.user_identity);

    // Listing is admin-only; erasure is admin-only.
    let err = h
        .client
        .list_encrypted_metadata(user.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientPermissions { .. }));
    assert_eq!(
        h.client
            .list_encrypted_metadata(admin.clone())
            .await
            .unwrap()
            .len(),
        1
    );

    let err = h
        .client
        .delete_encrypted_metadata(user.clone(), "sub_abcd".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientPermissions { .. }));

    h.client
        .delete_encrypted_metadata(admin, "sub_abcd".to_string())
        .await
        .unwrap();
    let err = h
        .client
        .get_encrypted_metadata(user, "sub_abcd".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound { .. }));
}

// ── Health & metrics ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn health_degrades_with_payer_balance() {
    let h = start().await;
    let _admin = h.admin().await;

    let health = h.client.get_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.payer_balance, Some(1_000_000_000));

    h.rpc.payer_balance.store(50_000_000, Ordering::Relaxed);
    let health = h.client.get_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.reasons, vec![DegradationReason::LowCycleBalance]);

    h.rpc.payer_balance.store(1_000_000, Ordering::Relaxed);
    let health = h.client.get_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Critical);
    assert_eq!(health.reasons, vec![DegradationReason::CriticalCycleBalance]);
}

#[tokio::test(start_paused = true)]
async fn metrics_and_overdue_reporting() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user.clone(), h.request("sub_abcd", 3_600))
        .await
        .unwrap();
    assert_eq!(h.client.ping().await.unwrap(), "pong");

    let metrics = h.client.get_system_metrics(admin.clone()).await.unwrap();
    assert_eq!(metrics.total_subscriptions, 1);
    assert_eq!(metrics.active_subscriptions, 1);
    assert_eq!(metrics.armed_timers, 1);

    assert!(h
        .client
        .get_overdue_subscriptions(admin.clone())
        .await
        .unwrap()
        .is_empty());

    // Freeze triggering, then sail past the deadline: the subscription
    // shows up as overdue.
    h.client.emergency_pause_all(admin.clone()).await.unwrap();
    tokio::time::advance(Duration::from_secs(2 * 3_600)).await;
    settle().await;
    let overdue = h
        .client
        .get_overdue_subscriptions(admin)
        .await
        .unwrap();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].id, "sub_abcd");
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cleanup_removes_old_terminal_records() {
    let h = start().await;
    let admin = h.admin().await;
    let user = h.user().await;

    h.client
        .create_subscription(user.clone(), h.request("sub_dead", 3_600))
        .await
        .unwrap();
    h.client
        .cancel_subscription(user.clone(), "sub_dead".to_string())
        .await
        .unwrap();
    h.client
        .create_subscription(user.clone(), h.request("sub_live", 3_600))
        .await
        .unwrap();

    // Not old enough yet.
    assert_eq!(
        h.client
            .cleanup_old_subscriptions(admin.clone(), 86_400)
            .await
            .unwrap(),
        0
    );

    tokio::time::advance(Duration::from_secs(3 * 86_400)).await;
    settle().await;
    assert_eq!(
        h.client
            .cleanup_old_subscriptions(admin.clone(), 86_400)
            .await
            .unwrap(),
        1
    );

    let remaining = h.client.list_subscriptions(admin).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "sub_live");
}
