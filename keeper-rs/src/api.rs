use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::auth::{AuthenticateRequest, Challenge, SessionGrant};
use crate::service::AuthContext;
use crate::types::{
    CreateSubscriptionRequest, DerivedKeys, EncryptedMetadata, HealthReport, NetworkEnv,
    Subscription, SystemMetrics,
};

/// Keeper JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "metronome_" via `namespace`.
/// Privileged methods take an [`AuthContext`] (identity, session token,
/// optional origin) established through `generateChallenge` /
/// `authenticate`.
#[rpc(server, namespace = "metronome")]
pub trait MetronomeApi {
    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Mint a signing challenge for an identity. Expires after 5 minutes.
    #[method(name = "generateChallenge")]
    async fn generate_challenge(&self, identity: String) -> RpcResult<Challenge>;

    /// Exchange a signed challenge for a session token.
    #[method(name = "authenticate")]
    async fn authenticate(&self, request: AuthenticateRequest) -> RpcResult<SessionGrant>;

    // ── Configuration ────────────────────────────────────────────────────────

    /// Select the network environment. Locked once keys are derived.
    #[method(name = "setNetwork")]
    async fn set_network(&self, auth: AuthContext, env: NetworkEnv) -> RpcResult<()>;

    /// Derive and cache the trigger-authority and fee-collection keys.
    /// Idempotent: repeat calls return the same addresses.
    #[method(name = "initialize")]
    async fn initialize(&self, auth: AuthContext) -> RpcResult<DerivedKeys>;

    // ── Subscriptions ────────────────────────────────────────────────────────

    #[method(name = "createSubscription")]
    async fn create_subscription(
        &self,
        auth: AuthContext,
        request: CreateSubscriptionRequest,
    ) -> RpcResult<String>;

    #[method(name = "pauseSubscription")]
    async fn pause_subscription(&self, auth: AuthContext, id: String) -> RpcResult<()>;

    #[method(name = "resumeSubscription")]
    async fn resume_subscription(&self, auth: AuthContext, id: String) -> RpcResult<()>;

    #[method(name = "cancelSubscription")]
    async fn cancel_subscription(&self, auth: AuthContext, id: String) -> RpcResult<()>;

    #[method(name = "listSubscriptions")]
    async fn list_subscriptions(&self, auth: AuthContext) -> RpcResult<Vec<Subscription>>;

    #[method(name = "getSubscription")]
    async fn get_subscription(&self, auth: AuthContext, id: String) -> RpcResult<Subscription>;

    /// Remove Cancelled/Expired records older than the threshold.
    /// Returns how many were removed.
    #[method(name = "cleanupOldSubscriptions")]
    async fn cleanup_old_subscriptions(
        &self,
        auth: AuthContext,
        older_than_seconds: u64,
    ) -> RpcResult<usize>;

    // ── Principal management ─────────────────────────────────────────────────

    #[method(name = "addAdmin")]
    async fn add_admin(&self, auth: AuthContext, identity: String) -> RpcResult<()>;

    /// An admin cannot remove itself.
    #[method(name = "removeAdmin")]
    async fn remove_admin(&self, auth: AuthContext, identity: String) -> RpcResult<()>;

    #[method(name = "addReadOnlyUser")]
    async fn add_read_only_user(&self, auth: AuthContext, identity: String) -> RpcResult<()>;

    #[method(name = "removeReadOnlyUser")]
    async fn remove_read_only_user(&self, auth: AuthContext, identity: String) -> RpcResult<()>;

    #[method(name = "getAdmins")]
    async fn get_admins(&self, auth: AuthContext) -> RpcResult<Vec<String>>;

    #[method(name = "getReadOnlyUsers")]
    async fn get_read_only_users(&self, auth: AuthContext) -> RpcResult<Vec<String>>;

    /// Bootstrap: succeeds only while the admin set is empty.
    #[method(name = "initializeFirstAdmin")]
    async fn initialize_first_admin(&self, identity: String) -> RpcResult<()>;

    // ── Health & operations ──────────────────────────────────────────────────

    #[method(name = "ping")]
    async fn ping(&self) -> RpcResult<String>;

    #[method(name = "getHealth")]
    async fn get_health(&self) -> RpcResult<HealthReport>;

    #[method(name = "getSystemMetrics")]
    async fn get_system_metrics(&self, auth: AuthContext) -> RpcResult<SystemMetrics>;

    /// Active subscriptions whose `next_execution` is already in the past.
    #[method(name = "getOverdueSubscriptions")]
    async fn get_overdue_subscriptions(&self, auth: AuthContext) -> RpcResult<Vec<Subscription>>;

    /// Cancel every timer and stop triggering until `resumeOperations`.
    /// Always succeeds locally.
    #[method(name = "emergencyPauseAll")]
    async fn emergency_pause_all(&self, auth: AuthContext) -> RpcResult<usize>;

    #[method(name = "resumeOperations")]
    async fn resume_operations(&self, auth: AuthContext) -> RpcResult<usize>;

    // ── Encrypted metadata ───────────────────────────────────────────────────

    #[method(name = "storeEncryptedMetadata")]
    async fn store_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
        data: String,
        iv: String,
        data_hash: String,
        version: u32,
    ) -> RpcResult<()>;

    #[method(name = "getEncryptedMetadata")]
    async fn get_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
    ) -> RpcResult<EncryptedMetadata>;

    /// Admin-gated erasure of a metadata record.
    #[method(name = "deleteEncryptedMetadata")]
    async fn delete_encrypted_metadata(&self, auth: AuthContext, id: String) -> RpcResult<()>;

    #[method(name = "listEncryptedMetadata")]
    async fn list_encrypted_metadata(
        &self,
        auth: AuthContext,
    ) -> RpcResult<Vec<(String, EncryptedMetadata)>>;
}
