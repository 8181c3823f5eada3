use std::net::SocketAddr;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::MetronomeApiServer;
use crate::auth::{AuthenticateRequest, Challenge, SessionGrant};
use crate::error::ServiceError;
use crate::service::{AuthContext, ServiceClient};
use crate::types::{
    CreateSubscriptionRequest, DerivedKeys, EncryptedMetadata, HealthReport, NetworkEnv,
    Subscription, SystemMetrics,
};

/// Map a service error to a JSON-RPC error object. The full typed error
/// rides along in `data` so clients can match on `kind`.
fn rpc_err(err: ServiceError) -> ErrorObject<'static> {
    let code = match &err {
        ServiceError::Validation(_) => -32602,
        ServiceError::NotFound { .. } => -32001,
        ServiceError::DuplicateId { .. } => -32002,
        ServiceError::Unauthorized | ServiceError::InsufficientPermissions { .. } => -32003,
        ServiceError::SessionExpired => -32004,
        ServiceError::InvalidSignature => -32005,
        ServiceError::NonceInvalid => -32006,
        ServiceError::RateLimited { .. } => -32007,
        ServiceError::TemporarilyBlocked { .. } => -32008,
        ServiceError::NotInitialized => -32009,
        ServiceError::NetworkLocked => -32010,
        ServiceError::RemoteUnavailable { .. } => -32011,
        ServiceError::RemoteRejected { .. } => -32012,
        ServiceError::SigningFailed { .. } => -32013,
        ServiceError::Internal { .. } => -32603,
    };
    let data = serde_json::to_value(&err).ok();
    ErrorObject::owned(code, err.to_string(), data)
}

/// JSON-RPC front end; every call forwards into the service task.
pub struct RpcServer {
    client: ServiceClient,
}

impl RpcServer {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> eyre::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "admin API started");
        Ok(handle)
    }
}

#[async_trait]
impl MetronomeApiServer for RpcServer {
    async fn generate_challenge(&self, identity: String) -> RpcResult<Challenge> {
        self.client.generate_challenge(identity).await.map_err(rpc_err)
    }

    async fn authenticate(&self, request: AuthenticateRequest) -> RpcResult<SessionGrant> {
        self.client.authenticate(request).await.map_err(rpc_err)
    }

    async fn set_network(&self, auth: AuthContext, env: NetworkEnv) -> RpcResult<()> {
        self.client.set_network(auth, env).await.map_err(rpc_err)
    }

    async fn initialize(&self, auth: AuthContext) -> RpcResult<DerivedKeys> {
        self.client.initialize(auth).await.map_err(rpc_err)
    }

    async fn create_subscription(
        &self,
        auth: AuthContext,
        request: CreateSubscriptionRequest,
    ) -> RpcResult<String> {
        self.client
            .create_subscription(auth, request)
            .await
            .map_err(rpc_err)
    }

    async fn pause_subscription(&self, auth: AuthContext, id: String) -> RpcResult<()> {
        self.client.pause_subscription(auth, id).await.map_err(rpc_err)
    }

    async fn resume_subscription(&self, auth: AuthContext, id: String) -> RpcResult<()> {
        self.client.resume_subscription(auth, id).await.map_err(rpc_err)
    }

    async fn cancel_subscription(&self, auth: AuthContext, id: String) -> RpcResult<()> {
        self.client.cancel_subscription(auth, id).await.map_err(rpc_err)
    }

    async fn list_subscriptions(&self, auth: AuthContext) -> RpcResult<Vec<Subscription>> {
        self.client.list_subscriptions(auth).await.map_err(rpc_err)
    }

    async fn get_subscription(&self, auth: AuthContext, id: String) -> RpcResult<Subscription> {
        self.client.get_subscription(auth, id).await.map_err(rpc_err)
    }

    async fn cleanup_old_subscriptions(
        &self,
        auth: AuthContext,
        older_than_seconds: u64,
    ) -> RpcResult<usize> {
        self.client
            .cleanup_old_subscriptions(auth, older_than_seconds)
            .await
            .map_err(rpc_err)
    }

    async fn add_admin(&self, auth: AuthContext, identity: String) -> RpcResult<()> {
        self.client.add_admin(auth, identity).await.map_err(rpc_err)
    }

    async fn remove_admin(&self, auth: AuthContext, identity: String) -> RpcResult<()> {
        self.client.remove_admin(auth, identity).await.map_err(rpc_err)
    }

    async fn add_read_only_user(&self, auth: AuthContext, identity: String) -> RpcResult<()> {
        self.client
            .add_read_only_user(auth, identity)
            .await
            .map_err(rpc_err)
    }

    async fn remove_read_only_user(&self, auth: AuthContext, identity: String) -> RpcResult<()> {
        self.client
            .remove_read_only_user(auth, identity)
            .await
            .map_err(rpc_err)
    }

    async fn get_admins(&self, auth: AuthContext) -> RpcResult<Vec<String>> {
        self.client.get_admins(auth).await.map_err(rpc_err)
    }

    async fn get_read_only_users(&self, auth: AuthContext) -> RpcResult<Vec<String>> {
        self.client.get_read_only_users(auth).await.map_err(rpc_err)
    }

    async fn initialize_first_admin(&self, identity: String) -> RpcResult<()> {
        self.client
            .initialize_first_admin(identity)
            .await
            .map_err(rpc_err)
    }

    async fn ping(&self) -> RpcResult<String> {
        self.client.ping().await.map_err(rpc_err)
    }

    async fn get_health(&self) -> RpcResult<HealthReport> {
        self.client.get_health().await.map_err(rpc_err)
    }

    async fn get_system_metrics(&self, auth: AuthContext) -> RpcResult<SystemMetrics> {
        self.client.get_system_metrics(auth).await.map_err(rpc_err)
    }

    async fn get_overdue_subscriptions(&self, auth: AuthContext) -> RpcResult<Vec<Subscription>> {
        self.client
            .get_overdue_subscriptions(auth)
            .await
            .map_err(rpc_err)
    }

    async fn emergency_pause_all(&self, auth: AuthContext) -> RpcResult<usize> {
        self.client.emergency_pause_all(auth).await.map_err(rpc_err)
    }

    async fn resume_operations(&self, auth: AuthContext) -> RpcResult<usize> {
        self.client.resume_operations(auth).await.map_err(rpc_err)
    }

    async fn store_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
        data: String,
        iv: String,
        data_hash: String,
        version: u32,
    ) -> RpcResult<()> {
        self.client
            .store_encrypted_metadata(auth, id, data, iv, data_hash, version)
            .await
            .map_err(rpc_err)
    }

    async fn get_encrypted_metadata(
        &self,
        auth: AuthContext,
        id: String,
    ) -> RpcResult<EncryptedMetadata> {
        self.client
            .get_encrypted_metadata(auth, id)
            .await
            .map_err(rpc_err)
    }

    async fn delete_encrypted_metadata(&self, auth: AuthContext, id: String) -> RpcResult<()> {
        self.client
            .delete_encrypted_metadata(auth, id)
            .await
            .map_err(rpc_err)
    }

    async fn list_encrypted_metadata(
        &self,
        auth: AuthContext,
    ) -> RpcResult<Vec<(String, EncryptedMetadata)>> {
        self.client
            .list_encrypted_metadata(auth)
            .await
            .map_err(rpc_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct_per_kind() {
        let a = rpc_err(ServiceError::NonceInvalid);
        let b = rpc_err(ServiceError::SessionExpired);
        assert_ne!(a.code(), b.code());
        assert!(a.data().is_some());
    }
}
