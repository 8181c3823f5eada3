use eyre::{eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use metronome_tx::rpc::Commitment;

use crate::auth::AuthConfig;
use crate::types::NetworkEnv;

/// Minimal subset of the deployment artifact JSON the keeper reads.
///
/// We intentionally keep this loose: extra fields are ignored. URLs may be
/// indirected through environment variables so provider API keys stay out
/// of committed files.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentArtifact {
    pub network: NetworkEnv,

    #[serde(default)]
    pub node_rpc: Option<String>,
    /// Name of an env var holding the node RPC URL.
    #[serde(default)]
    pub node_rpc_env_var: Option<String>,

    #[serde(default)]
    pub signer: Option<String>,
    /// Name of an env var holding the threshold-signer URL.
    #[serde(default)]
    pub signer_env_var: Option<String>,

    #[serde(default)]
    pub low_balance_lamports: Option<u64>,
    #[serde(default)]
    pub critical_balance_lamports: Option<u64>,
}

impl DeploymentArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read deployment artifact {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| {
            eyre!(
                "failed to parse deployment artifact {}: {e}",
                path.display()
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub network: NetworkEnv,
    pub rpc_url: String,
    pub signer_url: String,
    pub listen_addr: SocketAddr,
    pub state_file: PathBuf,

    pub rpc_timeout: Duration,
    pub signer_timeout: Duration,
    pub commitment: Commitment,

    pub low_balance_lamports: u64,
    pub critical_balance_lamports: u64,
    pub rehydrate_spread_seconds: u64,

    pub auth: AuthConfig,

    pub dry_run: bool,
    pub rehydrate_only: bool,
}

impl KeeperConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli_and_artifact(
        artifact: &DeploymentArtifact,
        rpc_override: Option<String>,
        signer_override: Option<String>,
        listen_addr: SocketAddr,
        state_file: PathBuf,
        rpc_timeout_seconds: u64,
        signer_timeout_seconds: u64,
        rehydrate_spread_seconds: u64,
        auth: AuthConfig,
        dry_run: bool,
        rehydrate_only: bool,
    ) -> Result<Self> {
        let rpc_url = resolve_url(
            rpc_override,
            "METRONOME_NODE_RPC_URL",
            artifact.node_rpc_env_var.as_deref(),
            artifact.node_rpc.as_deref(),
        )
        .ok_or_else(|| {
            eyre!(
                "no node RPC url. pass --rpc-url, set METRONOME_NODE_RPC_URL, set \
                 artifact.nodeRpcEnvVar, or include nodeRpc in the artifact json"
            )
        })?;

        let signer_url = resolve_url(
            signer_override,
            "METRONOME_SIGNER_URL",
            artifact.signer_env_var.as_deref(),
            artifact.signer.as_deref(),
        )
        .ok_or_else(|| {
            eyre!(
                "no signer url. pass --signer-url, set METRONOME_SIGNER_URL, set \
                 artifact.signerEnvVar, or include signer in the artifact json"
            )
        })?;

        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("helius-rpc.com/?api-key=") {
            tracing::warn!(
                "RPC URL looks like it may contain an API key; consider using \
                 METRONOME_NODE_RPC_URL env instead of committing it."
            );
        }

        if auth.backoff_base_seconds > auth.backoff_max_seconds {
            tracing::warn!(
                base = auth.backoff_base_seconds,
                max = auth.backoff_max_seconds,
                "auth backoff base > max; the max wins"
            );
        }

        let low = artifact.low_balance_lamports.unwrap_or(100_000_000);
        let critical = artifact.critical_balance_lamports.unwrap_or(10_000_000);
        if critical > low {
            tracing::warn!(
                low,
                critical,
                "critical balance threshold above the low threshold; swapping makes no sense, \
                 clamping critical to low"
            );
        }

        Ok(Self {
            network: artifact.network,
            rpc_url,
            signer_url,
            listen_addr,
            state_file,
            rpc_timeout: Duration::from_secs(rpc_timeout_seconds.max(1)),
            signer_timeout: Duration::from_secs(signer_timeout_seconds.max(1)),
            commitment: Commitment::Confirmed,
            low_balance_lamports: low,
            critical_balance_lamports: critical.min(low),
            rehydrate_spread_seconds,
            auth,
            dry_run,
            rehydrate_only,
        })
    }
}

fn resolve_url(
    cli_override: Option<String>,
    fixed_env: &str,
    artifact_env: Option<&str>,
    artifact_value: Option<&str>,
) -> Option<String> {
    cli_override
        .or_else(|| std::env::var(fixed_env).ok())
        .or_else(|| artifact_env.and_then(|k| std::env::var(k).ok()))
        .or_else(|| artifact_value.map(str::to_string))
}
