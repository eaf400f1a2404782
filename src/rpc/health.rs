use async_trait::async_trait;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

#[rpc(server, namespace = "system")]
pub trait SystemApi {
    #[method(name = "health")]
    async fn health(&self) -> RpcResult<String>;
}

/// Answers `GET /health` (proxied to `system_health`) while the RPC server
/// is up. Solver availability is intentionally not part of this check: a
/// down solver degrades intents only, not the bundler.
pub struct HealthChecker;

#[async_trait]
impl SystemApiServer for HealthChecker {
    async fn health(&self) -> RpcResult<String> {
        Ok("ok".to_string())
    }
}
