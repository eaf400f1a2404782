use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::bail;
use async_trait::async_trait;
use ethers::types::Address;
use jsonrpsee::{
    server::{middleware::proxy_get_request::ProxyGetRequestLayer, ServerBuilder},
    RpcModule,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    debug::{DebugApi, DebugApiServer},
    eth::{EntryPointStack, EthApi, EthApiServer},
    health::{HealthChecker, SystemApiServer},
    metrics::RpcMetricsLogger,
    proxy::MethodProxyLayer,
    EstimationSettings,
};
use crate::{
    builder::BundleTrigger,
    common::{handle::Task, precheck, types::ProviderLike},
    intents::IntentSink,
    op_pool::Mempool,
};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub host: String,
    pub chain_id: u64,
    pub upstream_url: String,
    pub debug_mode: bool,
    pub precheck_settings: precheck::Settings,
    pub estimation_settings: EstimationSettings,
    pub rpc_timeout: Duration,
    pub max_connections: u32,
}

pub struct RpcTask<M, I, P> {
    args: Args,
    stacks: Vec<EntryPointStack<M, I>>,
    triggers: HashMap<Address, BundleTrigger>,
    provider: Arc<P>,
}

impl<M, I, P> RpcTask<M, I, P>
where
    M: Mempool,
    I: IntentSink,
    P: ProviderLike,
{
    pub fn new(
        args: Args,
        stacks: Vec<EntryPointStack<M, I>>,
        triggers: HashMap<Address, BundleTrigger>,
        provider: Arc<P>,
    ) -> Self {
        Self {
            args,
            stacks,
            triggers,
            provider,
        }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}

#[async_trait]
impl<M, I, P> Task for RpcTask<M, I, P>
where
    M: Mempool,
    I: IntentSink,
    P: ProviderLike,
{
    async fn run(mut self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.args.host, self.args.port).parse()?;
        if self.stacks.is_empty() {
            bail!("No entry points provided");
        }

        let mut module = RpcModule::new(());
        module.merge(
            EthApi::new(
                self.stacks.clone(),
                self.provider.clone(),
                self.args.chain_id,
                self.args.precheck_settings,
                self.args.estimation_settings,
            )
            .into_rpc(),
        )?;
        if self.args.debug_mode {
            let mempools: HashMap<Address, Arc<M>> = self
                .stacks
                .iter()
                .map(|stack| (stack.address, stack.mempool.clone()))
                .collect();
            module.merge(DebugApi::new(mempools, self.triggers.clone()).into_rpc())?;
        }
        module.merge(HealthChecker.into_rpc())?;

        // GET /health proxies to the internal system_health method; every
        // unrecognized bundler method is forwarded to the upstream node.
        let service_builder = tower::ServiceBuilder::new()
            .layer(ProxyGetRequestLayer::new("/health", "system_health")?)
            .layer(MethodProxyLayer::new(self.args.upstream_url.clone()))
            .timeout(self.args.rpc_timeout);

        let server = ServerBuilder::default()
            .set_logger(RpcMetricsLogger)
            .set_middleware(service_builder)
            .max_connections(self.args.max_connections)
            .http_only()
            .build(addr)
            .await?;
        let handle = server.start(module)?;

        info!("Started RPC server on {addr}");

        tokio::select! {
            _ = handle.stopped() => {
                tracing::error!("RPC server stopped unexpectedly");
                bail!("RPC server stopped unexpectedly")
            }
            _ = shutdown_token.cancelled() => {
                tracing::info!("Server shutdown");
                Ok(())
            }
        }
    }
}
