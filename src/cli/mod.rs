use std::{collections::HashMap, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser};
use ethers::{providers::Middleware, types::Address};
use tokio::{signal, sync::mpsc};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod prometheus_exporter;

use crate::{
    builder::{
        BundleProposerImpl, BundleSenderImpl, BundleSenderSettings, BundleTrigger, LocalSigner,
        Relayer,
    },
    common::{
        contracts::IEntryPoint,
        eth, handle,
        handle::Task,
        precheck,
    },
    intents::{
        pipeline::{self, IntentPipeline, IntentPipelineTask},
        SolverClient,
    },
    op_pool::{PersistentReputation, PoolConfig, RocksDbStore, UoPool},
    rpc::{EntryPointStack, EstimationSettings, RpcTask, RpcTaskArgs},
};

/// Main entry point for the CLI
///
/// Reads configuration from the environment (and a `.env` file when
/// present), wires up one mempool, intent pipeline, and bundle sender per
/// supported entry point, and runs everything until a ctrl-c signal.
pub async fn run() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let opt = Cli::parse();

    let (appender, _guard) = if let Some(log_file) = &opt.logs.file {
        tracing_appender::non_blocking(tracing_appender::rolling::never(".", log_file))
    } else {
        tracing_appender::non_blocking(io::stdout())
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(opt.logs.level.parse::<Level>()?)
        .with_writer(appender)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let metrics_addr = format!("{}:{}", opt.metrics.host, opt.metrics.port).parse()?;
    prometheus_exporter::initialize(metrics_addr)?;

    node(opt).await
}

async fn node(opt: Cli) -> anyhow::Result<()> {
    let args = &opt.bundler;
    let provider = eth::new_provider(&args.eth_client_url)?;
    let chain_id = provider
        .get_chainid()
        .await
        .context("should fetch chain id from node")?
        .as_u64();
    info!("Chain id: {chain_id}");

    let signer = LocalSigner::connect(provider.clone(), chain_id, args.private_key.clone()).await?;
    let beneficiary = match &args.beneficiary {
        Some(address) => address
            .parse::<Address>()
            .context("Invalid beneficiary address")?,
        None => signer.address(),
    };
    info!("Signer: {:?}, beneficiary: {beneficiary:?}", signer.address());

    let store = Arc::new(RocksDbStore::open(&args.data_directory)?);
    let reputation = Arc::new(PersistentReputation::new(store.clone()));
    let restored_senders = reputation.restore()?;
    info!("Restored reputation for {restored_senders} senders");
    let reputation_runner = reputation.clone();
    tokio::spawn(async move { reputation_runner.run().await });

    let signer_middleware = signer.middleware();
    let max_op_ttl = Duration::from_secs(args.max_op_ttl_seconds);

    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    let mut stacks = Vec::new();
    let mut triggers = HashMap::new();

    for entry_point_str in &args.supported_entry_points {
        let entry_point_address: Address = entry_point_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid entry point address: {entry_point_str}"))?;
        let entry_point = Arc::new(IEntryPoint::new(
            entry_point_address,
            signer_middleware.clone(),
        ));

        let mempool = Arc::new(UoPool::new(
            PoolConfig {
                entry_point: entry_point_address,
                chain_id,
                max_ops_for_unstaked_sender: args.max_ops_for_unstaked_sender,
                max_op_ttl,
            },
            reputation.clone(),
            entry_point.clone(),
            store.clone(),
        ));
        let restored_ops = mempool.restore()?;
        info!("Restored {restored_ops} operations for entry point {entry_point_address:?}");

        let solver = Arc::new(SolverClient::new(&args.solver_url)?);
        let pipeline = Arc::new(IntentPipeline::new(
            entry_point_address,
            mempool.clone(),
            solver,
            pipeline::Settings {
                tick_interval: Duration::from_secs(1),
                max_op_ttl,
            },
        ));
        tasks.push(IntentPipelineTask::new(pipeline.clone()).boxed());

        let proposer = BundleProposerImpl::new(
            mempool.clone(),
            entry_point.clone(),
            pipeline.clone(),
            beneficiary,
            args.max_batch_gas_limit,
        );
        let relayer = Relayer::new(
            entry_point.clone(),
            provider.clone(),
            beneficiary,
            Duration::from_secs(args.relayer_wait_timeout_seconds),
        );
        let (trigger_sender, trigger_receiver) = mpsc::channel(16);
        let trigger = BundleTrigger::new(trigger_sender);
        tasks.push(
            BundleSenderImpl::new(
                trigger.manual_mode_flag(),
                trigger_receiver,
                proposer,
                mempool.clone(),
                relayer,
                BundleSenderSettings {
                    bundle_interval: Duration::from_secs(args.bundle_interval_seconds),
                },
            )
            .boxed(),
        );
        triggers.insert(entry_point_address, trigger);

        stacks.push(EntryPointStack {
            address: entry_point_address,
            mempool,
            intents: pipeline,
        });
    }

    tasks.push(
        RpcTask::new(
            RpcTaskArgs {
                port: args.port,
                host: args.host.clone(),
                chain_id,
                upstream_url: args.eth_client_url.clone(),
                debug_mode: args.debug_mode,
                precheck_settings: precheck::Settings {
                    max_verification_gas: args.max_verification_gas,
                },
                estimation_settings: EstimationSettings {
                    max_verification_gas: args.max_verification_gas,
                    max_call_gas: args.max_batch_gas_limit,
                },
                rpc_timeout: Duration::from_secs(args.rpc_timeout_seconds),
                max_connections: args.max_connections,
            },
            stacks,
            triggers,
            provider,
        )
        .boxed(),
    );

    handle::spawn_tasks_with_shutdown(tasks, signal::ctrl_c()).await;
    info!("All components shutdown, goodbye");
    Ok(())
}

/// Bundler options, every one overridable through `ERC4337_BUNDLER_*`
/// environment variables.
#[derive(Debug, Args)]
#[command(next_help_heading = "BUNDLER")]
struct BundlerArgs {
    /// Upstream Ethereum node (required)
    #[arg(
        long = "eth_client_url",
        name = "eth_client_url",
        env = "ERC4337_BUNDLER_ETH_CLIENT_URL"
    )]
    eth_client_url: String,

    /// Signing key for the relayer (required)
    #[arg(
        long = "private_key",
        name = "private_key",
        env = "ERC4337_BUNDLER_PRIVATE_KEY",
        hide_env_values = true
    )]
    private_key: String,

    /// HTTP listen port
    #[arg(
        long = "port",
        name = "port",
        env = "ERC4337_BUNDLER_PORT",
        default_value = "4337"
    )]
    port: u16,

    /// HTTP listen host
    #[arg(
        long = "host",
        name = "host",
        env = "ERC4337_BUNDLER_HOST",
        default_value = "0.0.0.0"
    )]
    host: String,

    /// Comma-separated entry point addresses; the first is preferred
    #[arg(
        long = "supported_entry_points",
        name = "supported_entry_points",
        env = "ERC4337_BUNDLER_SUPPORTED_ENTRY_POINTS",
        default_value = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
        value_delimiter = ','
    )]
    supported_entry_points: Vec<String>,

    /// Receiver of handleOps refunds; defaults to the signer address
    #[arg(
        long = "beneficiary",
        name = "beneficiary",
        env = "ERC4337_BUNDLER_BENEFICIARY"
    )]
    beneficiary: Option<String>,

    /// Validator cap on verificationGasLimit
    #[arg(
        long = "max_verification_gas",
        name = "max_verification_gas",
        env = "ERC4337_BUNDLER_MAX_VERIFICATION_GAS",
        default_value = "3000000"
    )]
    max_verification_gas: u64,

    /// Per-batch gas cap
    #[arg(
        long = "max_batch_gas_limit",
        name = "max_batch_gas_limit",
        env = "ERC4337_BUNDLER_MAX_BATCH_GAS_LIMIT",
        default_value = "25000000"
    )]
    max_batch_gas_limit: u64,

    /// Operation expiry in seconds
    #[arg(
        long = "max_op_ttl_seconds",
        name = "max_op_ttl_seconds",
        env = "ERC4337_BUNDLER_MAX_OP_TTL_SECONDS",
        default_value = "180"
    )]
    max_op_ttl_seconds: u64,

    /// Pending-operation cap per unstaked sender
    #[arg(
        long = "max_ops_for_unstaked_sender",
        name = "max_ops_for_unstaked_sender",
        env = "ERC4337_BUNDLER_MAX_OPS_FOR_UNSTAKED_SENDER",
        default_value = "4"
    )]
    max_ops_for_unstaked_sender: usize,

    /// Solver endpoint; must contain /solve
    #[arg(
        long = "solver_url",
        name = "solver_url",
        env = "SOLVER_URL",
        default_value = "http://localhost:7322/solve"
    )]
    solver_url: String,

    /// Persisted mempool and reputation state
    #[arg(
        long = "data_directory",
        name = "data_directory",
        env = "ERC4337_BUNDLER_DATA_DIRECTORY",
        default_value = "/tmp/stackup_bundler"
    )]
    data_directory: PathBuf,

    /// Enables the debug_bundler_* RPC surface
    #[arg(
        long = "debug_mode",
        name = "debug_mode",
        env = "ERC4337_BUNDLER_DEBUG_MODE",
        action = clap::ArgAction::Set,
        default_value = "false"
    )]
    debug_mode: bool,

    /// Seconds between automatic batch attempts
    #[arg(
        long = "bundle_interval_seconds",
        name = "bundle_interval_seconds",
        env = "ERC4337_BUNDLER_BUNDLE_INTERVAL_SECONDS",
        default_value = "10"
    )]
    bundle_interval_seconds: u64,

    /// Seconds to wait for bundle inclusion; 0 disables waiting
    #[arg(
        long = "relayer_wait_timeout_seconds",
        name = "relayer_wait_timeout_seconds",
        env = "ERC4337_BUNDLER_RELAYER_WAIT_TIMEOUT_SECONDS",
        default_value = "30"
    )]
    relayer_wait_timeout_seconds: u64,

    /// Per-request RPC timeout in seconds
    #[arg(
        long = "rpc_timeout_seconds",
        name = "rpc_timeout_seconds",
        env = "ERC4337_BUNDLER_RPC_TIMEOUT_SECONDS",
        default_value = "20"
    )]
    rpc_timeout_seconds: u64,

    /// Maximum concurrent RPC connections
    #[arg(
        long = "max_connections",
        name = "max_connections",
        env = "ERC4337_BUNDLER_MAX_CONNECTIONS",
        default_value = "100"
    )]
    max_connections: u32,
}

/// CLI options for the metrics server
#[derive(Debug, Args)]
#[command(next_help_heading = "Metrics")]
struct MetricsArgs {
    /// Port to listen on for metrics requests
    #[arg(
        long = "metrics.port",
        name = "metrics.port",
        env = "METRICS_PORT",
        default_value = "8080"
    )]
    port: u16,

    /// Host to listen on for metrics requests
    #[arg(
        long = "metrics.host",
        name = "metrics.host",
        env = "METRICS_HOST",
        default_value = "0.0.0.0"
    )]
    host: String,
}

/// CLI options for logging
#[derive(Debug, Args)]
#[command(next_help_heading = "Logging")]
struct LogsArgs {
    /// Log level
    ///
    /// Valid values are: trace, debug, info, warn, error
    #[arg(
        long = "log.level",
        name = "log.level",
        env = "LOG_LEVEL",
        default_value = "info"
    )]
    level: String,

    /// Log file
    ///
    /// If not provided, logs will be written to stdout
    #[arg(
        long = "log.file",
        name = "log.file",
        env = "LOG_FILE",
        default_value = None
    )]
    file: Option<String>,
}

/// CLI options
#[derive(Debug, Parser)]
struct Cli {
    #[clap(flatten)]
    bundler: BundlerArgs,

    #[clap(flatten)]
    metrics: MetricsArgs,

    #[clap(flatten)]
    logs: LogsArgs,
}
