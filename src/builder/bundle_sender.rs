use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use ethers::types::H256;
use tokio::{
    sync::{mpsc, oneshot},
    time::interval,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use super::{bundle_proposer::BundleProposer, relayer::{BundleRelayer, RelayError}};
use crate::{
    common::{handle::Task, types::BundlingMode},
    op_pool::Mempool,
};

pub struct SendBundleRequest {
    pub responder: oneshot::Sender<SendBundleResult>,
}

#[derive(Debug)]
pub enum SendBundleResult {
    Success { tx_hash: H256, op_count: usize },
    NoOperations,
    Error(anyhow::Error),
}

/// Handle shared with the debug RPC surface: flips between auto and manual
/// bundling and triggers an immediate batch.
#[derive(Clone)]
pub struct BundleTrigger {
    sender: mpsc::Sender<SendBundleRequest>,
    manual_bundling_mode: Arc<AtomicBool>,
}

impl BundleTrigger {
    pub fn new(sender: mpsc::Sender<SendBundleRequest>) -> Self {
        Self {
            sender,
            manual_bundling_mode: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn manual_mode_flag(&self) -> Arc<AtomicBool> {
        self.manual_bundling_mode.clone()
    }

    pub fn bundling_mode(&self) -> BundlingMode {
        if self.manual_bundling_mode.load(Ordering::Relaxed) {
            BundlingMode::Manual
        } else {
            BundlingMode::Auto
        }
    }

    pub fn set_bundling_mode(&self, mode: BundlingMode) {
        self.manual_bundling_mode
            .store(mode == BundlingMode::Manual, Ordering::Relaxed);
    }

    pub async fn send_bundle_now(&self) -> anyhow::Result<SendBundleResult> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(SendBundleRequest { responder })
            .await
            .context("bundle sender should accept trigger")?;
        receiver
            .await
            .context("bundle sender should answer trigger")
    }
}

#[derive(Debug)]
pub struct Settings {
    pub bundle_interval: Duration,
}

/// Periodically assembles a batch and relays it to the entry point, then
/// commits or rolls back the mempool depending on the outcome.
pub struct BundleSenderImpl<P, M, R>
where
    P: BundleProposer,
    M: Mempool,
    R: BundleRelayer,
{
    manual_bundling_mode: Arc<AtomicBool>,
    send_bundle_receiver: mpsc::Receiver<SendBundleRequest>,
    proposer: P,
    mempool: Arc<M>,
    relayer: R,
    settings: Settings,
}

impl<P, M, R> BundleSenderImpl<P, M, R>
where
    P: BundleProposer,
    M: Mempool,
    R: BundleRelayer,
{
    pub fn new(
        manual_bundling_mode: Arc<AtomicBool>,
        send_bundle_receiver: mpsc::Receiver<SendBundleRequest>,
        proposer: P,
        mempool: Arc<M>,
        relayer: R,
        settings: Settings,
    ) -> Self {
        Self {
            manual_bundling_mode,
            send_bundle_receiver,
            proposer,
            mempool,
            relayer,
            settings,
        }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }

    async fn send_bundle_once(&self) -> SendBundleResult {
        match self.try_send_bundle().await {
            Ok(result) => result,
            Err(error) => SendBundleResult::Error(error),
        }
    }

    /// Helper function returning `Result` to be able to use `?`.
    async fn try_send_bundle(&self) -> anyhow::Result<SendBundleResult> {
        let Some(bundle) = self.proposer.make_bundle().await? else {
            return Ok(SendBundleResult::NoOperations);
        };
        let op_count = bundle.ops.len();

        match self.relayer.submit(bundle.ops, bundle.gas_estimate).await {
            Ok(tx_hash) => {
                // Broadcast succeeded: the batch is committed regardless of
                // how inclusion waiting turns out below.
                self.mempool.commit_batch(&bundle.hashes);
                match self.relayer.wait_until_mined(tx_hash).await {
                    Ok(Some(block_number)) => {
                        info!("Bundle with hash {tx_hash:?} landed in block {block_number}")
                    }
                    Ok(None) => trace!("Not waiting for inclusion of {tx_hash:?}"),
                    Err(error @ RelayError::InclusionTimeout { .. }) => {
                        warn!("{error}; operations stay committed")
                    }
                    Err(error) => error!("Bundle {tx_hash:?} failed after broadcast: {error}"),
                }
                Ok(SendBundleResult::Success { tx_hash, op_count })
            }
            Err(error) => {
                self.mempool.rollback_batch(&bundle.hashes);
                metrics::increment_counter!("builder_bundle_txns_failed");
                Err(error.into())
            }
        }
    }
}

#[async_trait]
impl<P, M, R> Task for BundleSenderImpl<P, M, R>
where
    P: BundleProposer,
    M: Mempool,
    R: BundleRelayer,
{
    /// Loops forever, attempting to form and send a bundle on each tick in
    /// auto mode, or only on explicit triggers in manual mode.
    async fn run(mut self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let mut tick = interval(self.settings.bundle_interval);
        info!(
            "Bundle sender started for entry point {:?}",
            self.mempool.entry_point()
        );
        loop {
            let mut responder = None;
            tokio::select! {
                _ = shutdown_token.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if self.manual_bundling_mode.load(Ordering::Relaxed) {
                        continue;
                    }
                }
                Some(request) = self.send_bundle_receiver.recv() => {
                    responder = Some(request.responder);
                }
            }

            let result = self.send_bundle_once().await;
            match &result {
                SendBundleResult::Success { tx_hash, op_count } => {
                    info!("Sent bundle of {op_count} operations in transaction {tx_hash:?}");
                    metrics::increment_counter!("builder_bundle_txns_sent");
                }
                SendBundleResult::NoOperations => trace!("No operations to bundle"),
                SendBundleResult::Error(error) => {
                    error!("Failed to send bundle. Will retry next tick: {error:#}");
                }
            }

            if let Some(responder) = responder {
                if responder.send(result).is_err() {
                    error!("Failed to send bundle result to manual caller");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::{Address, U256};
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        builder::{bundle_proposer::{Bundle, MockBundleProposer}, relayer::MockBundleRelayer},
        op_pool::MockMempool,
    };

    fn bundle(hashes: Vec<H256>) -> Bundle {
        Bundle {
            ops: hashes.iter().map(|_| Default::default()).collect(),
            hashes,
            gas_estimate: 400_000.into(),
            rejected: vec![],
        }
    }

    #[tokio::test]
    async fn success_commits_batch() {
        let hashes = vec![H256::random(), H256::random()];
        let tx_hash = H256::random();

        let mut proposer = MockBundleProposer::new();
        let proposed = bundle(hashes.clone());
        proposer
            .expect_make_bundle()
            .return_once(move || Ok(Some(proposed)));

        let mut relayer = MockBundleRelayer::new();
        relayer
            .expect_submit()
            .withf(|_, gas| *gas == U256::from(400_000))
            .returning(move |_, _| Ok(tx_hash));
        relayer
            .expect_wait_until_mined()
            .with(eq(tx_hash))
            .returning(|_| Ok(Some(77)));

        let mut mempool = MockMempool::new();
        let expected = hashes.clone();
        mempool
            .expect_commit_batch()
            .withf(move |h| h == expected.as_slice())
            .times(1)
            .returning(|_| ());

        let sender = create_sender(proposer, mempool, relayer);
        match sender.send_bundle_once().await {
            SendBundleResult::Success { op_count: 2, .. } => {}
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submission_failure_rolls_back() {
        let hashes = vec![H256::random()];

        let mut proposer = MockBundleProposer::new();
        let proposed = bundle(hashes.clone());
        proposer
            .expect_make_bundle()
            .return_once(move || Ok(Some(proposed)));

        let mut relayer = MockBundleRelayer::new();
        relayer.expect_submit().returning(|_, _| {
            Err(RelayError::Submission(anyhow::anyhow!("no peers")))
        });

        let mut mempool = MockMempool::new();
        let expected = hashes.clone();
        mempool
            .expect_rollback_batch()
            .withf(move |h| h == expected.as_slice())
            .times(1)
            .returning(|_| ());

        let sender = create_sender(proposer, mempool, relayer);
        match sender.send_bundle_once().await {
            SendBundleResult::Error(_) => {}
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inclusion_timeout_keeps_batch_committed() {
        let hashes = vec![H256::random()];
        let tx_hash = H256::random();

        let mut proposer = MockBundleProposer::new();
        let proposed = bundle(hashes.clone());
        proposer
            .expect_make_bundle()
            .return_once(move || Ok(Some(proposed)));

        let mut relayer = MockBundleRelayer::new();
        relayer.expect_submit().returning(move |_, _| Ok(tx_hash));
        relayer.expect_wait_until_mined().returning(move |_| {
            Err(RelayError::InclusionTimeout {
                tx_hash,
                timeout: Duration::from_secs(30),
            })
        });

        let mut mempool = MockMempool::new();
        mempool.expect_commit_batch().times(1).returning(|_| ());
        // No rollback expectation: a rollback call would panic the mock.

        let sender = create_sender(proposer, mempool, relayer);
        match sender.send_bundle_once().await {
            SendBundleResult::Success { .. } => {}
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_bundle_is_a_noop() {
        let mut proposer = MockBundleProposer::new();
        proposer.expect_make_bundle().returning(|| Ok(None));

        let sender = create_sender(proposer, MockMempool::new(), MockBundleRelayer::new());
        match sender.send_bundle_once().await {
            SendBundleResult::NoOperations => {}
            other => panic!("expected no operations, got {other:?}"),
        }
    }

    #[test]
    fn trigger_mode_round_trip() {
        let (sender, _receiver) = mpsc::channel(1);
        let trigger = BundleTrigger::new(sender);
        assert_eq!(trigger.bundling_mode(), BundlingMode::Auto);
        trigger.set_bundling_mode(BundlingMode::Manual);
        assert_eq!(trigger.bundling_mode(), BundlingMode::Manual);
        trigger.set_bundling_mode(BundlingMode::Auto);
        assert_eq!(trigger.bundling_mode(), BundlingMode::Auto);
    }

    fn create_sender(
        proposer: MockBundleProposer,
        mut mempool: MockMempool,
        relayer: MockBundleRelayer,
    ) -> BundleSenderImpl<MockBundleProposer, MockMempool, MockBundleRelayer> {
        mempool
            .expect_entry_point()
            .returning(Address::zero);
        let (_sender, receiver) = mpsc::channel(1);
        BundleSenderImpl::new(
            Arc::new(AtomicBool::new(false)),
            receiver,
            proposer,
            Arc::new(mempool),
            relayer,
            Settings {
                bundle_interval: Duration::from_secs(1),
            },
        )
    }
}
