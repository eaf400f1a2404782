use std::sync::Arc;

use anyhow::Context;
use ethers::{
    abi::Address,
    prelude::SignerMiddleware,
    providers::{JsonRpcClient, Middleware, Provider},
};
use ethers_signers::{LocalWallet, Signer};
use tokio::task::AbortHandle;

/// A local signer handle
///
/// Wraps the signing middleware used by the relayer's entry point binding
/// and monitors the account balance in the background.
pub struct LocalSigner<C: JsonRpcClient> {
    signer: Arc<SignerMiddleware<Arc<Provider<C>>, LocalWallet>>,
    address: Address,
    monitor_abort_handle: AbortHandle,
}

impl<C: JsonRpcClient> Drop for LocalSigner<C> {
    fn drop(&mut self) {
        self.monitor_abort_handle.abort();
    }
}

impl<C: JsonRpcClient + 'static> LocalSigner<C> {
    pub async fn connect(
        provider: Arc<Provider<C>>,
        chain_id: u64,
        private_key: String,
    ) -> anyhow::Result<Self> {
        let wallet = private_key
            .parse::<LocalWallet>()
            .context("should create signer")?;
        let address = wallet.address();
        let monitor_abort_handle =
            tokio::spawn(monitor_account_balance(address, provider.clone())).abort_handle();

        Ok(Self {
            signer: Arc::new(SignerMiddleware::new(
                provider,
                wallet.with_chain_id(chain_id),
            )),
            address,
            monitor_abort_handle,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn middleware(&self) -> Arc<SignerMiddleware<Arc<Provider<C>>, LocalWallet>> {
        self.signer.clone()
    }
}

pub async fn monitor_account_balance<C: JsonRpcClient>(addr: Address, provider: Arc<Provider<C>>) {
    loop {
        match provider.get_balance(addr, None).await {
            Ok(balance) => {
                let eth_balance = balance.as_u128() as f64 / 1e18;
                tracing::info!("account {addr:?} balance: {}", eth_balance);
                metrics::gauge!("relayer_account_balance", eth_balance, "addr" => format!("{addr:?}"));
            }
            Err(error) => {
                tracing::warn!("Failed to read balance for {addr:?}: {error:#}");
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    }
}
