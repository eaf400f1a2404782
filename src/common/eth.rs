use std::{sync::Arc, time::Duration};

use anyhow::Context;
use ethers::{
    abi::RawLog,
    providers::{Http, HttpRateLimitRetryPolicy, Provider, RetryClient, RetryClientBuilder},
    types::Log,
};
use url::Url;

pub fn log_to_raw_log(log: Log) -> RawLog {
    let Log { topics, data, .. } = log;
    RawLog {
        topics,
        data: data.to_vec(),
    }
}

/// Builds an HTTP provider that retries on rate limiting and dubious
/// connectivity before surfacing an error.
pub fn new_provider(url: &str) -> anyhow::Result<Arc<Provider<RetryClient<Http>>>> {
    let parsed_url = Url::parse(url).context("Invalid RPC URL")?;
    let http = Http::new(parsed_url);

    let client = RetryClientBuilder::default()
        // these retries are if the server returns a 429
        .rate_limit_retries(10)
        // these retries are if the connection is dubious
        .timeout_retries(3)
        .initial_backoff(Duration::from_millis(500))
        .build(http, Box::<HttpRateLimitRetryPolicy>::default());

    Ok(Arc::new(Provider::new(client)))
}
