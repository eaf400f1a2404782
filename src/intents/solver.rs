use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use url::Url;

use super::SolverBody;

/// Per-request timeout for solver calls.
pub const SOLVER_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// The solver could not be reached or answered with an error status.
    /// Intents hit by this are re-queued, never dropped.
    #[error("solver transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The solver answered with a body this bundler cannot interpret.
    #[error("solver protocol error: {0}")]
    Protocol(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SolverLike: Send + Sync + 'static {
    async fn solve(&self, body: SolverBody) -> Result<SolverBody, SolverError>;

    async fn health(&self) -> Result<(), SolverError>;
}

/// HTTP client for the external solver service.
pub struct SolverClient {
    solve_url: Url,
    health_url: Url,
    client: reqwest::Client,
}

impl SolverClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            url.contains("/solve"),
            "solver URL must contain /solve: {url}"
        );
        let solve_url = Url::parse(url).context("invalid solver URL")?;
        let mut health_url = solve_url.clone();
        health_url.set_path("/health");
        health_url.set_query(None);
        health_url.set_fragment(None);

        let client = reqwest::Client::builder()
            .timeout(SOLVER_REQUEST_TIMEOUT)
            .build()
            .context("should build solver HTTP client")?;
        Ok(Self {
            solve_url,
            health_url,
            client,
        })
    }
}

#[async_trait]
impl SolverLike for SolverClient {
    async fn solve(&self, body: SolverBody) -> Result<SolverBody, SolverError> {
        let response = self
            .client
            .post(self.solve_url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let body: SolverBody = response.json().await.map_err(|error| {
            if error.is_decode() {
                SolverError::Protocol(format!("undecodable solver response: {error}"))
            } else {
                SolverError::Transport(error)
            }
        })?;

        if body.user_ops.len() != body.user_ops_ext.len() {
            return Err(SolverError::Protocol(format!(
                "mismatched solver response: {} ops, {} ext entries",
                body.user_ops.len(),
                body.user_ops_ext.len()
            )));
        }
        Ok(body)
    }

    async fn health(&self) -> Result<(), SolverError> {
        self.client
            .get(self.health_url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
