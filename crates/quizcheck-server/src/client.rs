//! A thin client for the checker service.

use anyhow::{Context, Result};
use quizcheck::CheckResult;
use tonic::transport::Channel;

use crate::proto;
use crate::proto::checker_client::CheckerClient;

/// Connection to a running checker service.
#[derive(Debug, Clone)]
pub struct Client {
    inner: CheckerClient<Channel>,
}

impl Client {
    /// Connect to `addr`, e.g. `http://127.0.0.1:32453`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the connection fails.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let inner = CheckerClient::connect(addr.clone())
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self { inner })
    }

    /// Grade `source` against the check registered as `id`.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and rejected (malformed) requests.
    pub async fn run_tests(
        &mut self,
        id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<CheckResult> {
        let request = proto::CheckRequest {
            id: id.into(),
            source: source.into(),
        };
        let response = self
            .inner
            .run_tests(request)
            .await
            .context("RunTests failed")?;
        Ok(response.into_inner().into())
    }
}
