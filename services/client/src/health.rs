use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;

/// Checks whether the remote voice service is up before connecting.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// `GET`s the service's health endpoint and expects a 2xx status.
pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: Url,
}

impl HttpHealthCheck {
    pub fn new(url: Url, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self) -> Result<()> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow!("health endpoint returned {}", status))
        }
    }
}
