use crate::consts;
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;

/// Sends webhook deliveries over HTTP
#[derive(Clone)]
pub struct HttpHookSender {
    client: reqwest::Client,
}

impl HttpHookSender {
    /// Every request, connect included, is bounded by `timeout`
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build the delivery http client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl crate::services::HookSender for HttpHookSender {
    async fn post_json(&self, url: &str, bearer_token: &str, body: &[u8]) -> anyhow::Result<u16> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, consts::JSON_CONTENT_TYPE)
            .bearer_auth(bearer_token)
            .body(body.to_vec())
            .send()
            .await
            .with_context(|| format!("failed to send webhook to {url}"))?;

        Ok(response.status().as_u16())
    }
}
