use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::{
    config::GatewayConfig,
    error::{BotError, Result},
    message::Segment,
};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability the host hands to the upstream-facing RPC surface. Kept as a
/// trait object so tests can substitute a recording double for the real
/// gateway.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_private_message(&self, user_id: i64, segments: &[Segment]) -> Result<()>;

    async fn send_group_message(&self, group_id: i64, segments: &[Segment]) -> Result<()>;

    async fn upload_group_file(
        &self,
        group_id: i64,
        file_path: &str,
        file_name: &str,
        folder: &str,
    ) -> Result<()>;

    async fn upload_private_file(
        &self,
        user_id: i64,
        file_path: &str,
        file_name: &str,
    ) -> Result<()>;

    /// Raw escape hatch: invokes a gateway action and returns its opaque
    /// response body.
    async fn call_api(&self, action: &str, params: Value) -> Result<Vec<u8>>;
}

/// OneBot-compatible HTTP gateway client: every action is a JSON POST to
/// `{http_url}/{action}`.
pub struct HttpGateway {
    client: Client,
    http_url: String,
    token: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|err| BotError::Gateway(err.to_string()))?;
        Ok(Self {
            client,
            http_url: config.http_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn call(&self, action: &str, params: Value) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.http_url, action);
        let mut request = self.client.post(&url).json(&params);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| BotError::Gateway(err.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| BotError::Gateway(err.to_string()))?;
        if !status.is_success() {
            return Err(BotError::Gateway(format!(
                "{} returned {}: {}",
                action,
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl MessageSender for HttpGateway {
    async fn send_private_message(&self, user_id: i64, segments: &[Segment]) -> Result<()> {
        self.call(
            "send_private_msg",
            json!({ "user_id": user_id, "message": segments }),
        )
        .await
        .map(|_| ())
    }

    async fn send_group_message(&self, group_id: i64, segments: &[Segment]) -> Result<()> {
        self.call(
            "send_group_msg",
            json!({ "group_id": group_id, "message": segments }),
        )
        .await
        .map(|_| ())
    }

    async fn upload_group_file(
        &self,
        group_id: i64,
        file_path: &str,
        file_name: &str,
        folder: &str,
    ) -> Result<()> {
        self.call(
            "upload_group_file",
            json!({
                "group_id": group_id,
                "file": file_path,
                "name": file_name,
                "folder": folder,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn upload_private_file(
        &self,
        user_id: i64,
        file_path: &str,
        file_name: &str,
    ) -> Result<()> {
        self.call(
            "upload_private_file",
            json!({
                "user_id": user_id,
                "file": file_path,
                "name": file_name,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn call_api(&self, action: &str, params: Value) -> Result<Vec<u8>> {
        self.call(action, params).await
    }
}
