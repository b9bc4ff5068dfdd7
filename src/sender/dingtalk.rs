use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DingTalkConfig;
use crate::message::{compose_content, excerpt, Extra};
use crate::sender::{call_json, http_client, SendError, Sender};

/// DingTalk custom-robot webhook. Each call is signed with the robot secret
/// and the current millisecond timestamp.
pub struct DingTalkSender {
    config: DingTalkConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    msgtype: &'static str,
    text: TextBody<'a>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct RobotResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

impl DingTalkSender {
    pub fn new(config: DingTalkConfig) -> Result<Self, SendError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }

    /// base64(HMAC-SHA256(secret, "{timestamp}\n{secret}"))
    pub fn compute_signature(timestamp_millis: i64, secret: &str) -> String {
        let string_to_sign = format!("{}\n{}", timestamp_millis, secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn endpoint(&self) -> String {
        format!("{}/robot/send", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Sender for DingTalkSender {
    fn name(&self) -> &'static str {
        "dingtalk"
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        content: &str,
        summary: Option<&str>,
        _extra: &Extra,
    ) -> Result<(), SendError> {
        let text = compose_content(content, summary);
        let body = TextMessage {
            msgtype: "text",
            text: TextBody { content: &text },
        };

        let mut query = vec![("access_token", self.config.access_token.clone())];
        if !self.config.secret.is_empty() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            query.push(("timestamp", timestamp.to_string()));
            query.push(("sign", Self::compute_signature(timestamp, &self.config.secret)));
        }

        let request = self.client.post(self.endpoint()).query(&query).json(&body);
        let response: RobotResponse = call_json(request, cancel).await?;

        if response.errcode != 0 {
            return Err(SendError::Provider {
                provider: "dingtalk",
                code: response.errcode,
                message: response.errmsg,
            });
        }

        info!(excerpt = excerpt(content, 64), "DingTalk message sent");
        Ok(())
    }
}
