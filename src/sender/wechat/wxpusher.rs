use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::WxPusherConfig;
use crate::message::Extra;
use crate::ratelimit::{RateLimiter, TokenBucket};
use crate::sender::{call_json, http_client, SendError, Sender};

/// WxPusher content type for plain text
const CONTENT_TYPE_TEXT: u8 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    app_token: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    content_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic_ids: Option<&'a [i64]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    uids: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    success: bool,
}

/// WxPusher broadcast sender. Delivers to the configured topics and, when
/// present, to `extra.user_id`. Optionally throttled by a rate limiter.
pub struct WxPusherSender {
    config: WxPusherConfig,
    client: reqwest::Client,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl WxPusherSender {
    /// Builds a token bucket when `qps` is set. Must run inside a tokio runtime.
    pub fn new(config: WxPusherConfig) -> Result<Self, SendError> {
        let limiter: Option<Arc<dyn RateLimiter>> = match config.qps {
            Some(qps) if qps > 0 => {
                let bucket = TokenBucket::new(qps);
                info!(qps = bucket.capacity(), "WxPusher rate limit enabled");
                Some(Arc::new(bucket))
            }
            _ => None,
        };
        Ok(Self::with_limiter(config, http_client()?, limiter))
    }

    pub fn with_limiter(
        config: WxPusherConfig,
        client: reqwest::Client,
        limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Self {
        Self {
            config,
            client,
            limiter,
        }
    }
}

#[async_trait]
impl Sender for WxPusherSender {
    fn name(&self) -> &'static str {
        "wxpusher"
    }

    fn close(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        content: &str,
        summary: Option<&str>,
        extra: &Extra,
    ) -> Result<(), SendError> {
        let uids: Vec<&str> = extra.recipient().into_iter().collect();
        if uids.is_empty() && self.config.topic_ids.is_empty() {
            return Err(SendError::InvalidTarget(
                "wxpusher needs topic_ids in config or extra.user_id".to_string(),
            ));
        }

        if let Some(limiter) = &self.limiter {
            limiter.wait(cancel).await?;
        }

        // WxPusher has its own summary field, so content goes out unmodified.
        let body = PushRequest {
            app_token: &self.config.app_token,
            content,
            summary,
            content_type: CONTENT_TYPE_TEXT,
            topic_ids: (!self.config.topic_ids.is_empty()).then_some(self.config.topic_ids.as_slice()),
            uids,
        };

        let request = self.client.post(&self.config.api_url).json(&body);
        let response: PushResponse = call_json(request, cancel).await?;

        if !response.success {
            return Err(SendError::Provider {
                provider: "wxpusher",
                code: response.code,
                message: response.msg,
            });
        }

        info!(
            topic_ids = ?self.config.topic_ids,
            user_id = extra.recipient(),
            "WxPusher message sent"
        );
        Ok(())
    }
}
