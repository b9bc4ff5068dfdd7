use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::token::{IssuedToken, TokenCache, TokenIssuer};
use crate::config::WeComConfig;
use crate::message::{compose_content, Extra};
use crate::sender::{call_json, http_client, SendError, Sender};

/// WeCom error codes meaning the access token is no longer accepted
const TOKEN_REJECTED_CODES: [i64; 2] = [40014, 42001];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    touser: &'a str,
    msgtype: &'static str,
    agentid: &'a str,
    text: TextBody<'a>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    content: &'a str,
}

/// Calls `cgi-bin/gettoken` with the corp id and application secret
pub struct WeComTokenIssuer {
    config: WeComConfig,
    client: reqwest::Client,
}

impl WeComTokenIssuer {
    pub fn new(config: WeComConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl TokenIssuer for WeComTokenIssuer {
    async fn issue(&self, cancel: &CancellationToken) -> Result<IssuedToken, SendError> {
        let url = format!("{}/cgi-bin/gettoken", self.config.base_url.trim_end_matches('/'));
        let request = self.client.get(url).query(&[
            ("corpid", self.config.corp_id.as_str()),
            ("corpsecret", self.config.app_secret.as_str()),
        ]);
        let response: TokenResponse = call_json(request, cancel).await?;

        if response.errcode != 0 || response.access_token.is_empty() {
            return Err(SendError::Provider {
                provider: "wecom",
                code: response.errcode,
                message: response.errmsg,
            });
        }

        Ok(IssuedToken {
            access_token: response.access_token,
            expires_in: Duration::from_secs(response.expires_in),
        })
    }
}

/// WeCom application message sender. Needs `extra.user_id` as the recipient.
pub struct WeComSender {
    config: WeComConfig,
    client: reqwest::Client,
    tokens: Arc<TokenCache>,
}

impl WeComSender {
    pub fn new(config: WeComConfig) -> Result<Self, SendError> {
        let client = http_client()?;
        let issuer = WeComTokenIssuer::new(config.clone(), client.clone());
        Ok(Self::with_token_cache(
            config,
            client,
            Arc::new(TokenCache::new(Arc::new(issuer))),
        ))
    }

    /// Build with an externally owned token cache
    pub fn with_token_cache(config: WeComConfig, client: reqwest::Client, tokens: Arc<TokenCache>) -> Self {
        Self {
            config,
            client,
            tokens,
        }
    }
}

#[async_trait]
impl Sender for WeComSender {
    fn name(&self) -> &'static str {
        "wecom"
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        content: &str,
        summary: Option<&str>,
        extra: &Extra,
    ) -> Result<(), SendError> {
        let user_id = extra
            .recipient()
            .ok_or(SendError::MissingRecipient("user_id"))?;

        let token = self.tokens.get_token(cancel).await?;

        let text = compose_content(content, summary);
        let body = TextMessage {
            touser: user_id,
            msgtype: "text",
            agentid: &self.config.agent_id,
            text: TextBody { content: &text },
        };

        let url = format!("{}/cgi-bin/message/send", self.config.base_url.trim_end_matches('/'));
        let request = self
            .client
            .post(url)
            .query(&[("access_token", token.as_str())])
            .json(&body);
        let response: SendResponse = call_json(request, cancel).await?;

        if response.errcode != 0 {
            if TOKEN_REJECTED_CODES.contains(&response.errcode) {
                warn!(code = response.errcode, "WeCom rejected access token, invalidating cache");
                self.tokens.invalidate().await;
            }
            return Err(SendError::Provider {
                provider: "wecom",
                code: response.errcode,
                message: response.errmsg,
            });
        }

        info!(user_id = user_id, "WeCom message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config(base_url: String) -> WeComConfig {
        WeComConfig {
            corp_id: "corp".to_string(),
            agent_id: "1000002".to_string(),
            app_secret: "app-secret".to_string(),
            base_url,
        }
    }

    async fn mock_token<'a>(server: &'a MockServer, token: &str) -> httpmock::Mock<'a> {
        let body = json!({"errcode": 0, "errmsg": "ok", "access_token": token, "expires_in": 7200});
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/cgi-bin/gettoken")
                    .query_param("corpid", "corp")
                    .query_param("corpsecret", "app-secret");
                then.status(200).json_body(body);
            })
            .await
    }

    #[tokio::test]
    async fn test_missing_user_id_fails_without_network() {
        let sender = WeComSender::new(config("http://127.0.0.1:9".to_string())).unwrap();
        let err = sender
            .send(&CancellationToken::new(), "hi", None, &Extra::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::MissingRecipient("user_id")));
    }

    #[tokio::test]
    async fn test_send_uses_cached_token() {
        let server = MockServer::start_async().await;
        let token_mock = mock_token(&server, "tok-1").await;
        let send_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cgi-bin/message/send")
                    .query_param("access_token", "tok-1")
                    .json_body(json!({
                        "touser": "alice",
                        "msgtype": "text",
                        "agentid": "1000002",
                        "text": {"content": "【Deploy】\n\ndone"}
                    }));
                then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
            })
            .await;

        let sender = WeComSender::new(config(server.base_url())).unwrap();
        let extra = Extra::with_user_id("alice");
        let cancel = CancellationToken::new();
        sender.send(&cancel, "done", Some("Deploy"), &extra).await.unwrap();
        sender.send(&cancel, "done", Some("Deploy"), &extra).await.unwrap();

        token_mock.assert_calls_async(1).await;
        send_mock.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn test_token_failure_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/cgi-bin/gettoken");
                then.status(200)
                    .json_body(json!({"errcode": 40001, "errmsg": "invalid credential"}));
            })
            .await;

        let sender = WeComSender::new(config(server.base_url())).unwrap();
        let err = sender
            .send(&CancellationToken::new(), "hi", None, &Extra::with_user_id("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Token(_)));
        assert!(err.to_string().contains("invalid credential"));
    }

    #[tokio::test]
    async fn test_rejected_token_invalidates_cache() {
        let server = MockServer::start_async().await;
        let token_mock = mock_token(&server, "tok-1").await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/cgi-bin/message/send");
                then.status(200)
                    .json_body(json!({"errcode": 42001, "errmsg": "access_token expired"}));
            })
            .await;

        let sender = WeComSender::new(config(server.base_url())).unwrap();
        let extra = Extra::with_user_id("carol");
        let cancel = CancellationToken::new();
        let err = sender.send(&cancel, "hi", None, &extra).await.unwrap_err();
        assert!(err.to_string().contains("access_token expired"));
        let _ = sender.send(&cancel, "hi", None, &extra).await;

        token_mock.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn test_server_error_with_empty_body_is_failure() {
        let server = MockServer::start_async().await;
        mock_token(&server, "tok-1").await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/cgi-bin/message/send");
                then.status(500).json_body(json!({}));
            })
            .await;

        let sender = WeComSender::new(config(server.base_url())).unwrap();
        let err = sender
            .send(&CancellationToken::new(), "hi", None, &Extra::with_user_id("dave"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Status { status: 500, .. }));
    }
}
