pub mod dingtalk;
pub mod wechat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::message::{excerpt, Extra, Message, Platform};
use crate::ratelimit::RateLimitError;

/// Per-request timeout for every outbound provider call. Not retried.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(Platform),

    #[error("missing recipient: extra.{0} is required")]
    MissingRecipient(&'static str),

    #[error("{0}")]
    InvalidTarget(String),

    #[error("failed to obtain access token: {0}")]
    Token(#[source] Box<SendError>),

    #[error("{provider} rejected the request (code {code}): {message}")]
    Provider {
        provider: &'static str,
        code: i64,
        message: String,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request timed out")]
    Timeout,

    #[error("delivery cancelled")]
    Cancelled,
}

impl From<RateLimitError> for SendError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Cancelled => SendError::Cancelled,
        }
    }
}

impl SendError {
    /// True when the delivery was abandoned rather than refused
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendError::Cancelled | SendError::Timeout)
    }
}

/// Delivery adapter for one external platform.
///
/// `summary` has already been normalised to `None` when empty.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Release background resources such as rate-limiter refill tasks
    fn close(&self) {}

    async fn send(
        &self,
        cancel: &CancellationToken,
        content: &str,
        summary: Option<&str>,
        extra: &Extra,
    ) -> Result<(), SendError>;
}

/// Routes messages to the sender registered for their platform.
///
/// Built once during startup and shared read-only afterwards.
#[derive(Default)]
pub struct SenderManager {
    senders: HashMap<Platform, Arc<dyn Sender>>,
}

impl SenderManager {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }

    /// Bind a sender to a platform. A later registration for the same platform wins.
    pub fn register(&mut self, platform: Platform, sender: Arc<dyn Sender>) {
        info!(platform = %platform, sender = sender.name(), "Registered sender");
        self.senders.insert(platform, sender);
    }

    /// Platforms in `required` that have no sender
    pub fn missing(&self, required: &[Platform]) -> Vec<Platform> {
        required
            .iter()
            .filter(|p| !self.senders.contains_key(*p))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Close every registered sender. Called once no worker can send any more.
    pub fn close(&self) {
        for (platform, sender) in &self.senders {
            debug!(platform = %platform, sender = sender.name(), "Closing sender");
            sender.close();
        }
    }

    pub async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<(), SendError> {
        let sender = self
            .senders
            .get(&message.platform)
            .ok_or(SendError::UnsupportedPlatform(message.platform))?;

        debug!(
            platform = %message.platform,
            sender = sender.name(),
            excerpt = message.excerpt(),
            "Routing message"
        );

        sender
            .send(cancel, &message.content, message.summary(), &message.extra)
            .await
    }
}

/// Shared client builder so every provider gets the same timeout
pub fn http_client() -> Result<reqwest::Client, SendError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Send a request and decode its JSON body, aborting if `cancel` fires.
pub(crate) async fn call_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<T, SendError> {
    let exchange = async {
        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(SendError::Status {
                status: status.as_u16(),
                body: excerpt(&String::from_utf8_lossy(&body), 200).to_string(),
            });
        }
        serde_json::from_slice::<T>(&body).map_err(|e| {
            let text = String::from_utf8_lossy(&body);
            SendError::Decode(format!("HTTP {}: {} ({})", status, e, excerpt(&text, 200)))
        })
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SendError::Cancelled),
        result = exchange => result,
    }
}

fn map_transport(err: reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Timeout
    } else {
        SendError::Http(err)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Records every delivery; fails any content starting with "fail"
    #[derive(Default)]
    pub struct RecordingSender {
        pub delivered: Mutex<Vec<String>>,
        pub calls: AtomicUsize,
        pub delay: Option<Duration>,
        pub closed: AtomicBool,
    }

    impl RecordingSender {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sender for RecordingSender {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn send(
            &self,
            cancel: &CancellationToken,
            content: &str,
            _summary: Option<&str>,
            _extra: &Extra,
        ) -> Result<(), SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SendError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if content.starts_with("fail") {
                return Err(SendError::InvalidTarget(format!("refused: {}", content)));
            }
            self.delivered.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;

    #[tokio::test]
    async fn test_send_routes_by_platform() {
        let wechat = Arc::new(RecordingSender::default());
        let dingtalk = Arc::new(RecordingSender::default());
        let mut manager = SenderManager::new();
        manager.register(Platform::Wechat, wechat.clone());
        manager.register(Platform::Dingtalk, dingtalk.clone());

        let cancel = CancellationToken::new();
        manager
            .send(&Message::new(Platform::Dingtalk, "to dingtalk"), &cancel)
            .await
            .unwrap();

        assert_eq!(dingtalk.delivered(), vec!["to dingtalk"]);
        assert!(wechat.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_send_unregistered_platform_fails() {
        let manager = SenderManager::new();
        let err = manager
            .send(&Message::new(Platform::Wechat, "hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::UnsupportedPlatform(Platform::Wechat)));
        assert_eq!(err.to_string(), "unsupported platform: wechat");
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let first = Arc::new(RecordingSender::default());
        let second = Arc::new(RecordingSender::default());
        let mut manager = SenderManager::new();
        manager.register(Platform::Wechat, first.clone());
        manager.register(Platform::Wechat, second.clone());

        manager
            .send(&Message::new(Platform::Wechat, "hi"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(first.delivered().is_empty());
        assert_eq!(second.delivered(), vec!["hi"]);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_error_returned_unchanged() {
        let mut manager = SenderManager::new();
        manager.register(Platform::Wechat, Arc::new(RecordingSender::default()));

        let err = manager
            .send(&Message::new(Platform::Wechat, "fail please"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "refused: fail please");
    }

    #[test]
    fn test_missing_reports_unregistered_platforms() {
        let mut manager = SenderManager::new();
        manager.register(Platform::Dingtalk, Arc::new(RecordingSender::default()));
        assert_eq!(manager.missing(&Platform::ALL), vec![Platform::Wechat]);
    }

    #[test]
    fn test_close_reaches_every_sender() {
        let wechat = Arc::new(RecordingSender::default());
        let dingtalk = Arc::new(RecordingSender::default());
        let mut manager = SenderManager::new();
        manager.register(Platform::Wechat, wechat.clone());
        manager.register(Platform::Dingtalk, dingtalk.clone());

        manager.close();

        assert!(wechat.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(dingtalk.closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
