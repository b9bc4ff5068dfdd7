pub mod token;
pub mod wecom;
pub mod wxpusher;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::WeChatConfig;
use crate::sender::{SendError, Sender};

use self::wecom::WeComSender;
use self::wxpusher::WxPusherSender;

/// Which backend serves the `wechat` platform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeChatSenderType {
    /// Enterprise WeChat application messages
    #[default]
    Wecom,
    /// WxPusher topic/user push
    Wxpusher,
}

impl fmt::Display for WeChatSenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeChatSenderType::Wecom => write!(f, "wecom"),
            WeChatSenderType::Wxpusher => write!(f, "wxpusher"),
        }
    }
}

/// Build the sender selected by `config.sender_type`
pub fn create_sender(config: &WeChatConfig) -> Result<Arc<dyn Sender>, SendError> {
    let sender: Arc<dyn Sender> = match config.sender_type {
        WeChatSenderType::Wecom => Arc::new(WeComSender::new(config.wecom.clone())?),
        WeChatSenderType::Wxpusher => Arc::new(WxPusherSender::new(config.wxpusher.clone())?),
    };
    Ok(sender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_sender_follows_type() {
        let mut config = WeChatConfig::default();
        assert_eq!(create_sender(&config).unwrap().name(), "wecom");

        config.sender_type = WeChatSenderType::Wxpusher;
        assert_eq!(create_sender(&config).unwrap().name(), "wxpusher");
    }

    #[test]
    fn test_sender_type_rejects_unknown_value() {
        let parsed: Result<WeChatSenderType, _> = serde_json::from_str("\"serverchan\"");
        assert!(parsed.is_err());
        let parsed: WeChatSenderType = serde_json::from_str("\"wxpusher\"").unwrap();
        assert_eq!(parsed.to_string(), "wxpusher");
    }
}
