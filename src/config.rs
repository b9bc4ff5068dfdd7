use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::message::Platform;
use crate::sender::wechat::WeChatSenderType;

const DEFAULT_BUFFER_SIZE: usize = 50;
const DEFAULT_WORKER_POOL_SIZE: usize = 2;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub dingtalk: DingTalkConfig,
    #[serde(default)]
    pub wechat: WeChatConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret expected in the `X-API-Token` header
    pub token: String,
    /// Upper bound on handling one request, body read included; 0 disables it
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// Queue capacity; zero or negative falls back to the default
    #[serde(default)]
    pub buffer_size: i64,
    /// Worker count; zero or negative falls back to the default
    #[serde(default)]
    pub worker_pool_size: i64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DingTalkConfig {
    #[serde(default)]
    pub access_token: String,
    /// Robot signing secret; leave empty for keyword-secured robots
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_dingtalk_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WeChatConfig {
    #[serde(default)]
    pub sender_type: WeChatSenderType,
    #[serde(default)]
    pub wecom: WeComConfig,
    #[serde(default)]
    pub wxpusher: WxPusherConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeComConfig {
    #[serde(default)]
    pub corp_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_wecom_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WxPusherConfig {
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub topic_ids: Vec<i64>,
    /// Requests per second; unset or zero disables throttling
    #[serde(default)]
    pub qps: Option<u32>,
    #[serde(default = "default_wxpusher_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// "stdout" (also when empty), "stderr", or a file path opened for append
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Local time of day, "HH:MM"
    #[serde(default = "default_check_time")]
    pub check_time: String,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_check_platform")]
    pub platform: Platform,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_dingtalk_base_url() -> String {
    "https://oapi.dingtalk.com".to_string()
}

fn default_wecom_base_url() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

fn default_wxpusher_api_url() -> String {
    "https://wxpusher.zjiecode.com/api/send/message".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_check_time() -> String {
    "08:00".to_string()
}

fn default_check_timeout_secs() -> u64 {
    30
}

fn default_check_platform() -> Platform {
    Platform::Wechat
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            worker_pool_size: 0,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl DispatcherConfig {
    /// Queue capacity after applying the default for non-positive values
    pub fn capacity(&self) -> usize {
        positive_or(self.buffer_size, DEFAULT_BUFFER_SIZE)
    }

    /// Worker count after applying the default for non-positive values
    pub fn workers(&self) -> usize {
        positive_or(self.worker_pool_size, DEFAULT_WORKER_POOL_SIZE)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn positive_or(value: i64, default: usize) -> usize {
    if value > 0 {
        value as usize
    } else {
        default
    }
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            secret: String::new(),
            base_url: default_dingtalk_base_url(),
        }
    }
}

impl Default for WeComConfig {
    fn default() -> Self {
        Self {
            corp_id: String::new(),
            agent_id: String::new(),
            app_secret: String::new(),
            base_url: default_wecom_base_url(),
        }
    }
}

impl Default for WxPusherConfig {
    fn default() -> Self {
        Self {
            app_token: String::new(),
            topic_ids: Vec::new(),
            qps: None,
            api_url: default_wxpusher_api_url(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            output: String::new(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_time: default_check_time(),
            timeout_secs: default_check_timeout_secs(),
            platform: default_check_platform(),
            user_id: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl HealthCheckConfig {
    /// Parse `check_time` into (hour, minute)
    pub fn time_of_day(&self) -> Result<(u32, u32)> {
        let (hour, minute) = self
            .check_time
            .split_once(':')
            .with_context(|| format!("Invalid check_time '{}', expected HH:MM", self.check_time))?;
        let hour: u32 = hour
            .trim()
            .parse()
            .with_context(|| format!("Invalid hour in check_time '{}'", self.check_time))?;
        let minute: u32 = minute
            .trim()
            .parse()
            .with_context(|| format!("Invalid minute in check_time '{}'", self.check_time))?;
        if hour > 23 || minute > 59 {
            anyhow::bail!("check_time '{}' is out of range", self.check_time);
        }
        Ok((hour, minute))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.token.is_empty() {
            anyhow::bail!("server.token must not be empty");
        }
        if self.health_check.enabled {
            self.health_check.time_of_day()?;
        }
        Ok(())
    }
}
