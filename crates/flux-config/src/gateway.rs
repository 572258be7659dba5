use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// 网关配置（gateway.toml）
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub common: CommonConfig,

    #[serde(default)]
    pub gb28181: SipConfig,

    #[serde(default)]
    pub media_servers: Vec<MediaServerConfig>,
}

/// 日志等通用配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommonConfig {
    /// trace|debug|info|warn|error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 日志文件路径，为空时只输出到控制台
    #[serde(default)]
    pub log_file: String,

    #[serde(default)]
    pub log_json: bool,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: String::new(),
            log_json: false,
        }
    }
}

/// GB28181 信令配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SipConfig {
    /// 平台 SIP 编码（20 位）
    #[serde(default = "default_serial")]
    pub serial: String,

    #[serde(default = "default_realm")]
    pub realm: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 写入 Via/Contact 的对外地址
    #[serde(default)]
    pub advertised_host: String,

    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,

    #[serde(default = "default_record_query_timeout")]
    pub record_query_timeout_secs: u64,

    #[serde(default = "default_heartbeat_check_interval")]
    pub heartbeat_check_interval_secs: u64,

    #[serde(default)]
    pub auth: AuthSection,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            serial: default_serial(),
            realm: default_realm(),
            host: default_host(),
            port: default_port(),
            advertised_host: String::new(),
            transaction_timeout_secs: default_transaction_timeout(),
            record_query_timeout_secs: default_record_query_timeout(),
            heartbeat_check_interval_secs: default_heartbeat_check_interval(),
            auth: AuthSection::default(),
        }
    }
}

/// REGISTER 鉴权
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AuthSection {
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub password: String,

    /// 设备独立密码（key = device_id）
    #[serde(default)]
    pub per_device: HashMap<String, String>,
}

/// 媒体服务器
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MediaServerConfig {
    pub id: i64,

    #[serde(default)]
    pub name: String,

    /// SRS | ZLM
    #[serde(rename = "type")]
    pub server_type: String,

    pub ip: String,
    pub port: u16,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub is_default: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_serial() -> String {
    "34020000002000000001".to_string()
}

fn default_realm() -> String {
    "3402000000".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5060
}

fn default_transaction_timeout() -> u64 {
    32
}

fn default_record_query_timeout() -> u64 {
    10
}

fn default_heartbeat_check_interval() -> u64 {
    3
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl GatewayConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let level = self.common.log_level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(anyhow!("invalid log_level: {}", self.common.log_level));
        }

        let sip = &self.gb28181;
        if sip.serial.len() != 20 || !sip.serial.bytes().all(|b| b.is_ascii_digit()) {
            return Err(anyhow!("gb28181.serial must be 20 digits: {:?}", sip.serial));
        }
        if sip.realm.is_empty() {
            return Err(anyhow!("gb28181.realm is empty"));
        }
        if sip.port == 0 {
            return Err(anyhow!("gb28181.port must be non-zero"));
        }
        if sip.transaction_timeout_secs == 0
            || sip.record_query_timeout_secs == 0
            || sip.heartbeat_check_interval_secs == 0
        {
            return Err(anyhow!("gb28181 timeouts must be non-zero"));
        }

        let mut ids = HashSet::new();
        for server in &self.media_servers {
            if !ids.insert(server.id) {
                return Err(anyhow!("duplicate media server id: {}", server.id));
            }
            let kind = server.server_type.to_ascii_uppercase();
            if kind != "SRS" && kind != "ZLM" {
                return Err(anyhow!(
                    "media server {} has unsupported type: {}",
                    server.id,
                    server.server_type
                ));
            }
        }

        Ok(())
    }

    /// 输出为 TOML 文本
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
