// 网关运行参数

use std::collections::HashMap;
use std::time::Duration;

use crate::sip::transaction::DEFAULT_TIMEOUT;
use crate::utils::is_valid_id;
use crate::{Gb28181Error, Result};

/// REGISTER 鉴权配置
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// 是否启用 Digest 鉴权
    pub enable: bool,

    /// 全局密码
    pub password: String,

    /// 每设备独立密码表（key = device_id），优先于全局密码
    pub per_device: HashMap<String, String>,
}

impl AuthConfig {
    pub fn password_for(&self, device_id: &str) -> &str {
        self.per_device
            .get(device_id)
            .map(String::as_str)
            .unwrap_or(&self.password)
    }
}

/// GB28181 网关配置
#[derive(Debug, Clone)]
pub struct Gb28181Config {
    /// 平台 SIP 编码
    pub serial: String,

    /// SIP 域
    pub realm: String,

    /// 监听地址
    pub host: String,
    pub port: u16,

    /// 写入 Via/Contact 的对外地址，为空时使用监听地址
    pub advertised_host: String,

    /// SIP 事务超时
    pub transaction_timeout: Duration,

    /// 录像查询等待时间
    pub record_query_timeout: Duration,

    /// 心跳检查周期
    pub heartbeat_check_interval: Duration,

    pub auth: AuthConfig,
}

impl Default for Gb28181Config {
    fn default() -> Self {
        Self {
            serial: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            host: "0.0.0.0".to_string(),
            port: 5060,
            advertised_host: String::new(),
            transaction_timeout: DEFAULT_TIMEOUT,
            record_query_timeout: Duration::from_secs(10),
            heartbeat_check_interval: Duration::from_secs(3),
            auth: AuthConfig::default(),
        }
    }
}

impl Gb28181Config {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_id(&self.serial) {
            return Err(Gb28181Error::Config(format!(
                "serial must be a 20 digit ID: {:?}",
                self.serial
            )));
        }
        if self.realm.is_empty() {
            return Err(Gb28181Error::Config("realm is empty".to_string()));
        }
        if self.transaction_timeout.is_zero()
            || self.record_query_timeout.is_zero()
            || self.heartbeat_check_interval.is_zero()
        {
            return Err(Gb28181Error::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
