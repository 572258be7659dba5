use anyhow::{anyhow, Context, Result};
use config::{Config, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::GatewayConfig;

/// 网关配置文件名
pub const GATEWAY_CONFIG_FILE: &str = "gateway.toml";

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    /// 加载 `<dir>/gateway.toml`，文件不存在时使用默认配置
    pub fn load_gateway(&self) -> Result<GatewayConfig> {
        let config_path = self.config_dir.join(GATEWAY_CONFIG_FILE);

        if !config_path.exists() {
            let config = GatewayConfig::default();
            config.validate()?;
            return Ok(config);
        }

        Self::from_file(&config_path)
    }

    /// 从指定文件加载并校验
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(anyhow!("Config file not found: {}", path.display()));
        }

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ))
            .build()
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let gateway: GatewayConfig = config
            .try_deserialize()
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        gateway
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;

        Ok(gateway)
    }

    /// 校验配置目录中的网关配置
    pub fn validate(&self) -> Result<()> {
        self.load_gateway().map(|_| ())
    }
}
