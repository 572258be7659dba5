// 厂商通道解析器
// 按 Catalog 中的 Manufacturer 选择解析策略，未知厂商回退到通用解析器

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::model::Channel;
use crate::Result;

/// 通用解析器名称
pub const COMMON_PARSER: &str = "Common";

/// 厂商通道解析策略
pub trait ChannelParser: Send + Sync {
    fn parse_channels(&self, channels: Vec<Channel>) -> Result<Vec<Channel>>;
}

/// 原样返回
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughParser;

impl ChannelParser for PassthroughParser {
    fn parse_channels(&self, channels: Vec<Channel>) -> Result<Vec<Channel>> {
        Ok(channels)
    }
}

/// 只保留 Parental == 1 的通道
///
/// 宇视等厂商的目录中会混入组织节点，只有 Parental 为 1 的才是视频通道。
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentalParser;

impl ChannelParser for ParentalParser {
    fn parse_channels(&self, channels: Vec<Channel>) -> Result<Vec<Channel>> {
        Ok(channels.into_iter().filter(|c| c.parental == 1).collect())
    }
}

/// 厂商名 -> 解析器
pub struct ParserRegistry {
    parsers: RwLock<HashMap<String, Arc<dyn ChannelParser>>>,
}

impl ParserRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            parsers: RwLock::new(HashMap::new()),
        }
    }

    /// 注册内置解析器
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        registry.register("Hikvision", Arc::new(PassthroughParser));
        registry.register("DAHUA", Arc::new(PassthroughParser));
        registry.register("UNIVIEW", Arc::new(ParentalParser));
        registry.register(COMMON_PARSER, Arc::new(PassthroughParser));
        registry
    }

    /// 注册（同名覆盖）
    pub fn register(&self, manufacturer: &str, parser: Arc<dyn ChannelParser>) {
        let mut parsers = self.parsers.write().unwrap_or_else(|e| e.into_inner());
        parsers.insert(manufacturer.to_string(), parser);
    }

    pub fn lookup(&self, manufacturer: &str) -> Option<Arc<dyn ChannelParser>> {
        let parsers = self.parsers.read().unwrap_or_else(|e| e.into_inner());
        parsers.get(manufacturer).cloned()
    }

    /// 查找解析器，找不到时回退到通用解析器
    pub fn lookup_or_common(&self, manufacturer: &str) -> Option<Arc<dyn ChannelParser>> {
        self.lookup(manufacturer).or_else(|| {
            let common = self.lookup(COMMON_PARSER);
            if common.is_some() {
                tracing::debug!(
                    target: "gb28181::device",
                    manufacturer = %manufacturer,
                    "Using common parser for unknown manufacturer"
                );
            }
            common
        })
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
