// 下游流媒体服务适配
// 网关只负责信令，PS 流由媒体服务器接收，这里只调用其 HTTP 控制接口

pub mod srs;
pub mod zlm;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::{Gb28181Error, Result};

pub use srs::SrsMedia;
pub use zlm::ZlmMedia;

/// 媒体服务 HTTP 请求超时
pub const API_TIMEOUT: Duration = Duration::from_secs(10);

/// 媒体服务能力
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// 申请收流端口
    async fn publish(&self, stream_id: &str, ssrc: &str) -> Result<u16>;

    async fn unpublish(&self, stream_id: &str) -> Result<()>;

    /// 流是否正在推送
    async fn stream_status(&self, stream_id: &str) -> Result<bool>;

    /// 媒体服务地址 ip:port
    fn address(&self) -> String;

    /// 对外播放地址
    fn playback_url(&self, stream_id: &str) -> String;
}

/// 媒体服务器记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaServer {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// SRS / ZLM
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

impl MediaServer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// 按服务器类型创建适配器
pub fn create_media_engine(server: &MediaServer) -> Result<Arc<dyn MediaEngine>> {
    let engine: Arc<dyn MediaEngine> = match server.server_type.to_ascii_uppercase().as_str() {
        "SRS" => Arc::new(SrsMedia::new(
            server.address(),
            server.username.clone(),
            server.password.clone(),
        )?),
        "ZLM" => Arc::new(ZlmMedia::new(server.address(), server.secret.clone())?),
        other => {
            return Err(Gb28181Error::MediaServer(format!(
                "unsupported media server type: {}",
                other
            )))
        }
    };
    Ok(engine)
}

/// 媒体服务器目录
pub trait MediaServerDirectory: Send + Sync {
    fn get_media_server(&self, id: i64) -> Option<MediaServer>;

    fn default_media_server(&self) -> Option<MediaServer>;

    fn list_media_servers(&self) -> Vec<MediaServer>;
}

/// 内存目录，由配置初始化
#[derive(Default)]
pub struct InMemoryDirectory {
    servers: RwLock<HashMap<i64, MediaServer>>,
}

impl InMemoryDirectory {
    pub fn new(servers: impl IntoIterator<Item = MediaServer>) -> Self {
        let dir = Self::default();
        for server in servers {
            dir.upsert(server);
        }
        dir
    }

    pub fn upsert(&self, server: MediaServer) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(server.id, server);
    }
}

impl MediaServerDirectory for InMemoryDirectory {
    fn get_media_server(&self, id: i64) -> Option<MediaServer> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.get(&id).cloned()
    }

    fn default_media_server(&self) -> Option<MediaServer> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.values().find(|s| s.is_default).cloned()
    }

    fn list_media_servers(&self) -> Vec<MediaServer> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<MediaServer> = servers.values().cloned().collect();
        list.sort_by_key(|s| s.id);
        list
    }
}

#[derive(Deserialize)]
struct ApiCode {
    #[serde(default)]
    code: i64,
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(API_TIMEOUT)
        .build()
        .map_err(|e| Gb28181Error::MediaServer(format!("build http client: {}", e)))
}

/// 发送请求并解析 JSON，HTTP 非 200 或 code 非 0 都视为失败
pub(crate) async fn api_request<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    url: &str,
) -> Result<T> {
    tracing::debug!(target: "gb28181::media", url = %url, "API request");

    let resp = request
        .send()
        .await
        .map_err(|e| Gb28181Error::MediaServer(format!("request {}: {}", url, e)))?;
    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        return Err(Gb28181Error::MediaServer(format!(
            "server returned status code={} for {}",
            status.as_u16(),
            url
        )));
    }

    let text = resp
        .text()
        .await
        .map_err(|e| Gb28181Error::MediaServer(format!("read response for {}: {}", url, e)))?;
    tracing::debug!(target: "gb28181::media", url = %url, size = text.len(), "API response");

    let code: ApiCode = serde_json::from_str(&text)
        .map_err(|e| Gb28181Error::MediaServer(format!("invalid json from {}: {} (body={})", url, e, text)))?;
    if code.code != 0 {
        return Err(Gb28181Error::MediaServer(format!(
            "server fail code={} {}",
            code.code, text
        )));
    }

    serde_json::from_str(&text)
        .map_err(|e| Gb28181Error::MediaServer(format!("invalid json from {}: {} (body={})", url, e, text)))
}
