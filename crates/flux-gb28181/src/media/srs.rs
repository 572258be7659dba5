use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{api_request, http_client, MediaEngine};
use crate::Result;

/// SRS 适配，收流走 GB 插件的 /gb/v1/publish/
pub struct SrsMedia {
    addr: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    id: &'a str,
    ssrc: &'a str,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default)]
    port: u16,
}

#[derive(Deserialize, Default)]
struct StreamPublish {
    #[serde(default)]
    active: bool,
}

#[derive(Deserialize)]
struct Stream {
    #[serde(default)]
    name: String,
    #[serde(default)]
    publish: StreamPublish,
}

#[derive(Deserialize)]
struct StreamsResponse {
    #[serde(default)]
    streams: Vec<Stream>,
}

impl SrsMedia {
    pub fn new(addr: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        Ok(Self {
            addr: addr.into(),
            username: username.into(),
            password: password.into(),
            client: http_client()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    fn host(&self) -> &str {
        self.addr.split(':').next().unwrap_or(&self.addr)
    }
}

#[async_trait]
impl MediaEngine for SrsMedia {
    async fn publish(&self, stream_id: &str, ssrc: &str) -> Result<u16> {
        let url = self.url("/gb/v1/publish/");
        let req = self
            .with_auth(self.client.post(&url))
            .json(&PublishRequest { id: stream_id, ssrc });
        let res: PublishResponse = api_request(req, &url).await?;

        tracing::info!(target: "gb28181::media", stream_id, ssrc, port = res.port, "SRS publish allocated");
        Ok(res.port)
    }

    async fn unpublish(&self, stream_id: &str) -> Result<()> {
        // SRS 在流断开后自行回收
        tracing::debug!(target: "gb28181::media", stream_id, "SRS unpublish is a no-op");
        Ok(())
    }

    async fn stream_status(&self, stream_id: &str) -> Result<bool> {
        let url = self.url("/api/v1/streams?count=99");
        let res: StreamsResponse = api_request(self.with_auth(self.client.get(&url)), &url).await?;

        Ok(res
            .streams
            .iter()
            .find(|s| s.name == stream_id)
            .map(|s| s.publish.active)
            .unwrap_or(false))
    }

    fn address(&self) -> String {
        self.addr.clone()
    }

    fn playback_url(&self, stream_id: &str) -> String {
        format!("webrtc://{}/live/{}", self.host(), stream_id)
    }
}
