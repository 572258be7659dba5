use async_trait::async_trait;
use serde::Deserialize;

use super::{api_request, http_client, MediaEngine};
use crate::Result;

/// ZLMediaKit 适配，使用 RTP 服务器接口收流
pub struct ZlmMedia {
    addr: String,
    secret: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct OpenRtpServerResponse {
    #[serde(default)]
    port: u16,
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Deserialize)]
struct MediaListResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

impl ZlmMedia {
    pub fn new(addr: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        Ok(Self {
            addr: addr.into(),
            secret: secret.into(),
            client: http_client()?,
        })
    }

    fn url(&self, api: &str) -> String {
        format!("http://{}/index/api/{}", self.addr, api)
    }
}

#[async_trait]
impl MediaEngine for ZlmMedia {
    async fn publish(&self, stream_id: &str, ssrc: &str) -> Result<u16> {
        let url = self.url("openRtpServer");
        let req = self.client.get(&url).query(&[
            ("secret", self.secret.as_str()),
            ("port", "0"),
            ("enable_tcp", "1"),
            ("stream_id", stream_id),
            ("ssrc", ssrc),
        ]);
        let res: OpenRtpServerResponse = api_request(req, &url).await?;

        tracing::info!(target: "gb28181::media", stream_id, ssrc, port = res.port, "ZLM rtp server opened");
        Ok(res.port)
    }

    async fn unpublish(&self, stream_id: &str) -> Result<()> {
        let url = self.url("closeRtpServer");
        let req = self
            .client
            .get(&url)
            .query(&[("secret", self.secret.as_str()), ("stream_id", stream_id)]);
        let _: Empty = api_request(req, &url).await?;

        tracing::info!(target: "gb28181::media", stream_id, "ZLM rtp server closed");
        Ok(())
    }

    async fn stream_status(&self, stream_id: &str) -> Result<bool> {
        let url = self.url("getMediaList");
        let req = self
            .client
            .get(&url)
            .query(&[("secret", self.secret.as_str()), ("stream", stream_id)]);
        let res: MediaListResponse = api_request(req, &url).await?;
        Ok(!res.data.is_empty())
    }

    fn address(&self) -> String {
        self.addr.clone()
    }

    fn playback_url(&self, stream_id: &str) -> String {
        format!(
            "http://{}/index/api/webrtc?app=rtp&stream={}&type=play",
            self.addr, stream_id
        )
    }
}
