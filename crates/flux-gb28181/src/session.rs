// 点播会话管理
// 相同请求参数共享一路上行 INVITE，按引用计数决定何时真正挂断

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::media::MediaEngine;
use crate::model::ChannelStatus;
use crate::sip::builder::{dialog_request, LocalEndpoint, CONTENT_TYPE_MANSRTSP};
use crate::sip::message::{SipMethod, SipRequest, SipResponse};

/// 点播会话
#[derive(Clone)]
pub struct Session {
    /// 会话键（媒体服务:设备:通道:码流:类型:开始:结束）
    pub key: String,

    /// 通道 ID
    pub channel_id: String,

    /// 设备 ID
    pub device_id: String,

    /// 媒体服务器收流地址
    pub media_host: String,
    pub media_port: u16,

    /// SSRC，同时作为媒体服务中的流 ID
    pub ssrc: String,

    pub status: ChannelStatus,

    /// 对外播放地址
    pub url: String,

    /// 共享该会话的观看者数量
    pub ref_count: u32,

    /// 对话内 SIP CSeq
    pub cseq: u32,

    /// MANSRTSP 报文内的 CSeq
    pub rtsp_cseq: u32,

    pub created_at: DateTime<Utc>,

    /// 建立对话的 INVITE 及其 2xx 响应
    pub invite_req: SipRequest,
    pub invite_res: SipResponse,

    /// 创建该会话时使用的媒体服务
    pub media: Arc<dyn MediaEngine>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("channel_id", &self.channel_id)
            .field("ssrc", &self.ssrc)
            .field("status", &self.status)
            .field("url", &self.url)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

impl Session {
    /// 对话内请求，CSeq 递增
    pub fn next_request(&mut self, method: SipMethod, local: &LocalEndpoint) -> SipRequest {
        self.cseq += 1;
        dialog_request(method, &self.invite_req, &self.invite_res, self.cseq, local)
    }

    /// 携带 MANSRTSP 的 INFO，body 由 CSeq 生成
    pub fn next_info(&mut self, local: &LocalEndpoint, body: impl FnOnce(u32) -> String) -> SipRequest {
        let rtsp_cseq = self.rtsp_cseq;
        self.rtsp_cseq += 1;
        let mut req = self.next_request(SipMethod::Info, local);
        req.set_body(CONTENT_TYPE_MANSRTSP, body(rtsp_cseq));
        req
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            channel_id: self.channel_id.clone(),
            device_id: self.device_id.clone(),
            media_host: self.media_host.clone(),
            media_port: self.media_port,
            ssrc: self.ssrc.clone(),
            status: self.status,
            url: self.url.clone(),
            ref_count: self.ref_count,
            created_at: self.created_at,
        }
    }
}

/// 对外暴露的会话快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub channel_id: String,
    pub device_id: String,
    pub media_host: String,
    pub media_port: u16,
    pub ssrc: String,
    pub status: ChannelStatus,
    pub url: String,
    pub ref_count: u32,
    pub created_at: DateTime<Utc>,
}

/// 会话表
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<String, Session>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// 会话键锁，释放时清理无人等待的锁
pub struct SessionLock<'a> {
    table: &'a SessionTable,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.table
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话键上的互斥锁，同一键的 Invite/Bye 串行执行
    pub async fn lock(&self, key: &str) -> SessionLock<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        SessionLock {
            table: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    pub fn insert(&self, session: Session) {
        tracing::info!(
            target: "gb28181::session",
            key = %session.key,
            channel_id = %session.channel_id,
            ssrc = %session.ssrc,
            url = %session.url,
            "Session added"
        );
        self.sessions.insert(session.key.clone(), session);
    }

    pub fn remove(&self, key: &str) -> Option<Session> {
        let removed = self.sessions.remove(key).map(|(_, s)| s);
        if removed.is_some() {
            tracing::info!(target: "gb28181::session", key, "Session removed");
        }
        removed
    }

    /// 原地修改会话，不存在时返回 None
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.get_mut(key).map(|mut s| f(s.value_mut()))
    }

    /// 按播放地址查找会话键
    pub fn find_by_url(&self, url: &str) -> Option<String> {
        self.sessions
            .iter()
            .find(|s| s.url == url)
            .map(|s| s.key().clone())
    }

    /// 按对话 Call-ID 查找会话键
    pub fn find_by_call_id(&self, call_id: &str) -> Option<String> {
        self.sessions
            .iter()
            .find(|s| s.invite_req.call_id() == Some(call_id))
            .map(|s| s.key().clone())
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.sessions.iter().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaEngine;
    use crate::model::Transport;
    use crate::sip::builder::{invite_request, response_from_request, OutboundConfig};
    use crate::sip::message::header_param;
    use crate::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullMedia;

    #[async_trait]
    impl MediaEngine for NullMedia {
        async fn publish(&self, _: &str, _: &str) -> Result<u16> {
            Ok(30000)
        }
        async fn unpublish(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn stream_status(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
        fn address(&self) -> String {
            "10.0.0.5:1985".to_string()
        }
        fn playback_url(&self, id: &str) -> String {
            format!("webrtc://10.0.0.5/live/{}", id)
        }
    }

    fn local() -> LocalEndpoint {
        LocalEndpoint {
            serial: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            host: "10.0.0.1".to_string(),
            port: 5060,
        }
    }

    fn session(key: &str, url: &str) -> Session {
        let conf = OutboundConfig {
            transport: Transport::Udp,
            destination: "192.168.1.100:5060".to_string(),
            from: "34020000002000000001".to_string(),
            to: "34020000001320000001".to_string(),
        };
        let invite_req = invite_request("v=0\r\n", "s", &conf, &local()).unwrap();
        let invite_res = response_from_request(&invite_req, 200, "OK");
        Session {
            key: key.to_string(),
            channel_id: "34020000001310000001".to_string(),
            device_id: "34020000001320000001".to_string(),
            media_host: "10.0.0.5".to_string(),
            media_port: 30000,
            ssrc: "0123456789".to_string(),
            status: ChannelStatus::On,
            url: url.to_string(),
            ref_count: 1,
            cseq: invite_req.cseq().unwrap_or(1),
            rtsp_cseq: 1,
            created_at: Utc::now(),
            invite_req,
            invite_res,
            media: Arc::new(NullMedia),
        }
    }

    #[test]
    fn test_table_lookup() {
        let table = SessionTable::new();
        let s = session("k1", "webrtc://10.0.0.5/live/0123456789");
        let call_id = s.invite_req.call_id().unwrap().to_string();
        table.insert(s);

        assert_eq!(table.find_by_url("webrtc://10.0.0.5/live/0123456789").as_deref(), Some("k1"));
        assert!(table.find_by_url("webrtc://other").is_none());
        assert_eq!(table.find_by_call_id(&call_id).as_deref(), Some("k1"));

        assert_eq!(table.update("k1", |s| {
            s.ref_count += 1;
            s.ref_count
        }), Some(2));
        assert_eq!(table.snapshot()[0].ref_count, 2);
        assert!(table.update("missing", |_| ()).is_none());

        assert!(table.remove("k1").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_info_serializes() {
        let info = session("k1", "webrtc://10.0.0.5/live/0123456789").info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "ON");
        assert_eq!(json["media_port"], 30000);
        let created_at: DateTime<Utc> = json["created_at"].as_str().unwrap().parse().unwrap();
        assert_eq!(created_at, info.created_at);
    }

    #[test]
    fn test_dialog_cseq() {
        let mut s = session("k1", "u");
        let bye = s.next_request(SipMethod::Bye, &local());
        assert_eq!(bye.header("CSeq"), Some("2 BYE"));
        assert_eq!(bye.call_id(), s.invite_req.call_id());
        assert!(header_param(bye.header("To").unwrap(), "tag").is_some());

        let pause = s.next_info(&local(), crate::sip::builder::mansrtsp_pause);
        assert_eq!(pause.header("CSeq"), Some("3 INFO"));
        assert_eq!(pause.header("Content-Type"), Some("Application/MANSRTSP"));
        assert_eq!(pause.body_str(), "PAUSE RTSP/1.0\r\nCSeq: 1\r\nPauseTime: now\r\n");

        let resume = s.next_info(&local(), crate::sip::builder::mansrtsp_resume);
        assert_eq!(resume.header("CSeq"), Some("4 INFO"));
        assert!(resume.body_str().contains("CSeq: 2\r\n"));
    }

    #[tokio::test]
    async fn test_key_lock_serializes_and_cleans_up() {
        let table = Arc::new(SessionTable::new());

        let first = table.lock("k").await;
        let t = Arc::clone(&table);
        let waiter = tokio::spawn(async move {
            let _second = t.lock("k").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(table.lock_count(), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(table.lock_count(), 0);
    }
}
