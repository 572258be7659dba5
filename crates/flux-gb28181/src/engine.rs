// 出站信令引擎
// 负责点播对话、回放控制、云台控制、录像查询以及目录/配置查询

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::device::{Device, DeviceRegistry};
use crate::manscdp;
use crate::media::{create_media_engine, MediaEngine, MediaServer, MediaServerDirectory};
use crate::model::{ChannelStatus, InviteRequest, Record};
use crate::ptz::to_ptz_cmd;
use crate::session::{Session, SessionInfo, SessionTable};
use crate::sip::builder::{
    ack_request, dialog_request, invite_request, mansrtsp_pause, mansrtsp_resume, mansrtsp_speed, message_request,
    LocalEndpoint, OutboundConfig,
};
use crate::sip::message::{SipMethod, SipRequest, SipResponse};
use crate::sip::sdp::{SdpAnswer, SdpOffer};
use crate::sip::transaction::SipClient;
use crate::utils::{create_ssrc, is_valid_id};
use crate::{Gb28181Error, Result};

/// 录像查询默认等待时间
pub const DEFAULT_RECORD_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// 按媒体服务器记录创建适配器
pub type MediaFactory = Arc<dyn Fn(&MediaServer) -> Result<Arc<dyn MediaEngine>> + Send + Sync>;

/// 一次 RecordInfo 响应
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    /// 设备声明的录像总数
    pub sum_num: usize,
    pub records: Vec<Record>,
}

/// 当前使用的媒体服务
struct ActiveMedia {
    server: MediaServer,
    engine: Arc<dyn MediaEngine>,
}

/// 出站信令引擎
pub struct OutboundEngine {
    client: Arc<dyn SipClient>,
    devices: Arc<DeviceRegistry>,
    directory: Arc<dyn MediaServerDirectory>,
    local: LocalEndpoint,
    sessions: SessionTable,
    record_queries: DashMap<String, mpsc::UnboundedSender<RecordBatch>>,
    media: Mutex<Option<ActiveMedia>>,
    media_factory: MediaFactory,
    sn: AtomicU32,
    record_timeout: Duration,
    cancel: CancellationToken,
}

/// 录像查询登记，离开作用域时注销
struct RecordQueryGuard<'a> {
    queries: &'a DashMap<String, mpsc::UnboundedSender<RecordBatch>>,
    channel_id: String,
}

impl Drop for RecordQueryGuard<'_> {
    fn drop(&mut self) {
        self.queries.remove(&self.channel_id);
    }
}

impl OutboundEngine {
    pub fn new(
        client: Arc<dyn SipClient>,
        devices: Arc<DeviceRegistry>,
        directory: Arc<dyn MediaServerDirectory>,
        local: LocalEndpoint,
    ) -> Self {
        Self {
            client,
            devices,
            directory,
            local,
            sessions: SessionTable::new(),
            record_queries: DashMap::new(),
            media: Mutex::new(None),
            media_factory: Arc::new(create_media_engine),
            sn: AtomicU32::new(1),
            record_timeout: DEFAULT_RECORD_QUERY_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_media_factory(mut self, factory: MediaFactory) -> Self {
        self.media_factory = factory;
        self
    }

    pub fn with_record_timeout(mut self, timeout: Duration) -> Self {
        self.record_timeout = timeout;
        self
    }

    pub fn local(&self) -> &LocalEndpoint {
        &self.local
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// 取消所有等待中的出站操作
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed)
    }

    /// 设备的出站路由，离线设备没有来源地址
    fn outbound_config(&self, device: &Device) -> Result<OutboundConfig> {
        if device.source_addr.is_empty() {
            return Err(Gb28181Error::DeviceOffline(device.device_id.clone()));
        }
        Ok(OutboundConfig {
            transport: device.transport,
            destination: device.source_addr.clone(),
            from: self.local.serial.clone(),
            to: device.device_id.clone(),
        })
    }

    fn device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .get_device(device_id)
            .ok_or_else(|| Gb28181Error::DeviceNotFound(device_id.to_string()))
    }

    fn device_by_channel(&self, channel_id: &str) -> Result<Device> {
        self.devices
            .get_device_by_channel(channel_id)
            .ok_or_else(|| Gb28181Error::DeviceNotFound(channel_id.to_string()))
    }

    /// 发送请求并等待 2xx 最终响应
    async fn transact(&self, req: SipRequest) -> Result<SipResponse> {
        let method = req.method.clone();
        let target = req.uri.clone();
        let mut tx = self.client.send_request(req).await?;
        let res = tx.final_response(&self.cancel).await?;
        if !res.is_success() {
            return Err(Gb28181Error::SipTransaction(format!(
                "{} {} rejected: {} {}",
                method, target, res.status_code, res.reason_phrase
            )));
        }
        Ok(res)
    }

    /// 向设备发送 MANSCDP MESSAGE
    async fn send_message(&self, device: &Device, xml: &str) -> Result<()> {
        let conf = self.outbound_config(device)?;
        let req = message_request(xml, &conf, &self.local)?;
        self.transact(req).await?;
        Ok(())
    }

    /// 选择媒体服务，地址或类型变化时替换适配器
    async fn media_engine(&self, media_server_id: i64) -> Result<Arc<dyn MediaEngine>> {
        let server = if media_server_id > 0 {
            self.directory.get_media_server(media_server_id)
        } else {
            self.directory.default_media_server()
        }
        .ok_or_else(|| {
            Gb28181Error::MediaServer(format!("media server {} not found", media_server_id))
        })?;

        let mut active = self.media.lock().await;
        if let Some(current) = active.as_ref() {
            if current.server.address() == server.address()
                && current.server.server_type.eq_ignore_ascii_case(&server.server_type)
            {
                return Ok(Arc::clone(&current.engine));
            }
        }

        let engine = (self.media_factory)(&server)?;
        tracing::info!(
            target: "gb28181::engine",
            media_server_id = server.id,
            server_type = %server.server_type,
            addr = %server.address(),
            "Media server selected"
        );
        *active = Some(ActiveMedia {
            server,
            engine: Arc::clone(&engine),
        });
        Ok(engine)
    }

    /// 点播
    ///
    /// 相同参数且仍在推流的会话直接复用并增加引用计数，否则新建 INVITE 对话。
    pub async fn invite(&self, req: &InviteRequest) -> Result<SessionInfo> {
        if !is_valid_id(&req.channel_id) {
            return Err(Gb28181Error::InvalidId(req.channel_id.clone()));
        }

        let key = req.session_key();
        let _lock = self.sessions.lock(&key).await;

        if let Some(existing) = self.sessions.get(&key) {
            let publishing = existing
                .media
                .stream_status(&existing.ssrc)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(target: "gb28181::engine", key = %key, error = %e, "Failed to query stream status");
                    false
                });
            if publishing {
                let info = self.sessions.update(&key, |s| {
                    s.ref_count += 1;
                    s.info()
                });
                if let Some(info) = info {
                    tracing::info!(target: "gb28181::engine", key = %key, ref_count = info.ref_count, "Reusing session");
                    return Ok(info);
                }
            } else if let Some(stale) = self.sessions.remove(&key) {
                tracing::info!(target: "gb28181::engine", key = %key, ssrc = %stale.ssrc, "Replacing stale session");
                if let Err(e) = stale.media.unpublish(&stale.ssrc).await {
                    tracing::warn!(target: "gb28181::engine", ssrc = %stale.ssrc, error = %e, "Failed to unpublish stale stream");
                }
            }
        }

        let device = self.device_by_channel(&req.channel_id)?;
        let conf = self.outbound_config(&device)?;

        let media = self.media_engine(req.media_server_id).await?;
        let ssrc = create_ssrc(req.is_live());
        let media_port = media.publish(&ssrc, &ssrc).await?;

        match self.start_dialog(req, &key, &conf, &media, &ssrc, media_port).await {
            Ok(session) => {
                let info = session.info();
                self.devices.set_channel_ssrc(&req.channel_id, &ssrc);
                self.sessions.insert(session);
                Ok(info)
            }
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::engine",
                    channel_id = %req.channel_id,
                    ssrc = %ssrc,
                    error = %e,
                    "Invite failed, releasing media reservation"
                );
                if let Err(ue) = media.unpublish(&ssrc).await {
                    tracing::error!(target: "gb28181::engine", ssrc = %ssrc, error = %ue, "Failed to unpublish stream");
                }
                Err(e)
            }
        }
    }

    async fn start_dialog(
        &self,
        req: &InviteRequest,
        key: &str,
        conf: &OutboundConfig,
        media: &Arc<dyn MediaEngine>,
        ssrc: &str,
        media_port: u16,
    ) -> Result<Session> {
        let address = media.address();
        let media_host = address.split(':').next().unwrap_or_default().to_string();
        if media_host.is_empty() {
            return Err(Gb28181Error::MediaServer("media host is empty".to_string()));
        }

        let sdp = SdpOffer {
            channel_id: req.channel_id.clone(),
            media_host: media_host.clone(),
            media_port,
            play_type: req.play_type,
            start_time: req.start_time,
            end_time: req.end_time,
            ssrc: ssrc.to_string(),
        }
        .to_string();
        let subject = format!("{}:{},{}:0", req.channel_id, ssrc, self.local.serial);

        let invite = invite_request(&sdp, &subject, conf, &self.local)?;
        let answer = self.transact(invite.clone()).await?;

        let ack = ack_request(&invite, &answer, &self.local);
        if let Err(e) = self.client.write_request(ack).await {
            self.abandon_dialog(&invite, &answer).await;
            return Err(e);
        }

        let remote = SdpAnswer::parse(&answer.body_str());
        if let Some(device_ssrc) = remote.ssrc.as_deref().filter(|s| *s != ssrc) {
            tracing::warn!(
                target: "gb28181::engine",
                channel_id = %req.channel_id,
                ssrc = %ssrc,
                device_ssrc = %device_ssrc,
                "Device answered with a different SSRC"
            );
        }

        tracing::info!(
            target: "gb28181::engine",
            device_id = %conf.to,
            channel_id = %req.channel_id,
            ssrc = %ssrc,
            media_port,
            device_media = %remote.connection.as_deref().unwrap_or("-"),
            device_port = remote.port.unwrap_or(0),
            "Invite established"
        );

        Ok(Session {
            key: key.to_string(),
            channel_id: req.channel_id.clone(),
            device_id: conf.to.clone(),
            media_host,
            media_port,
            ssrc: ssrc.to_string(),
            status: ChannelStatus::On,
            url: media.playback_url(ssrc),
            ref_count: 1,
            cseq: invite.cseq().unwrap_or(1),
            rtsp_cseq: 1,
            created_at: Utc::now(),
            invite_req: invite,
            invite_res: answer,
            media: Arc::clone(media),
        })
    }

    /// ACK 发送失败时设备侧对话已建立，尽力发送 BYE 拆除
    async fn abandon_dialog(&self, invite: &SipRequest, answer: &SipResponse) {
        let cseq = invite.cseq().unwrap_or(1) + 1;
        let bye = dialog_request(SipMethod::Bye, invite, answer, cseq, &self.local);
        if let Err(e) = self.transact(bye).await {
            tracing::warn!(
                target: "gb28181::engine",
                call_id = %invite.call_id().unwrap_or_default(),
                error = %e,
                "Failed to send BYE for unacknowledged dialog"
            );
        }
    }

    /// 挂断，引用计数归零时才真正释放
    pub async fn bye(&self, url: &str) -> Result<()> {
        let key = self
            .sessions
            .find_by_url(url)
            .ok_or_else(|| Gb28181Error::SessionNotFound(url.to_string()))?;
        let _lock = self.sessions.lock(&key).await;

        let remaining = self
            .sessions
            .update(&key, |s| {
                s.ref_count = s.ref_count.saturating_sub(1);
                s.ref_count
            })
            .ok_or_else(|| Gb28181Error::SessionNotFound(url.to_string()))?;
        if remaining > 0 {
            tracing::info!(target: "gb28181::engine", key = %key, ref_count = remaining, "Session still in use");
            return Ok(());
        }

        let Some(mut session) = self.sessions.remove(&key) else {
            return Err(Gb28181Error::SessionNotFound(url.to_string()));
        };

        if let Err(e) = session.media.unpublish(&session.ssrc).await {
            tracing::error!(target: "gb28181::engine", stream_id = %session.ssrc, error = %e, "Failed to unpublish stream");
        }

        // 设备已主动挂断的对话不再发送 BYE
        if session.status == ChannelStatus::Off {
            return Ok(());
        }

        let bye = session.next_request(SipMethod::Bye, &self.local);
        self.transact(bye).await?;
        Ok(())
    }

    async fn send_info(&self, url: &str, body: impl FnOnce(u32) -> String) -> Result<()> {
        let key = self
            .sessions
            .find_by_url(url)
            .ok_or_else(|| Gb28181Error::SessionNotFound(url.to_string()))?;
        let req = self
            .sessions
            .update(&key, |s| s.next_info(&self.local, body))
            .ok_or_else(|| Gb28181Error::SessionNotFound(url.to_string()))?;
        self.transact(req).await?;
        Ok(())
    }

    pub async fn pause(&self, url: &str) -> Result<()> {
        self.send_info(url, mansrtsp_pause).await
    }

    pub async fn resume(&self, url: &str) -> Result<()> {
        self.send_info(url, mansrtsp_resume).await
    }

    pub async fn speed(&self, url: &str, speed: f32) -> Result<()> {
        self.send_info(url, |cseq| mansrtsp_speed(cseq, speed)).await
    }

    /// 云台控制
    pub async fn control_ptz(&self, device_id: &str, channel_id: &str, ptz: &str, speed: &str) -> Result<()> {
        let device = self.device_by_channel(channel_id)?;
        let cmd = to_ptz_cmd(ptz, speed)?;
        let xml = manscdp::ptz_control(self.next_sn(), channel_id, &cmd);

        tracing::debug!(
            target: "gb28181::engine",
            device_id = %device_id,
            channel_id = %channel_id,
            ptz = %ptz,
            cmd = %cmd,
            "Sending PTZ control"
        );
        self.send_message(&device, &xml).await
    }

    /// 录像查询
    ///
    /// 设备可能分多次 MESSAGE 返回，累计到 SumNum 条后返回；超时返回已收到的部分。
    pub async fn query_record(
        &self,
        device_id: &str,
        channel_id: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Record>> {
        let device = self.device_by_channel(channel_id)?;
        let xml = manscdp::record_info_query(self.next_sn(), channel_id, start_time, end_time)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = match self.record_queries.entry(channel_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(Gb28181Error::RecordQueryInProgress(channel_id.to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
                RecordQueryGuard {
                    queries: &self.record_queries,
                    channel_id: channel_id.to_string(),
                }
            }
        };

        self.send_message(&device, &xml).await?;

        let deadline = tokio::time::Instant::now() + self.record_timeout;
        let mut records: Vec<Record> = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Gb28181Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        target: "gb28181::engine",
                        device_id = %device_id,
                        channel_id = %channel_id,
                        received = records.len(),
                        "Record query timeout"
                    );
                    return Err(Gb28181Error::RecordQueryTimeout {
                        channel_id: channel_id.to_string(),
                        records,
                    });
                }
                batch = rx.recv() => {
                    let Some(batch) = batch else {
                        return Err(Gb28181Error::Cancelled);
                    };
                    let batch_count = batch.records.len();
                    records.extend(batch.records);
                    tracing::info!(
                        target: "gb28181::engine",
                        channel_id = %channel_id,
                        expected_count = batch.sum_num,
                        actual_count = records.len(),
                        batch_count,
                        "Record query result"
                    );
                    if records.len() >= batch.sum_num {
                        return Ok(records);
                    }
                }
            }
        }
    }

    /// 投递 RecordInfo 结果，没有等待中的查询时返回 false
    pub fn deliver_records(&self, channel_id: &str, batch: RecordBatch) -> bool {
        match self.record_queries.get(channel_id) {
            Some(tx) => tx.send(batch).is_ok(),
            None => false,
        }
    }

    pub async fn catalog(&self, device_id: &str) -> Result<()> {
        let device = self.device(device_id)?;
        let xml = manscdp::catalog_query(self.next_sn(), device_id);
        self.send_message(&device, &xml).await
    }

    pub async fn config_download(&self, device_id: &str) -> Result<()> {
        let device = self.device(device_id)?;
        let xml = manscdp::config_download(self.next_sn(), device_id);
        self.send_message(&device, &xml).await
    }

    pub async fn device_info(&self, device_id: &str) -> Result<()> {
        let device = self.device(device_id)?;
        let xml = manscdp::device_info_query(self.next_sn(), device_id);
        self.send_message(&device, &xml).await
    }

    /// 设备主动挂断，对应会话置为 OFF
    pub fn on_remote_bye(&self, call_id: &str) -> bool {
        let Some(key) = self.sessions.find_by_call_id(call_id) else {
            return false;
        };
        self.sessions
            .update(&key, |s| s.status = ChannelStatus::Off)
            .is_some()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::InMemoryDirectory;
    use crate::model::Transport;
    use crate::sip::transaction::ClientTransaction;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// 记录所有请求，始终回复 200
    #[derive(Default)]
    struct RecordingClient {
        sent: StdMutex<Vec<SipRequest>>,
    }

    #[async_trait]
    impl SipClient for RecordingClient {
        async fn send_request(&self, req: SipRequest) -> Result<ClientTransaction> {
            let branch = req.branch().unwrap_or_default().to_string();
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(crate::sip::builder::response_from_request(&req, 200, "OK"));
            self.sent.lock().unwrap().push(req);
            Ok(ClientTransaction::detached(&branch, rx, Duration::from_secs(1)))
        }

        async fn write_request(&self, req: SipRequest) -> Result<()> {
            self.sent.lock().unwrap().push(req);
            Ok(())
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

    fn engine(client: Arc<RecordingClient>) -> OutboundEngine {
        let devices = Arc::new(DeviceRegistry::default());
        devices.add_device(Device::new(
            "34020000001320000001",
            "192.168.1.100:5060",
            Transport::Udp,
        ));
        OutboundEngine::new(
            client,
            devices,
            Arc::new(InMemoryDirectory::default()),
            local(),
        )
    }

    #[tokio::test]
    async fn test_sn_shared_across_messages() {
        let client = Arc::new(RecordingClient::default());
        let engine = engine(Arc::clone(&client));

        engine.catalog("34020000001320000001").await.unwrap();
        engine.config_download("34020000001320000001").await.unwrap();
        engine
            .control_ptz("34020000001320000001", "34020000001320000001", "left", "5")
            .await
            .unwrap();

        let sent = client.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].body_str().contains("<SN>1</SN>"));
        assert!(sent[1].body_str().contains("<SN>2</SN>"));
        assert!(sent[2].body_str().contains("<SN>3</SN>"));
        assert!(sent[2].body_str().contains("<PTZCmd>A50F01"));
        assert_eq!(sent[0].to_user(), Some("34020000001320000001"));
    }

    #[tokio::test]
    async fn test_not_found_sends_nothing() {
        let client = Arc::new(RecordingClient::default());
        let engine = engine(Arc::clone(&client));

        assert!(matches!(
            engine.catalog("34020000001320000009").await,
            Err(Gb28181Error::DeviceNotFound(_))
        ));
        assert!(matches!(
            engine.pause("webrtc://nowhere").await,
            Err(Gb28181Error::SessionNotFound(_))
        ));
        assert!(matches!(
            engine.control_ptz("34020000001320000001", "34020000001320000001", "spin", "5").await,
            Err(Gb28181Error::InvalidCommand(_))
        ));
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_device() {
        let client = Arc::new(RecordingClient::default());
        let engine = engine(Arc::clone(&client));
        engine
            .devices()
            .check_heartbeats_at(Utc::now() + chrono::Duration::seconds(3600));

        assert!(matches!(
            engine.device_info("34020000001320000001").await,
            Err(Gb28181Error::DeviceOffline(_))
        ));
    }

    #[tokio::test]
    async fn test_invite_without_media_server() {
        let client = Arc::new(RecordingClient::default());
        let engine = engine(Arc::clone(&client));
        let req = InviteRequest {
            device_id: "34020000001320000001".to_string(),
            channel_id: "34020000001320000001".to_string(),
            media_server_id: 7,
            ..Default::default()
        };
        assert!(matches!(engine.invite(&req).await, Err(Gb28181Error::MediaServer(_))));
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_query_rejects_concurrent() {
        let client = Arc::new(RecordingClient::default());
        let engine = Arc::new(engine(Arc::clone(&client)).with_record_timeout(Duration::from_millis(300)));

        let e = Arc::clone(&engine);
        let first = tokio::spawn(async move {
            e.query_record("34020000001320000001", "34020000001320000001", 0, 0).await
        });

        while engine.record_queries.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            engine
                .query_record("34020000001320000001", "34020000001320000001", 0, 0)
                .await,
            Err(Gb28181Error::RecordQueryInProgress(_))
        ));

        assert!(matches!(
            first.await.unwrap(),
            Err(Gb28181Error::RecordQueryTimeout { .. })
        ));
        assert!(engine.record_queries.is_empty());
        assert!(!engine.deliver_records("34020000001320000001", RecordBatch::default()));
    }

    #[tokio::test]
    async fn test_record_query_cancelled() {
        let client = Arc::new(RecordingClient::default());
        let engine = Arc::new(engine(Arc::clone(&client)));

        let e = Arc::clone(&engine);
        let query = tokio::spawn(async move {
            e.query_record("34020000001320000001", "34020000001320000001", 0, 0).await
        });
        while engine.record_queries.is_empty() {
            tokio::task::yield_now().await;
        }

        engine.shutdown();
        assert!(matches!(query.await.unwrap(), Err(Gb28181Error::Cancelled)));
        assert!(engine.record_queries.is_empty());
    }
}
