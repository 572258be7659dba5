// 入站请求分发
// REGISTER 鉴权与设备上线，MESSAGE 按 CmdType 更新设备状态，NOTIFY/BYE 直接应答

use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::{generate_nonce, parse_authorization, validate_auth};
use crate::config::AuthConfig;
use crate::device::{Device, DeviceRegistry};
use crate::engine::{OutboundEngine, RecordBatch};
use crate::manscdp::{self, ManscdpMessage};
use crate::sip::builder::{register_response, response_from_request, unauthorized_response};
use crate::sip::message::{SipMethod, SipRequest, SipResponse};
use crate::sip::transaction::ResponseSink;
use crate::sip::transport::RequestHandler;
use crate::utils::{is_same_ip, is_valid_id};

/// 入站请求分发器
pub struct Dispatcher {
    devices: Arc<DeviceRegistry>,
    engine: Arc<OutboundEngine>,
    realm: String,
    auth: AuthConfig,
}

async fn respond(sink: &Arc<dyn ResponseSink>, res: SipResponse) {
    let status = res.status_code;
    if let Err(e) = sink.respond(res).await {
        tracing::warn!(target: "gb28181::sip", status, error = %e, "Failed to send response");
    }
}

impl Dispatcher {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        engine: Arc<OutboundEngine>,
        realm: impl Into<String>,
        auth: AuthConfig,
    ) -> Self {
        Self {
            devices,
            engine,
            realm: realm.into(),
            auth,
        }
    }

    /// REGISTER：鉴权、注销、上线或重复 ID 冲突
    async fn on_register(&self, req: &SipRequest, sink: &Arc<dyn ResponseSink>) {
        let device_id = req.from_user().unwrap_or_default().to_string();
        if !is_valid_id(&device_id) {
            tracing::error!(target: "gb28181::sip", device_id = %device_id, "Invalid device ID in REGISTER");
            return;
        }
        let source = req.remote_addr();

        if self.auth.enable {
            let Some(header) = req.header("Authorization") else {
                respond(sink, unauthorized_response(req, &self.realm, &generate_nonce())).await;
                return;
            };

            let info = parse_authorization(header);
            if !validate_auth(Some(&info), self.auth.password_for(&device_id)) {
                tracing::error!(target: "gb28181::sip", device_id = %device_id, source = %source, "Auth failed");
                respond(sink, register_response(req, 403, "Auth Failed")).await;
                return;
            }
        }

        let Some(expires) = req.header("Expires") else {
            tracing::error!(target: "gb28181::sip", device_id = %device_id, "Empty Expires header");
            return;
        };
        let expires: i64 = match expires.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(target: "gb28181::sip", device_id = %device_id, expires = %expires, error = %e, "Failed to parse Expires header");
                return;
            }
        };

        if expires == 0 {
            self.devices.remove_device(&device_id);
            tracing::warn!(target: "gb28181::sip", device_id = %device_id, "Device unregistered");
            return;
        }

        match self.devices.get_device(&device_id) {
            None => {
                self.devices
                    .add_device(Device::new(&device_id, &source, req.transport));
                respond(sink, register_response(req, 200, "OK")).await;
                tracing::info!(target: "gb28181::sip", device_id = %device_id, source = %source, transport = %req.transport, "Register success");

                self.pull_device_state(&device_id);
            }
            Some(device) if !device.source_addr.is_empty() && !is_same_ip(&device.source_addr, &source) => {
                // 同一 ID 从不同 IP 注册，国标未定义虚拟 ID，按冲突拒绝
                tracing::error!(
                    target: "gb28181::sip",
                    device_id = %device_id,
                    old_source = %device.source_addr,
                    new_source = %source,
                    "Device already registered"
                );
                respond(sink, register_response(req, 400, "Conflict Device ID")).await;
            }
            Some(_) => {
                self.devices
                    .update_registration(&device_id, &source, req.transport);
                respond(sink, register_response(req, 200, "OK")).await;
                tracing::info!(target: "gb28181::sip", device_id = %device_id, source = %source, "Re-register success");
            }
        }
    }

    /// 新设备上线后异步拉取配置、目录与设备信息
    fn pull_device_state(&self, device_id: &str) {
        let engine = Arc::clone(&self.engine);
        let id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.config_download(&id).await {
                tracing::warn!(target: "gb28181::engine", device_id = %id, error = %e, "ConfigDownload failed");
            }
        });

        let engine = Arc::clone(&self.engine);
        let id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.catalog(&id).await {
                tracing::warn!(target: "gb28181::engine", device_id = %id, error = %e, "Catalog failed");
            }
            if let Err(e) = engine.device_info(&id).await {
                tracing::warn!(target: "gb28181::engine", device_id = %id, error = %e, "DeviceInfo failed");
            }
        });
    }

    async fn on_message(&self, req: &SipRequest, sink: &Arc<dyn ResponseSink>) {
        if let Some(from) = req.from_user() {
            if !is_valid_id(from) {
                tracing::warn!(target: "gb28181::sip", from = %from, "Invalid device ID in MESSAGE");
            }
        }

        let msg = match manscdp::decode(&req.body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(target: "gb28181::sip", error = %e, body = %req.body_str(), "Failed to decode MESSAGE");
                respond(sink, response_from_request(req, 400, "Bad Request")).await;
                return;
            }
        };

        tracing::debug!(target: "gb28181::sip", cmd_type = %msg.cmd_type, device_id = %msg.device_id, sn = %msg.sn, "Received MESSAGE");

        if !self.handle_command(&msg) {
            respond(sink, response_from_request(req, 400, "Bad Request")).await;
            return;
        }
        respond(sink, response_from_request(req, 200, "OK")).await;
    }

    /// 处理 MANSCDP 命令，返回 false 表示应答 400
    fn handle_command(&self, msg: &ManscdpMessage) -> bool {
        let device_id = msg.device_id.as_str();
        match msg.cmd_type.as_str() {
            "Keepalive" => {
                let online = self
                    .devices
                    .get_device(device_id)
                    .map(|d| d.online)
                    .unwrap_or(false);
                if !online {
                    tracing::warn!(target: "gb28181::sip", device_id = %device_id, "Keepalive from unknown or offline device");
                    return false;
                }
                self.devices.update_heartbeat(device_id);
                tracing::debug!(target: "gb28181::sip", device_id = %device_id, "Keepalive");
            }
            // SensorCatalog 为宇视扩展，格式与 Catalog 相同
            "Catalog" | "SensorCatalog" => {
                let channels = msg.channels();
                tracing::info!(
                    target: "gb28181::sip",
                    device_id = %device_id,
                    sum_num = msg.sum_num(),
                    count = channels.len(),
                    "Catalog"
                );
                if let Err(e) = self.devices.update_channels(device_id, channels) {
                    tracing::warn!(target: "gb28181::sip", device_id = %device_id, error = %e, "Failed to update channels");
                }
            }
            "ConfigDownload" => {
                if let Some(param) = &msg.basic_param {
                    self.devices.update_device_config(
                        device_id,
                        param.heartbeat_interval(),
                        param.heartbeat_count(),
                    );
                }
            }
            "DeviceInfo" => {
                self.devices.update_device_info(
                    device_id,
                    &msg.device_name,
                    &msg.manufacturer,
                    &msg.model,
                    &msg.firmware,
                );
                tracing::info!(
                    target: "gb28181::sip",
                    device_id = %device_id,
                    manufacturer = %msg.manufacturer,
                    model = %msg.model,
                    "DeviceInfo"
                );
            }
            "Alarm" => {
                tracing::info!(
                    target: "gb28181::sip",
                    device_id = %device_id,
                    priority = %msg.alarm_priority,
                    method = %msg.alarm_method,
                    description = %msg.alarm_description,
                    "Alarm"
                );
            }
            // RecordInfo 响应中的 DeviceID 是被查询的通道
            "RecordInfo" => {
                let batch = RecordBatch {
                    sum_num: msg.sum_num(),
                    records: msg.records(),
                };
                if !self.engine.deliver_records(device_id, batch) {
                    tracing::debug!(target: "gb28181::sip", channel_id = %device_id, "No pending record query, dropped");
                }
            }
            other => {
                tracing::warn!(target: "gb28181::sip", cmd_type = %other, "Not supported CmdType");
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, req: SipRequest, sink: Arc<dyn ResponseSink>) {
        match req.method {
            SipMethod::Register => self.on_register(&req, &sink).await,
            SipMethod::Message => self.on_message(&req, &sink).await,
            SipMethod::Notify => {
                tracing::info!(target: "gb28181::sip", "Received NOTIFY request");
                respond(&sink, response_from_request(&req, 200, "OK")).await;
            }
            SipMethod::Bye => {
                let call_id = req.call_id().unwrap_or_default();
                if self.engine.on_remote_bye(call_id) {
                    tracing::info!(target: "gb28181::sip", call_id = %call_id, "Session closed by device");
                }
                respond(&sink, response_from_request(&req, 200, "OK")).await;
            }
            SipMethod::Ack => {}
            _ => {
                tracing::warn!(target: "gb28181::sip", method = %req.method, "Unsupported SIP method");
                respond(&sink, response_from_request(&req, 405, "Method Not Allowed")).await;
            }
        }
    }
}
