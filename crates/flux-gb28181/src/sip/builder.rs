// SIP 请求/响应构造
// 出站请求统一使用 20 位国标编码作为 From/To，响应按请求复制事务相关头部

use chrono::Local;
use std::net::SocketAddr;

use super::message::{header_param, SipMethod, SipRequest, SipResponse};
use crate::model::Transport;
use crate::utils::{generate_branch, generate_tag, is_valid_id};
use crate::{Gb28181Error, Result};

/// REGISTER 响应中的有效期
pub const REGISTER_EXPIRES: u32 = 3600;

/// REGISTER 响应 Date 头格式
pub const DATE_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub const CONTENT_TYPE_SDP: &str = "application/sdp";
pub const CONTENT_TYPE_MANSRTSP: &str = "Application/MANSRTSP";

/// 本端信令地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    /// 平台 SIP 编码
    pub serial: String,
    pub realm: String,
    /// 对外通告的 IP
    pub host: String,
    pub port: u16,
}

impl LocalEndpoint {
    pub fn via(&self, transport: Transport) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            transport,
            self.host,
            self.port,
            generate_branch()
        )
    }

    pub fn contact(&self) -> String {
        format!("<sip:{}@{}:{}>", self.serial, self.host, self.port)
    }
}

/// 出站请求参数
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub transport: Transport,
    /// 目的地址 ip:port
    pub destination: String,
    /// 本端编码
    pub from: String,
    /// 对端编码
    pub to: String,
}

/// 国标编码对应的 SIP URI，域取编码前 10 位
pub fn gb_uri(id: &str) -> String {
    let domain = id.get(..10).unwrap_or(id);
    format!("sip:{}@{}", id, domain)
}

fn new_request(
    method: SipMethod,
    conf: &OutboundConfig,
    local: &LocalEndpoint,
) -> Result<SipRequest> {
    if !is_valid_id(&conf.from) || !is_valid_id(&conf.to) {
        return Err(Gb28181Error::InvalidId(format!(
            "From or To is not a 20 digit ID: {} -> {}",
            conf.from, conf.to
        )));
    }

    let destination: SocketAddr = conf.destination.parse().map_err(|_| {
        Gb28181Error::SipTransaction(format!("invalid destination: {:?}", conf.destination))
    })?;

    let to_uri = gb_uri(&conf.to);
    let mut req = SipRequest::new(method.clone(), to_uri.clone());
    req.headers.add("Via", local.via(conf.transport));
    req.headers.add(
        "From",
        format!("<{}>;tag={}", gb_uri(&conf.from), generate_tag(16)),
    );
    req.headers.add("To", format!("<{}>", to_uri));
    req.headers.add("Call-ID", generate_tag(32));
    req.headers.add("CSeq", format!("1 {}", method));
    req.headers.add("Contact", local.contact());
    req.headers.add("Max-Forwards", "70");
    req.remote = Some(destination);
    req.transport = conf.transport;

    Ok(req)
}

/// INVITE，Subject 为 "通道:SSRC,平台:0"
pub fn invite_request(
    sdp: &str,
    subject: &str,
    conf: &OutboundConfig,
    local: &LocalEndpoint,
) -> Result<SipRequest> {
    let mut req = new_request(SipMethod::Invite, conf, local)?;
    req.headers.add("Subject", subject);
    req.set_body(CONTENT_TYPE_SDP, sdp.to_string());
    Ok(req)
}

/// MESSAGE，携带 MANSCDP XML
pub fn message_request(
    xml: &str,
    conf: &OutboundConfig,
    local: &LocalEndpoint,
) -> Result<SipRequest> {
    let mut req = new_request(SipMethod::Message, conf, local)?;
    req.set_body(crate::manscdp::CONTENT_TYPE, xml.to_string());
    Ok(req)
}

/// 响应中 Contact 的 URI，没有时沿用原请求 URI
fn remote_target(invite: &SipRequest, answer: &SipResponse) -> String {
    answer
        .header("Contact")
        .and_then(|c| {
            let start = c.find('<')? + 1;
            let end = c[start..].find('>')? + start;
            Some(c[start..end].to_string())
        })
        .unwrap_or_else(|| invite.uri.clone())
}

/// 对 INVITE 2xx 的 ACK
pub fn ack_request(invite: &SipRequest, answer: &SipResponse, local: &LocalEndpoint) -> SipRequest {
    let cseq = invite.cseq().unwrap_or(1);
    dialog_request(SipMethod::Ack, invite, answer, cseq, local)
}

/// 会话内请求（BYE/INFO），复用 INVITE 对话的 From/To/Call-ID
pub fn dialog_request(
    method: SipMethod,
    invite: &SipRequest,
    answer: &SipResponse,
    cseq: u32,
    local: &LocalEndpoint,
) -> SipRequest {
    let mut req = SipRequest::new(method.clone(), remote_target(invite, answer));
    req.headers.add("Via", local.via(invite.transport));
    if let Some(from) = invite.header("From") {
        req.headers.add("From", from);
    }
    if let Some(to) = answer.header("To").or_else(|| invite.header("To")) {
        req.headers.add("To", to);
    }
    if let Some(call_id) = invite.call_id() {
        req.headers.add("Call-ID", call_id);
    }
    req.headers.add("CSeq", format!("{} {}", cseq, method));
    req.headers.add("Contact", local.contact());
    req.headers.add("Max-Forwards", "70");
    req.remote = invite.remote;
    req.transport = invite.transport;
    req
}

/// MANSRTSP 暂停
pub fn mansrtsp_pause(cseq: u32) -> String {
    format!("PAUSE RTSP/1.0\r\nCSeq: {}\r\nPauseTime: now\r\n", cseq)
}

/// MANSRTSP 恢复播放
pub fn mansrtsp_resume(cseq: u32) -> String {
    format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nRange: npt=now\r\n", cseq)
}

/// MANSRTSP 倍速
pub fn mansrtsp_speed(cseq: u32, speed: f32) -> String {
    format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nScale: {:.1}\r\n", cseq, speed)
}

/// 按请求生成响应，To 没有 tag 时补一个 10 位 tag
pub fn response_from_request(req: &SipRequest, code: u16, reason: &str) -> SipResponse {
    let mut res = SipResponse::new(code, reason);
    for via in req.headers.get_all("Via") {
        res.headers.add("Via", via);
    }
    if let Some(from) = req.header("From") {
        res.headers.add("From", from);
    }
    if let Some(to) = req.header("To") {
        if header_param(to, "tag").is_some() {
            res.headers.add("To", to);
        } else {
            res.headers.add("To", format!("{};tag={}", to, generate_tag(10)));
        }
    }
    if let Some(call_id) = req.call_id() {
        res.headers.add("Call-ID", call_id);
    }
    if let Some(cseq) = req.header("CSeq") {
        res.headers.add("CSeq", cseq);
    }
    res
}

/// REGISTER 响应，附带 Expires 与 Date
pub fn register_response(req: &SipRequest, code: u16, reason: &str) -> SipResponse {
    let mut res = response_from_request(req, code, reason);
    res.headers.add("Expires", REGISTER_EXPIRES.to_string());
    res.headers.add("Date", Local::now().format(DATE_LAYOUT).to_string());
    res
}

/// 401 鉴权挑战
pub fn unauthorized_response(req: &SipRequest, realm: &str, nonce: &str) -> SipResponse {
    let mut res = response_from_request(req, 401, "Unauthorized");
    res.headers.add(
        "WWW-Authenticate",
        format!(r#"Digest realm="{}",nonce="{}",algorithm=MD5"#, realm, nonce),
    );
    res
}
