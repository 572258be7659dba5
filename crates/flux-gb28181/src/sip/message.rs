// SIP 消息解析和生成
// 支持 GB28181 使用的请求/响应格式，头部保持原始顺序，按名称大小写不敏感查找

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

use crate::model::Transport;
use crate::{Gb28181Error, Result};

pub const SIP_VERSION: &str = "SIP/2.0";

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
    Other(String),
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Options => "OPTIONS",
            SipMethod::Other(m) => m.as_str(),
        };
        f.write_str(s)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Self {
        match s {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "MESSAGE" => SipMethod::Message,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "INFO" => SipMethod::Info,
            "OPTIONS" => SipMethod::Options,
            other => SipMethod::Other(other.to_string()),
        }
    }
}

/// 紧凑头部名展开
fn canonical_name(name: &str) -> &str {
    match name {
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "i" | "I" => "Call-ID",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "m" | "M" => "Contact",
        "s" | "S" => "Subject",
        "k" | "K" => "Supported",
        _ => name,
    }
}

/// 有序头部列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 第一个同名头部
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 追加
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换第一个同名头部，不存在时追加，多余的同名头部删除
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.0.retain_mut(|(k, v)| {
            if !k.eq_ignore_ascii_case(name) {
                return true;
            }
            if replaced {
                return false;
            }
            *v = value.clone();
            replaced = true;
            true
        });
        if !replaced {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,

    /// 对端地址：入站为来源，出站为目的地
    pub remote: Option<SocketAddr>,

    /// 入站为到达的传输方式，出站为发送使用的传输方式
    pub transport: Transport,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            remote: None,
            transport: Transport::Udp,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq 序号
    pub fn cseq(&self) -> Option<u32> {
        self.headers.get("CSeq").and_then(parse_cseq)
    }

    /// 顶层 Via 的 branch
    pub fn branch(&self) -> Option<&str> {
        self.headers.get("Via").and_then(|v| header_param(v, "branch"))
    }

    /// From 中的用户部分（设备 ID）
    pub fn from_user(&self) -> Option<&str> {
        self.headers.get("From").and_then(uri_user)
    }

    pub fn to_user(&self) -> Option<&str> {
        self.headers.get("To").and_then(uri_user)
    }

    /// 对端地址字符串 ip:port
    pub fn remote_addr(&self) -> String {
        self.remote.map(|s| s.to_string()).unwrap_or_default()
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} {}", self.method, self.uri, self.version);
        encode(&start, &self.headers, &self.body)
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: SIP_VERSION.to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.get("Via").and_then(|v| header_param(v, "branch"))
    }

    /// 1xx 临时响应
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} {}", self.version, self.status_code, self.reason_phrase);
        encode(&start, &self.headers, &self.body)
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// 入站报文
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 解析一条完整报文
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head_end, body_start) = find_head_end(data)
            .ok_or_else(|| Gb28181Error::SipParse("missing header terminator".to_string()))?;

        let head = String::from_utf8_lossy(&data[..head_end]);
        let mut lines = head.lines();
        let start_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Gb28181Error::SipParse("empty SIP message".to_string()))?
            .to_string();

        let mut headers = Headers::new();
        let mut last: Option<(String, String)> = None;
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // 折行
                if let Some((_, value)) = last.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((k, v)) = last.take() {
                headers.add(k, v);
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = canonical_name(name.trim()).to_string();
                last = Some((name, value.trim().to_string()));
            }
        }
        if let Some((k, v)) = last.take() {
            headers.add(k, v);
        }

        let rest = &data[body_start..];
        let body = match headers.get("Content-Length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| Gb28181Error::SipParse(format!("invalid Content-Length: {}", len)))?;
                if len > rest.len() {
                    return Err(Gb28181Error::SipParse(format!(
                        "truncated body: expected {} bytes, got {}",
                        len,
                        rest.len()
                    )));
                }
                Bytes::copy_from_slice(&rest[..len])
            }
            None => Bytes::copy_from_slice(rest),
        };

        if start_line.starts_with("SIP/") {
            let mut parts = start_line.splitn(3, ' ');
            let version = parts.next().unwrap_or(SIP_VERSION).to_string();
            let status_code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| Gb28181Error::SipParse(format!("invalid status line: {}", start_line)))?;
            let reason_phrase = parts.next().unwrap_or_default().to_string();
            return Ok(SipMessage::Response(SipResponse {
                version,
                status_code,
                reason_phrase,
                headers,
                body,
            }));
        }

        let parts: Vec<&str> = start_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Gb28181Error::SipParse(format!("invalid request line: {}", start_line)));
        }

        Ok(SipMessage::Request(SipRequest {
            method: SipMethod::parse(parts[0]),
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
            body,
            remote: None,
            transport: Transport::Udp,
        }))
    }
}

/// 流式传输中第一条完整报文的长度，不完整时返回 None
///
/// Content-Length 溢出或报文总长超过 `max_len` 时返回错误，调用方应关闭连接。
pub fn frame_len(buf: &[u8], max_len: usize) -> Result<Option<usize>> {
    let Some((head_end, body_start)) = find_head_end(buf) else {
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let content_length = head
        .lines()
        .skip(1)
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| {
            let k = k.trim();
            k.eq_ignore_ascii_case("Content-Length") || k == "l" || k == "L"
        })
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let total = body_start
        .checked_add(content_length)
        .filter(|total| *total <= max_len)
        .ok_or_else(|| {
            Gb28181Error::SipParse(format!("Content-Length {} exceeds limit", content_length))
        })?;
    Ok((buf.len() >= total).then_some(total))
}

/// 返回 (头部结束位置, 消息体起始位置)
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

fn encode(start: &str, headers: &Headers, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(512 + body.len());
    buf.put_slice(start.as_bytes());
    buf.put_slice(b"\r\n");
    for (k, v) in headers.iter() {
        if k.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        buf.put_slice(k.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(v.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// 解析 "1 REGISTER" 中的序号
pub fn parse_cseq(value: &str) -> Option<u32> {
    value.split_whitespace().next()?.parse().ok()
}

/// 头部参数，如 Via 的 branch、From 的 tag
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// 从 From/To/Contact 或 Request-URI 中取出用户部分
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:").map(|p| p + 4)?;
    let rest = &value[start..];
    let end = rest.find('@')?;
    let user = &rest[..end];
    (!user.is_empty()).then_some(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.100:5060;rport;branch=z9hG4bK123456\r\n\
From: <sip:34020000001320000001@3402000000>;tag=abcdef\r\n\
To: <sip:34020000001320000001@3402000000>\r\n\
Call-ID: 123456789@192.168.1.100\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:34020000001320000001@192.168.1.100:5060>\r\n\
Max-Forwards: 70\r\n\
Expires: 3600\r\n\
Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let SipMessage::Request(req) = SipMessage::parse(REGISTER.as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.uri, "sip:34020000002000000001@3402000000");
        assert_eq!(req.header("expires"), Some("3600"));
        assert_eq!(req.call_id(), Some("123456789@192.168.1.100"));
        assert_eq!(req.cseq(), Some(1));
        assert_eq!(req.branch(), Some("z9hG4bK123456"));
        assert_eq!(req.from_user(), Some("34020000001320000001"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_parse_response_with_body() {
        let raw = "SIP/2.0 200 OK\r\n\
v: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc\r\n\
i: call-1\r\n\
CSeq: 20 INVITE\r\n\
c: application/sdp\r\n\
l: 5\r\n\r\nv=0\r\nEXTRA";
        let SipMessage::Response(res) = SipMessage::parse(raw.as_bytes()).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(res.status_code, 200);
        assert_eq!(res.reason_phrase, "OK");
        assert_eq!(res.call_id(), Some("call-1"));
        assert_eq!(res.branch(), Some("z9hG4bKabc"));
        assert_eq!(res.header("CSeq"), Some("20 INVITE"));
        assert_eq!(res.header("Content-Type"), Some("application/sdp"));
        assert_eq!(&res.body[..], b"v=0\r\n");
        assert!(res.is_success());
    }

    #[test]
    fn test_parse_errors() {
        assert!(SipMessage::parse(b"").is_err());
        assert!(SipMessage::parse(b"garbage without terminator").is_err());
        assert!(SipMessage::parse(b"INVITE\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"SIP/2.0 abc OK\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\nabc").is_err());
    }

    #[test]
    fn test_unknown_method() {
        let raw = "PUBLISH sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let SipMessage::Request(req) = SipMessage::parse(raw.as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.method, SipMethod::Other("PUBLISH".to_string()));
        assert_eq!(req.method.to_string(), "PUBLISH");
    }

    #[test]
    fn test_encode_keeps_order_and_length() {
        let mut req = SipRequest::new(SipMethod::Message, "sip:34020000001320000001@3402000000");
        req.headers.add("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1");
        req.headers.add("Content-Length", "999");
        req.headers.add("Call-ID", "c1");
        req.set_body("Application/MANSCDP+xml", "<Query/>");

        let text = req.to_string();
        assert!(text.starts_with("MESSAGE sip:34020000001320000001@3402000000 SIP/2.0\r\n"));
        assert!(text.find("Via:").unwrap() < text.find("Call-ID:").unwrap());
        assert!(text.contains("Content-Length: 8\r\n\r\n<Query/>"));
        assert!(!text.contains("999"));

        let SipMessage::Request(back) = SipMessage::parse(text.as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(&back.body[..], b"<Query/>");
    }

    #[test]
    fn test_headers_set_and_remove() {
        let mut headers = Headers::new();
        headers.add("Via", "a");
        headers.add("via", "b");
        assert_eq!(headers.get_all("VIA").count(), 2);

        headers.set("Via", "c");
        assert_eq!(headers.get_all("Via").collect::<Vec<_>>(), vec!["c"]);

        headers.set("Expires", "3600");
        assert_eq!(headers.get("expires"), Some("3600"));

        headers.remove("VIA");
        assert!(!headers.contains("Via"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_frame_len() {
        let msg = "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let mut stream = msg.as_bytes().to_vec();
        stream.extend_from_slice(b"MESSAGE sip:a@b SIP/2.0\r\n");

        assert_eq!(frame_len(&stream, 1024).unwrap(), Some(msg.len()));
        assert_eq!(frame_len(&msg.as_bytes()[..msg.len() - 1], 1024).unwrap(), None);
        assert_eq!(frame_len(b"MESSAGE sip:a@b SIP/2.0\r\n", 1024).unwrap(), None);
    }

    #[test]
    fn test_frame_len_rejects_oversized_content_length() {
        let head = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(matches!(
            frame_len(head, usize::MAX),
            Err(Gb28181Error::SipParse(_))
        ));

        let head = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 4096\r\n\r\n";
        assert!(frame_len(head, 1024).is_err());
        assert_eq!(frame_len(head, 8192).unwrap(), None);
    }

    #[test]
    fn test_uri_helpers() {
        assert_eq!(
            uri_user("<sip:34020000001320000001@3402000000>;tag=1"),
            Some("34020000001320000001")
        );
        assert_eq!(uri_user("sip:34020000002000000001@10.0.0.1:5060"), Some("34020000002000000001"));
        assert_eq!(uri_user("<sip:10.0.0.1>"), None);
        assert_eq!(header_param("<sip:a@b>;tag=xyz", "tag"), Some("xyz"));
        assert_eq!(header_param("<sip:a@b>", "tag"), None);
        assert_eq!(parse_cseq("42 BYE"), Some(42));
        assert_eq!(parse_cseq("x BYE"), None);
    }
}
