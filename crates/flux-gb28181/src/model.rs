// GB28181 数据模型
// 通道、录像记录以及对外暴露的请求结构

use serde::{Deserialize, Serialize};
use std::fmt;

/// SIP 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl Transport {
    /// 从 Via 头中的传输字段解析，如 "SIP/2.0/TCP"
    pub fn from_via(via: &str) -> Self {
        let proto = via.split_whitespace().next().unwrap_or_default();
        if proto.to_ascii_uppercase().ends_with("/TCP") {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "UDP"),
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// 通道/会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelStatus {
    #[serde(rename = "ON")]
    On,
    #[default]
    #[serde(rename = "OFF")]
    Off,
}

impl ChannelStatus {
    /// 设备上报的状态字符串，"ON"/"ONLINE"/"OK" 视为在线
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "ONLINE" | "OK" => ChannelStatus::On,
            _ => ChannelStatus::Off,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::On => write!(f, "ON"),
            ChannelStatus::Off => write!(f, "OFF"),
        }
    }
}

/// 通道附加信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelExtra {
    pub ptz_type: i32,
    pub resolution: String,
    /// 下载倍速档位，如 1/2/4/8
    pub download_speed: String,
}

/// 设备下的一个通道
///
/// 通道只记录父设备 ID，不持有设备对象，设备归属通过反查得到。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub parent_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    /// 是否有子设备，部分厂商用它区分叶子通道
    pub parental: i32,
    pub safety_way: i32,
    pub register_way: i32,
    pub secrecy: i32,
    pub ip_address: String,
    pub port: u16,
    pub status: ChannelStatus,
    pub longitude: f64,
    pub latitude: f64,
    pub info: ChannelExtra,
    /// 点播时由网关分配
    pub ssrc: String,
}

impl Channel {
    /// 设备自身对应的伪通道
    pub fn for_device(device_id: &str) -> Self {
        Self {
            channel_id: device_id.to_string(),
            parent_id: device_id.to_string(),
            name: device_id.to_string(),
            status: ChannelStatus::On,
            ..Default::default()
        }
    }
}

/// 录像记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub device_id: String,
    pub name: String,
    pub file_path: String,
    pub address: String,
    pub start_time: String,
    pub end_time: String,
    pub secrecy: i32,
    #[serde(rename = "type")]
    pub record_type: String,
}

/// 点播类型
pub mod play_type {
    pub const LIVE: u8 = 0;
    pub const PLAYBACK: u8 = 1;
    pub const DOWNLOAD: u8 = 2;
    pub const TALK: u8 = 3;
}

/// 点播请求
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRequest {
    pub device_id: String,
    pub channel_id: String,
    pub media_server_id: i64,
    /// 0 实时 1 回放 2 下载
    pub play_type: u8,
    pub sub_stream: i32,
    pub start_time: i64,
    pub end_time: i64,
}

impl InviteRequest {
    /// 会话去重键：媒体服务、设备、通道、码流、类型、时间段全部相同才复用
    pub fn session_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.media_server_id,
            self.device_id,
            self.channel_id,
            self.sub_stream,
            self.play_type,
            self.start_time,
            self.end_time
        )
    }

    pub fn is_live(&self) -> bool {
        self.play_type == play_type::LIVE
    }
}
