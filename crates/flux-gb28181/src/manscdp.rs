// MANSCDP XML 消息
// 设备上报消息的解码（支持 GB2312/GBK 等字符集）以及下发查询/控制消息的生成

use chrono::{Local, TimeZone};
use encoding_rs::{Encoding, UTF_8};
use quick_xml::de::from_str;
use serde::Deserialize;

use crate::model::{Channel, ChannelExtra, ChannelStatus, Record};
use crate::{Gb28181Error, Result};

/// MANSCDP 消息体的 Content-Type
pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// 设备上报的 MANSCDP 消息（Notify/Response 根节点）
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpMessage {
    /// 命令类型
    #[serde(default)]
    pub cmd_type: String,

    #[serde(rename = "SN", default)]
    pub sn: String,

    /// 设备 ID，RecordInfo 响应中为通道 ID
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    /// 总条数（Catalog/RecordInfo 分包时表示全部条数）
    #[serde(default)]
    pub sum_num: String,

    #[serde(default)]
    pub device_list: Option<ItemList<CatalogItem>>,

    #[serde(default)]
    pub record_list: Option<ItemList<RecordItem>>,

    /// ConfigDownload 响应中的基本参数
    #[serde(default)]
    pub basic_param: Option<BasicParam>,

    // DeviceInfo 响应
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub result: String,

    /// Keepalive 中的状态
    #[serde(default)]
    pub status: String,

    // Alarm 通知
    #[serde(default)]
    pub alarm_priority: String,
    #[serde(default)]
    pub alarm_method: String,
    #[serde(default)]
    pub alarm_description: String,
}

/// 带 Num 属性的列表节点
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ItemList<T> {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<T>,
}

/// 目录项
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItem {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub civil_code: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub parental: String,
    #[serde(rename = "ParentID", default)]
    pub parent_id: String,
    #[serde(default)]
    pub safety_way: String,
    #[serde(default)]
    pub register_way: String,
    #[serde(default)]
    pub secrecy: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub longitude: String,
    #[serde(default)]
    pub latitude: String,
    #[serde(default)]
    pub info: Option<CatalogItemInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItemInfo {
    #[serde(rename = "PTZType", default)]
    pub ptz_type: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub download_speed: String,
}

/// 录像项
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RecordItem {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub secrecy: String,
    #[serde(default)]
    pub r#type: String,
}

/// 设备基本参数
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BasicParam {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expiration: String,
    #[serde(default)]
    pub heart_beat_interval: String,
    #[serde(default)]
    pub heart_beat_count: String,
}

impl BasicParam {
    /// 心跳间隔（秒），缺失或非法时为 0
    pub fn heartbeat_interval(&self) -> u64 {
        parse_or_default(&self.heart_beat_interval)
    }

    /// 心跳超时次数，缺失或非法时为 0
    pub fn heartbeat_count(&self) -> u32 {
        parse_or_default(&self.heart_beat_count)
    }
}

fn parse_or_default<T: std::str::FromStr + Default>(s: &str) -> T {
    s.trim().parse().unwrap_or_default()
}

impl ManscdpMessage {
    pub fn sn(&self) -> u32 {
        parse_or_default(&self.sn)
    }

    pub fn sum_num(&self) -> usize {
        parse_or_default(&self.sum_num)
    }

    /// 目录项转换为通道
    pub fn channels(&self) -> Vec<Channel> {
        self.device_list
            .as_ref()
            .map(|list| list.items.iter().map(CatalogItem::to_channel).collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.record_list
            .as_ref()
            .map(|list| list.items.iter().map(RecordItem::to_record).collect())
            .unwrap_or_default()
    }
}

impl CatalogItem {
    pub fn to_channel(&self) -> Channel {
        let info = self.info.clone().unwrap_or_default();
        Channel {
            channel_id: self.device_id.trim().to_string(),
            parent_id: self.parent_id.trim().to_string(),
            name: self.name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            owner: self.owner.clone(),
            civil_code: self.civil_code.clone(),
            address: self.address.clone(),
            parental: parse_or_default(&self.parental),
            safety_way: parse_or_default(&self.safety_way),
            register_way: parse_or_default(&self.register_way),
            secrecy: parse_or_default(&self.secrecy),
            ip_address: self.ip_address.clone(),
            port: parse_or_default(&self.port),
            status: ChannelStatus::parse(&self.status),
            longitude: parse_or_default(&self.longitude),
            latitude: parse_or_default(&self.latitude),
            info: ChannelExtra {
                ptz_type: parse_or_default(&info.ptz_type),
                resolution: info.resolution,
                download_speed: info.download_speed,
            },
            ssrc: String::new(),
        }
    }
}

impl RecordItem {
    pub fn to_record(&self) -> Record {
        Record {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            file_path: self.file_path.clone(),
            address: self.address.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            secrecy: parse_or_default(&self.secrecy),
            record_type: self.r#type.clone(),
        }
    }
}

/// 从 XML 声明中取出 encoding 标签
fn declared_encoding(body: &[u8]) -> Option<&'static Encoding> {
    let head_len = body.len().min(128);
    let head = String::from_utf8_lossy(&body[..head_len]);
    let decl_end = head.find("?>")?;
    let decl = &head[..decl_end];
    let pos = decl.find("encoding")?;
    let rest = decl[pos + "encoding".len()..].trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let label = rest[1..].split(quote).next()?;
    Encoding::for_label(label.trim().as_bytes())
}

/// 按声明的字符集解码消息体，未声明时按 UTF-8 处理
pub fn decode_body(body: &[u8]) -> String {
    let encoding = declared_encoding(body).unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

/// 解码设备上报的 MANSCDP 消息
pub fn decode(body: &[u8]) -> Result<ManscdpMessage> {
    let text = decode_body(body);
    let msg: ManscdpMessage = from_str(text.trim())
        .map_err(|e| Gb28181Error::Xml(format!("Failed to parse MANSCDP XML: {}", e)))?;

    if msg.cmd_type.is_empty() {
        return Err(Gb28181Error::Xml("missing CmdType".to_string()));
    }
    Ok(msg)
}

/// 目录查询
pub fn catalog_query(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
        sn, device_id
    )
}

/// 设备信息查询
pub fn device_info_query(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>DeviceInfo</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
        sn, device_id
    )
}

/// 设备配置查询（基本参数）
pub fn config_download(sn: u32, device_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>ConfigDownload</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<ConfigType>BasicParam</ConfigType>\r\n</Query>\r\n",
        sn, device_id
    )
}

/// 云台控制
pub fn ptz_control(sn: u32, channel_id: &str, ptz_cmd: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\r\n<Control>\r\n<CmdType>DeviceControl</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<PTZCmd>{}</PTZCmd>\r\n<Info>\r\n<ControlPriority>150</ControlPriority>\r\n</Info>\r\n</Control>\r\n",
        sn, channel_id, ptz_cmd
    )
}

/// 录像查询，开始时间取当天零点，结束时间精确到秒（本地时间）
pub fn record_info_query(sn: u32, channel_id: &str, start: i64, end: i64) -> Result<String> {
    let start = local_time(start)?.format("%Y-%m-%dT00:00:00");
    let end = local_time(end)?.format("%Y-%m-%dT%H:%M:%S");

    Ok(format!(
        "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>RecordInfo</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<StartTime>{}</StartTime>\r\n<EndTime>{}</EndTime>\r\n<Secrecy>0</Secrecy>\r\n<Type>all</Type>\r\n</Query>\r\n",
        sn, channel_id, start, end
    ))
}

fn local_time(ts: i64) -> Result<chrono::DateTime<Local>> {
    Local
        .timestamp_opt(ts, 0)
        .earliest()
        .ok_or_else(|| Gb28181Error::Xml(format!("invalid timestamp: {}", ts)))
}
