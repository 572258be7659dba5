use thiserror::Error;

use crate::model::Record;

#[derive(Error, Debug)]
pub enum Gb28181Error {
    #[error("Invalid GB28181 ID: {0}")]
    InvalidId(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device offline: {0}")]
    DeviceOffline(String),

    #[error("No parser found for manufacturer: {0} and common parser is not available")]
    NoParser(String),

    #[error("Failed to parse channels: {0}")]
    ParseChannels(String),

    #[error("Invalid ptz command: {0:?}")]
    InvalidCommand(String),

    #[error("Stream not found: {0}")]
    SessionNotFound(String),

    #[error("Media server error: {0}")]
    MediaServer(String),

    #[error("SIP transaction error: {0}")]
    SipTransaction(String),

    #[error("SIP transaction timeout: {0}")]
    SipTimeout(String),

    #[error("SIP parse error: {0}")]
    SipParse(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Record query already in progress for channel {0}")]
    RecordQueryInProgress(String),

    #[error("Record query timeout for channel {channel_id}, received {} records", records.len())]
    RecordQueryTimeout {
        channel_id: String,
        records: Vec<Record>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl Gb28181Error {
    /// 是否为“找不到”类错误（设备/通道/会话）
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Gb28181Error::DeviceNotFound(_) | Gb28181Error::SessionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Gb28181Error>;
