// flux-gb28181: GB28181 信令网关核心库
//
// - 设备注册、心跳与目录管理
// - 点播/回放对话，收流交给外部媒体服务器
// - 云台控制与录像查询

pub mod auth;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod manscdp;
pub mod media;
pub mod model;
pub mod parser;
pub mod ptz;
pub mod server;
pub mod session;
pub mod sip;
pub mod utils;

// 重新导出常用类型
pub use config::{AuthConfig, Gb28181Config};
pub use device::{Device, DeviceRegistry};
pub use engine::{OutboundEngine, RecordBatch};
pub use error::{Gb28181Error, Result};
pub use media::{InMemoryDirectory, MediaEngine, MediaServer, MediaServerDirectory};
pub use server::Gb28181Server;
pub use session::SessionInfo;
