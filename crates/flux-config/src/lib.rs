pub mod gateway;
pub mod loader;

pub use gateway::{AuthSection, CommonConfig, GatewayConfig, MediaServerConfig, SipConfig};
pub use loader::{ConfigLoader, GATEWAY_CONFIG_FILE};
