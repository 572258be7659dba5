// GB28181 网关
// 组装传输层、设备管理、出站引擎与入站分发，并负责启停

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Gb28181Config;
use crate::device::DeviceRegistry;
use crate::dispatcher::Dispatcher;
use crate::engine::OutboundEngine;
use crate::media::MediaServerDirectory;
use crate::parser::ParserRegistry;
use crate::sip::builder::LocalEndpoint;
use crate::sip::transport::SipTransport;
use crate::{Gb28181Error, Result};

/// GB28181 信令网关
pub struct Gb28181Server {
    config: Gb28181Config,
    transport: Arc<SipTransport>,
    devices: Arc<DeviceRegistry>,
    engine: Arc<OutboundEngine>,
}

impl Gb28181Server {
    /// 使用内置厂商解析器启动
    pub async fn start(config: Gb28181Config, directory: Arc<dyn MediaServerDirectory>) -> Result<Self> {
        Self::start_with_parsers(config, directory, Arc::new(ParserRegistry::with_builtin())).await
    }

    pub async fn start_with_parsers(
        config: Gb28181Config,
        directory: Arc<dyn MediaServerDirectory>,
        parsers: Arc<ParserRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let bind_addr: SocketAddr = config
            .bind_addr()
            .parse()
            .map_err(|e| Gb28181Error::Config(format!("invalid bind address {}: {}", config.bind_addr(), e)))?;
        let transport = SipTransport::bind(bind_addr, config.transaction_timeout).await?;
        let local_addr = transport.local_addr();

        let host = if !config.advertised_host.is_empty() {
            config.advertised_host.clone()
        } else if local_addr.ip().is_unspecified() {
            tracing::warn!(
                target: "gb28181::sip",
                addr = %local_addr,
                "No advertised host configured, using 127.0.0.1 in Via/Contact"
            );
            "127.0.0.1".to_string()
        } else {
            local_addr.ip().to_string()
        };
        let local = LocalEndpoint {
            serial: config.serial.clone(),
            realm: config.realm.clone(),
            host,
            port: local_addr.port(),
        };

        let devices = Arc::new(DeviceRegistry::new(parsers));
        let engine = Arc::new(
            OutboundEngine::new(transport.clone(), Arc::clone(&devices), directory, local)
                .with_record_timeout(config.record_query_timeout),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&devices),
            Arc::clone(&engine),
            config.realm.clone(),
            config.auth.clone(),
        ));

        transport.start(dispatcher)?;
        devices.start_heartbeat_checker(config.heartbeat_check_interval);

        tracing::info!(
            target: "gb28181::sip",
            serial = %config.serial,
            realm = %config.realm,
            addr = %local_addr,
            auth = config.auth.enable,
            "GB28181 gateway started"
        );

        Ok(Self {
            config,
            transport,
            devices,
            engine,
        })
    }

    pub fn config(&self) -> &Gb28181Config {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn engine(&self) -> &Arc<OutboundEngine> {
        &self.engine
    }

    /// 取消等待中的出站操作，停止心跳检查并释放监听端口
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.devices.stop_heartbeat_checker();
        self.transport.shutdown().await;
        tracing::info!(target: "gb28181::sip", "GB28181 gateway stopped");
    }
}
