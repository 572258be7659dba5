use anyhow::{Context, Result};
use clap::Parser;
use flux_config::{ConfigLoader, GatewayConfig, MediaServerConfig};
use flux_gb28181::{AuthConfig, Gb28181Config, Gb28181Server, InMemoryDirectory, MediaServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod logging;

/// 未显式配置媒体服务器时，CANDIDATE 对应的 SRS HTTP API 端口
const CANDIDATE_SRS_PORT: u16 = 1985;

#[derive(Parser, Debug)]
#[command(author, version, about = "GB28181 signaling gateway")]
struct Args {
    /// 配置文件，缺省读取 ./config/gateway.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖 SIP 监听端口
    #[arg(long)]
    sip_port: Option<u16>,

    /// 覆盖日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 打印生效配置后退出
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::from_file(path)?,
        None => ConfigLoader::new("./config").load_gateway()?,
    };

    if let Some(port) = args.sip_port {
        config.gb28181.port = port;
    }
    if let Some(level) = &args.log_level {
        config.common.log_level = level.clone();
    }
    apply_candidate(&mut config, std::env::var("CANDIDATE").ok());

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// CANDIDATE 为本机对外 IP：作为 Via/Contact 地址，并在没有媒体服务器时生成默认 SRS
fn apply_candidate(config: &mut GatewayConfig, candidate: Option<String>) {
    let Some(ip) = candidate.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()) else {
        return;
    };

    if config.gb28181.advertised_host.is_empty() {
        config.gb28181.advertised_host = ip.clone();
    }
    if config.media_servers.is_empty() {
        config.media_servers.push(MediaServerConfig {
            id: 1,
            name: "Default".to_string(),
            server_type: "SRS".to_string(),
            ip,
            port: CANDIDATE_SRS_PORT,
            username: String::new(),
            password: String::new(),
            secret: String::new(),
            is_default: true,
        });
    }
}

fn server_config(config: &GatewayConfig) -> Gb28181Config {
    let sip = &config.gb28181;
    Gb28181Config {
        serial: sip.serial.clone(),
        realm: sip.realm.clone(),
        host: sip.host.clone(),
        port: sip.port,
        advertised_host: sip.advertised_host.clone(),
        transaction_timeout: Duration::from_secs(sip.transaction_timeout_secs),
        record_query_timeout: Duration::from_secs(sip.record_query_timeout_secs),
        heartbeat_check_interval: Duration::from_secs(sip.heartbeat_check_interval_secs),
        auth: AuthConfig {
            enable: sip.auth.enable,
            password: sip.auth.password.clone(),
            per_device: sip.auth.per_device.clone(),
        },
    }
}

/// 只有一台媒体服务器且未标记默认时，把它当作默认
fn media_directory(servers: &[MediaServerConfig]) -> InMemoryDirectory {
    let single = servers.len() == 1;
    InMemoryDirectory::new(servers.iter().map(|s| MediaServer {
        id: s.id,
        name: s.name.clone(),
        server_type: s.server_type.clone(),
        ip: s.ip.clone(),
        port: s.port,
        username: s.username.clone(),
        password: s.password.clone(),
        secret: s.secret.clone(),
        is_default: s.is_default || single,
    }))
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    Ok("Ctrl+C")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let _log_guard = logging::init(&config.common)?;

    let directory = Arc::new(media_directory(&config.media_servers));
    if config.media_servers.is_empty() {
        tracing::warn!(target: "gb28181d", "No media server configured, invite will fail");
    }

    let server = Gb28181Server::start(server_config(&config), directory)
        .await
        .context("Failed to start GB28181 gateway")?;

    tracing::info!(
        target: "gb28181d",
        addr = %server.local_addr(),
        media_servers = config.media_servers.len(),
        "flux-gb28181d running"
    );

    let signal = wait_for_shutdown().await?;
    tracing::info!(target: "gb28181d", signal, "Shutting down");

    server.shutdown().await;
    Ok(())
}
