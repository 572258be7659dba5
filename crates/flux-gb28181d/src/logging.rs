use anyhow::{Context, Result};
use flux_config::CommonConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// `RUST_LOG` 优先于配置中的 log_level；配置了 log_file 时写入文件（非阻塞）。
/// 返回的 guard 需要持有到进程退出，否则缓冲中的日志会丢失。
pub fn init(common: &CommonConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&common.log_level))
        .context("Invalid log level")?;

    if common.log_file.is_empty() {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if common.log_json {
            builder.json().init();
        } else {
            builder.init();
        }
        return Ok(None);
    }

    let path = Path::new(&common.log_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file: {}", common.log_file))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false);
    if common.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(Some(guard))
}
