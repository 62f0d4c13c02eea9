use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::Settings;

struct TelemetryState {
    enabled: bool,
    dir: PathBuf,
}

static TELEMETRY: Lazy<std::sync::RwLock<TelemetryState>> = Lazy::new(|| {
    std::sync::RwLock::new(TelemetryState {
        enabled: false,
        dir: PathBuf::from("logs"),
    })
});

/**
 * \brief 按应用配置初始化日志开关与目录。
 */
pub fn init(settings: &Settings) {
    if let Ok(mut guard) = TELEMETRY.write() {
        guard.enabled = settings.telemetry_enabled;
        guard.dir = settings.log_dir.clone();
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY.read().map(|g| g.enabled).unwrap_or(false)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = TELEMETRY
        .read()
        .map(|g| g.dir.clone())
        .unwrap_or_else(|_| PathBuf::from("logs"));
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("abapgen.log"))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}
