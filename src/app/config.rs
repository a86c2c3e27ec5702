use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    pub adb_path: String,
    pub fastboot_path: String,
    pub python_path: String,
    pub mtk_client_path: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            fastboot_path: String::new(),
            python_path: String::new(),
            mtk_client_path: "mtk".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSettings {
    pub collect_timeout_secs: u64,
    pub quick_timeout_secs: u64,
    /// 0 disables the ceiling for streamed operations.
    pub stream_timeout_secs: u64,
    pub cancel_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            collect_timeout_secs: 300,
            quick_timeout_secs: 10,
            stream_timeout_secs: 0,
            cancel_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherSettings {
    pub tick_interval_ms: u64,
    pub channel_capacity: usize,
    pub max_messages_per_tick: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            channel_capacity: 1024,
            max_messages_per_tick: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SequenceSettings {
    pub halt_on_soft_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSettings {
    pub max_stdout_lines: usize,
    pub max_stderr_lines: usize,
    pub max_error_detail_lines: usize,
    pub max_potential_error_lines: usize,
    pub max_step_summary_chars: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            max_stdout_lines: 15,
            max_stderr_lines: 10,
            max_error_detail_lines: 20,
            max_potential_error_lines: 5,
            max_step_summary_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub sequence: SequenceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tools: ToolSettings::default(),
            timeouts: TimeoutSettings::default(),
            dispatcher: DispatcherSettings::default(),
            sequence: SequenceSettings::default(),
            logging: LoggingSettings::default(),
            report: ReportSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl EngineConfig {
    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.collect_timeout_secs)
    }

    pub fn quick_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.quick_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Option<Duration> {
        match self.timeouts.stream_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.cancel_grace_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.tick_interval_ms)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVPANEL_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    home_dir().join(".devpanel_config.json")
}

pub fn backup_config_path() -> PathBuf {
    home_dir().join(".devpanel_config.backup.json")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn load_config() -> Result<EngineConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &EngineConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, AppError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    let mut config: EngineConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &EngineConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

/// Older flat config files kept tool paths and the timeout at the top level.
fn apply_legacy_overrides(mut config: EngineConfig, value: &serde_json::Value) -> EngineConfig {
    if let Some(adb) = value.get("adb_path").and_then(|v| v.as_str()) {
        config.tools.adb_path = adb.to_string();
    }
    if let Some(fastboot) = value.get("fastboot_path").and_then(|v| v.as_str()) {
        config.tools.fastboot_path = fastboot.to_string();
    }
    if let Some(mtk) = value.get("mtkclient_path").and_then(|v| v.as_str()) {
        config.tools.mtk_client_path = mtk.to_string();
    }
    if let Some(timeout) = value.get("command_timeout").and_then(|v| v.as_u64()) {
        config.timeouts.collect_timeout_secs = timeout;
    }
    config
}

fn validate_config(mut config: EngineConfig) -> EngineConfig {
    let defaults = EngineConfig::default();
    if config.timeouts.collect_timeout_secs == 0 {
        config.timeouts.collect_timeout_secs = defaults.timeouts.collect_timeout_secs;
    }
    if config.timeouts.quick_timeout_secs == 0 {
        config.timeouts.quick_timeout_secs = defaults.timeouts.quick_timeout_secs;
    }
    if config.timeouts.cancel_grace_ms < 100 {
        config.timeouts.cancel_grace_ms = defaults.timeouts.cancel_grace_ms;
    }
    if !(10..=1000).contains(&config.dispatcher.tick_interval_ms) {
        config.dispatcher.tick_interval_ms = defaults.dispatcher.tick_interval_ms;
    }
    if config.dispatcher.channel_capacity < 16 {
        config.dispatcher.channel_capacity = defaults.dispatcher.channel_capacity;
    }
    if config.dispatcher.max_messages_per_tick < config.dispatcher.channel_capacity {
        config.dispatcher.max_messages_per_tick = config.dispatcher.channel_capacity;
    }
    if config.report.max_stdout_lines == 0 {
        config.report.max_stdout_lines = defaults.report.max_stdout_lines;
    }
    if config.report.max_stderr_lines == 0 {
        config.report.max_stderr_lines = defaults.report.max_stderr_lines;
    }
    if config.report.max_error_detail_lines == 0 {
        config.report.max_error_detail_lines = defaults.report.max_error_detail_lines;
    }
    if config.report.max_step_summary_chars < 10 {
        config.report.max_step_summary_chars = defaults.report.max_step_summary_chars;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_legacy_values() {
        let value = serde_json::json!({
            "adb_path": "/opt/platform-tools/adb",
            "fastboot_path": "/opt/platform-tools/fastboot",
            "mtkclient_path": "/opt/mtkclient/mtk",
            "command_timeout": 120
        });
        let mut config: EngineConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        config = apply_legacy_overrides(config, &value);
        assert_eq!(config.tools.adb_path, "/opt/platform-tools/adb");
        assert_eq!(config.tools.fastboot_path, "/opt/platform-tools/fastboot");
        assert_eq!(config.tools.mtk_client_path, "/opt/mtkclient/mtk");
        assert_eq!(config.timeouts.collect_timeout_secs, 120);
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = EngineConfig::default();
        config.timeouts.collect_timeout_secs = 0;
        config.timeouts.cancel_grace_ms = 5;
        config.dispatcher.tick_interval_ms = 0;
        config.dispatcher.channel_capacity = 1;
        config.dispatcher.max_messages_per_tick = 0;
        config.report.max_stdout_lines = 0;
        let validated = validate_config(config);
        assert_eq!(validated.timeouts.collect_timeout_secs, 300);
        assert_eq!(validated.timeouts.cancel_grace_ms, 5000);
        assert_eq!(validated.dispatcher.tick_interval_ms, 100);
        assert_eq!(validated.dispatcher.channel_capacity, 1024);
        assert_eq!(validated.dispatcher.max_messages_per_tick, 1024);
        assert_eq!(validated.report.max_stdout_lines, 15);
    }

    #[test]
    fn stream_timeout_zero_means_unbounded() {
        let mut config = EngineConfig::default();
        assert_eq!(config.stream_timeout(), None);
        config.timeouts.stream_timeout_secs = 30;
        assert_eq!(config.stream_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn missing_file_yields_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let backup = dir.path().join("config.backup.json");

        let loaded = load_config_from_path(&path).expect("load defaults");
        assert_eq!(loaded, EngineConfig::default());

        let mut config = EngineConfig::default();
        config.sequence.halt_on_soft_failure = true;
        config.tools.adb_path = "/usr/bin/adb".to_string();
        save_config_to_path(&config, &path, &backup).expect("save");
        save_config_to_path(&config, &path, &backup).expect("save again");
        assert!(backup.exists());

        let reloaded = load_config_from_path(&path).expect("reload");
        assert!(reloaded.sequence.halt_on_soft_failure);
        assert_eq!(reloaded.tools.adb_path, "/usr/bin/adb");
    }

    #[test]
    fn rejects_unparseable_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").expect("write");
        let err = load_config_from_path(&path).expect_err("should fail");
        assert_eq!(err.code, "ERR_SYSTEM");
    }
}
