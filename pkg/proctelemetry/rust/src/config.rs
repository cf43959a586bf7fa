// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{LevelFilter, warn};
use serde::Deserialize;

use crate::arbiter::{
    ArbiterConfig, DEFAULT_LEAK_CHECK_INTERVAL, DEFAULT_LEAK_WARNING_THRESHOLD,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_TEMPORARY_HANDLES,
};
use crate::snapshot::{DEFAULT_REFRESH_LOCK_TIMEOUT, SnapshotConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/process-telemetry.yaml";

const ENV_ENABLED: &str = "DD_PROCESS_TELEMETRY_ENABLED";
const ENV_LOG_LEVEL: &str = "DD_PROCESS_TELEMETRY_LOG_LEVEL";
const ENV_LOCK_TIMEOUT_MS: &str = "DD_PROCESS_TELEMETRY_LOCK_TIMEOUT_MS";
const ENV_MAX_TEMPORARY_HANDLES: &str = "DD_PROCESS_TELEMETRY_MAX_TEMPORARY_HANDLES";
const ENV_LEAK_WARNING_THRESHOLD: &str = "DD_PROCESS_TELEMETRY_LEAK_WARNING_THRESHOLD";
const ENV_LEAK_CHECK_INTERVAL_SECS: &str = "DD_PROCESS_TELEMETRY_LEAK_CHECK_INTERVAL_SECS";
const ENV_DUMP_ON_LEAK: &str = "DD_PROCESS_TELEMETRY_DUMP_ON_LEAK";
const ENV_REFRESH_LOCK_TIMEOUT_MS: &str = "DD_PROCESS_TELEMETRY_REFRESH_LOCK_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_level: String,
    pub arbiter: ArbiterSection,
    pub snapshot: SnapshotSection,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
            arbiter: ArbiterSection::default(),
            snapshot: SnapshotSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ArbiterSection {
    pub lock_timeout_ms: u64,
    pub max_temporary_handles: usize,
    pub leak_warning_threshold: usize,
    /// 0 turns the leak monitor off.
    pub leak_check_interval_secs: u64,
    pub dump_on_leak: bool,
}

impl Default for ArbiterSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: millis(DEFAULT_LOCK_TIMEOUT),
            max_temporary_handles: DEFAULT_MAX_TEMPORARY_HANDLES,
            leak_warning_threshold: DEFAULT_LEAK_WARNING_THRESHOLD,
            leak_check_interval_secs: DEFAULT_LEAK_CHECK_INTERVAL.as_secs(),
            dump_on_leak: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub refresh_lock_timeout_ms: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            refresh_lock_timeout_ms: millis(DEFAULT_REFRESH_LOCK_TIMEOUT),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TelemetryConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).context("Failed to parse process telemetry config")
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            lock_timeout: Duration::from_millis(self.arbiter.lock_timeout_ms),
            max_temporary_handles: self.arbiter.max_temporary_handles,
            leak_warning_threshold: self.arbiter.leak_warning_threshold,
            leak_check_interval: Duration::from_secs(self.arbiter.leak_check_interval_secs),
            dump_on_leak: self.arbiter.dump_on_leak,
            enabled: self.enabled,
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            refresh_lock_timeout: Duration::from_millis(self.snapshot.refresh_lock_timeout_ms),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        parse_log_level(&self.log_level)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(enabled) = get_env_bool_option(ENV_ENABLED) {
            self.enabled = enabled;
        }
        if let Ok(level) = env::var(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(ms) = get_env_number_option(ENV_LOCK_TIMEOUT_MS) {
            self.arbiter.lock_timeout_ms = ms;
        }
        if let Some(max) = get_env_number_option(ENV_MAX_TEMPORARY_HANDLES) {
            self.arbiter.max_temporary_handles = max;
        }
        if let Some(threshold) = get_env_number_option(ENV_LEAK_WARNING_THRESHOLD) {
            self.arbiter.leak_warning_threshold = threshold;
        }
        if let Some(secs) = get_env_number_option(ENV_LEAK_CHECK_INTERVAL_SECS) {
            self.arbiter.leak_check_interval_secs = secs;
        }
        if let Some(dump) = get_env_bool_option(ENV_DUMP_ON_LEAK) {
            self.arbiter.dump_on_leak = dump;
        }
        if let Some(ms) = get_env_number_option(ENV_REFRESH_LOCK_TIMEOUT_MS) {
            self.snapshot.refresh_lock_timeout_ms = ms;
        }
    }
}

/// Loads the YAML config file if it exists, then applies environment
/// overrides. A missing file means defaults; a malformed one is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<TelemetryConfig> {
    let path = config_path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);

    let mut config = if path.exists() {
        let contents = fs::read_to_string(&path).with_context(|| {
            format!("Failed to read process telemetry config {}", path.display())
        })?;
        TelemetryConfig::from_yaml_str(&contents)?
    } else {
        warn!(
            "Config file not found at {}. Using defaults and environment variables.",
            path.display()
        );
        TelemetryConfig::default()
    };

    config.apply_env_overrides();
    Ok(config)
}

fn get_env_bool_option(env_var: &str) -> Option<bool> {
    let val = env::var(env_var).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => {
            warn!("Ignoring {env_var}={val}: expected true/false/1/0");
            None
        }
    }
}

fn get_env_number_option<T: FromStr>(env_var: &str) -> Option<T> {
    let val = env::var(env_var).ok()?;
    match val.trim().parse() {
        Ok(number) => Some(number),
        Err(_) => {
            warn!("Ignoring {env_var}={val}: expected a non-negative integer");
            None
        }
    }
}

/// Parse a Go log level string. Unknown levels default to Info.
pub fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "critical" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}
