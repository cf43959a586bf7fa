// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Capability interface of the native telemetry layer and the value types it
//! returns. Every operation can fail independently of the others.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::errors::Result;

pub type Pid = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Idle,
    Dead,
    Unknown,
}

impl RunState {
    /// Maps the single-letter state code used by the kernel.
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => RunState::Running,
            'S' => RunState::Sleeping,
            'D' => RunState::DiskSleep,
            'T' | 't' => RunState::Stopped,
            'Z' => RunState::Zombie,
            'I' => RunState::Idle,
            'X' | 'x' => RunState::Dead,
            _ => RunState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcState {
    pub ppid: Pid,
    pub run_state: RunState,
    pub name: String,
    pub threads: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcExe {
    pub path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

impl ProcExe {
    pub fn basename(&self) -> Option<&str> {
        self.path.as_ref()?.file_name()?.to_str()
    }
}

/// Memory sizes are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcMem {
    pub size: u64,
    pub resident: u64,
    pub share: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
}

impl ProcMem {
    pub fn page_faults(&self) -> u64 {
        self.minor_faults.saturating_add(self.major_faults)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcCpu {
    pub user_ms: u64,
    pub sys_ms: u64,
    pub total_ms: u64,
    /// Share of one cpu used since the previous sample, in percent. Providers
    /// leave it empty; snapshots derive it from consecutive samples.
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcTime {
    /// Process start, milliseconds since the unix epoch.
    pub start_time_ms: u64,
    pub user_ms: u64,
    pub sys_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcFd {
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcCred {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// One open session with the native telemetry layer.
///
/// Implementations are not expected to be safe for concurrent use; the
/// arbiter guarantees a handle is only ever driven by one call at a time.
pub trait TelemetryProvider: Send {
    fn list_process_ids(&self) -> Result<Vec<Pid>>;

    fn get_process_state(&self, pid: Pid) -> Result<ProcState>;

    fn get_process_args(&self, pid: Pid) -> Result<Vec<String>>;

    fn get_process_executable_info(&self, pid: Pid) -> Result<ProcExe>;

    fn get_process_environment(&self, pid: Pid) -> Result<HashMap<String, String>>;

    fn get_process_memory(&self, pid: Pid) -> Result<ProcMem>;

    fn get_process_cpu(&self, pid: Pid) -> Result<ProcCpu>;

    fn get_process_time(&self, pid: Pid) -> Result<ProcTime>;

    fn get_process_file_descriptors(&self, pid: Pid) -> Result<ProcFd>;

    fn get_process_credentials(&self, pid: Pid) -> Result<ProcCred>;

    /// `signal` is a signal name such as `"SIGTERM"` or `"TERM"`.
    fn send_signal(&self, pid: Pid, signal: &str) -> Result<()>;
}

/// Creates provider handles. Opening a handle is assumed to be expensive.
pub trait HandleFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn TelemetryProvider>>;
}
