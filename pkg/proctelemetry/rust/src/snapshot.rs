// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Point-in-time view of one process.
//!
//! A [`ProcessSnapshot`] captures the identity of a process once and then
//! refreshes its dynamic attributes on demand. Each attribute is fetched on
//! its own: a failure leaves that attribute at its last known value while
//! the others are still refreshed. Refreshes of one snapshot are serialized
//! and their results are published all at once, so readers never see a mix
//! of two refreshes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::arbiter::{ArbitratedProvider, Arbiter};
use crate::errors::{Error, Result};
use crate::provider::{
    Pid, ProcCpu, ProcCred, ProcFd, ProcMem, ProcState, ProcTime, RunState, TelemetryProvider,
};

pub const DEFAULT_REFRESH_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Command line used when nothing better is known about a process.
pub const UNKNOWN_COMMAND: &str = "<unknown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// How long `refresh` waits for a concurrent refresh of the same
    /// snapshot before failing with [`Error::LockTimeout`].
    pub refresh_lock_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            refresh_lock_timeout: DEFAULT_REFRESH_LOCK_TIMEOUT,
        }
    }
}

/// Static attributes, captured by the first refresh and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    pub pid: Pid,
    pub command_line: Vec<String>,
    pub base_name: String,
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Uninitialized,
    Initialized,
    Refreshed,
    Dead,
}

/// Dynamic attributes as of the last refresh. `None` means the attribute
/// has never been read successfully.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessSample {
    pub state: Option<ProcState>,
    pub memory: Option<ProcMem>,
    pub cpu: Option<ProcCpu>,
    pub time: Option<ProcTime>,
    pub file_descriptors: Option<ProcFd>,
    pub credentials: Option<ProcCred>,
    pub last_refresh: Option<SystemTime>,
    pub dead: bool,
}

struct Published {
    sample: ProcessSample,
    state: SnapshotState,
}

/// Bookkeeping owned by whoever holds the refresh lock.
#[derive(Default)]
struct RefreshBook {
    last_cpu: Option<(u64, Instant)>,
}

pub struct ProcessSnapshot {
    pid: Pid,
    provider: ArbitratedProvider,
    config: SnapshotConfig,
    identity: OnceLock<ProcessIdentity>,
    refresh_lock: Mutex<RefreshBook>,
    published: RwLock<Published>,
    dead: AtomicBool,
    permission_denied_logged: AtomicBool,
}

impl ProcessSnapshot {
    /// Creates an uninitialized snapshot. Nothing is read until the first
    /// [`refresh`](Self::refresh).
    pub fn new(pid: Pid, arbiter: &Arc<Arbiter>, config: SnapshotConfig) -> Self {
        Self {
            pid,
            provider: arbiter.provider(),
            config,
            identity: OnceLock::new(),
            refresh_lock: Mutex::new(RefreshBook::default()),
            published: RwLock::new(Published {
                sample: ProcessSample::default(),
                state: SnapshotState::Uninitialized,
            }),
            dead: AtomicBool::new(false),
            permission_denied_logged: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Re-reads every dynamic attribute and returns the new sample.
    ///
    /// Per-attribute failures are absorbed. Arbitration failures and a
    /// timeout on the refresh lock are returned to the caller. Once the
    /// process is known to be dead this returns the last sample without
    /// touching the provider.
    pub fn refresh(&self) -> Result<ProcessSample> {
        if self.is_dead() {
            return Ok(self.current());
        }

        let Some(mut book) = self.refresh_lock.try_lock_for(self.config.refresh_lock_timeout) else {
            return Err(Error::LockTimeout {
                resource: "snapshot refresh",
                timeout: self.config.refresh_lock_timeout,
            });
        };

        // Another refresh may have latched the process while we waited.
        if self.is_dead() {
            return Ok(self.current());
        }

        let pid = self.pid;
        let mut sample = self.current();
        let mut unexpected = None;

        if let Some(state) =
            self.collect("state", &mut unexpected, self.provider.get_process_state(pid))?
        {
            sample.state = Some(state);
        }

        if self.identity.get().is_none() {
            let identity = self.capture_identity(sample.state.as_ref(), &mut unexpected)?;
            if self.identity.set(identity).is_err() {
                debug!("identity of process {pid} was already captured");
            }
        }

        if let Some(memory) =
            self.collect("memory", &mut unexpected, self.provider.get_process_memory(pid))?
        {
            sample.memory = Some(memory);
        }

        if let Some(mut cpu) =
            self.collect("cpu", &mut unexpected, self.provider.get_process_cpu(pid))?
        {
            let now = Instant::now();
            cpu.percent = book
                .last_cpu
                .and_then(|(total_ms, at)| cpu_percent(total_ms, cpu.total_ms, now - at));
            book.last_cpu = Some((cpu.total_ms, now));
            sample.cpu = Some(cpu);
        }

        if let Some(time) =
            self.collect("time", &mut unexpected, self.provider.get_process_time(pid))?
        {
            sample.time = Some(time);
        }

        if let Some(fds) = self.collect(
            "file descriptors",
            &mut unexpected,
            self.provider.get_process_file_descriptors(pid),
        )? {
            sample.file_descriptors = Some(fds);
        }

        if let Some(credentials) = self.collect(
            "credentials",
            &mut unexpected,
            self.provider.get_process_credentials(pid),
        )? {
            sample.credentials = Some(credentials);
        }

        let dead = match unexpected {
            Some(error) => self.confirm_gone(&error)?,
            None => false,
        };

        sample.last_refresh = Some(SystemTime::now());
        sample.dead = dead;

        let mut published = self.published.write();
        published.state = if dead {
            SnapshotState::Dead
        } else if published.state == SnapshotState::Uninitialized {
            SnapshotState::Initialized
        } else {
            SnapshotState::Refreshed
        };
        published.sample = sample.clone();
        if dead {
            self.dead.store(true, Ordering::SeqCst);
        }
        drop(published);
        drop(book);

        Ok(sample)
    }

    /// Sorts a provider result into a value, an absorbed failure, or an
    /// arbitration error to hand back to the caller.
    fn collect<T>(
        &self,
        attribute: &str,
        unexpected: &mut Option<Error>,
        result: Result<T>,
    ) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_arbitration() => Err(e),
            Err(Error::PermissionDenied { context }) => {
                if !self.permission_denied_logged.swap(true, Ordering::SeqCst) {
                    warn!(
                        "permission denied reading {attribute} of process {}: {context}; \
                         further permission errors for this process are not logged",
                        self.pid
                    );
                }
                Ok(None)
            }
            Err(Error::NotImplemented { operation }) => {
                debug!(
                    "{attribute} of process {} is not available on this platform ({operation})",
                    self.pid
                );
                Ok(None)
            }
            Err(e) => {
                debug!("failed to read {attribute} of process {}: {e}", self.pid);
                unexpected.get_or_insert(e);
                Ok(None)
            }
        }
    }

    fn capture_identity(
        &self,
        state: Option<&ProcState>,
        unexpected: &mut Option<Error>,
    ) -> Result<ProcessIdentity> {
        let pid = self.pid;
        let args = self
            .collect("arguments", unexpected, self.provider.get_process_args(pid))?
            .filter(|args| !args.is_empty());
        let exe = self.collect(
            "executable",
            unexpected,
            self.provider.get_process_executable_info(pid),
        )?;
        let exe_name = exe.as_ref().and_then(|exe| exe.basename()).map(str::to_string);
        let state_name = state.map(|state| state.name.clone());

        let base_name = exe_name
            .clone()
            .or_else(|| {
                args.as_ref()
                    .and_then(|args| args.first())
                    .and_then(|arg0| Path::new(arg0).file_name())
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .or_else(|| state_name.clone())
            .unwrap_or_else(|| UNKNOWN_COMMAND.to_string());

        let command_line = args
            .or_else(|| exe_name.map(|name| vec![name]))
            .or_else(|| state_name.map(|name| vec![name]))
            .unwrap_or_else(|| vec![UNKNOWN_COMMAND.to_string()]);

        let environment = self
            .collect(
                "environment",
                unexpected,
                self.provider.get_process_environment(pid),
            )?
            .unwrap_or_default();

        Ok(ProcessIdentity {
            pid,
            command_line,
            base_name,
            environment,
        })
    }

    /// Checks the process table after an unexpected failure. Returns whether
    /// the process is gone.
    fn confirm_gone(&self, cause: &Error) -> Result<bool> {
        match self.provider.list_process_ids() {
            Ok(pids) if !pids.contains(&self.pid) => {
                debug!("process {} no longer exists ({cause}), marking it dead", self.pid);
                Ok(true)
            }
            Ok(_) => {
                debug!("process {} still exists after: {cause}", self.pid);
                Ok(false)
            }
            Err(e) if e.is_arbitration() => Err(e),
            Err(e) => {
                warn!("could not check whether process {} still exists: {e}", self.pid);
                Ok(false)
            }
        }
    }

    /// Last known sample. Never blocks on a refresh in progress.
    pub fn current(&self) -> ProcessSample {
        self.published.read().sample.clone()
    }

    pub fn state(&self) -> SnapshotState {
        self.published.read().state
    }

    pub fn identity(&self) -> Option<&ProcessIdentity> {
        self.identity.get()
    }

    pub fn process_state(&self) -> Option<ProcState> {
        self.published.read().sample.state.clone()
    }

    pub fn memory(&self) -> Option<ProcMem> {
        self.published.read().sample.memory.clone()
    }

    pub fn cpu(&self) -> Option<ProcCpu> {
        self.published.read().sample.cpu.clone()
    }

    pub fn time(&self) -> Option<ProcTime> {
        self.published.read().sample.time.clone()
    }

    pub fn file_descriptors(&self) -> Option<ProcFd> {
        self.published.read().sample.file_descriptors.clone()
    }

    pub fn credentials(&self) -> Option<ProcCred> {
        self.published.read().sample.credentials.clone()
    }

    pub fn last_refresh(&self) -> Option<SystemTime> {
        self.published.read().sample.last_refresh
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Last known parent pid.
    pub fn parent_pid(&self) -> Option<Pid> {
        self.published.read().sample.state.as_ref().map(|state| state.ppid)
    }

    /// Refreshes, then reports whether the process is alive and not a zombie.
    pub fn is_running(&self) -> Result<bool> {
        let sample = self.refresh()?;
        Ok(!sample.dead
            && sample
                .state
                .is_some_and(|state| state.run_state != RunState::Zombie))
    }

    /// Sends `signal` (for example `"SIGTERM"`) to the process.
    pub fn kill(&self, signal: &str) -> Result<()> {
        self.provider.send_signal(self.pid, signal)
    }
}

fn cpu_percent(previous_ms: u64, current_ms: u64, elapsed: Duration) -> Option<f64> {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if elapsed_ms <= 0.0 {
        return None;
    }
    let used_ms = current_ms.saturating_sub(previous_ms) as f64;
    Some(used_ms / elapsed_ms * 100.0)
}
