// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Instrumented in-memory provider for unit tests.
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::{Once, mpsc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::arbiter::{Arbiter, ArbiterConfig};
use crate::errors::{Error, Result};
use crate::provider::{
    HandleFactory, Pid, ProcCpu, ProcCred, ProcExe, ProcFd, ProcMem, ProcState, ProcTime, RunState,
    TelemetryProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    State,
    Args,
    Exe,
    Environment,
    Memory,
    Cpu,
    Time,
    Fds,
    Credentials,
    Signal,
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub ppid: Pid,
    pub name: String,
    pub args: Vec<String>,
    pub exe: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub memory: ProcMem,
    pub cpu_total_ms: u64,
    pub fds: u64,
}

impl FakeProcess {
    pub fn new(ppid: Pid, name: &str) -> Self {
        Self {
            ppid,
            name: name.to_string(),
            args: vec![format!("/usr/bin/{name}"), "--serve".to_string()],
            exe: Some(PathBuf::from(format!("/usr/bin/{name}"))),
            environment: HashMap::from([("HOME".to_string(), "/root".to_string())]),
            memory: ProcMem {
                size: 4096,
                resident: 2048,
                share: 1024,
                minor_faults: 10,
                major_faults: 1,
            },
            cpu_total_ms: 100,
            fds: 4,
        }
    }
}

#[derive(Default)]
pub struct FakeWorld {
    processes: Mutex<BTreeMap<Pid, FakeProcess>>,
    failures: Mutex<HashMap<(Pid, Op), Error>>,
    calls: Mutex<HashMap<Op, usize>>,
    total_calls: AtomicUsize,
    opened: AtomicUsize,
    live: AtomicUsize,
    fail_open: AtomicBool,
    latency_ms: AtomicU64,
    tag_generations: AtomicBool,
    generation: AtomicU64,
    signals: Mutex<Vec<(Pid, String)>>,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, pid: Pid, process: FakeProcess) {
        self.processes.lock().insert(pid, process);
    }

    pub fn remove(&self, pid: Pid) {
        self.processes.lock().remove(&pid);
    }

    pub fn update(&self, pid: Pid, f: impl FnOnce(&mut FakeProcess)) {
        if let Some(process) = self.processes.lock().get_mut(&pid) {
            f(process);
        }
    }

    /// Makes every future `op` on `pid` fail with `error`.
    pub fn fail(&self, pid: Pid, op: Op, error: Error) {
        self.failures.lock().insert((pid, op), error);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap();
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Every `get_process_state` starts a new generation; the other dynamic
    /// attributes report the current generation in their numeric fields.
    pub fn tag_generations(&self) {
        self.tag_generations.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn handles_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<(Pid, String)> {
        self.signals.lock().clone()
    }

    fn enter(&self, pid: Option<Pid>, op: Op) -> Result<()> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            thread::sleep(Duration::from_millis(latency));
        }

        if let Some(pid) = pid
            && let Some(error) = self.failures.lock().get(&(pid, op))
        {
            return Err(error.clone());
        }
        Ok(())
    }

    fn process(&self, pid: Pid) -> Result<FakeProcess> {
        self.processes
            .lock()
            .get(&pid)
            .cloned()
            .ok_or_else(|| Error::transient(format!("no such process {pid}")))
    }

    fn tag(&self) -> Option<u64> {
        self.tag_generations
            .load(Ordering::SeqCst)
            .then(|| self.generation.load(Ordering::SeqCst))
    }
}

pub struct FakeFactory(pub Arc<FakeWorld>);

impl HandleFactory for FakeFactory {
    fn open(&self) -> Result<Box<dyn TelemetryProvider>> {
        if self.0.fail_open.load(Ordering::SeqCst) {
            return Err(Error::transient("cannot open provider"));
        }
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        self.0.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle(Arc::clone(&self.0))))
    }
}

pub struct FakeHandle(Arc<FakeWorld>);

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TelemetryProvider for FakeHandle {
    fn list_process_ids(&self) -> Result<Vec<Pid>> {
        self.0.enter(None, Op::List)?;
        Ok(self.0.processes.lock().keys().copied().collect())
    }

    fn get_process_state(&self, pid: Pid) -> Result<ProcState> {
        self.0.enter(Some(pid), Op::State)?;
        let process = self.0.process(pid)?;
        let threads = if self.0.tag_generations.load(Ordering::SeqCst) {
            self.0.generation.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            1
        };
        Ok(ProcState {
            ppid: process.ppid,
            run_state: RunState::Sleeping,
            name: process.name,
            threads: Some(threads),
        })
    }

    fn get_process_args(&self, pid: Pid) -> Result<Vec<String>> {
        self.0.enter(Some(pid), Op::Args)?;
        Ok(self.0.process(pid)?.args)
    }

    fn get_process_executable_info(&self, pid: Pid) -> Result<ProcExe> {
        self.0.enter(Some(pid), Op::Exe)?;
        Ok(ProcExe {
            path: self.0.process(pid)?.exe,
            cwd: None,
        })
    }

    fn get_process_environment(&self, pid: Pid) -> Result<HashMap<String, String>> {
        self.0.enter(Some(pid), Op::Environment)?;
        Ok(self.0.process(pid)?.environment)
    }

    fn get_process_memory(&self, pid: Pid) -> Result<ProcMem> {
        self.0.enter(Some(pid), Op::Memory)?;
        let mut memory = self.0.process(pid)?.memory;
        if let Some(generation) = self.0.tag() {
            memory.size = generation;
        }
        Ok(memory)
    }

    fn get_process_cpu(&self, pid: Pid) -> Result<ProcCpu> {
        self.0.enter(Some(pid), Op::Cpu)?;
        let total = self.0.tag().unwrap_or(self.0.process(pid)?.cpu_total_ms);
        Ok(ProcCpu {
            user_ms: total,
            sys_ms: 0,
            total_ms: total,
            percent: None,
        })
    }

    fn get_process_time(&self, pid: Pid) -> Result<ProcTime> {
        self.0.enter(Some(pid), Op::Time)?;
        let total = self.0.tag().unwrap_or(self.0.process(pid)?.cpu_total_ms);
        Ok(ProcTime {
            start_time_ms: 1_700_000_000_000,
            user_ms: total,
            sys_ms: 0,
            total_ms: total,
        })
    }

    fn get_process_file_descriptors(&self, pid: Pid) -> Result<ProcFd> {
        self.0.enter(Some(pid), Op::Fds)?;
        let total = self.0.tag().unwrap_or(self.0.process(pid)?.fds);
        Ok(ProcFd { total })
    }

    fn get_process_credentials(&self, pid: Pid) -> Result<ProcCred> {
        self.0.enter(Some(pid), Op::Credentials)?;
        self.0.process(pid)?;
        Ok(ProcCred {
            uid: 1000,
            euid: 1000,
            gid: 1000,
            egid: 1000,
            user: Some("dd-agent".to_string()),
            group: None,
        })
    }

    fn send_signal(&self, pid: Pid, signal: &str) -> Result<()> {
        self.0.enter(Some(pid), Op::Signal)?;
        self.0.process(pid)?;
        self.0.signals.lock().push((pid, signal.to_string()));
        Ok(())
    }
}

/// Arbiter over the fake world with short timeouts and no leak monitor.
pub fn fake_arbiter(world: &Arc<FakeWorld>) -> Arc<Arbiter> {
    fake_arbiter_with(world, test_arbiter_config())
}

pub fn fake_arbiter_with(world: &Arc<FakeWorld>, config: ArbiterConfig) -> Arc<Arbiter> {
    Arc::new(Arbiter::open(FakeFactory(Arc::clone(world)), config))
}

pub fn test_arbiter_config() -> ArbiterConfig {
    ArbiterConfig {
        lock_timeout: Duration::from_millis(200),
        max_temporary_handles: 4,
        leak_warning_threshold: 2,
        leak_check_interval: Duration::ZERO,
        ..ArbiterConfig::default()
    }
}

/// Occupies the shared handle for `hold` from another thread. Returns once
/// the holder is inside its call.
pub fn hold_shared(arbiter: &Arc<Arbiter>, hold: Duration) -> JoinHandle<()> {
    let (started_tx, started_rx) = mpsc::channel();
    let arbiter = Arc::clone(arbiter);
    let holder = thread::spawn(move || {
        arbiter
            .call(|_| {
                started_tx.send(()).unwrap();
                thread::sleep(hold);
                Ok(())
            })
            .unwrap();
    });
    started_rx.recv().unwrap();
    holder
}

struct WarningCapture {
    messages: Mutex<Vec<String>>,
}

impl log::Log for WarningCapture {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            self.messages.lock().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static WARNINGS: WarningCapture = WarningCapture {
    messages: parking_lot::const_mutex(Vec::new()),
};

/// Installs a process-wide logger that records warnings. Tests share it, so
/// filter the result on something unique to the test.
pub fn capture_warnings() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&WARNINGS).unwrap();
        log::set_max_level(log::LevelFilter::Warn);
    });
}

/// Warnings recorded so far that contain `needle`.
pub fn warnings_containing(needle: &str) -> usize {
    WARNINGS
        .messages
        .lock()
        .iter()
        .filter(|message| message.contains(needle))
        .count()
}
