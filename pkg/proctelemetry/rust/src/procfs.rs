// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Linux implementation of the telemetry provider, reading /proc.

pub mod parse;

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, SysconfVar};

use crate::errors::{Error, Result};
use crate::provider::{
    HandleFactory, Pid, ProcCpu, ProcCred, ProcExe, ProcFd, ProcMem, ProcState, ProcTime, RunState,
    TelemetryProvider,
};
use parse::{Stat, ticks_to_ms};

const DEFAULT_CLOCK_TICKS: u64 = 100;
const DEFAULT_PAGE_SIZE: u64 = 4096;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// The proc root to read: `HOST_PROC` when set, the host's proc mount inside
/// the agent container, `/proc` otherwise.
pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| match env::var_os("HOST_PROC") {
        Some(host_proc) => PathBuf::from(host_proc),
        None if env::var_os("DOCKER_DD_AGENT").is_some() && Path::new("/host").exists() => {
            PathBuf::from("/host/proc")
        }
        None => PathBuf::from("/proc"),
    })
}

/// Opens handles over a proc root.
#[derive(Debug, Clone)]
pub struct ProcfsFactory {
    root: PathBuf,
}

impl ProcfsFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcfsFactory {
    fn default() -> Self {
        Self::new(root_path())
    }
}

impl HandleFactory for ProcfsFactory {
    fn open(&self) -> Result<Box<dyn TelemetryProvider>> {
        Ok(Box::new(ProcfsHandle::open(&self.root)?))
    }
}

/// A provider session. Host constants are resolved once when it is opened.
#[derive(Debug)]
pub struct ProcfsHandle {
    root: PathBuf,
    boot_time_secs: Option<u64>,
    clock_ticks: u64,
    page_size: u64,
}

impl ProcfsHandle {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::NotImplemented {
                operation: format!("procfs at {}", root.display()),
            });
        }

        let boot_time_secs = fs::read_to_string(root.join("stat"))
            .ok()
            .and_then(|content| parse::parse_boot_time(&content));
        if boot_time_secs.is_none() {
            debug!("no boot time under {}, start times unavailable", root.display());
        }

        Ok(Self {
            root: root.to_path_buf(),
            boot_time_secs,
            clock_ticks: sysconf_u64(SysconfVar::CLK_TCK).unwrap_or(DEFAULT_CLOCK_TICKS),
            page_size: sysconf_u64(SysconfVar::PAGE_SIZE).unwrap_or(DEFAULT_PAGE_SIZE),
        })
    }

    fn pid_path(&self, pid: Pid, entry: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(entry)
    }

    /// Reads a per-process text file. The kernel truncates names at a byte
    /// boundary, so the content is not guaranteed to be valid UTF-8.
    fn read(&self, pid: Pid, entry: &str) -> Result<String> {
        let bytes = fs::read(self.pid_path(pid, entry))
            .map_err(|e| Error::from_io(e, format!("reading {entry} of pid {pid}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn stat(&self, pid: Pid) -> Result<Stat> {
        let content = self.read(pid, "stat")?;
        parse::parse_stat(&content)
            .ok_or_else(|| Error::transient(format!("malformed stat for pid {pid}")))
    }
}

fn sysconf_u64(var: SysconfVar) -> Option<u64> {
    let value = unistd::sysconf(var).ok().flatten()?;
    u64::try_from(value).ok().filter(|v| *v > 0)
}

fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| Error::NotImplemented {
        operation: format!("signal {name}"),
    })
}

impl TelemetryProvider for ProcfsHandle {
    fn list_process_ids(&self) -> Result<Vec<Pid>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::from_io(e, format!("listing {}", self.root.display())))?;

        let mut pids: Vec<Pid> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn get_process_state(&self, pid: Pid) -> Result<ProcState> {
        let stat = self.stat(pid)?;
        Ok(ProcState {
            ppid: stat.ppid,
            run_state: RunState::from_code(stat.state),
            name: stat.comm,
            threads: Some(stat.num_threads),
        })
    }

    fn get_process_args(&self, pid: Pid) -> Result<Vec<String>> {
        Ok(parse::parse_cmdline(&self.read(pid, "cmdline")?))
    }

    fn get_process_executable_info(&self, pid: Pid) -> Result<ProcExe> {
        let path = fs::read_link(self.pid_path(pid, "exe"))
            .map_err(|e| Error::from_io(e, format!("resolving exe of pid {pid}")))?;
        // cwd can be unreadable when exe is not; that is not worth failing for.
        let cwd = fs::read_link(self.pid_path(pid, "cwd")).ok();
        Ok(ProcExe {
            path: Some(path),
            cwd,
        })
    }

    fn get_process_environment(&self, pid: Pid) -> Result<HashMap<String, String>> {
        let path = self.pid_path(pid, "environ");
        let file = fs::File::open(&path)
            .map_err(|e| Error::from_io(e, format!("opening environ of pid {pid}")))?;
        let reader = BufReader::new(file);
        let mut env_vars = HashMap::new();

        for entry_result in reader.split(b'\0') {
            let bytes = entry_result
                .map_err(|e| Error::from_io(e, format!("reading environ of pid {pid}")))?;
            if bytes.is_empty() {
                continue;
            }

            let entry = String::from_utf8_lossy(&bytes);
            if let Some((key, value)) = entry.split_once('=') {
                env_vars.insert(key.to_string(), value.to_string());
            }
        }

        Ok(env_vars)
    }

    fn get_process_memory(&self, pid: Pid) -> Result<ProcMem> {
        let statm = parse::parse_statm(&self.read(pid, "statm")?)
            .ok_or_else(|| Error::transient(format!("malformed statm for pid {pid}")))?;
        let stat = self.stat(pid)?;
        Ok(ProcMem {
            size: statm.size.saturating_mul(self.page_size),
            resident: statm.resident.saturating_mul(self.page_size),
            share: statm.shared.saturating_mul(self.page_size),
            minor_faults: stat.minflt,
            major_faults: stat.majflt,
        })
    }

    fn get_process_cpu(&self, pid: Pid) -> Result<ProcCpu> {
        let stat = self.stat(pid)?;
        let user_ms = ticks_to_ms(stat.utime, self.clock_ticks);
        let sys_ms = ticks_to_ms(stat.stime, self.clock_ticks);
        Ok(ProcCpu {
            user_ms,
            sys_ms,
            total_ms: user_ms.saturating_add(sys_ms),
            percent: None,
        })
    }

    fn get_process_time(&self, pid: Pid) -> Result<ProcTime> {
        let boot_time_secs = self.boot_time_secs.ok_or_else(|| Error::NotImplemented {
            operation: "process start time without boot time".to_string(),
        })?;
        let stat = self.stat(pid)?;
        let user_ms = ticks_to_ms(stat.utime, self.clock_ticks);
        let sys_ms = ticks_to_ms(stat.stime, self.clock_ticks);
        Ok(ProcTime {
            start_time_ms: boot_time_secs
                .saturating_mul(1000)
                .saturating_add(ticks_to_ms(stat.starttime, self.clock_ticks)),
            user_ms,
            sys_ms,
            total_ms: user_ms.saturating_add(sys_ms),
        })
    }

    fn get_process_file_descriptors(&self, pid: Pid) -> Result<ProcFd> {
        let entries = fs::read_dir(self.pid_path(pid, "fd"))
            .map_err(|e| Error::from_io(e, format!("listing fds of pid {pid}")))?;
        let total = entries.filter_map(|entry| entry.ok()).count();
        trace!("pid {pid} has {total} open fds");
        Ok(ProcFd {
            total: u64::try_from(total).unwrap_or(u64::MAX),
        })
    }

    fn get_process_credentials(&self, pid: Pid) -> Result<ProcCred> {
        let ids = parse::parse_status_ids(&self.read(pid, "status")?)
            .ok_or_else(|| Error::transient(format!("malformed status for pid {pid}")))?;
        Ok(ProcCred {
            uid: ids.uid,
            euid: ids.euid,
            gid: ids.gid,
            egid: ids.egid,
            user: uzers::get_user_by_uid(ids.uid).map(|u| u.name().to_string_lossy().into_owned()),
            group: uzers::get_group_by_gid(ids.gid)
                .map(|g| g.name().to_string_lossy().into_owned()),
        })
    }

    fn send_signal(&self, pid: Pid, signal: &str) -> Result<()> {
        let sig = parse_signal(signal)?;
        match signal::kill(unistd::Pid::from_raw(pid), sig) {
            Ok(()) => Ok(()),
            Err(Errno::EPERM) => Err(Error::PermissionDenied {
                context: format!("sending {sig} to pid {pid}"),
            }),
            Err(e) => Err(Error::transient(format!("sending {sig} to pid {pid}: {e}"))),
        }
    }
}
