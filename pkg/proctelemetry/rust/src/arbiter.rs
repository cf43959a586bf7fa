// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Arbitrates access to the native telemetry provider.
//!
//! The arbiter owns one long-lived shared handle and serializes calls on it.
//! A caller that cannot get the shared handle within the lock timeout is
//! served by a temporary handle instead, opened for that one call and closed
//! right after. Temporary handles are capped; past the cap callers get
//! [`Error::ResourceExhausted`]. A background monitor warns when many
//! temporary handles are alive at once, which usually means some caller is
//! sitting on the shared handle.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::leak_monitor::LeakMonitor;
use crate::provider::{
    HandleFactory, Pid, ProcCpu, ProcCred, ProcExe, ProcFd, ProcMem, ProcState, ProcTime,
    TelemetryProvider,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_TEMPORARY_HANDLES: usize = 50;
pub const DEFAULT_LEAK_WARNING_THRESHOLD: usize = 25;
pub const DEFAULT_LEAK_CHECK_INTERVAL: Duration = Duration::from_secs(300);

const SHARED_HANDLE: &str = "shared native telemetry handle";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// How long a caller waits for the shared handle before falling back to
    /// a temporary handle.
    pub lock_timeout: Duration,
    /// Cap on concurrently open temporary handles. Zero disables the
    /// fallback: callers time out instead.
    pub max_temporary_handles: usize,
    pub leak_warning_threshold: usize,
    /// Zero disables the leak monitor.
    pub leak_check_interval: Duration,
    /// Record a backtrace for every temporary handle and include them in
    /// leak warnings.
    pub dump_on_leak: bool,
    pub enabled: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_temporary_handles: DEFAULT_MAX_TEMPORARY_HANDLES,
            leak_warning_threshold: DEFAULT_LEAK_WARNING_THRESHOLD,
            leak_check_interval: DEFAULT_LEAK_CHECK_INTERVAL,
            dump_on_leak: false,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub live_temporary_handles: usize,
    pub peak_temporary_handles: usize,
    pub temporary_handles_created: u64,
    pub shared_handle_open: bool,
    pub enabled: bool,
    pub closed: bool,
}

/// Who is using a handle, for leak diagnostics.
#[derive(Debug, Clone)]
pub struct HandleUser {
    pub thread: String,
    pub since: Instant,
    pub backtrace: Option<String>,
}

impl HandleUser {
    fn current(capture_backtrace: bool) -> Self {
        let thread = thread::current();
        Self {
            thread: thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id())),
            since: Instant::now(),
            backtrace: capture_backtrace.then(|| Backtrace::force_capture().to_string()),
        }
    }
}

#[derive(Default)]
struct TemporaryHandles {
    live: AtomicUsize,
    peak: AtomicUsize,
    created: AtomicU64,
    next_id: AtomicU64,
    users: Mutex<BTreeMap<u64, HandleUser>>,
}

impl TemporaryHandles {
    fn reserve(&self, limit: usize, capture_backtrace: bool) -> Result<TemporarySlot<'_>> {
        let previous = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| Error::ResourceExhausted { limit })?;
        self.peak.fetch_max(previous + 1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.users
            .lock()
            .insert(id, HandleUser::current(capture_backtrace));
        Ok(TemporarySlot { handles: self, id })
    }
}

/// A reserved temporary handle slot, released on drop.
struct TemporarySlot<'a> {
    handles: &'a TemporaryHandles,
    id: u64,
}

impl Drop for TemporarySlot<'_> {
    fn drop(&mut self) {
        self.handles.users.lock().remove(&self.id);
        self.handles.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ArbiterInner {
    factory: Box<dyn HandleFactory>,
    config: ArbiterConfig,
    shared: Mutex<Option<Box<dyn TelemetryProvider>>>,
    shared_open: AtomicBool,
    shared_user: Mutex<Option<HandleUser>>,
    enabled: AtomicBool,
    closed: AtomicBool,
    temporaries: TemporaryHandles,
}

impl ArbiterInner {
    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(Error::Disabled);
        }
        Ok(())
    }

    fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn TelemetryProvider) -> Result<T>,
    {
        self.check_usable()?;

        let Some(mut shared) = self.shared.try_lock_for(self.config.lock_timeout) else {
            return self.call_with_temporary(op);
        };

        // close() may have run while we were waiting.
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if shared.is_none() {
            let handle = self.factory.open().map_err(|e| {
                warn!("could not open {SHARED_HANDLE}: {e}");
                Error::HandleUnavailable {
                    context: e.to_string(),
                }
            })?;
            *shared = Some(handle);
            self.shared_open.store(true, Ordering::SeqCst);
            debug!("opened {SHARED_HANDLE}");
        }

        *self.shared_user.lock() = Some(HandleUser::current(self.config.dump_on_leak));
        let result = {
            // Cleared even if `op` panics.
            let _holder = scopeguard::guard((), |()| *self.shared_user.lock() = None);
            match shared.as_deref() {
                Some(handle) => op(handle),
                None => Err(Error::HandleUnavailable {
                    context: format!("{SHARED_HANDLE} not open"),
                }),
            }
        };

        if self.closed.load(Ordering::SeqCst) && shared.take().is_some() {
            self.shared_open.store(false, Ordering::SeqCst);
            debug!("closed {SHARED_HANDLE} after in-flight call");
        }

        result
    }

    fn call_with_temporary<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn TelemetryProvider) -> Result<T>,
    {
        let limit = self.config.max_temporary_handles;
        if limit == 0 {
            return Err(Error::LockTimeout {
                resource: SHARED_HANDLE,
                timeout: self.config.lock_timeout,
            });
        }

        let slot = self.temporaries.reserve(limit, self.config.dump_on_leak)?;
        debug!(
            "{SHARED_HANDLE} busy for {:?}, using temporary handle #{}",
            self.config.lock_timeout, slot.id
        );

        let handle = self.factory.open().map_err(|e| {
            warn!("could not open temporary native telemetry handle: {e}");
            Error::LockTimeout {
                resource: SHARED_HANDLE,
                timeout: self.config.lock_timeout,
            }
        })?;
        let result = op(handle.as_ref());
        drop(handle);
        drop(slot);
        result
    }

    /// Warns when more temporary handles are alive than the threshold.
    /// Returns whether a warning was emitted.
    fn check_for_leaks(&self) -> bool {
        let live = self.temporaries.live.load(Ordering::SeqCst);
        let threshold = self.config.leak_warning_threshold;
        if live <= threshold {
            trace!("{live} temporary native telemetry handles open");
            return false;
        }

        warn!(
            "{live} temporary native telemetry handles are open (warning threshold {threshold}); \
             a caller is probably holding the {SHARED_HANDLE} without returning"
        );

        if self.config.dump_on_leak {
            if let Some(user) = self.shared_user.lock().clone() {
                warn!(
                    "{SHARED_HANDLE} held for {:?} by thread {}:\n{}",
                    user.since.elapsed(),
                    user.thread,
                    user.backtrace.as_deref().unwrap_or("<no backtrace>")
                );
            }
            let users = self.temporaries.users.lock().clone();
            for (id, user) in users {
                warn!(
                    "temporary handle #{id} open for {:?} in thread {}:\n{}",
                    user.since.elapsed(),
                    user.thread,
                    user.backtrace.as_deref().unwrap_or("<no backtrace>")
                );
            }
        }

        true
    }
}

/// Single arbitration point for native telemetry calls. Share it between
/// consumers with an `Arc`.
pub struct Arbiter {
    inner: Arc<ArbiterInner>,
    monitor: Mutex<Option<LeakMonitor>>,
}

impl Arbiter {
    /// Creates the arbiter and starts its leak monitor. The shared handle is
    /// opened lazily by the first call.
    pub fn open(factory: impl HandleFactory + 'static, config: ArbiterConfig) -> Self {
        let inner = Arc::new(ArbiterInner {
            factory: Box::new(factory),
            shared: Mutex::new(None),
            shared_open: AtomicBool::new(false),
            shared_user: Mutex::new(None),
            enabled: AtomicBool::new(config.enabled),
            closed: AtomicBool::new(false),
            temporaries: TemporaryHandles::default(),
            config,
        });

        let monitor = if inner.config.leak_check_interval.is_zero() {
            None
        } else {
            let weak = Arc::downgrade(&inner);
            match LeakMonitor::spawn(inner.config.leak_check_interval, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check_for_leaks();
                }
            }) {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    error!("could not start native telemetry leak monitor: {e}");
                    None
                }
            }
        };

        Self {
            inner,
            monitor: Mutex::new(monitor),
        }
    }

    /// Runs `op` against a provider handle under the arbitration rules.
    /// Failures of the arbitration itself are returned as-is and never
    /// retried here.
    pub fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn TelemetryProvider) -> Result<T>,
    {
        self.inner.call(op)
    }

    pub fn enable(&self) {
        if !self.inner.enabled.swap(true, Ordering::SeqCst) {
            info!("native telemetry access enabled");
        }
    }

    pub fn disable(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            info!("native telemetry access disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.inner.config
    }

    /// Stops the leak monitor and releases the shared handle. Further calls
    /// fail with [`Error::Closed`]. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }

        match self.inner.shared.try_lock_for(self.inner.config.lock_timeout) {
            Some(mut shared) => {
                if shared.take().is_some() {
                    self.inner.shared_open.store(false, Ordering::SeqCst);
                    debug!("closed {SHARED_HANDLE}");
                }
            }
            None => warn!("{SHARED_HANDLE} is busy; it will be closed when the current call returns"),
        }

        info!("native telemetry arbiter closed");
    }

    pub fn stats(&self) -> ArbiterStats {
        let temporaries = &self.inner.temporaries;
        ArbiterStats {
            live_temporary_handles: temporaries.live.load(Ordering::SeqCst),
            peak_temporary_handles: temporaries.peak.load(Ordering::SeqCst),
            temporary_handles_created: temporaries.created.load(Ordering::SeqCst),
            shared_handle_open: self.inner.shared_open.load(Ordering::SeqCst),
            enabled: self.is_enabled(),
            closed: self.is_closed(),
        }
    }

    /// Provider view whose every operation goes through this arbiter.
    pub fn provider(self: &Arc<Self>) -> ArbitratedProvider {
        ArbitratedProvider::new(Arc::clone(self))
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Delegates each provider operation through [`Arbiter::call`].
#[derive(Clone)]
pub struct ArbitratedProvider {
    arbiter: Arc<Arbiter>,
}

impl ArbitratedProvider {
    pub fn new(arbiter: Arc<Arbiter>) -> Self {
        Self { arbiter }
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }
}

impl TelemetryProvider for ArbitratedProvider {
    fn list_process_ids(&self) -> Result<Vec<Pid>> {
        self.arbiter.call(|p| p.list_process_ids())
    }

    fn get_process_state(&self, pid: Pid) -> Result<ProcState> {
        self.arbiter.call(|p| p.get_process_state(pid))
    }

    fn get_process_args(&self, pid: Pid) -> Result<Vec<String>> {
        self.arbiter.call(|p| p.get_process_args(pid))
    }

    fn get_process_executable_info(&self, pid: Pid) -> Result<ProcExe> {
        self.arbiter.call(|p| p.get_process_executable_info(pid))
    }

    fn get_process_environment(&self, pid: Pid) -> Result<HashMap<String, String>> {
        self.arbiter.call(|p| p.get_process_environment(pid))
    }

    fn get_process_memory(&self, pid: Pid) -> Result<ProcMem> {
        self.arbiter.call(|p| p.get_process_memory(pid))
    }

    fn get_process_cpu(&self, pid: Pid) -> Result<ProcCpu> {
        self.arbiter.call(|p| p.get_process_cpu(pid))
    }

    fn get_process_time(&self, pid: Pid) -> Result<ProcTime> {
        self.arbiter.call(|p| p.get_process_time(pid))
    }

    fn get_process_file_descriptors(&self, pid: Pid) -> Result<ProcFd> {
        self.arbiter.call(|p| p.get_process_file_descriptors(pid))
    }

    fn get_process_credentials(&self, pid: Pid) -> Result<ProcCred> {
        self.arbiter.call(|p| p.get_process_credentials(pid))
    }

    fn send_signal(&self, pid: Pid, signal: &str) -> Result<()> {
        self.arbiter.call(|p| p.send_signal(pid, signal))
    }
}
