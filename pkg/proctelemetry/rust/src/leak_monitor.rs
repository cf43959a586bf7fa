// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

const THREAD_NAME: &str = "proc-telemetry-leak-monitor";

/// Background thread running `check` every `interval` until stopped.
pub(crate) struct LeakMonitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl LeakMonitor {
    pub(crate) fn spawn<F>(interval: Duration, check: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                while !*stopped {
                    let timed_out = cvar.wait_for(&mut stopped, interval).timed_out();
                    if *stopped {
                        break;
                    }
                    if timed_out {
                        MutexGuard::unlocked(&mut stopped, &check);
                    }
                }
                debug!("{THREAD_NAME} exiting");
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock() = true;
        cvar.notify_all();

        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            debug!("{THREAD_NAME} panicked");
        }
    }
}

impl Drop for LeakMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
