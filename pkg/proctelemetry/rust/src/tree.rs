// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Rolls up the resource usage of a process and its direct children.
//!
//! Children are discovered by scanning the process table for entries whose
//! parent is the root. Once tracked, a child is kept even after it stops
//! matching (it was reparented or exited) and keeps contributing its last
//! known values until the owner forgets it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;
use serde::Serialize;

use crate::arbiter::Arbiter;
use crate::errors::Result;
use crate::provider::Pid;
use crate::snapshot::{ProcessSample, ProcessSnapshot, SnapshotConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateMemory {
    pub size: u64,
    pub resident: u64,
    pub share: u64,
    pub page_faults: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateCpu {
    pub user_ms: u64,
    pub sys_ms: u64,
    pub total_ms: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateTime {
    pub user_ms: u64,
    pub sys_ms: u64,
    pub total_ms: u64,
}

/// Sums over the root and every tracked child. A metric a process has never
/// reported counts as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateView {
    pub root_pid: Pid,
    pub processes: usize,
    pub memory: AggregateMemory,
    pub cpu: AggregateCpu,
    pub time: AggregateTime,
    pub file_descriptors: u64,
}

impl AggregateView {
    fn from_samples(root_pid: Pid, samples: &[ProcessSample]) -> Self {
        let sum = |metric: fn(&ProcessSample) -> Option<u64>| -> u64 {
            samples
                .iter()
                .filter_map(metric)
                .fold(0, u64::saturating_add)
        };

        Self {
            root_pid,
            processes: samples.len(),
            memory: AggregateMemory {
                size: sum(|s| s.memory.as_ref().map(|m| m.size)),
                resident: sum(|s| s.memory.as_ref().map(|m| m.resident)),
                share: sum(|s| s.memory.as_ref().map(|m| m.share)),
                page_faults: sum(|s| s.memory.as_ref().map(|m| m.page_faults())),
            },
            cpu: AggregateCpu {
                user_ms: sum(|s| s.cpu.as_ref().map(|c| c.user_ms)),
                sys_ms: sum(|s| s.cpu.as_ref().map(|c| c.sys_ms)),
                total_ms: sum(|s| s.cpu.as_ref().map(|c| c.total_ms)),
                percent: samples
                    .iter()
                    .filter_map(|s| s.cpu.as_ref()?.percent)
                    .sum(),
            },
            time: AggregateTime {
                user_ms: sum(|s| s.time.as_ref().map(|t| t.user_ms)),
                sys_ms: sum(|s| s.time.as_ref().map(|t| t.sys_ms)),
                total_ms: sum(|s| s.time.as_ref().map(|t| t.total_ms)),
            },
            file_descriptors: sum(|s| s.file_descriptors.as_ref().map(|f| f.total)),
        }
    }
}

#[derive(Default)]
struct Children {
    tracked: BTreeMap<Pid, Arc<ProcessSnapshot>>,
    /// Pids that matched the most recent scan.
    matched: BTreeSet<Pid>,
}

pub struct ProcessTree {
    root: Arc<ProcessSnapshot>,
    arbiter: Arc<Arbiter>,
    config: SnapshotConfig,
    children: Mutex<Children>,
}

impl ProcessTree {
    pub fn new(root_pid: Pid, arbiter: &Arc<Arbiter>, config: SnapshotConfig) -> Self {
        Self {
            root: Arc::new(ProcessSnapshot::new(root_pid, arbiter, config)),
            arbiter: Arc::clone(arbiter),
            config,
            children: Mutex::new(Children::default()),
        }
    }

    pub fn root(&self) -> &Arc<ProcessSnapshot> {
        &self.root
    }

    pub fn root_pid(&self) -> Pid {
        self.root.pid()
    }

    /// Refreshes the root, discovers its current children, refreshes those,
    /// and returns the new aggregate.
    pub fn refresh(&self) -> Result<AggregateView> {
        self.root.refresh()?;

        // A dead root's pid may be reused; its new owner's children are not ours.
        if self.root.is_dead() {
            debug!("root process {} is dead, skipping child scan", self.root_pid());
            return Ok(self.aggregate());
        }

        let matching = self.scan_children()?;
        let to_refresh: Vec<_> = {
            let mut children = self.children.lock();
            let snapshots = matching
                .iter()
                .map(|&pid| {
                    let snapshot = children.tracked.entry(pid).or_insert_with(|| {
                        debug!("tracking child {pid} of process {}", self.root_pid());
                        Arc::new(ProcessSnapshot::new(pid, &self.arbiter, self.config))
                    });
                    Arc::clone(snapshot)
                })
                .collect();
            children.matched = matching.into_iter().collect();
            snapshots
        };

        for child in to_refresh {
            child.refresh()?;
        }

        Ok(self.aggregate())
    }

    /// Pids in the process table whose parent is the root, read in a single
    /// arbitrated call.
    fn scan_children(&self) -> Result<Vec<Pid>> {
        let root = self.root_pid();
        self.arbiter.call(|provider| {
            let pids = provider.list_process_ids()?;
            Ok(pids
                .into_iter()
                .filter(|&pid| pid != root)
                .filter(|&pid| match provider.get_process_state(pid) {
                    Ok(state) => state.ppid == root,
                    Err(e) => {
                        trace!("skipping process {pid} while scanning for children: {e}");
                        false
                    }
                })
                .collect())
        })
    }

    /// Sums the last known values of the root and every tracked child
    /// without refreshing anything.
    pub fn aggregate(&self) -> AggregateView {
        let mut samples = vec![self.root.current()];
        samples.extend(
            self.children
                .lock()
                .tracked
                .values()
                .map(|child| child.current()),
        );
        AggregateView::from_samples(self.root_pid(), &samples)
    }

    pub fn children(&self) -> Vec<Pid> {
        self.children.lock().tracked.keys().copied().collect()
    }

    pub fn child(&self, pid: Pid) -> Option<Arc<ProcessSnapshot>> {
        self.children.lock().tracked.get(&pid).cloned()
    }

    /// Stops tracking `pid`; its values no longer count toward the aggregate.
    pub fn forget_child(&self, pid: Pid) -> Option<Arc<ProcessSnapshot>> {
        let mut children = self.children.lock();
        children.matched.remove(&pid);
        children.tracked.remove(&pid)
    }

    /// Refreshes the children that did not match the last scan, then stops
    /// tracking every child known to be dead. Returns the forgotten pids.
    /// Reparented children that are still alive are kept.
    pub fn forget_dead_children(&self) -> Result<Vec<Pid>> {
        let unmatched: Vec<_> = {
            let children = self.children.lock();
            children
                .tracked
                .iter()
                .filter(|&(pid, child)| !children.matched.contains(pid) && !child.is_dead())
                .map(|(_, child)| Arc::clone(child))
                .collect()
        };
        for child in unmatched {
            child.refresh()?;
        }

        let mut children = self.children.lock();
        let dead: Vec<Pid> = children
            .tracked
            .iter()
            .filter(|(_, child)| child.is_dead())
            .map(|(&pid, _)| pid)
            .collect();
        for pid in &dead {
            children.tracked.remove(pid);
            children.matched.remove(pid);
            debug!("forgot dead child {pid} of process {}", self.root_pid());
        }
        Ok(dead)
    }
}
