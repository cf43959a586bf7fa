// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

mod arbiter;
pub mod config;
mod errors;
mod leak_monitor;
pub mod procfs;
mod provider;
mod snapshot;
mod tree;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export the public API
pub use arbiter::{ArbitratedProvider, Arbiter, ArbiterConfig, ArbiterStats, HandleUser};
pub use errors::{Error, Result};
pub use provider::{
    HandleFactory, Pid, ProcCpu, ProcCred, ProcExe, ProcFd, ProcMem, ProcState, ProcTime,
    RunState, TelemetryProvider,
};
pub use snapshot::{
    ProcessIdentity, ProcessSample, ProcessSnapshot, SnapshotConfig, SnapshotState,
    UNKNOWN_COMMAND,
};
pub use tree::{AggregateCpu, AggregateMemory, AggregateTime, AggregateView, ProcessTree};
