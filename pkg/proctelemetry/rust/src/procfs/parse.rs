// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Parsers for the text files under /proc/<pid>. They only look at the
//! fields we report and ignore the rest.

use crate::provider::Pid;

/// Fields of /proc/<pid>/stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub comm: String,
    pub state: char,
    pub ppid: Pid,
    pub minflt: u64,
    pub majflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u64,
    pub starttime: u64,
}

// Offsets counted from the first field after the state letter.
const PPID: usize = 0;
const MINFLT: usize = 6;
const MAJFLT: usize = 8;
const UTIME: usize = 10;
const STIME: usize = 11;
const NUM_THREADS: usize = 16;
const STARTTIME: usize = 18;

pub fn parse_stat(content: &str) -> Option<Stat> {
    // comm is free text and may itself contain spaces and parentheses, so it
    // spans from the first '(' to the last ')'.
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let comm = content.get(open + 1..close)?.to_string();

    let mut fields = content.get(close + 1..)?.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let rest: Vec<&str> = fields.collect();
    let field = |index: usize| -> Option<u64> { rest.get(index)?.parse().ok() };

    Some(Stat {
        comm,
        state,
        ppid: rest.get(PPID)?.parse().ok()?,
        minflt: field(MINFLT)?,
        majflt: field(MAJFLT)?,
        utime: field(UTIME)?,
        stime: field(STIME)?,
        num_threads: field(NUM_THREADS)?,
        starttime: field(STARTTIME)?,
    })
}

/// Splits /proc/<pid>/cmdline into arguments.
///
/// Trailing NULs left by a process that shortened its argv are dropped. A
/// command line rewritten as a single space separated string (gunicorn,
/// puma and other setproctitle users) is split on spaces instead.
pub fn parse_cmdline(raw: &str) -> Vec<String> {
    let trimmed = raw.trim_end_matches('\0');
    let mut parts = trimmed.split('\0');
    let packed = match (parts.next(), parts.next()) {
        (Some(only), None) => only.contains(' '),
        _ => false,
    };

    let separator = if packed { ' ' } else { '\0' };
    trimmed
        .split_terminator(separator)
        .map(str::to_string)
        .collect()
}

/// Fields of /proc/<pid>/statm, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statm {
    pub size: u64,
    pub resident: u64,
    pub shared: u64,
}

pub fn parse_statm(content: &str) -> Option<Statm> {
    let mut fields = content.split_whitespace().map(|f| f.parse::<u64>().ok());
    Some(Statm {
        size: fields.next()??,
        resident: fields.next()??,
        shared: fields.next()??,
    })
}

/// Real and effective ids from the Uid:/Gid: lines of /proc/<pid>/status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ids {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

pub fn parse_status_ids(content: &str) -> Option<Ids> {
    let mut uids = None;
    let mut gids = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            uids = parse_id_pair(rest);
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gids = parse_id_pair(rest);
        }
    }

    let (uid, euid) = uids?;
    let (gid, egid) = gids?;
    Some(Ids {
        uid,
        euid,
        gid,
        egid,
    })
}

fn parse_id_pair(rest: &str) -> Option<(u32, u32)> {
    let mut ids = rest.split_whitespace();
    let real = ids.next()?.parse().ok()?;
    let effective = ids.next()?.parse().ok()?;
    Some((real, effective))
}

/// Boot time in seconds since the epoch, from the btime line of /proc/stat.
pub fn parse_boot_time(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime"))
        .and_then(|rest| rest.trim().parse().ok())
}

pub fn ticks_to_ms(ticks: u64, clock_ticks: u64) -> u64 {
    if clock_ticks == 0 {
        return 0;
    }
    ticks.saturating_mul(1000) / clock_ticks
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (weird) proc) S 1 4242 4242 0 -1 4194560 1500 0 7 0 250 50 0 0 20 0 3 0 98765 12345678 300 18446744073709551615";

    #[test]
    fn test_parse_stat() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.comm, "my (weird) proc");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.minflt, 1500);
        assert_eq!(stat.majflt, 7);
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.num_threads, 3);
        assert_eq!(stat.starttime, 98765);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert_eq!(parse_stat("4242 (sh) S 1 4242"), None);
        assert_eq!(parse_stat(""), None);
        assert_eq!(parse_stat("4242 sh S 1"), None);
    }

    #[test]
    fn test_parse_cmdline() {
        assert_eq!(
            parse_cmdline("python\0-u\0script.py\0"),
            vec!["python", "-u", "script.py"]
        );
        assert_eq!(
            parse_cmdline("gunicorn: master [foobar]\0\0\0\0"),
            vec!["gunicorn:", "master", "[foobar]"]
        );
        assert_eq!(parse_cmdline("/usr/bin/my app\0--flag"), vec!["/usr/bin/my app", "--flag"]);
        assert!(parse_cmdline("").is_empty());
        assert!(parse_cmdline("\0\0").is_empty());
    }

    #[test]
    fn test_parse_statm() {
        let statm = parse_statm("2000 300 120 10 0 500 0\n").unwrap();
        assert_eq!(
            statm,
            Statm {
                size: 2000,
                resident: 300,
                shared: 120
            }
        );
        assert_eq!(parse_statm("2000 abc"), None);
    }

    #[test]
    fn test_parse_status_ids() {
        let status = "Name:\tbash\nState:\tS (sleeping)\nUid:\t1000\t0\t0\t0\nGid:\t100\t101\t101\t101\n";
        let ids = parse_status_ids(status).unwrap();
        assert_eq!(
            ids,
            Ids {
                uid: 1000,
                euid: 0,
                gid: 100,
                egid: 101
            }
        );
        assert_eq!(parse_status_ids("Name:\tbash\nUid:\t1000\t1000\n"), None);
    }

    #[test]
    fn test_parse_boot_time() {
        let content = "cpu  1 2 3 4\nintr 0\nbtime 1700000000\nprocesses 10\n";
        assert_eq!(parse_boot_time(content), Some(1_700_000_000));
        assert_eq!(parse_boot_time("cpu 1 2 3\n"), None);
    }

    #[test]
    fn test_ticks_to_ms() {
        assert_eq!(ticks_to_ms(250, 100), 2500);
        assert_eq!(ticks_to_ms(1, 1000), 1);
        assert_eq!(ticks_to_ms(10, 0), 0);
    }
}
