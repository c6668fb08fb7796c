//! Process-table snapshot and descendant discovery.
//!
//! Maps every live process to its parent by reading `/proc/<pid>/stat`, then
//! walks the child relation breadth-first from a root PID. The table is
//! rebuilt from scratch on every call: children appear and disappear between
//! pause cycles, so nothing here is worth caching.

use std::collections::VecDeque;
use std::fs;

use anyhow::{Context, Result};
use tracing::debug;

/// One process-table entry: a process and its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
}

/// Snapshot the live process table from `/proc`.
///
/// Entries that cannot be read are skipped: a process exiting between the
/// directory scan and the stat read is an expected race, not an error. Only
/// an unreadable `/proc` itself is fatal.
pub fn snapshot() -> Result<Vec<ProcessRecord>> {
    let entries = fs::read_dir("/proc").context("could not open /proc")?;

    let mut records = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        match parent_of(pid) {
            Some(ppid) => records.push(ProcessRecord { pid, ppid }),
            None => debug!("failed to read parent process id for {pid}"),
        }
    }
    Ok(records)
}

/// Parent PID of `pid`, read from `/proc/<pid>/stat`.
///
/// The stat line is `pid (comm) state ppid ...`. comm may itself contain
/// parentheses and spaces, so the parse anchors on the last `)`.
fn parent_of(pid: i32) -> Option<i32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// All transitive descendants of `root` in the live process table, in
/// breadth-first discovery order, excluding `root` itself.
pub fn descendants(root: i32) -> Result<Vec<i32>> {
    Ok(descendants_in(&snapshot()?, root))
}

/// Breadth-first closure of the child relation over a fixed snapshot.
///
/// Kernel idle tasks can be recorded as their own parent; the containment
/// check keeps such records from looping the walk.
fn descendants_in(records: &[ProcessRecord], root: i32) -> Vec<i32> {
    let mut found = Vec::new();
    let mut frontier = VecDeque::from([root]);

    while let Some(parent) = frontier.pop_front() {
        for record in records {
            if record.ppid == parent && record.pid != root && !found.contains(&record.pid) {
                found.push(record.pid);
                frontier.push_back(record.pid);
            }
        }
    }
    found
}
