// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Process tree discovery and termination

use crate::error::{Result, UpdateError};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

pub trait ProcessTree: Send + Sync + fmt::Debug {
    /// Every process below `pid`, parents before children
    fn descendants(&self, pid: u32) -> Result<Vec<u32>>;

    /// Freeze one process so it cannot spawn more children
    fn suspend(&self, pid: u32) -> Result<()>;

    /// Forcibly kill one process; an already-gone process is not an error
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Forcibly kill every member of process group `pgid`; an empty group is not an error
    fn terminate_group(&self, pgid: u32) -> Result<()>;
}

/// Kill the tool led by `pid` together with everything it started.
///
/// `pid` must lead its own process group. While `root_running` is true the root has
/// not been collected, so `pid` still names it: the root is frozen, its descendants
/// are killed deepest first, then the group, then the root. Once the root has been
/// collected only the group kill is sent, which also reaches orphans that were
/// reparented away from the tree.
pub fn terminate_tree(tree: &dyn ProcessTree, pid: u32, root_running: bool) {
    if root_running {
        if let Err(e) = tree.suspend(pid) {
            tracing::warn!("Failed to stop process {pid}: {e}");
        }

        let descendants = tree.descendants(pid).unwrap_or_else(|e| {
            tracing::warn!("Failed to enumerate children of {pid}: {e}");
            Vec::new()
        });
        tracing::info!(
            "Killing flashing process {pid} and {} descendant(s)",
            descendants.len()
        );

        for child in descendants.iter().rev() {
            if let Err(e) = tree.terminate(*child) {
                tracing::warn!("Failed to kill descendant {child}: {e}");
            }
        }
    } else {
        tracing::info!("Flashing process {pid} already exited, killing its process group");
    }

    if let Err(e) = tree.terminate_group(pid) {
        tracing::warn!("Failed to kill process group {pid}: {e}");
    }
    if root_running {
        if let Err(e) = tree.terminate(pid) {
            tracing::warn!("Failed to kill process {pid}: {e}");
        }
    }
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| UpdateError::Launch(format!("pid {pid} out of range")))
}

fn ignore_gone(result: nix::Result<()>) -> Result<()> {
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(UpdateError::Io(std::io::Error::from(e))),
    }
}

/// Reads parent links from `/proc/<pid>/stat`.
#[derive(Debug, Clone)]
pub struct ProcfsTree {
    proc_root: PathBuf,
}

impl Default for ProcfsTree {
    fn default() -> Self {
        Self::new(Path::new("/proc"))
    }
}

impl ProcfsTree {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
        }
    }

    fn children_by_parent(&self) -> Result<HashMap<u32, Vec<u32>>> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes can vanish between read_dir and read
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = parse_parent_pid(&stat) {
                children.entry(ppid).or_default().push(pid);
            }
        }
        Ok(children)
    }
}

impl ProcessTree for ProcfsTree {
    fn descendants(&self, pid: u32) -> Result<Vec<u32>> {
        let children = self.children_by_parent()?;
        let mut found = Vec::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            if let Some(kids) = children.get(&parent) {
                for &kid in kids {
                    if kid != pid && !found.contains(&kid) {
                        found.push(kid);
                        queue.push_back(kid);
                    }
                }
            }
        }
        Ok(found)
    }

    fn suspend(&self, pid: u32) -> Result<()> {
        ignore_gone(signal::kill(to_pid(pid)?, Signal::SIGSTOP))
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        ignore_gone(signal::kill(to_pid(pid)?, Signal::SIGKILL))
    }

    fn terminate_group(&self, pgid: u32) -> Result<()> {
        ignore_gone(signal::killpg(to_pid(pgid)?, Signal::SIGKILL))
    }
}

/// Fields of `/proc/<pid>/stat` that follow the command name: state, ppid, pgrp, ...
/// The name is wrapped in parentheses and may itself contain ") ".
fn stat_fields(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    Some(stat.get(stat.rfind(')')? + 1..)?.split_whitespace())
}

fn parse_parent_pid(stat: &str) -> Option<u32> {
    stat_fields(stat)?.nth(1)?.parse().ok()
}

/// Non-zombie processes whose process group is `pgid`
#[cfg(test)]
pub(crate) fn live_group_members(proc_root: &Path, pgid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            let mut fields = stat_fields(&stat)?;
            let state = fields.next()?;
            let group: u32 = fields.nth(1)?.parse().ok()?;
            (group == pgid && state != "Z" && state != "X").then_some(pid)
        })
        .collect()
}
