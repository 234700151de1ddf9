//! Lookup of OS processes by executable name
//!
//! Used to sweep strays left over from earlier runs and to tolerate handle
//! loss: a process found under the expected name still counts as alive.

use parking_lot::Mutex;
use std::ffi::OsStr;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// A process found in the OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Enumerates and kills OS processes by executable name
pub trait ProcessRegistry: Send + Sync {
    /// All running processes whose executable name is `name`
    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry>;

    /// Forcefully kill a process; returns false if it could not be signalled
    fn kill(&self, pid: u32) -> bool;

    /// Whether a process with this pid still exists
    fn is_running(&self, pid: u32) -> bool;
}

pub type SharedRegistry = Arc<dyn ProcessRegistry>;

/// Registry backed by the operating system's process table
pub struct SystemRegistry {
    system: Mutex<System>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Names a process may be listed under for a given executable
fn name_variants(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if let Some(stem) = name.strip_suffix(".exe") {
        names.push(stem.to_string());
    } else {
        names.push(format!("{}.exe", name));
    }
    names
}

impl ProcessRegistry for SystemRegistry {
    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut found = Vec::new();
        for variant in name_variants(name) {
            for process in system.processes_by_exact_name(OsStr::new(&variant)) {
                found.push(ProcessEntry {
                    pid: process.pid().as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                });
            }
        }
        found
    }

    fn kill(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.kill()).unwrap_or(false)
    }

    fn is_running(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_variants() {
        assert_eq!(name_variants("nginx"), vec!["nginx", "nginx.exe"]);
        assert_eq!(name_variants("php-cgi.exe"), vec!["php-cgi.exe", "php-cgi"]);
    }

    #[test]
    fn test_current_process_is_running() {
        let registry = SystemRegistry::new();
        assert!(registry.is_running(std::process::id()));
    }

    #[test]
    fn test_unknown_name_finds_nothing() {
        let registry = SystemRegistry::new();
        assert!(registry
            .find_by_name("tierwarden-no-such-process-name")
            .is_empty());
    }
}
