use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Point-in-time memory figures, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub process_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
}

/// Source of process-wide resource figures. Implementations must be cheap
/// enough to call on every step completion.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceUsage {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        let process_memory_bytes = match self.pid {
            Some(pid) => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };
        ResourceUsage {
            process_memory_bytes,
            total_memory_bytes: system.total_memory(),
            used_memory_bytes: system.used_memory(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    pub os_version: Option<String>,
    pub host_name: Option<String>,
    pub pid: u32,
    pub cpu_count: usize,
    pub system_uptime_secs: u64,
    pub process_uptime_secs: u64,
    pub memory: ResourceUsage,
}

impl SystemInfo {
    pub fn collect(probe: &dyn ResourceProbe, started: Instant) -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_version: System::long_os_version(),
            host_name: System::host_name(),
            pid: std::process::id(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            system_uptime_secs: System::uptime(),
            process_uptime_secs: started.elapsed().as_secs(),
            memory: probe.sample(),
        }
    }
}
