//! Process resource sampling.

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

const MB: f64 = 1024.0 * 1024.0;

/// Memory figures for the current process and host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryUsage {
    /// Resident set size of this process
    pub rss_bytes: u64,
    /// Virtual memory reserved by this process
    pub virtual_bytes: u64,
    /// Memory in use across the host
    pub system_used_bytes: u64,
    /// Total host memory
    pub system_total_bytes: u64,
}

impl MemoryUsage {
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / MB
    }

    /// Fraction of host memory in use, 0.0 when the total is unknown.
    pub fn used_ratio(&self) -> f64 {
        if self.system_total_bytes == 0 {
            0.0
        } else {
            self.system_used_bytes as f64 / self.system_total_bytes as f64
        }
    }
}

/// One resource reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub memory: MemoryUsage,
    /// CPU usage of this process in percent of one core
    pub cpu_percent: f32,
}

/// Source of resource readings; swapped for a fixed probe in tests.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Probe backed by the operating system via `sysinfo`.
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_memory();

        let mut sample = ResourceSample {
            memory: MemoryUsage {
                system_used_bytes: system.used_memory(),
                system_total_bytes: system.total_memory(),
                ..MemoryUsage::default()
            },
            cpu_percent: 0.0,
        };

        if let Some(pid) = self.pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                sample.memory.rss_bytes = process.memory();
                sample.memory.virtual_bytes = process.virtual_memory();
                sample.cpu_percent = process.cpu_usage();
            }
        }

        sample
    }
}

/// Probe returning a constant reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub ResourceSample);

impl FixedProbe {
    /// A probe reporting `rss_mb` of resident memory out of a 16 GiB host at `used_ratio` usage.
    pub fn with_rss_mb(rss_mb: f64, used_ratio: f64) -> Self {
        let total = 16 * 1024 * 1024 * 1024_u64;
        Self(ResourceSample {
            memory: MemoryUsage {
                rss_bytes: (rss_mb * MB) as u64,
                virtual_bytes: (rss_mb * MB) as u64 * 2,
                system_used_bytes: (total as f64 * used_ratio) as u64,
                system_total_bytes: total,
            },
            cpu_percent: 5.0,
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceSample {
        self.0
    }
}
