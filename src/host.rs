//! Host resource probe for the admission gate (§4.3 `HostResourcesAvailable`).

use parking_lot::Mutex;
use sysinfo::System;

pub struct HostProbe {
    system: Mutex<System>,
}

impl HostProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system: Mutex::new(system) }
    }

    pub fn core_count(&self) -> usize {
        self.system.lock().cpus().len().max(1)
    }

    pub fn total_memory_mib(&self) -> i64 {
        (self.system.lock().total_memory() / (1024 * 1024)) as i64
    }

    /// Free CPU percentage = 100 − system-wide CPU utilization.
    pub fn available_cpu_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        let used: f64 = system.cpus().iter().map(|c| c.cpu_usage() as f64).sum::<f64>()
            / system.cpus().len().max(1) as f64;
        (100.0 - used).max(0.0)
    }

    /// Free memory in MiB = OS-reported available bytes / 2^20.
    pub fn available_memory_mib(&self) -> i64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        (system.available_memory() / (1024 * 1024)) as i64
    }

    /// §4.3: free CPU% ≥ CPU_UNIT / (MAX_CPU · cores) and free memory (MiB)
    /// ≥ MEM_UNIT.
    pub fn resources_available(&self, cpu_unit: i64, max_cpu: i64, mem_unit: i64) -> bool {
        let cores = self.core_count() as f64;
        let threshold = cpu_unit as f64 / (max_cpu as f64 * cores);
        self.available_cpu_percent() >= threshold && self.available_memory_mib() >= mem_unit
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}
