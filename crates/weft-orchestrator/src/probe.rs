use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

/// Host resource pressure, in percent (0 to 100).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of resource samples for adaptive concurrency.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}

/// [`ResourceProbe`] reading the host through `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after construction reads low.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        ResourceSample {
            cpu_percent: f64::from(system.global_cpu_usage()),
            memory_percent,
        }
    }
}

/// A probe that always reports the same sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub ResourceSample);

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn sample(&self) -> ResourceSample {
        self.0
    }
}
