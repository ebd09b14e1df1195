//! Process memory sampling for ingestion backpressure.

use std::sync::Mutex;

use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used: u64,
    pub total: u64,
}

impl MemorySample {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }
}

pub trait MemorySampler: Send + Sync {
    /// `None` when the platform cannot report memory.
    fn sample(&self) -> Option<MemorySample>;
}

/// Samples this process's resident memory against a budget, or against the
/// host's total memory when no budget is configured.
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
    budget: Option<u64>,
}

impl SysinfoSampler {
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            budget: budget.filter(|b| *b > 0),
        }
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&self) -> Option<MemorySample> {
        let pid = self.pid?;
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let used = sys.process(pid)?.memory();
        let total = match self.budget {
            Some(budget) => budget,
            None => {
                sys.refresh_memory();
                sys.total_memory()
            },
        };
        Some(MemorySample { used, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_handles_zero_total() {
        assert_eq!(MemorySample { used: 5, total: 0 }.ratio(), 0.0);
        assert!((MemorySample { used: 1, total: 4 }.ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn sysinfo_reports_this_process() {
        let sampler = SysinfoSampler::new(Some(u64::MAX));
        if let Some(sample) = sampler.sample() {
            assert!(sample.used > 0);
            assert_eq!(sample.total, u64::MAX);
        }
    }
}
