//! Resident memory sampling for the memory watchdog.
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of resident-memory readings for a process.
pub trait MemorySampler: Send {
    /// Resident set size of `pid` in bytes, or `None` if it cannot be read.
    fn resident_bytes(&mut self, pid: u32) -> Option<u64>;
}

/// Reads memory through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|process| process.memory())
    }
}

/// Sampler that replays scripted readings; used to drive the watchdog in tests.
#[derive(Default)]
pub struct ScriptedSampler {
    readings: Vec<u64>,
}

impl ScriptedSampler {
    /// Readings are handed out in order; the last one repeats.
    pub fn new(readings: Vec<u64>) -> Self {
        Self { readings }
    }
}

impl MemorySampler for ScriptedSampler {
    fn resident_bytes(&mut self, _pid: u32) -> Option<u64> {
        match self.readings.len() {
            0 => None,
            1 => self.readings.first().copied(),
            _ => Some(self.readings.remove(0)),
        }
    }
}
