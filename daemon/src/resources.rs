use sysinfo::System;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

pub struct ResourceManager {
    system: System,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn available_memory_gb(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.available_memory() / BYTES_PER_GB
    }

    /// Check whether the host can currently honour a memory ceiling.
    ///
    /// Only warns: the worker pool may be dispatched to a cluster, in which
    /// case local memory is irrelevant.
    pub fn check_memory_available(&mut self, service: &str, required_gb: u32) -> bool {
        let available_gb = self.available_memory_gb();
        if available_gb < u64::from(required_gb) {
            log::warn!(
                "{}: memory ceiling is {}GB but only {}GB is available",
                service,
                required_gb,
                available_gb
            );
            return false;
        }
        true
    }
}
