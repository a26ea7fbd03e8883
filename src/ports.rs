use crate::config::PortSettings;
use crate::error::DeployError;
use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

/// Hands out ports from a fixed range that are neither assigned to a service
/// nor bound by anything else on the host.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    max_attempts: u32,
    probing: Arc<Mutex<HashSet<u16>>>,
}

/// A port reserved against concurrent allocations until dropped.
///
/// Keep the lease alive until the port has been written to the store.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    probing: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut probing = self.probing.lock().unwrap_or_else(|e| e.into_inner());
        probing.remove(&self.port);
    }
}

impl PortAllocator {
    pub fn new(settings: &PortSettings) -> Self {
        Self {
            start: settings.start,
            end: settings.end,
            max_attempts: settings.max_attempts,
            probing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn exhausted(&self) -> DeployError {
        DeployError::ResourceExhausted {
            start: self.start,
            end: self.end,
        }
    }

    /// Samples up to `max_attempts` candidates, skipping `assigned` ports and
    /// ports another caller is probing, and returns the first one that binds.
    pub fn allocate(&self, assigned: &HashSet<u16>) -> Result<PortLease, DeployError> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.max_attempts {
            let candidate = rng.gen_range(self.start..=self.end);
            if assigned.contains(&candidate) {
                continue;
            }
            {
                let mut probing = self
                    .probing
                    .lock()
                    .map_err(|_| DeployError::Internal("port table poisoned".to_string()))?;
                if self.saturated(assigned, &probing) {
                    break;
                }
                if !probing.insert(candidate) {
                    continue;
                }
            }
            let lease = PortLease {
                port: candidate,
                probing: Arc::clone(&self.probing),
            };
            if is_bindable(candidate) {
                return Ok(lease);
            }
            // lease drops here and frees the candidate for other callers
        }
        Err(self.exhausted())
    }

    fn saturated(&self, assigned: &HashSet<u16>, probing: &HashSet<u16>) -> bool {
        (self.start..=self.end).all(|p| assigned.contains(&p) || probing.contains(&p))
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
