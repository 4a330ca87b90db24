//! Loopback port allocation for proxy instances.
//!
//! Scans upward from a configured start port, skipping ports already handed
//! out to live sessions and probing real bind availability, so that two
//! concurrent session-creation requests can never race into the same port.

use crate::error::{RelayError, RelayResult};
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

pub struct PortAllocator {
    start: u16,
    window: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, window: u16) -> Self {
        Self {
            start,
            window,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Find, probe and reserve an unused loopback port.
    ///
    /// The scan-and-reserve step runs under the allocator mutex; the returned
    /// port stays reserved until `release` is called.
    pub fn allocate(&self) -> RelayResult<u16> {
        let mut reserved = self.reserved.lock().unwrap();

        for offset in 0..self.window {
            let port = match self.start.checked_add(offset) {
                Some(p) => p,
                None => break,
            };
            if reserved.contains(&port) {
                continue;
            }
            // Probe actual availability; something outside our bookkeeping
            // may already hold the port.
            match TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => {
                    drop(listener);
                    reserved.insert(port);
                    tracing::debug!("allocated port {port}");
                    return Ok(port);
                }
                Err(_) => continue,
            }
        }

        Err(RelayError::NoFreePort {
            start: self.start,
            window: self.window,
        })
    }

    /// Return a port to the pool. Releasing an unknown port is a no-op.
    pub fn release(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
    }

    /// Number of ports currently handed out.
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocates_distinct_ports() {
        let allocator = PortAllocator::new(42000, 200);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        allocator.release(a);
        allocator.release(b);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let allocator = Arc::new(PortAllocator::new(43000, 200));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.allocate().unwrap())
            })
            .collect();

        let mut ports = HashSet::new();
        for handle in handles {
            let port = handle.join().unwrap();
            assert!(ports.insert(port), "port {port} handed out twice");
        }
        assert_eq!(ports.len(), 50);
    }

    #[test]
    fn exhausted_window_reports_no_free_port() {
        let allocator = PortAllocator::new(44000, 2);
        let _a = allocator.allocate().unwrap();
        let _b = allocator.allocate().unwrap();
        match allocator.allocate() {
            Err(RelayError::NoFreePort { start, window }) => {
                assert_eq!(start, 44000);
                assert_eq!(window, 2);
            }
            other => panic!("expected NoFreePort, got {other:?}"),
        }
    }
}
