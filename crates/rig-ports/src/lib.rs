//! Concurrency-safe, collision-free local port allocator (spec §4.3).
//!
//! Candidates step through the configured window using a random stride
//! coprime with the window size, spreading allocations to minimise
//! collisions with other processes running concurrent tests on the same
//! host. Each candidate is test-bound before being handed back, so the
//! caller can use the listener directly without a bind-time TOCTOU gap.

use std::collections::HashMap;

use rig_common::error::{Error, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Default candidate window, matching the range observed in practice.
pub const DEFAULT_MIN_PORT: u16 = 8192;
pub const DEFAULT_MAX_PORT: u16 = 32767;

struct State {
    by_port: HashMap<u16, String>,
    by_instance: HashMap<String, Vec<u16>>,
}

/// Allocates locally-bound listeners to instances, tracking `{port ->
/// instance}` and the reverse index for O(k) release.
pub struct PortAllocator {
    min: u16,
    max: u16,
    state: Mutex<State>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min < max, "port window must be non-empty");
        Self {
            min,
            max,
            state: Mutex::new(State {
                by_port: HashMap::new(),
                by_instance: HashMap::new(),
            }),
        }
    }

    pub fn with_default_range() -> Self {
        Self::new(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT)
    }

    /// Binds and returns `n` open listeners reserved to `instance_id`. On
    /// failure, every listener acquired during this call is closed and the
    /// window's reservations are rolled back.
    pub async fn allocate(&self, instance_id: &str, n: usize) -> Result<Vec<TcpListener>> {
        let window = (self.max - self.min) as u32 + 1;
        let stride = coprime_stride(window);
        let start = rand::random::<u32>() % window;

        let mut state = self.state.lock().await;
        let mut listeners = Vec::with_capacity(n);
        let mut reserved_ports = Vec::with_capacity(n);

        let mut offset = 0u32;
        let mut attempts = 0usize;

        while listeners.len() < n && attempts < window as usize {
            let candidate = self.min + ((start + offset * stride) % window) as u16;
            offset += 1;
            attempts += 1;

            if state.by_port.contains_key(&candidate) {
                continue;
            }

            match TcpListener::bind(("127.0.0.1", candidate)).await {
                Ok(listener) => {
                    state.by_port.insert(candidate, instance_id.to_string());
                    reserved_ports.push(candidate);
                    listeners.push(listener);
                }
                Err(_) => continue,
            }
        }

        if listeners.len() < n {
            for port in &reserved_ports {
                state.by_port.remove(port);
            }
            return Err(Error::PortExhausted(window as usize));
        }

        state
            .by_instance
            .entry(instance_id.to_string())
            .or_default()
            .extend(reserved_ports);

        Ok(listeners)
    }

    /// Releases every port held by `instance_id`.
    pub async fn release(&self, instance_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(ports) = state.by_instance.remove(instance_id) {
            for port in ports {
                state.by_port.remove(&port);
            }
        }
    }

    /// Total number of currently-allocated ports, for invariant checks.
    pub async fn allocated(&self) -> usize {
        self.state.lock().await.by_port.len()
    }
}

/// Picks a stride coprime with `window` so stepping by it visits every
/// residue class exactly once before repeating.
fn coprime_stride(window: u32) -> u32 {
    const CANDIDATE_PRIMES: &[u32] = &[
        104729, 93179, 82463, 70957, 61001, 50021, 40009, 30011, 20011, 10007, 6079, 3041, 1009,
        503, 251, 127, 67, 31, 17, 7, 3,
    ];
    for &p in CANDIDATE_PRIMES {
        if p < window && gcd(p, window) == 1 {
            return p;
        }
    }
    1
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn allocates_distinct_ports() {
        let allocator = PortAllocator::new(20000, 20100);
        let listeners = allocator.allocate("inst-a", 5).await.unwrap();
        let ports: HashSet<u16> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();
        assert_eq!(ports.len(), 5);
        assert_eq!(allocator.allocated().await, 5);
    }

    #[tokio::test]
    async fn release_frees_ports_for_reuse() {
        let allocator = PortAllocator::new(20200, 20250);
        let listeners = allocator.allocate("inst-a", 3).await.unwrap();
        drop(listeners);
        allocator.release("inst-a").await;
        assert_eq!(allocator.allocated().await, 0);

        let more = allocator.allocate("inst-b", 3).await.unwrap();
        assert_eq!(more.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_instances_never_share_a_port() {
        let allocator = std::sync::Arc::new(PortAllocator::new(20300, 20400));
        let mut handles = Vec::new();
        for i in 0..4 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .allocate(&format!("inst-{i}"), 5)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|l| l.local_addr().unwrap().port())
                    .collect::<Vec<_>>()
            }));
        }

        let mut all_ports = Vec::new();
        for handle in handles {
            all_ports.extend(handle.await.unwrap());
        }
        let unique: HashSet<u16> = all_ports.iter().copied().collect();
        assert_eq!(unique.len(), all_ports.len());
        assert_eq!(allocator.allocated().await, all_ports.len());
    }

    #[tokio::test]
    async fn exhaustion_rolls_back_reservations() {
        let allocator = PortAllocator::new(21000, 21001);
        // Window has exactly 2 ports; asking for 3 must fail cleanly.
        let result = allocator.allocate("inst-a", 3).await;
        assert!(result.is_err());
        assert_eq!(allocator.allocated().await, 0);
    }
}
