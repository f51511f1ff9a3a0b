//! Backend pool with lock-free load and health accounting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One index-service replica.
#[derive(Debug)]
pub struct Backend {
    url: String,
    in_flight: AtomicUsize,
    healthy: AtomicBool,
}

impl Backend {
    fn new(url: &str) -> Self {
        let url = if url.ends_with('/') { url.to_string() } else { format!("{}/", url) };
        Self {
            url,
            in_flight: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Base URL, always ending in `/`
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requests currently being relayed to this backend
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Last probe verdict
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// A health change worth logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Probe failed after the backend was up
    WentDown,
    /// Probe succeeded after the backend was down
    CameUp,
}

/// Fixed set of backends shared by the health loop and request handlers.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Backend>,
}

impl BackendPool {
    /// Pool over `urls`; every backend starts healthy.
    pub fn new<S: AsRef<str>>(urls: &[S]) -> Self {
        Self {
            backends: urls.iter().map(|u| Backend::new(u.as_ref())).collect(),
        }
    }

    /// All backends in configuration order
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Index of the healthy backend with the fewest in-flight requests,
    /// lowest index on ties.
    pub fn select(&self) -> Option<usize> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_healthy())
            .min_by_key(|(i, b)| (b.in_flight(), *i))
            .map(|(i, _)| i)
    }

    /// Select a backend and count a request against it until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        let index = self.select()?;
        self.backends[index].in_flight.fetch_add(1, Ordering::SeqCst);
        Some(InFlightGuard { pool: self.clone(), index })
    }

    /// Record a probe result, returning the transition if health changed.
    pub fn record_probe(&self, index: usize, healthy: bool) -> Option<HealthTransition> {
        let backend = self.backends.get(index)?;
        let was = backend.healthy.swap(healthy, Ordering::SeqCst);
        match (was, healthy) {
            (true, false) => Some(HealthTransition::WentDown),
            (false, true) => Some(HealthTransition::CameUp),
            _ => None,
        }
    }
}

/// Holds one in-flight slot on a backend; released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    pool: Arc<BackendPool>,
    index: usize,
}

impl InFlightGuard {
    /// Backend the request was routed to
    pub fn backend(&self) -> &Backend {
        &self.pool.backends[self.index]
    }

    /// Position of that backend in the pool
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.pool.backends[self.index].in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(urls: &[&str]) -> Arc<BackendPool> {
        Arc::new(BackendPool::new(urls))
    }

    #[test]
    fn test_least_loaded_wins() {
        let pool = pool(&["http://a", "http://b"]);
        let guards: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        let order: Vec<_> = guards.iter().map(InFlightGuard::index).collect();
        assert_eq!(order, vec![0, 1, 0, 1]);
        assert_eq!(pool.backends()[0].in_flight(), 2);
        assert_eq!(pool.backends()[1].in_flight(), 2);
    }

    #[test]
    fn test_routes_to_idle_backend() {
        let pool = pool(&["http://a", "http://b"]);
        pool.backends[0].in_flight.store(2, Ordering::SeqCst);
        assert_eq!(pool.select(), Some(1));
        let guard = pool.acquire().unwrap();
        assert_eq!(guard.index(), 1);
        assert_eq!(guard.backend().url(), "http://b/");
    }

    #[test]
    fn test_ties_take_lowest_index() {
        let pool = pool(&["http://a", "http://b", "http://c"]);
        assert_eq!(pool.select(), Some(0));
        pool.record_probe(0, false);
        assert_eq!(pool.select(), Some(1));
    }

    #[test]
    fn test_guard_releases_slot() {
        let pool = pool(&["http://a"]);
        {
            let _guard = pool.acquire().unwrap();
            assert_eq!(pool.backends()[0].in_flight(), 1);
        }
        assert_eq!(pool.backends()[0].in_flight(), 0);
    }

    #[test]
    fn test_no_healthy_backend() {
        let pool = pool(&["http://a", "http://b"]);
        pool.record_probe(0, false);
        pool.record_probe(1, false);
        assert_eq!(pool.select(), None);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_only_changes_are_transitions() {
        let pool = pool(&["http://a"]);
        assert_eq!(pool.record_probe(0, true), None);
        assert_eq!(pool.record_probe(0, false), Some(HealthTransition::WentDown));
        assert_eq!(pool.record_probe(0, false), None);
        assert_eq!(pool.record_probe(0, true), Some(HealthTransition::CameUp));
    }
}
