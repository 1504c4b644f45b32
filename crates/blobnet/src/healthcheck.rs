use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::Clock;
use crate::error::Result;

/// Removes unhealthy hosts from a membership snapshot.
pub trait Filter: Send + Sync {
    fn run(&self, addrs: &HashSet<String>) -> HashSet<String>;
}

/// Probes one host. Implementations typically hit a health endpoint.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, addr: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    /// Consecutive failures before a host turns unhealthy.
    pub fails: i64,
    /// Consecutive passes before a host turns healthy again.
    pub passes: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { fails: 3, passes: 2 }
    }
}

/// Tracks the health status of a set of hosts via a bounded signed trend
/// counter per host, clamped to `[-fails, +passes]`. A host transitions to
/// unhealthy on reaching `-fails` and back to healthy on reaching `+passes`.
struct State {
    config: FilterConfig,
    inner: Mutex<StateInner>,
}

#[derive(Default)]
struct StateInner {
    all: HashSet<String>,
    healthy: HashSet<String>,
    trend: HashMap<String, i64>,
}

impl State {
    fn new(config: FilterConfig) -> Self {
        Self { config, inner: Mutex::new(StateInner::default()) }
    }

    /// Sets the tracked membership to `addrs`. New entries start healthy;
    /// entries absent from `addrs` are removed entirely.
    fn sync(&self, addrs: &HashSet<String>) {
        let mut inner = self.inner.lock();
        for addr in addrs {
            if inner.all.insert(addr.clone()) {
                inner.healthy.insert(addr.clone());
            }
        }
        let dropped: Vec<String> =
            inner.all.iter().filter(|a| !addrs.contains(*a)).cloned().collect();
        for addr in dropped {
            inner.all.remove(&addr);
            inner.healthy.remove(&addr);
            inner.trend.remove(&addr);
        }
    }

    fn failed(&self, addr: &str) {
        let mut inner = self.inner.lock();
        let fails = self.config.fails;
        let t = inner.trend.entry(addr.to_string()).or_insert(0);
        *t = (*t - 1).min(-1).max(-fails);
        if *t == -fails {
            inner.healthy.remove(addr);
        }
    }

    fn passed(&self, addr: &str) {
        let mut inner = self.inner.lock();
        let passes = self.config.passes;
        let t = inner.trend.entry(addr.to_string()).or_insert(0);
        *t = (*t + 1).max(1).min(passes);
        if *t == passes {
            inner.healthy.insert(addr.to_string());
        }
    }

    fn healthy(&self) -> HashSet<String> {
        self.inner.lock().healthy.clone()
    }

    fn all(&self) -> HashSet<String> {
        self.inner.lock().all.clone()
    }
}

/// Actively probed health filter. A background monitor drives `probe`,
/// which reports pass/fail per host into the trend state.
pub struct ActiveFilter {
    state: State,
    checker: Arc<dyn Checker>,
}

impl ActiveFilter {
    pub fn new(config: FilterConfig, checker: Arc<dyn Checker>) -> Self {
        Self { state: State::new(config), checker }
    }

    pub fn passed(&self, addr: &str) {
        self.state.passed(addr);
    }

    pub fn failed(&self, addr: &str) {
        self.state.failed(addr);
    }

    /// Probes every tracked host once.
    pub async fn probe(&self) {
        for addr in self.state.all() {
            match self.checker.check(&addr).await {
                Ok(()) => self.state.passed(&addr),
                Err(e) => {
                    warn!(addr = %addr, error = %e, "health probe failed");
                    self.state.failed(&addr);
                }
            }
        }
    }

    /// Probes on `interval` until `stop` fires.
    pub async fn monitor(&self, interval: Duration, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => self.probe().await,
            }
        }
    }
}

impl Filter for ActiveFilter {
    fn run(&self, addrs: &HashSet<String>) -> HashSet<String> {
        self.state.sync(addrs);
        self.state.healthy().intersection(addrs).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PassiveFilterConfig {
    /// Failures within `fail_timeout` before a host turns unhealthy.
    pub fails: usize,
    /// Sliding window for failures; also how long an unhealthy mark lasts.
    pub fail_timeout: Duration,
}

impl Default for PassiveFilterConfig {
    fn default() -> Self {
        Self { fails: 3, fail_timeout: Duration::from_secs(5 * 60) }
    }
}

/// Passively tracked health filter. Clients report request failures; hosts
/// accumulating `fails` failures within `fail_timeout` are excluded until
/// the mark ages out. Only network errors should be reported, not
/// application-level errors.
pub struct PassiveFilter {
    config: PassiveFilterConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<PassiveInner>,
}

#[derive(Default)]
struct PassiveInner {
    unhealthy: HashMap<String, Instant>,
    failures: HashMap<String, VecDeque<Instant>>,
}

impl PassiveFilter {
    pub fn new(config: PassiveFilterConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, inner: Mutex::new(PassiveInner::default()) }
    }

    /// Marks a request to `addr` as failed.
    pub fn failed(&self, addr: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let failures = inner.failures.entry(addr.to_string()).or_default();
        while let Some(&front) = failures.front() {
            if now.duration_since(front) > self.config.fail_timeout {
                failures.pop_front();
            } else {
                break;
            }
        }
        failures.push_back(now);
        if failures.len() >= self.config.fails {
            inner.unhealthy.insert(addr.to_string(), now);
        }
    }
}

impl Filter for PassiveFilter {
    fn run(&self, addrs: &HashSet<String>) -> HashSet<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut healthy = addrs.clone();
        let expired: Vec<String> = inner
            .unhealthy
            .iter()
            .filter(|(_, &t)| now.duration_since(t) > self.config.fail_timeout)
            .map(|(a, _)| a.clone())
            .collect();
        for addr in expired {
            inner.unhealthy.remove(&addr);
        }
        for addr in inner.unhealthy.keys() {
            healthy.remove(addr);
        }
        healthy
    }
}

/// Combines filters: a host marked unhealthy by any member is unhealthy.
pub struct MultiFilter {
    filters: Vec<Arc<dyn Filter>>,
}

impl MultiFilter {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }
}

impl Filter for MultiFilter {
    fn run(&self, addrs: &HashSet<String>) -> HashSet<String> {
        self.filters
            .iter()
            .fold(addrs.clone(), |healthy, f| f.run(&healthy))
    }
}
