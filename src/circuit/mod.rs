//! Circuit Breaker
//!
//! Per-destination breaker around outbound HTTP calls. Destinations are
//! keyed by `scheme://host[:port]`.
//!
//! State names follow the traffic, not the switch:
//!
//! ```text
//!            failures >= threshold             interval elapsed
//!   Open ─────────────────────────▶ Closed ──────────────────────▶ HalfOpen
//!    ▲                                 ▲                               │
//!    │      all probes succeeded       │  some probe failed            │
//!    └─────────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! `Open` lets traffic through, `Closed` rejects it, `HalfOpen` lets up to
//! `max_retry` probes through. Transitions are evaluated when a destination
//! is accessed, so no background task runs per destination.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::{Client, Request, Response, Url};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Failures that close a healthy circuit.
pub const DEFAULT_THRESHOLD: u32 = 10;

/// Probes allowed while half-open.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Time a closed circuit waits before probing.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub threshold: u32,
    pub max_retry: u32,
    pub interval: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            max_retry: DEFAULT_MAX_RETRY,
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Traffic flows.
    Open,
    /// Every call fails fast.
    Closed,
    /// A limited number of probes flow.
    HalfOpen,
}

#[derive(Debug)]
struct Destination {
    status: CircuitStatus,
    fail_num: u32,
    /// Probes admitted in the current half-open round.
    probes_started: u32,
    /// Probes finished in the current half-open round.
    probes_done: u32,
    closed_at: Instant,
}

impl Destination {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Open,
            fail_num: 0,
            probes_started: 0,
            probes_done: 0,
            closed_at: Instant::now(),
        }
    }

    fn set_open(&mut self) {
        self.status = CircuitStatus::Open;
        self.fail_num = 0;
        self.probes_started = 0;
        self.probes_done = 0;
    }

    fn set_closed(&mut self) {
        self.status = CircuitStatus::Closed;
        self.probes_started = 0;
        self.probes_done = 0;
        self.closed_at = Instant::now();
    }

    fn set_half_open(&mut self, max_retry: u32) {
        self.status = CircuitStatus::HalfOpen;
        self.fail_num = max_retry;
        self.probes_started = 0;
        self.probes_done = 0;
    }
}

/// How a call was admitted.
enum Admission {
    Normal,
    Probe,
}

/// `scheme://host[:port]` of a URL.
pub fn destination_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

/// HTTP client with a circuit breaker per destination.
pub struct CircuitClient {
    client: Client,
    config: CircuitConfig,
    destinations: DashMap<String, Arc<Mutex<Destination>>>,
}

impl CircuitClient {
    pub fn new(client: Client) -> Self {
        Self::with_config(client, CircuitConfig::default())
    }

    pub fn with_config(client: Client, config: CircuitConfig) -> Self {
        Self {
            client,
            config,
            destinations: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Current state of a destination, if it has been called.
    pub fn status(&self, key: &str) -> Option<CircuitStatus> {
        let state = self.destinations.get(key).map(|d| Arc::clone(d.value()))?;
        let mut state = state.lock();
        self.tick(key, &mut state);
        Some(state.status)
    }

    /// Send `request` through the breaker of its destination.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let key = destination_key(request.url());
        let client = self.client.clone();
        self.call_keyed(&key, || async move {
            client.execute(request).await.map_err(Error::Http)
        })
        .await
    }

    /// Run an arbitrary operation against `url` through its breaker. Any
    /// error returned by `f` counts as a failure.
    pub async fn call<F, Fut, T>(&self, url: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let parsed = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid circuit url {}: {}", url, e)))?;
        self.call_keyed(&destination_key(&parsed), f).await
    }

    async fn call_keyed<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let state = Arc::clone(
            self.destinations
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Destination::new())))
                .value(),
        );

        let admission = self.admit(key, &state)?;
        let result = f().await;
        self.settle(key, &state, admission, result.is_ok());
        result
    }

    /// Evaluate time-driven transitions.
    fn tick(&self, key: &str, state: &mut Destination) {
        if state.status == CircuitStatus::Closed && state.closed_at.elapsed() >= self.config.interval
        {
            debug!("Circuit for {} is half-open", key);
            state.set_half_open(self.config.max_retry);
        }
    }

    fn admit(&self, key: &str, state: &Mutex<Destination>) -> Result<Admission> {
        let mut state = state.lock();
        self.tick(key, &mut state);
        match state.status {
            CircuitStatus::Open => Ok(Admission::Normal),
            CircuitStatus::Closed => {
                metrics::circuit_rejection();
                Err(Error::CircuitBroken {
                    url: key.to_string(),
                })
            }
            CircuitStatus::HalfOpen => {
                if state.probes_started >= self.config.max_retry {
                    metrics::circuit_rejection();
                    return Err(Error::CircuitRetryExceeded {
                        url: key.to_string(),
                    });
                }
                state.probes_started += 1;
                Ok(Admission::Probe)
            }
        }
    }

    fn settle(&self, key: &str, state: &Mutex<Destination>, admission: Admission, ok: bool) {
        let mut state = state.lock();
        match admission {
            Admission::Normal => {
                if ok {
                    return;
                }
                state.fail_num = state.fail_num.saturating_add(1);
                if state.fail_num >= self.config.threshold && state.status == CircuitStatus::Open {
                    warn!(
                        "Circuit for {} closed after {} failures",
                        key, state.fail_num
                    );
                    state.set_closed();
                }
            }
            Admission::Probe => {
                // A round that ended while this probe ran no longer counts it.
                if state.status != CircuitStatus::HalfOpen {
                    return;
                }
                if ok {
                    state.fail_num = state.fail_num.saturating_sub(1);
                }
                state.probes_done += 1;
                if state.probes_done >= self.config.max_retry {
                    if state.fail_num == 0 {
                        info!("Circuit for {} recovered", key);
                        state.set_open();
                    } else {
                        warn!("Circuit for {} still failing, closing again", key);
                        state.set_closed();
                    }
                }
            }
        }
    }
}
