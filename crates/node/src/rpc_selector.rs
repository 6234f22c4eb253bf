//! # RPC Endpoint Selector
//!
//! Probes every candidate RPC endpoint concurrently and picks the fastest
//! one that answered successfully within the probe timeout.
//!
//! ```text
//!  candidates[0..n] ──▶ probe (timeout) ─┐
//!                   ──▶ probe (timeout) ─┼─▶ join_all ─▶ [(index, latency)] ─▶ select_best
//!                   ──▶ probe (timeout) ─┘
//! ```
//!
//! Probes never share state; each returns its own measurement and a single
//! reducer picks the minimum after all of them have finished. Ties go to
//! the candidate listed first. No responder means no selection, and the
//! caller keeps its current endpoint.

#[cfg(any(test, feature = "test-util"))]
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Liveness check of one endpoint.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    /// Succeeds only if the endpoint answered with a success status.
    async fn probe(&self, endpoint: &str) -> Result<()>;
}

/// Probes `GET {endpoint}/status` and requires HTTP 200.
#[derive(Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, endpoint: &str) -> Result<()> {
        let url = format!("{}/status", endpoint.trim_end_matches('/'));
        let resp = self.client.get(&url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(anyhow!("probe {} returned {}", url, resp.status()));
        }
        Ok(())
    }
}

/// Prober with preset per-endpoint latencies; unknown endpoints fail.
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
pub struct StaticProber {
    latencies: HashMap<String, Duration>,
}

#[cfg(any(test, feature = "test-util"))]
impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, endpoint: impl Into<String>, latency: Duration) -> Self {
        self.latencies.insert(endpoint.into(), latency);
        self
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl EndpointProber for StaticProber {
    async fn probe(&self, endpoint: &str) -> Result<()> {
        match self.latencies.get(endpoint) {
            Some(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            None => Err(anyhow!("{} unreachable", endpoint)),
        }
    }
}

/// Probes all candidates concurrently.
///
/// Returns `(index, latency)` for every candidate that succeeded within
/// `probe_timeout`, in input order.
pub async fn probe_all(
    prober: &dyn EndpointProber,
    candidates: &[String],
    probe_timeout: Duration,
) -> Vec<(usize, Duration)> {
    let probes = candidates.iter().enumerate().map(|(i, endpoint)| async move {
        let started = Instant::now();
        match timeout(probe_timeout, prober.probe(endpoint)).await {
            Ok(Ok(())) => Some((i, started.elapsed())),
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, error = %e, "probe failed");
                None
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "probe timed out");
                None
            }
        }
    });
    join_all(probes).await.into_iter().flatten().collect()
}

/// Index of the lowest latency; the earliest index wins a tie.
pub fn select_best(results: &[(usize, Duration)]) -> Option<usize> {
    results
        .iter()
        .copied()
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(i, _)| i)
}

/// Probes and selects in one step.
pub async fn best_endpoint(
    prober: &dyn EndpointProber,
    candidates: &[String],
    probe_timeout: Duration,
) -> Option<String> {
    let results = probe_all(prober, candidates, probe_timeout).await;
    select_best(&results).map(|i| candidates[i].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn list(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reducer_prefers_lowest_then_first() {
        assert_eq!(select_best(&[(0, ms(30)), (1, ms(10)), (2, ms(10))]), Some(1));
        assert_eq!(select_best(&[(2, ms(5)), (0, ms(5))]), Some(0));
        assert_eq!(select_best(&[]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_reachable_wins() {
        let prober = StaticProber::new().with("a", ms(50)).with("b", ms(200));
        let best = best_endpoint(&prober, &list(&["c", "b", "a"]), Duration::from_secs(15)).await;
        assert_eq!(best.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_counts_as_unreachable() {
        let prober = StaticProber::new().with("a", Duration::from_secs(20)).with("b", ms(200));
        let results = probe_all(&prober, &list(&["a", "b"]), Duration::from_secs(15)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nobody_answers() {
        let prober = StaticProber::new();
        assert!(best_endpoint(&prober, &list(&["a", "b"]), Duration::from_secs(15)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn probes_run_concurrently() {
        let prober = StaticProber::new().with("a", ms(100)).with("b", ms(100)).with("c", ms(100));
        let started = Instant::now();
        let results = probe_all(&prober, &list(&["a", "b", "c"]), Duration::from_secs(15)).await;
        assert_eq!(results.len(), 3);
        assert!(started.elapsed() < ms(300));
    }
}
