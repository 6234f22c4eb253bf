//! GeoIP and speed-test collaborators.
//!
//! Only the scheduled invocation and result storage belong to the node;
//! the measurements themselves sit behind [`GeoIpResolver`] and
//! [`SpeedTester`].

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Public location of this node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub ip: String,
    pub city: String,
    pub country: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Throughput in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestResult {
    pub download_bps: u64,
    pub upload_bps: u64,
}

#[async_trait]
pub trait GeoIpResolver: Send + Sync {
    async fn resolve(&self) -> Result<Location>;
}

#[async_trait]
pub trait SpeedTester: Send + Sync {
    async fn run(&self) -> Result<SpeedtestResult>;
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP IMPLEMENTATIONS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    country: String,
    #[serde(default, rename = "countryCode")]
    country_code: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
}

/// Resolves the caller's own location through an ip-api compatible URL.
#[derive(Clone)]
pub struct HttpGeoIpResolver {
    url: String,
    client: Client,
}

impl HttpGeoIpResolver {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl GeoIpResolver for HttpGeoIpResolver {
    async fn resolve(&self) -> Result<Location> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().await.unwrap_or_default();
            return Err(anyhow!("geoip lookup failed {} {}", status, t));
        }
        let body = resp.json::<IpApiResponse>().await?;
        if !body.status.is_empty() && body.status != "success" {
            return Err(anyhow!("geoip lookup failed: {}", body.message));
        }
        Ok(Location {
            ip: body.query,
            city: body.city,
            country: body.country,
            country_code: body.country_code,
            latitude: body.lat,
            longitude: body.lon,
        })
    }
}

/// Measures throughput by downloading from and uploading to one URL.
#[derive(Clone)]
pub struct HttpSpeedTester {
    url: String,
    upload_size: usize,
    client: Client,
}

impl HttpSpeedTester {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            upload_size: 8 * 1024 * 1024,
            client,
        })
    }
}

fn bytes_per_sec(bytes: usize, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / secs) as u64
}

#[async_trait]
impl SpeedTester for HttpSpeedTester {
    async fn run(&self) -> Result<SpeedtestResult> {
        if self.url.is_empty() {
            return Err(anyhow!("speedtest url is not configured"));
        }

        let started = Instant::now();
        let resp = self.client.get(&self.url).send().await?.error_for_status()?;
        let downloaded = resp.bytes().await?.len();
        let download_bps = bytes_per_sec(downloaded, started.elapsed());

        let payload = vec![0u8; self.upload_size];
        let started = Instant::now();
        self.client
            .post(&self.url)
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        let upload_bps = bytes_per_sec(self.upload_size, started.elapsed());

        Ok(SpeedtestResult {
            download_bps,
            upload_bps,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FIXED IMPLEMENTATIONS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(any(test, feature = "test-util"))]
pub use fixed::{FixedGeoIp, FixedSpeedTester};

#[cfg(any(test, feature = "test-util"))]
mod fixed {
    use super::*;
    use parking_lot::Mutex;

    /// Returns a preset answer, or fails when none is set.
    #[derive(Default)]
    pub struct FixedGeoIp {
        location: Mutex<Option<Location>>,
    }

    impl FixedGeoIp {
        pub fn new(location: Option<Location>) -> Self {
            Self {
                location: Mutex::new(location),
            }
        }

        pub fn set(&self, location: Option<Location>) {
            *self.location.lock() = location;
        }
    }

    #[async_trait]
    impl GeoIpResolver for FixedGeoIp {
        async fn resolve(&self) -> Result<Location> {
            self.location
                .lock()
                .clone()
                .ok_or_else(|| anyhow!("geoip unavailable"))
        }
    }

    #[derive(Default)]
    pub struct FixedSpeedTester {
        result: Mutex<Option<SpeedtestResult>>,
    }

    impl FixedSpeedTester {
        pub fn new(result: Option<SpeedtestResult>) -> Self {
            Self {
                result: Mutex::new(result),
            }
        }
    }

    #[async_trait]
    impl SpeedTester for FixedSpeedTester {
        async fn run(&self) -> Result<SpeedtestResult> {
            (*self.result.lock()).ok_or_else(|| anyhow!("speedtest unavailable"))
        }
    }
}
