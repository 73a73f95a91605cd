//! Remote time-series store
//!
//! Points are encoded as InfluxDB line protocol and posted to the v2 write
//! endpoint over blocking HTTP.

use crate::config::RemoteStoreConfig;
use crate::error::{Result, StationError};
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use ureq::Agent;

/// Lines sent per HTTP request
pub const WRITE_BATCH_SIZE: usize = 5000;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One time-series point
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp_ns: i64,
}

impl Point {
    pub fn new(measurement: &str, timestamp_ns: i64) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ns,
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Line-protocol form, or `None` when no field has a finite value
    pub fn to_line(&self) -> Option<String> {
        let fields: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| format!("{}={}", escape_key(k), v))
            .collect();
        if fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);
        for (key, value) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }
        line.push(' ');
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&self.timestamp_ns.to_string());
        Some(line)
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escaping for tag keys, tag values and field keys
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Remote store accepting batches of points per bucket
pub trait RemoteTimeSeriesStore: Send {
    /// Reopen the connection before a burst of writes
    fn refresh(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, bucket: &str, points: &[Point]) -> Result<()>;
}

/// InfluxDB 2.x client
pub struct InfluxClient {
    config: RemoteStoreConfig,
    agent: Agent,
}

impl InfluxClient {
    pub fn new(config: RemoteStoreConfig) -> Self {
        Self {
            config,
            agent: Self::build_agent(),
        }
    }

    fn build_agent() -> Agent {
        ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build()
    }

    fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.config.url.trim_end_matches('/'))
    }

    fn post(&self, bucket: &str, body: &str) -> Result<()> {
        let response = self
            .agent
            .post(&self.write_url())
            .query("org", &self.config.org)
            .query("bucket", bucket)
            .query("precision", "ns")
            .set("Authorization", &format!("Token {}", self.config.token))
            .set("Content-Type", "text/plain; charset=utf-8")
            .send_string(body);

        match response {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let message = response.into_string().unwrap_or_default();
                Err(StationError::Persistence(format!(
                    "Write to bucket '{}' rejected with HTTP {}: {}",
                    bucket, code, message
                )))
            }
            Err(ureq::Error::Transport(e)) => Err(StationError::Connectivity(format!(
                "Could not reach {}: {}",
                self.config.url, e
            ))),
        }
    }
}

impl RemoteTimeSeriesStore for InfluxClient {
    fn refresh(&mut self) -> Result<()> {
        debug!("Opening connection to {}", self.config.url);
        self.agent = Self::build_agent();
        Ok(())
    }

    fn write(&mut self, bucket: &str, points: &[Point]) -> Result<()> {
        let lines: Vec<String> = points.iter().filter_map(Point::to_line).collect();
        for batch in lines.chunks(WRITE_BATCH_SIZE) {
            self.post(bucket, &batch.join("\n"))?;
        }
        debug!("Wrote {} points to bucket '{}'", lines.len(), bucket);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryRemoteState {
    points: Vec<(String, Point)>,
    failing: bool,
}

/// Remote store kept in memory. Clones share the same points.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryRemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every following write fail with a connectivity error
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Points written to `bucket`, in write order
    pub fn points(&self, bucket: &str) -> Vec<Point> {
        self.lock()
            .points
            .iter()
            .filter(|(b, _)| b == bucket)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteTimeSeriesStore for MemoryRemote {
    fn write(&mut self, bucket: &str, points: &[Point]) -> Result<()> {
        let mut state = self.lock();
        if state.failing {
            return Err(StationError::Connectivity("remote store unreachable".into()));
        }
        state
            .points
            .extend(points.iter().map(|p| (bucket.to_string(), p.clone())));
        debug!("Stored {} points for bucket '{}' in memory", points.len(), bucket);
        Ok(())
    }
}
