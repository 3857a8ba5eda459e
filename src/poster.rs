//! Where merged payloads go once a tick is done.

use crate::payload::Payload;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Accepts one merged payload per tick.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(&self, payload: &Payload) -> Result<()>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "agentKey")]
    agent_key: &'a str,
    payload: &'a Payload,
}

/// Posts each payload as JSON to a remote endpoint.
pub struct HttpPoster {
    client: reqwest::Client,
    endpoint: String,
    agent_key: String,
}

impl HttpPoster {
    pub fn new(endpoint: impl Into<String>, agent_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            agent_key: agent_key.into(),
        })
    }
}

#[async_trait]
impl Poster for HttpPoster {
    async fn post(&self, payload: &Payload) -> Result<()> {
        let envelope = Envelope {
            agent_key: &self.agent_key,
            payload,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("POST to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{} answered HTTP {status}: {}", self.endpoint, body.trim());
        }
        debug!(endpoint = %self.endpoint, status = %status, "Payload posted");
        Ok(())
    }
}

/// A single payload with timestamp, one per line.
#[derive(Serialize)]
struct PayloadLine<'a> {
    timestamp: DateTime<Utc>,
    payload: &'a Payload,
}

/// Appends payloads to a JSON Lines file.
pub struct JsonLinesPoster {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesPoster {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open payload log {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl Poster for JsonLinesPoster {
    async fn post(&self, payload: &Payload) -> Result<()> {
        let line = serde_json::to_string(&PayloadLine {
            timestamp: Utc::now(),
            payload,
        })?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        // Payloads are minutes apart, nothing to batch
        writer.flush()?;
        Ok(())
    }
}

/// Fans each payload out to every configured poster.
#[derive(Default)]
pub struct PosterSet {
    posters: Vec<Arc<dyn Poster>>,
}

impl PosterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, poster: Arc<dyn Poster>) {
        self.posters.push(poster);
    }

    pub fn is_empty(&self) -> bool {
        self.posters.is_empty()
    }
}

#[async_trait]
impl Poster for PosterSet {
    /// Tries every poster and reports the first failure.
    async fn post(&self, payload: &Payload) -> Result<()> {
        if self.posters.is_empty() {
            debug!(payload = %serde_json::Value::Object(payload.clone()), "No poster configured");
            return Ok(());
        }
        let mut first_err = None;
        for poster in &self.posters {
            if let Err(e) = poster.post(payload).await {
                if first_err.is_some() {
                    warn!(error = %format!("{e:#}"), "Poster failed");
                } else {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
