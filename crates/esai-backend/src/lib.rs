//! Client for the image-generation backend the conversation talks to.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_STEPS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Ready,
    Loading,
    Error,
    Unknown(String),
}

impl HealthStatus {
    fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "ready" => Self::Ready,
            "loading" | "starting" => Self::Loading,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Loading => f.write_str("loading"),
            Self::Error => f.write_str("error"),
            Self::Unknown(raw) if raw.is_empty() => f.write_str("unknown"),
            Self::Unknown(raw) => write!(f, "unknown ({raw})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub steps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Usually a `data:image/png;base64,...` URL.
    pub data_url: String,
}

impl GeneratedImage {
    pub fn mime_type(&self) -> Option<&str> {
        let rest = self.data_url.strip_prefix("data:")?;
        let (meta, _) = rest.split_once(',')?;
        meta.split(';').next().filter(|mime| !mime.is_empty())
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        let payload = match self.data_url.split_once(',') {
            Some((meta, data)) if meta.starts_with("data:") => {
                if !meta.ends_with(";base64") {
                    bail!("image data URL is not base64 encoded");
                }
                data
            }
            _ => self.data_url.as_str(),
        };
        BASE64
            .decode(payload.trim().as_bytes())
            .context("failed to decode image payload")
    }
}

pub trait ImageBackend {
    fn health(&self) -> Result<HealthStatus>;
    fn generate(&self, req: &GenerateRequest) -> Result<GeneratedImage>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    pub base_url: String,
    pub health_timeout: Duration,
    pub generate_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            health_timeout: Duration::from_secs(5),
            generate_timeout: Duration::from_secs(300),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn client(timeout: Duration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    image: Option<String>,
    error: Option<String>,
}

impl ImageBackend for HttpBackend {
    fn health(&self) -> Result<HealthStatus> {
        let client = Self::client(self.health_timeout)?;
        let response = client
            .get(self.endpoint("health"))
            .send()
            .context("failed calling backend health endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("backend health check failed ({status})"));
        }

        let parsed: HealthResponse = response
            .json()
            .context("failed to decode backend health response")?;
        Ok(HealthStatus::from_wire(&parsed.status))
    }

    fn generate(&self, req: &GenerateRequest) -> Result<GeneratedImage> {
        let client = Self::client(self.generate_timeout)?;
        let response = client
            .post(self.endpoint("generate"))
            .json(req)
            .send()
            .context("failed calling backend generate endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(anyhow!("image generation failed ({status}): {body}"));
        }

        let parsed: GenerateResponse = response
            .json()
            .context("failed to decode backend generate response")?;
        if let Some(error) = parsed.error {
            return Err(anyhow!("backend reported an error: {error}"));
        }
        let data_url = parsed
            .image
            .ok_or_else(|| anyhow!("backend response has no image"))?;
        Ok(GeneratedImage { data_url })
    }
}

/// Polls `health` until the backend is ready.
///
/// Unreachable backends count as still loading. An `error` status fails
/// immediately; anything else keeps polling until `timeout`.
pub fn wait_until_ready<B, F>(
    backend: &B,
    poll: Duration,
    timeout: Duration,
    mut on_status: F,
) -> Result<()>
where
    B: ImageBackend + ?Sized,
    F: FnMut(&Result<HealthStatus>),
{
    let started = Instant::now();
    loop {
        let status = backend.health();
        on_status(&status);
        match &status {
            Ok(HealthStatus::Ready) => return Ok(()),
            Ok(HealthStatus::Error) => bail!("backend failed to load its model"),
            Ok(other) => debug!("backend not ready yet: {other}"),
            Err(err) => debug!("backend unreachable: {err:#}"),
        }

        if started.elapsed() >= timeout {
            bail!(
                "timed out after {}s waiting for the backend to become ready",
                timeout.as_secs()
            );
        }
        thread::sleep(poll);
    }
}
