use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::QmdError;
use crate::error::Result;
use crate::proto::RUN_PATH;
use crate::proto::RunRequest;

const MAX_RESPONSE_BYTES: usize = 4 << 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards engine invocations to a sidecar over HTTP.
#[derive(Clone, Debug)]
pub struct SidecarClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunPayload {
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    detail: Option<String>,
}

impl SidecarClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        })
    }

    pub async fn run(&self, workspace_dir: &Path, args: &[String], deadline: Instant) -> Result<Vec<u8>> {
        let url = format!("{}{RUN_PATH}", self.base_url);
        let request = RunRequest {
            workspace_dir: workspace_dir.to_string_lossy().into_owned(),
            args: args.to_vec(),
        };
        let timeout = deadline.saturating_duration_since(Instant::now());
        let mut resp = self
            .http
            .post(&url)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    QmdError::Timeout {
                        command: format!("POST {url}"),
                        timeout,
                    }
                } else {
                    QmdError::Unavailable(format!("qmd sidecar request failed: {err}"))
                }
            })?;

        let status = resp.status();
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(QmdError::sidecar(format!(
                    "sidecar response exceeds {MAX_RESPONSE_BYTES} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }
        let payload: RunPayload = serde_json::from_slice(&body).unwrap_or_default();

        if status != StatusCode::OK {
            let mut message = payload.error.trim().to_string();
            if message.is_empty() {
                message = String::from_utf8_lossy(&body).trim().to_string();
            }
            if message.is_empty() {
                message = format!("qmd sidecar request failed: {status}");
            }
            return Err(QmdError::Sidecar {
                message,
                detail: payload.detail,
            });
        }

        let encoded = payload.output.trim();
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD
            .decode(encoded)
            .map_err(|err| QmdError::sidecar(format!("decode qmd sidecar output: {err}")))
    }
}
