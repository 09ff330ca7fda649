//! Sidecar wire types.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Serialize;

pub const HEALTH_PATH: &str = "/healthz";
pub const RUN_PATH: &str = "/run";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    pub workspace_dir: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResponse {
    /// Base64 of the engine's combined output.
    pub output: String,
}

impl RunResponse {
    pub fn from_output(output: &[u8]) -> Self {
        Self {
            output: STANDARD.encode(output),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let encoded = self.output.trim();
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD.decode(encoded)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    /// Engine exit reason and output, without the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
