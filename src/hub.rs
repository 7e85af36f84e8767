//! HuggingFace Hub client.
//!
//! Validates model ids against the Hub API before a deployment is attempted.
//! A 404 falls back to the search endpoint (sorted by downloads) and the best
//! hit is validated once more; the search hop is never repeated, so a
//! registry that echoes the queried id back cannot cause a loop.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Validation result. `id` carries the canonical id on success, or the best
/// search suggestion when validation of that suggestion failed.
#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
    pub id: String,
    pub gated: bool,
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubModel {
    id: Option<String>,
    #[serde(default)]
    gated: serde_json::Value,
}

pub struct HubClient {
    client: reqwest::Client,
    base: String,
}

impl HubClient {
    pub fn new() -> reqwest::Result<Self> {
        Self::with_base("https://huggingface.co")
    }

    pub fn with_base(base: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }

    /// Validate a model id, resolving through search at most once.
    pub async fn validate(&self, model_id: &str, token: &str) -> ModelInfo {
        let cleaned = model_id.trim();
        if cleaned.is_empty() {
            return ModelInfo {
                valid: false,
                error: Some("Model ID is empty or contains only whitespace".to_string()),
                ..Default::default()
            };
        }
        let token = token.trim();

        let mut id = cleaned.to_string();
        let mut searched = false;
        loop {
            match self.lookup(&id, token).await {
                Lookup::Found { canonical, gated } => {
                    info!(model = %canonical, gated, "model validated");
                    return ModelInfo {
                        id: canonical,
                        gated,
                        valid: true,
                        error: None,
                    };
                }
                Lookup::NotFound => {
                    if !searched {
                        debug!(model = %id, "model not found, attempting search");
                        if let Some(found) = self.search(&id, token).await {
                            if found != id {
                                id = found;
                                searched = true;
                                continue;
                            }
                        }
                    }
                    return ModelInfo {
                        id,
                        valid: false,
                        error: Some(format!("Model not found: {cleaned}")),
                        ..Default::default()
                    };
                }
                Lookup::Failed(message) => {
                    return ModelInfo {
                        id,
                        valid: false,
                        error: Some(message),
                        ..Default::default()
                    };
                }
            }
        }
    }

    async fn lookup(&self, model_id: &str, token: &str) -> Lookup {
        let url = format!("{}/api/models/{}", self.base, encode_path(model_id));
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return Lookup::Failed(format!(
                    "Failed to connect to HuggingFace API: {}",
                    transport_error_message(&e)
                ))
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Lookup::NotFound;
        }
        if !status.is_success() {
            return Lookup::Failed(format!(
                "API request failed with HTTP {}",
                status.as_u16()
            ));
        }

        match response.json::<HubModel>().await {
            Ok(HubModel {
                id: Some(canonical),
                gated,
            }) => Lookup::Found {
                canonical,
                gated: gated == serde_json::Value::Bool(true),
            },
            // A 200 without an id field is treated like a miss.
            Ok(_) => Lookup::NotFound,
            Err(e) => Lookup::Failed(format!(
                "Failed to connect to HuggingFace API: {}",
                transport_error_message(&e)
            )),
        }
    }

    /// Best search hit by downloads, if any.
    pub async fn search(&self, term: &str, token: &str) -> Option<String> {
        let term = term.trim();
        if term.is_empty() {
            return None;
        }

        let url = format!("{}/api/models", self.base);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("search", term),
                ("sort", "downloads"),
                ("direction", "-1"),
                ("limit", "5"),
            ])
            .bearer_auth(token.trim())
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let hits: Vec<HubModel> = response.json().await.ok()?;
        let found = hits.into_iter().find_map(|m| m.id)?;
        info!(model = %found, "search resolved model");
        Some(found)
    }
}

enum Lookup {
    Found { canonical: String, gated: bool },
    NotFound,
    Failed(String),
}

/// Percent-encode a model id for use as a URL path segment. RFC 3986
/// unreserved characters and `/` pass through.
fn encode_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Map transport failures to the messages operators actually see.
fn transport_error_message(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "Operation timeout".to_string()
    } else if e.is_connect() {
        "Failed to connect to host".to_string()
    } else if e.is_decode() {
        "Malformed response body".to_string()
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_path_segments() {
        assert_eq!(encode_path("meta-llama/Llama-3.1-8B"), "meta-llama/Llama-3.1-8B");
        assert_eq!(encode_path("org/model name"), "org/model%20name");
        assert_eq!(encode_path("a+b"), "a%2Bb");
    }

    #[tokio::test]
    async fn rejects_whitespace_only_id_locally() {
        let client = HubClient::with_base("http://127.0.0.1:0").unwrap();
        let info = client.validate("   ", "token").await;
        assert!(!info.valid);
        assert_eq!(
            info.error.as_deref(),
            Some("Model ID is empty or contains only whitespace")
        );
    }

    #[tokio::test]
    async fn unreachable_registry_maps_to_connect_error() {
        // Port 9 on localhost is the discard port and refuses connections.
        let client = HubClient::with_base("http://127.0.0.1:9").unwrap();
        let info = client.validate("org/model", "token").await;
        assert!(!info.valid);
        let message = info.error.unwrap();
        assert!(
            message.starts_with("Failed to connect to HuggingFace API"),
            "unexpected message: {message}"
        );
    }
}
