//! Environment configuration.
//!
//! Settings come from two layers: the process environment (highest
//! precedence) and a `.env` file loaded once at startup. The file is looked
//! up under `$BLACKBOX_ROOT`, then the working directory, with `$HOME/.env`
//! merged in as the lowest-precedence fallback.

use std::collections::HashMap;
use std::path::Path;

/// Cached view of the `.env` file plus typed accessors for the settings the
/// daemon understands. Process env always wins over the file.
#[derive(Debug, Default)]
pub struct EnvStore {
    file: HashMap<String, String>,
}

impl EnvStore {
    /// Load the `.env` layer. Missing files are not an error.
    pub fn load() -> Self {
        let mut file = match std::env::var("BLACKBOX_ROOT") {
            Ok(root) => read_env_file(Path::new(&root).join(".env")),
            Err(_) => read_env_file(".env"),
        };

        if let Ok(home) = std::env::var("HOME") {
            for (key, value) in read_env_file(Path::new(&home).join(".env")) {
                file.entry(key).or_insert(value);
            }
        }

        Self { file }
    }

    /// Build a store from explicit values, bypassing file lookup.
    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self { file: values }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match std::env::var(key) {
            Ok(value) => Some(value),
            Err(_) => self.file.get(key).cloned(),
        }
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn hf_token(&self) -> Option<String> {
        self.get("HF_TOKEN").filter(|t| !t.trim().is_empty())
    }

    /// Admission limit for concurrently deployed models.
    pub fn max_concurrent_models(&self) -> usize {
        self.get_or("MAX_CONCURRENT_MODELS", "3")
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(3)
    }

    /// Base of the port scan when no usable port was requested.
    pub fn start_port(&self) -> u16 {
        self.get_or("START_PORT", "8000").parse().unwrap_or(8000)
    }

    pub fn gpu_type(&self) -> Option<String> {
        self.get("GPU_TYPE").filter(|t| !t.is_empty())
    }

    pub fn tensor_parallel_size(&self) -> Option<usize> {
        self.get("TENSOR_PARALLEL_SIZE").and_then(|v| v.parse().ok())
    }

    /// `true|1|yes` forces the elevated docker invocation.
    pub fn use_sudo_docker(&self) -> bool {
        matches!(
            self.get_or("USE_SUDO_DOCKER", "").as_str(),
            "true" | "1" | "yes"
        )
    }

    /// Host where deployed inference runtimes are reachable for scraping.
    pub fn vllm_host(&self) -> String {
        self.get_or("VLLM_HOST", "localhost")
    }

    pub fn log_level(&self) -> Option<String> {
        self.get("LOG_LEVEL")
    }
}

fn read_env_file(path: impl AsRef<Path>) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_env(&text),
        Err(_) => HashMap::new(),
    }
}

/// Parse `key=value` lines. `#` lines are comments, values may be wrapped in
/// double quotes, and whitespace around keys and values is trimmed.
fn parse_env(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    out
}
