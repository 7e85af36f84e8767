//! vLLM metrics scraper.
//!
//! Pulls each deployed runtime's Prometheus `/metrics` exposition and
//! extracts the KV-cache figures the telemetry pipeline works with. A scrape
//! carries a 1.5 s request deadline inside a 2 s wall deadline; failures are
//! transient and yield an unavailable sample, never an error.

use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);
const WALL_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Typical vLLM KV-cache block footprint, used when the runtime does not
/// label a block size and no per-process attribution is available.
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024;

/// One scrape of a model's KV-cache state. `available` is true only when the
/// runtime reported a non-zero block count.
#[derive(Debug, Clone, Default)]
pub struct ModelBlockData {
    pub model_id: String,
    pub port: u16,
    pub num_gpu_blocks: u64,
    pub block_size_bytes: u64,
    /// Live KV-cache utilization fraction, clamped to [0, 1].
    pub kv_cache_usage: f64,
    /// Derived from the two monotonic counters, in [0, 100].
    pub prefix_cache_hit_rate: f64,
    pub requests_running: u64,
    pub requests_waiting: u64,
    pub available: bool,
}

pub struct MetricsScraper {
    client: reqwest::Client,
    host: String,
}

impl MetricsScraper {
    pub fn new(host: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(1))
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }

    /// Scrape one runtime. Any failure returns an unavailable sample.
    pub async fn scrape(&self, model_id: &str, port: u16) -> ModelBlockData {
        let url = format!("http://{}:{}/metrics", self.host, port);
        let fetch = async {
            let response = self.client.get(&url).send().await.ok()?;
            if !response.status().is_success() {
                return None;
            }
            response.text().await.ok()
        };

        let body = match timeout(WALL_TIMEOUT, fetch).await {
            Ok(Some(body)) => body,
            Ok(None) | Err(_) => {
                debug!(model = %model_id, port, "metrics scrape failed");
                return ModelBlockData {
                    model_id: model_id.to_string(),
                    port,
                    ..Default::default()
                };
            }
        };

        let mut data = parse_exposition(&body);
        data.model_id = model_id.to_string();
        data.port = port;
        debug!(
            model = %model_id,
            blocks = data.num_gpu_blocks,
            kv_usage = data.kv_cache_usage,
            available = data.available,
            "scraped metrics"
        );
        data
    }

    /// True iff `/health` answers 200 within the deadline.
    pub async fn health(&self, port: u16) -> bool {
        let url = format!("http://{}:{}/health", self.host, port);
        let fetch = self.client.get(&url).send();
        match timeout(HEALTH_TIMEOUT, fetch).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

/// Parse a Prometheus exposition into the metrics this daemon reads.
///
/// `vllm:cache_config_info` carries its payload in labels; the remaining
/// metrics are plain value lines. `#` metadata lines are skipped for value
/// lookups.
pub fn parse_exposition(text: &str) -> ModelBlockData {
    let mut blocks = 0u64;
    let mut block_size = 0u64;
    let mut kv_usage = 0.0f64;
    let mut queries = 0u64;
    let mut hits = 0u64;
    let mut running = 0u64;
    let mut waiting = 0u64;

    for line in text.lines() {
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with("vllm:cache_config_info") {
            if let Some(v) = label_digits(line, "num_gpu_blocks") {
                blocks = v;
            }
            if let Some(v) = label_digits(line, "block_size") {
                block_size = v;
            }
        } else if line.starts_with("vllm:kv_cache_usage_perc") {
            if let Some(v) = sample_value(line) {
                kv_usage = v.clamp(0.0, 1.0);
            }
        } else if line.starts_with("vllm:prefix_cache_queries_total") {
            if let Some(v) = sample_value(line) {
                queries = v as u64;
            }
        } else if line.starts_with("vllm:prefix_cache_hits_total") {
            if let Some(v) = sample_value(line) {
                hits = v as u64;
            }
        } else if line.starts_with("vllm:num_requests_running") {
            if let Some(v) = sample_value(line) {
                running = v as u64;
            }
        } else if line.starts_with("vllm:num_requests_waiting") {
            if let Some(v) = sample_value(line) {
                waiting = v as u64;
            }
        }
    }

    let hit_rate = if queries > 0 {
        (100.0 * hits as f64 / queries as f64).clamp(0.0, 100.0)
    } else {
        0.0
    };

    ModelBlockData {
        model_id: String::new(),
        port: 0,
        num_gpu_blocks: blocks,
        block_size_bytes: if block_size > 0 {
            block_size
        } else {
            DEFAULT_BLOCK_SIZE
        },
        kv_cache_usage: kv_usage,
        prefix_cache_hit_rate: hit_rate,
        requests_running: running,
        requests_waiting: waiting,
        available: blocks > 0,
    }
}

/// Digits of a label value, e.g. `num_gpu_blocks="27,855"` yields 27855.
fn label_digits(line: &str, label: &str) -> Option<u64> {
    let needle = format!("{label}=\"");
    let start = line.find(&needle)? + needle.len();
    let end = line[start..].find('"')? + start;
    let digits: String = line[start..end].chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Value of a sample line: the number after the label set, or after the
/// metric name when the line carries no labels.
fn sample_value(line: &str) -> Option<f64> {
    let rest = match line.rfind('}') {
        Some(brace) => &line[brace + 1..],
        None => {
            let space = line.find(char::is_whitespace)?;
            &line[space..]
        }
    };
    // Drop an optional trailing timestamp.
    rest.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPOSITION: &str = "\
# HELP vllm:cache_config_info Information of the LLMEngine CacheConfig
# TYPE vllm:cache_config_info gauge
vllm:cache_config_info{block_size=\"16\",cache_dtype=\"auto\",num_gpu_blocks=\"27855\",num_cpu_blocks=\"2048\"} 1.0
# HELP vllm:kv_cache_usage_perc GPU KV-cache usage
vllm:kv_cache_usage_perc{model_name=\"org/model\"} 0.42
vllm:prefix_cache_queries_total{model_name=\"org/model\"} 200.0
vllm:prefix_cache_hits_total{model_name=\"org/model\"} 50.0
vllm:num_requests_running{model_name=\"org/model\"} 3.0
vllm:num_requests_waiting{model_name=\"org/model\"} 7.0
";

    #[test]
    fn parses_full_exposition() {
        let data = parse_exposition(EXPOSITION);
        assert!(data.available);
        assert_eq!(data.num_gpu_blocks, 27855);
        assert_eq!(data.block_size_bytes, 16);
        assert!((data.kv_cache_usage - 0.42).abs() < 1e-9);
        assert!((data.prefix_cache_hit_rate - 25.0).abs() < 1e-9);
        assert_eq!(data.requests_running, 3);
        assert_eq!(data.requests_waiting, 7);
    }

    #[test]
    fn metadata_lines_do_not_shadow_values() {
        // The HELP line mentions the metric name; only the value line counts.
        let text = "# HELP vllm:num_requests_running running\nvllm:num_requests_running 5.0\n";
        let data = parse_exposition(text);
        assert_eq!(data.requests_running, 5);
    }

    #[test]
    fn missing_blocks_marks_unavailable() {
        let data = parse_exposition("vllm:num_requests_running 1.0\n");
        assert!(!data.available);
        assert_eq!(data.num_gpu_blocks, 0);
    }

    #[test]
    fn block_size_defaults_when_label_absent() {
        let text = "vllm:cache_config_info{num_gpu_blocks=\"100\"} 1.0\n";
        let data = parse_exposition(text);
        assert_eq!(data.block_size_bytes, DEFAULT_BLOCK_SIZE);
        assert!(data.available);
    }

    #[test]
    fn kv_usage_is_clamped() {
        let data = parse_exposition("vllm:kv_cache_usage_perc{a=\"b\"} 1.7\n");
        assert!((data.kv_cache_usage - 1.0).abs() < 1e-9);
        let data = parse_exposition("vllm:kv_cache_usage_perc{a=\"b\"} -0.3\n");
        assert_eq!(data.kv_cache_usage, 0.0);
    }

    #[test]
    fn hit_rate_zero_without_queries() {
        let data = parse_exposition("vllm:prefix_cache_hits_total{a=\"b\"} 10\n");
        assert_eq!(data.prefix_cache_hit_rate, 0.0);
    }

    #[test]
    fn label_digits_strip_separators() {
        assert_eq!(
            label_digits("vllm:cache_config_info{num_gpu_blocks=\"27,855\"} 1.0", "num_gpu_blocks"),
            Some(27855)
        );
        assert_eq!(label_digits("no labels here", "num_gpu_blocks"), None);
    }

    #[test]
    fn sample_value_handles_unlabeled_lines() {
        assert_eq!(sample_value("vllm:num_requests_waiting 2.0"), Some(2.0));
        assert_eq!(sample_value("vllm:metric{a=\"b\"} 3.5 1700000000"), Some(3.5));
        assert_eq!(sample_value("vllm:metric"), None);
    }
}
