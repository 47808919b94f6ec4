//! Settings of a stream processor: how many runners per computation, how many partitions and
//! which codec per stream, and the policy of each computation.
//!
//! Settings are usually built in code, they can also be loaded from a JSON document:
//!
//! ```json
//! {
//!   "concurrency": 2,
//!   "partitions": 4,
//!   "codec": "proto",
//!   "policy": { "maxRetries": 3, "delay": "100ms", "continueOnFailure": true },
//!   "computations": { "counter": { "concurrency": 1 } },
//!   "streams": { "input": { "partitions": 8, "codec": "json" } }
//! }
//! ```

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use backoff::policy::RetryPolicy;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Error;
use crate::Result;
use crate::codec::{self, Codec};
use crate::filter::{FilterChain, RecordFilter};

pub mod policy;

pub use policy::ComputationPolicy;

/// Base64 encoded JSON settings, see [Settings::load].
const ENV_SETTINGS: &str = "LOGSTREAM_SETTINGS";

#[derive(Debug, Clone)]
pub struct Settings {
    concurrency: u16,
    partitions: u16,
    codec: Arc<dyn Codec>,
    policy: ComputationPolicy,
    concurrencies: HashMap<String, u16>,
    stream_partitions: HashMap<String, u16>,
    codecs: HashMap<String, Arc<dyn Codec>>,
    policies: HashMap<String, ComputationPolicy>,
    filters: HashMap<String, FilterChain>,
}

impl Settings {
    /// `concurrency` is the default number of runners per computation, `partitions` the default
    /// number of partitions per stream.
    pub fn new(concurrency: u16, partitions: u16) -> Self {
        Self {
            concurrency,
            partitions,
            codec: codec::default_codec(),
            policy: ComputationPolicy::default(),
            concurrencies: HashMap::new(),
            stream_partitions: HashMap::new(),
            codecs: HashMap::new(),
            policies: HashMap::new(),
            filters: HashMap::new(),
        }
    }

    /// Default codec of the streams.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Default policy of the computations.
    pub fn with_policy(mut self, policy: ComputationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, computation: impl Into<String>, concurrency: u16) -> Self {
        self.concurrencies.insert(computation.into(), concurrency);
        self
    }

    pub fn with_partitions(mut self, stream: impl Into<String>, partitions: u16) -> Self {
        self.set_partitions(stream, partitions);
        self
    }

    pub fn with_stream_codec(mut self, stream: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        self.codecs.insert(stream.into(), codec);
        self
    }

    pub fn with_computation_policy(
        mut self,
        computation: impl Into<String>,
        policy: ComputationPolicy,
    ) -> Self {
        self.policies.insert(computation.into(), policy);
        self
    }

    pub fn with_filter(mut self, stream: impl Into<String>, filter: Arc<dyn RecordFilter>) -> Self {
        self.filters.entry(stream.into()).or_default().add(filter);
        self
    }

    pub fn set_partitions(&mut self, stream: impl Into<String>, partitions: u16) {
        self.stream_partitions.insert(stream.into(), partitions);
    }

    pub fn concurrency(&self, computation: &str) -> u16 {
        self.concurrencies
            .get(computation)
            .copied()
            .unwrap_or(self.concurrency)
    }

    pub fn partitions(&self, stream: &str) -> u16 {
        self.stream_partitions
            .get(stream)
            .copied()
            .unwrap_or(self.partitions)
    }

    pub fn codec(&self, stream: &str) -> Arc<dyn Codec> {
        Arc::clone(self.codecs.get(stream).unwrap_or(&self.codec))
    }

    pub fn policy(&self, computation: &str) -> &ComputationPolicy {
        self.policies.get(computation).unwrap_or(&self.policy)
    }

    /// Filters of a stream, an empty chain when none is configured.
    pub fn filters(&self, stream: &str) -> FilterChain {
        self.filters.get(stream).cloned().unwrap_or_default()
    }

    /// Loads the settings from the base64 encoded JSON found in `LOGSTREAM_SETTINGS`.
    pub fn load() -> Result<Self> {
        let encoded = env::var(ENV_SETTINGS)
            .map_err(|_| Error::Config(format!("{ENV_SETTINGS} is not set")))?;
        Self::from_base64(&encoded)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode settings: {e:?}")))?;
        Self::from_json(&decoded)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let spec: SettingsSpec = serde_json::from_slice(data)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {e:?}")))?;
        spec.try_into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SettingsSpec {
    concurrency: u16,
    partitions: u16,
    #[serde(default)]
    codec: Option<String>,
    #[serde(default)]
    policy: Option<PolicySpec>,
    #[serde(default)]
    computations: HashMap<String, ComputationSpec>,
    #[serde(default)]
    streams: HashMap<String, StreamSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ComputationSpec {
    #[serde(default)]
    concurrency: Option<u16>,
    #[serde(default)]
    policy: Option<PolicySpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StreamSpec {
    #[serde(default)]
    partitions: Option<u16>,
    #[serde(default)]
    codec: Option<String>,
}

/// Unset fields keep the value of [ComputationPolicy::default]. `maxRetries: -1` retries
/// forever.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PolicySpec {
    max_retries: Option<i32>,
    delay: Option<DurationSpec>,
    max_delay: Option<DurationSpec>,
    factor: Option<f64>,
    jitter: Option<f64>,
    continue_on_failure: Option<bool>,
    skip_first_failures: Option<u32>,
    batch_capacity: Option<usize>,
    batch_threshold: Option<DurationSpec>,
}

/// A duration given either as milliseconds or as a string like `"250ms"`, `"2s"`, `"1m"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DurationSpec {
    Millis(u64),
    Text(String),
}

impl TryFrom<DurationSpec> for Duration {
    type Error = Error;

    fn try_from(spec: DurationSpec) -> Result<Self> {
        match spec {
            DurationSpec::Millis(ms) => Ok(Duration::from_millis(ms)),
            DurationSpec::Text(text) => parse_duration(&text),
        }
    }
}

fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (amount, unit) = text.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration: {text:?}")))?;
    let seconds = |factor: u64| {
        amount
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| Error::Config(format!("duration out of range: {text:?}")))
    };
    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(amount)),
        "us" => Ok(Duration::from_micros(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => seconds(60),
        "h" => seconds(3600),
        other => Err(Error::Config(format!(
            "invalid duration unit {other:?} in {text:?}"
        ))),
    }
}

impl TryFrom<PolicySpec> for ComputationPolicy {
    type Error = Error;

    fn try_from(spec: PolicySpec) -> Result<Self> {
        let defaults = RetryPolicy::new();
        let mut retry = RetryPolicy::new();
        retry = match spec.max_retries {
            None | Some(0) => retry.with_max_retries(0),
            Some(n) if n < 0 => retry.with_unlimited_retries(),
            Some(n) => retry.with_max_retries(u16::try_from(n).unwrap_or(u16::MAX)),
        };
        let delay = spec
            .delay
            .map(Duration::try_from)
            .transpose()?
            .unwrap_or(defaults.delay());
        let max_delay = spec
            .max_delay
            .map(Duration::try_from)
            .transpose()?
            .unwrap_or(delay);
        retry = retry
            .with_backoff(delay, max_delay, spec.factor.unwrap_or(defaults.factor()))
            .with_jitter(spec.jitter.unwrap_or(defaults.jitter()));

        let mut policy = ComputationPolicy::new()
            .with_retry_policy(retry)
            .with_continue_on_failure(spec.continue_on_failure.unwrap_or_default())
            .with_skip_first_failures(spec.skip_first_failures.unwrap_or_default());
        if spec.batch_capacity.is_some() || spec.batch_threshold.is_some() {
            let threshold = spec
                .batch_threshold
                .map(Duration::try_from)
                .transpose()?
                .unwrap_or(policy.batch_threshold());
            let capacity = spec.batch_capacity.unwrap_or(policy.batch_capacity());
            policy = policy.with_batch_policy(capacity, threshold);
        }
        Ok(policy)
    }
}

impl TryFrom<SettingsSpec> for Settings {
    type Error = Error;

    fn try_from(spec: SettingsSpec) -> Result<Self> {
        let mut settings = Settings::new(spec.concurrency, spec.partitions);
        if let Some(name) = spec.codec {
            settings = settings.with_codec(codec::codec_by_name(&name)?);
        }
        if let Some(policy) = spec.policy {
            settings = settings.with_policy(policy.try_into()?);
        }
        for (name, computation) in spec.computations {
            if let Some(concurrency) = computation.concurrency {
                settings = settings.with_concurrency(name.as_str(), concurrency);
            }
            if let Some(policy) = computation.policy {
                settings = settings.with_computation_policy(name, policy.try_into()?);
            }
        }
        for (name, stream) in spec.streams {
            if let Some(partitions) = stream.partitions {
                settings.set_partitions(name.as_str(), partitions);
            }
            if let Some(codec) = stream.codec {
                settings = settings.with_stream_codec(name, codec::codec_by_name(&codec)?);
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let settings = Settings::new(2, 3)
            .with_concurrency("c1", 4)
            .with_partitions("s1", 8)
            .with_stream_codec("s1", codec::codec_by_name("json").unwrap())
            .with_computation_policy(
                "c1",
                ComputationPolicy::new().with_continue_on_failure(true),
            );
        assert_eq!(settings.concurrency("c1"), 4);
        assert_eq!(settings.concurrency("c2"), 2);
        assert_eq!(settings.partitions("s1"), 8);
        assert_eq!(settings.partitions("s2"), 3);
        assert_eq!(settings.codec("s1").name(), "json");
        assert_eq!(settings.codec("s2").name(), "proto");
        assert!(settings.policy("c1").continue_on_failure());
        assert!(!settings.policy("c2").continue_on_failure());
        assert!(settings.filters("s1").is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("5d").is_err());
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(matches!(
            parse_duration(&format!("{}h", u64::MAX / 60)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_duration(&format!("{}m", u64::MAX)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let data = json!({
            "concurrency": 2,
            "partitions": 4,
            "codec": "json",
            "policy": {
                "maxRetries": 3,
                "delay": "10ms",
                "maxDelay": "1s",
                "factor": 2.0,
                "continueOnFailure": true
            },
            "computations": {
                "c1": { "concurrency": 1, "policy": { "batchCapacity": 10, "batchThreshold": 50 } }
            },
            "streams": { "s1": { "partitions": 8, "codec": "proto" } }
        });
        let settings = Settings::from_json(data.to_string().as_bytes()).unwrap();
        assert_eq!(settings.concurrency("c1"), 1);
        assert_eq!(settings.concurrency("c2"), 2);
        assert_eq!(settings.partitions("s1"), 8);
        assert_eq!(settings.codec("s1").name(), "proto");
        assert_eq!(settings.codec("s2").name(), "json");

        let default_policy = settings.policy("c2");
        assert!(default_policy.continue_on_failure());
        assert_eq!(default_policy.retry_policy().max_retries(), Some(3));
        assert_eq!(
            default_policy.retry_policy().max_delay(),
            Duration::from_secs(1)
        );

        let c1 = settings.policy("c1");
        assert_eq!(c1.batch_capacity(), 10);
        assert_eq!(c1.batch_threshold(), Duration::from_millis(50));
        assert_eq!(c1.retry_policy().max_retries(), Some(0));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            Settings::from_json(br#"{"concurrency": 1}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::from_json(br#"{"concurrency": 1, "partitions": 1, "codec": "xml"}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::from_json(
                br#"{"concurrency": 1, "partitions": 1, "policy": {"delay": "soon"}}"#
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_base64() {
        let data = json!({ "concurrency": 3, "partitions": 5 }).to_string();
        let settings = Settings::from_base64(&BASE64_STANDARD.encode(data)).unwrap();
        assert_eq!(settings.concurrency("any"), 3);
        assert_eq!(settings.partitions("any"), 5);
        assert!(matches!(
            Settings::from_base64("not base64!"),
            Err(Error::Config(_))
        ));
    }
}
