//! Configuration for the generation endpoint, retries and partitioning

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::{debug, error};

/// Which wire protocol the endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointFlavor
{   /// `POST /generate/submit`, `GET /generate/stream/{jobId}`
    Generic
  , /// Gradio queue API: `POST /gradio_api/call/predict`
    Gradio
}

/// Remote generation endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig
{   /// API base URL, without trailing slash
    pub api_base: String
  , /// Wire protocol
    pub flavor: EndpointFlavor
  , /// Submit call timeout in seconds
    pub submit_timeout_secs: u64
  , /// Stream read timeout in seconds, per partition
    pub poll_timeout_secs: u64
  , /// Smallest max_tokens the endpoint accepts
    pub min_max_tokens: u32
  , /// Largest max_tokens the endpoint accepts
    pub max_max_tokens: u32
}

impl Default for EndpointConfig
{   fn default() -> Self
    {   EndpointConfig
        {   api_base: "http://127.0.0.1:7860".to_string()
          , flavor: EndpointFlavor::Generic
          , submit_timeout_secs: 30
          , poll_timeout_secs: 120
          , min_max_tokens: 256
          , max_max_tokens: 2048
        }
    }
}

impl EndpointConfig
{   pub fn submit_timeout(&self) -> Duration
    {   Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration
    {   Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig
{   /// Total attempts per partition, first one included
    pub max_attempts: usize
  , /// Backoff multiplier for retries
    pub backoff_multiplier: f32
  , /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64
  , /// Upper bound on a single backoff in milliseconds
    pub max_backoff_ms: u64
}

impl Default for RetryConfig
{   fn default() -> Self
    {   RetryConfig
        {   max_attempts: 3
          , backoff_multiplier: 2.0
          , initial_backoff_ms: 2000
          , max_backoff_ms: 30_000
        }
    }
}

/// Partition sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig
{   /// Per-call output token ceiling
    pub token_ceiling: u32
  , /// Estimated tokens for one generated option
    pub tokens_per_item: u32
  , /// Hard cap on slots per call
    pub max_slots_per_call: usize
}

impl Default for PartitionConfig
{   fn default() -> Self
    {   PartitionConfig
        {   token_ceiling: 2048
          , tokens_per_item: 300
          , max_slots_per_call: 3
        }
    }
}

/// Complete plangen configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanGenConfig
{   pub endpoint: EndpointConfig
  , pub retry: RetryConfig
  , pub partition: PartitionConfig
  , /// Overall orchestration deadline in seconds
    pub deadline_secs: Option<u64>
}

impl PlanGenConfig
{   /// Defaults overlaid with `PLANGEN_*` environment variables
    pub fn from_env() -> crate::Result<Self>
    {   let mut config = PlanGenConfig::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P)
      -> crate::Result<Self>
    {   let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)
          .map_err(|e| {
            error!("Cannot read {}: {}", path.display(), e);
            crate::Error::InvalidConfiguration(
              format!("{}: {}", path.display(), e)
            )
          })?;
        let config: PlanGenConfig = serde_json::from_str(&text)
          .map_err(|e| {
            error!("Bad config {}: {}", path.display(), e);
            crate::Error::InvalidConfiguration(e.to_string())
          })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> crate::Result<()>
    where F: Fn(&str) -> Option<String>
    {   if let Some(base) = lookup("PLANGEN_API_BASE")
        {   self.endpoint.api_base
              = base.trim_end_matches('/').to_string();
        }
        if let Some(flavor) = lookup("PLANGEN_FLAVOR")
        {   self.endpoint.flavor = match flavor.as_str()
            {   "generic" => EndpointFlavor::Generic
              , "gradio" => EndpointFlavor::Gradio
              , other => {
                  return Err(crate::Error::InvalidConfiguration(
                    format!("PLANGEN_FLAVOR: unknown flavor {}", other)
                  ));
                }
            };
        }
        if let Some(v) = parse_var(&lookup, "PLANGEN_MAX_TOKENS")?
        {   self.partition.token_ceiling = v;
        }
        if let Some(v) = parse_var(&lookup, "PLANGEN_POLL_TIMEOUT_SECS")?
        {   self.endpoint.poll_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "PLANGEN_MAX_ATTEMPTS")?
        {   self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "PLANGEN_DEADLINE_SECS")?
        {   self.deadline_secs = Some(v);
        }
        Ok(())
    }

    /// Reject values the orchestrator cannot work with
    pub fn validate(&self) -> crate::Result<()>
    {   let invalid = |msg: &str| {
          error!("Invalid configuration: {}", msg);
          Err(crate::Error::InvalidConfiguration(msg.to_string()))
        };
        if self.retry.max_attempts == 0
        {   return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.backoff_multiplier >= 1.0)
        {   return invalid("retry.backoff_multiplier must be >= 1");
        }
        if self.endpoint.min_max_tokens > self.endpoint.max_max_tokens
        {   return invalid("endpoint token range is inverted");
        }
        if self.partition.max_slots_per_call == 0
        {   return invalid("partition.max_slots_per_call must be >= 1");
        }
        if self.partition.tokens_per_item == 0
        {   return invalid("partition.tokens_per_item must be >= 1");
        }
        Ok(())
    }

    pub fn deadline(&self) -> Option<Duration>
    {   self.deadline_secs.map(Duration::from_secs)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> crate::Result<Option<T>>
where F: Fn(&str) -> Option<String>
    , T: std::str::FromStr
{   match lookup(name)
    {   None => Ok(None)
      , Some(raw) => raw.trim().parse::<T>()
          .map(Some)
          .map_err(|_| {
            error!("{} is not a number: {}", name, raw);
            crate::Error::InvalidConfiguration(
              format!("{}: not a number: {}", name, raw)
            )
          })
    }
}
