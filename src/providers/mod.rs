//! Remote generation endpoints

use std::time::Duration;
use async_trait::async_trait;
use log::{error, warn};
use crate::request::RawCompletion;

pub mod http;

// Re-export for convenience
pub use http::HttpGenerationClient;

/// Two-phase access to a generation endpoint.
///
/// `submit` hands a prompt over and returns the server's job handle;
/// `poll` blocks the calling task until that job's terminal event
/// arrives or `timeout` elapses. Implementations never retry.
#[async_trait]
pub trait GenerationBackend: Send + Sync
{   async fn submit(
      &self
    , system_prompt: &str
    , user_prompt: &str
    , max_tokens: u32
    , temperature: f32
    ) -> crate::Result<String>;

    async fn poll(
      &self
    , job_id: &str
    , timeout: Duration
    ) -> crate::Result<RawCompletion>;
}

/// Bring `requested` into the endpoint's accepted range
pub fn clamp_max_tokens(requested: u32, min: u32, max: u32) -> u32
{   let clamped = requested.clamp(min, max);
    if clamped != requested
    {   warn!(
          "max_tokens {} outside [{}, {}], sending {}",
          requested, min, max, clamped
        );
    }
    clamped
}

/// Temperature in [0, 1]; NaN is rejected, the rest clamped
pub fn check_temperature(temperature: f32) -> crate::Result<f32>
{   if temperature.is_nan()
    {   error!("Temperature is NaN");
        return Err(crate::Error::InvalidParameter(
          "temperature is NaN".to_string()
        ));
    }
    let clamped = temperature.clamp(0.0, 1.0);
    if clamped != temperature
    {   warn!("Temperature {} clamped to {}", temperature, clamped);
    }
    Ok(clamped)
}
