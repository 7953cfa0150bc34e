//! Retry logic around one partition's submit -> poll -> extract cycle

use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn, error};
use crate::extract::ResponseExtractor;
use crate::providers::GenerationBackend;
use crate::request::{GenerationJob, JobStatus, ParsedSlotResult, Partition};

/// Retry policy for failed attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy
{   pub max_attempts: usize
  , pub backoff_multiplier: f32
  , pub initial_backoff: Duration
  , pub max_backoff: Duration
}

impl RetryPolicy
{   /// Create a new retry policy
    pub fn new(
      max_attempts: usize
    , backoff_multiplier: f32
    , initial_backoff_ms: u64
    , max_backoff_ms: u64
    ) -> Self
    {   RetryPolicy
        {   max_attempts
          , backoff_multiplier
          , initial_backoff: Duration::from_millis(
              initial_backoff_ms
            )
          , max_backoff: Duration::from_millis(max_backoff_ms)
        }
    }

    pub fn from_config(config: &crate::config::RetryConfig) -> Self
    {   RetryPolicy::new(
          config.max_attempts,
          config.backoff_multiplier,
          config.initial_backoff_ms,
          config.max_backoff_ms
        )
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_for_attempt(
      &self
    , attempt: usize
    ) -> Duration
    {   let exponent = attempt.saturating_sub(1).min(32) as i32;
        let multiplier
          = self.backoff_multiplier.powi(exponent);
        let millis
          = self.initial_backoff.as_millis() as f32 * multiplier;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

impl Default for RetryPolicy
{   fn default() -> Self
    {   RetryPolicy::from_config(&crate::config::RetryConfig::default())
    }
}

/// What happened to one partition once its retries ended
#[derive(Debug, Clone)]
pub struct PartitionOutcome
{   pub partition_index: usize
  , /// Slots the partition was responsible for
    pub slots: Vec<String>
  , /// Attempts actually made
    pub attempts: usize
  , pub result: crate::Result<ParsedSlotResult>
}

impl PartitionOutcome
{   /// Outcome for a partition abandoned at the deadline
    pub fn cancelled(partition: &Partition, attempts: usize) -> Self
    {   PartitionOutcome
        {   partition_index: partition.index
          , slots: partition.slot_names()
          , attempts
          , result: Err(crate::Error::Cancelled)
        }
    }
}

/// Runs attempts for a partition until success or exhaustion
#[derive(Clone)]
pub struct RetryOrchestrator
{   backend: Arc<dyn GenerationBackend>
  , extractor: ResponseExtractor
  , poll_timeout: Duration
}

impl RetryOrchestrator
{   pub fn new(
      backend: Arc<dyn GenerationBackend>
    , extractor: ResponseExtractor
    , poll_timeout: Duration
    ) -> Self
    {   RetryOrchestrator
        {   backend
          , extractor
          , poll_timeout
        }
    }

    pub fn with_extractor(mut self, extractor: ResponseExtractor) -> Self
    {   self.extractor = extractor;
        self
    }

    /// One submit -> poll -> extract cycle
    pub async fn attempt(&self, partition: &Partition)
      -> crate::Result<ParsedSlotResult>
    {   let job_id = self.backend
          .submit(
            &partition.system_prompt,
            &partition.prompt,
            partition.max_tokens,
            partition.temperature
          )
          .await?;
        let mut job = GenerationJob::new(partition.index, job_id);

        let raw = match self.backend
          .poll(&job.job_id, self.poll_timeout)
          .await
        {   Ok(raw) => raw
          , Err(e) => {
              job.finish(match e
              {   crate::Error::PollTimeout { .. } => JobStatus::TimedOut
                , _ => JobStatus::Failed
              });
              error!(
                "Job {} for partition {} ended {:?} after {:?}: {}",
                job.job_id, partition.index, job.status, job.elapsed(), e
              );
              return Err(e);
            }
        };

        let expected = partition.slot_names();
        let parsed = self.extractor.extract(&raw, &expected);
        let parsed = match parsed
        {   Ok(p) if p.is_empty() => {
              error!(
                "Job {} recovered none of {:?}",
                job.job_id, expected
              );
              Err(crate::Error::extraction("no_expected_keys", &raw))
            }
          , other => other
        };
        job.finish(match parsed
        {   Ok(_) => JobStatus::Succeeded
          , Err(_) => JobStatus::Failed
        });
        debug!(
          "Job {} for partition {} {:?} in {:?}",
          job.job_id, partition.index, job.status, job.elapsed()
        );
        parsed
    }

    /// Attempt `partition` under `policy`.
    ///
    /// A partial result is accepted as is; only errors are retried,
    /// and only while they are retryable and attempts remain.
    pub async fn run(
      &self
    , partition: &Partition
    , policy: &RetryPolicy
    ) -> PartitionOutcome
    {   let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop
        {   attempt += 1;
            debug!(
              "Partition {} attempt {}/{}",
              partition.index, attempt, max_attempts
            );
            let result = self.attempt(partition).await;
            let done = match &result
            {   Ok(parsed) => {
                  if parsed.is_partial()
                  {   warn!(
                        "Partition {} partial, missing {:?}",
                        partition.index, parsed.missing_keys
                      );
                  } else
                  {   info!("Partition {} complete", partition.index);
                  }
                  true
                }
              , Err(e) if !e.is_retryable() => {
                  error!(
                    "Partition {} failed, not retryable: {}",
                    partition.index, e
                  );
                  true
                }
              , Err(e) if attempt >= max_attempts => {
                  error!(
                    "Partition {} exhausted {} attempts: {}",
                    partition.index, attempt, e
                  );
                  true
                }
              , Err(e) => {
                  warn!(
                    "Partition {} attempt {}/{} failed: {}",
                    partition.index, attempt, max_attempts, e
                  );
                  false
                }
            };

            if done
            {   return PartitionOutcome
                {   partition_index: partition.index
                  , slots: partition.slot_names()
                  , attempts: attempt
                  , result
                };
            }
            tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
        }
    }
}
