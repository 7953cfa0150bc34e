use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use log::{debug, info, warn, error};
use crate::assemble::{AssembledResult, PlanAssembler};
use crate::config::PlanGenConfig;
use crate::extract::ResponseExtractor;
use crate::partition::PromptPartitioner;
use crate::providers::GenerationBackend;
use crate::request::{GenerationRequest, PartitionPlan};
use crate::retry::{PartitionOutcome, RetryOrchestrator, RetryPolicy};
use crate::PlanGenFoot;

/// Plans a request, runs every partition concurrently and assembles
/// the result. Holds no per-call state, so one instance can serve
/// any number of concurrent calls.
#[derive(Clone)]
pub struct Orchestrator
{   partitioner: PromptPartitioner
  , retry: RetryOrchestrator
  , policy: RetryPolicy
  , default_deadline: Option<Duration>
}

impl Orchestrator
{   /// Orchestrator over any backend
    pub fn new(
      config: &PlanGenConfig
    , backend: Arc<dyn GenerationBackend>
    ) -> Self
    {   debug!("Creating Orchestrator");
        Orchestrator
        {   partitioner: PromptPartitioner::new(config.partition.clone())
          , retry: RetryOrchestrator::new(
              backend,
              ResponseExtractor::default(),
              config.endpoint.poll_timeout()
            )
          , policy: RetryPolicy::from_config(&config.retry)
          , default_deadline: config.deadline()
        }
    }

    /// Orchestrator over the configured HTTP endpoint
    pub fn from_config(config: &PlanGenConfig) -> crate::Result<Self>
    {   config.validate()?;
        let client = crate::providers::HttpGenerationClient::new(
          config.endpoint.clone()
        )?;
        Ok(Orchestrator::new(config, Arc::new(client)))
    }

    /// Swap the extractor (e.g. for different numeric fields)
    pub fn with_extractor(mut self, extractor: ResponseExtractor) -> Self
    {   self.retry = self.retry.with_extractor(extractor);
        self
    }

    pub fn plan(&self, request: &GenerationRequest) -> PartitionPlan
    {   self.partitioner.plan(request)
    }

    /// Generate every slot of `request`.
    ///
    /// Errors only for a malformed request. Failed, partial and
    /// cancelled partitions are reported in the manifest. Partitions
    /// still running at `deadline` are aborted.
    pub async fn generate(
      &self
    , request: &GenerationRequest
    , deadline: Option<Duration>
    ) -> crate::Result<AssembledResult>
    {   request.validate()?;
        let plan = self.partitioner.plan(request);
        plan.check_covers(request)?;
        let deadline_at = deadline
          .or(self.default_deadline)
          .map(|d| Instant::now() + d);
        info!(
          "Generating {} slots in {} partitions",
          request.slots.len(), plan.len()
        );

        let mut tasks = Vec::with_capacity(plan.len());
        for partition in plan.partitions
        {   let retry = self.retry.clone();
            let policy = self.policy.clone();
            let task_partition = partition.clone();
            let handle = tokio::spawn(async move {
              retry.run(&task_partition, &policy).await
            });
            tasks.push((partition, handle));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (partition, mut handle) in tasks
        {   let joined = match deadline_at
            {   Some(at) => {
                  match tokio::time::timeout_at(at, &mut handle).await
                  {   Ok(joined) => Some(joined)
                    , Err(_) => {
                        handle.abort();
                        None
                      }
                  }
                }
              , None => Some(handle.await)
            };
            let outcome = match joined
            {   Some(Ok(outcome)) => outcome
              , Some(Err(e)) => {
                  error!("Partition {} task failed: {}", partition.index, e);
                  PartitionOutcome
                  {   partition_index: partition.index
                    , slots: partition.slot_names()
                    , attempts: 0
                    , result: Err(crate::Error::Other(
                        format!("partition task failed: {}", e)
                      ))
                  }
                }
              , None => {
                  warn!(
                    "Partition {} cancelled at deadline",
                    partition.index
                  );
                  PartitionOutcome::cancelled(&partition, 0)
                }
            };
            outcomes.push(outcome);
        }

        Ok(PlanAssembler::assemble(&request.slot_names(), outcomes))
    }
}

/// Public API for plan generation - owns the task
pub struct GenerationService
{   hand: crate::PlanGenHand
  , _task_handle: tokio::task::JoinHandle<()>
}

impl GenerationService
{   /// Create and spawn a new service.
    /// Returns immediately - spawns background task
    pub fn new(orchestrator: Orchestrator) -> Self
    {   debug!("Creating GenerationService with task ownership");

        let (generate_tx, generate_rx)
          = mpsc::unbounded_channel();
        let (kill_process_tx, kill_process_rx)
          = mpsc::unbounded_channel();

        let hand = crate::PlanGenHand
        {   generate_tx
          , kill_process_tx
        };

        let foot = crate::PlanGenFoot
        {   generate_rx
          , kill_process_rx
        };

        let _task_handle = tokio::spawn(async move {
          run_service_loop(foot, Arc::new(orchestrator)).await
        });

        GenerationService
        {   hand
          , _task_handle
        }
    }

    /// Queue a generation - returns almost immediately
    pub async fn generate(
      &self
    , request: GenerationRequest
    , deadline: Option<Duration>
    ) -> crate::Result<
        mpsc::UnboundedReceiver<crate::GenerateReply>
      >
    {   debug!("generate queuing {} slots", request.slots.len());
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::GenerateArgs
        {   request
          , deadline
          , reply: reply_tx
        };

        self.hand.generate_tx
          .send(cmd)
          .map_err(|_| {
            error!("Service channel closed");
            crate::Error::Other(
              "Service disconnected".to_string()
            )
          })?;

        Ok(reply_rx)
    }

    /// Gracefully shutdown the service
    pub async fn shutdown(self)
      -> crate::Result<()>
    {   debug!("Shutting down GenerationService");
        let (reply_tx, mut reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::KillProcessArgs
        {   reply: reply_tx
        };

        self.hand.kill_process_tx
          .send(cmd)
          .map_err(|_| {
            error!("Service channel already closed");
            crate::Error::Other(
              "Service already shutdown".to_string()
            )
          })?;

        // Wait for shutdown confirmation
        if let Some(result) = reply_rx.recv().await
        {   debug!("Service shutdown confirmed");
            result
        } else
        {   error!("Service loop ended without confirming shutdown");
            Err(crate::Error::Other(
              "Service loop ended".to_string()
            ))
        }
    }
}

/// Main service event loop
///
/// tokio::select! is ONLY for fast queueing. Each generate runs
/// in its own task so calls never wait on each other.
async fn run_service_loop(
  foot: PlanGenFoot
, orchestrator: Arc<Orchestrator>
)
{   debug!("Starting GenerationService event loop");
    let PlanGenFoot
    {   mut generate_rx
      , mut kill_process_rx
    } = foot;

    loop
    { tokio::select!
      { Some(cmd) = generate_rx.recv() => {
          debug!("Received Generate for {} slots", cmd.request.slots.len());
          let orchestrator = orchestrator.clone();
          tokio::spawn(async move {
            let result = orchestrator
              .generate(&cmd.request, cmd.deadline)
              .await;
            let _ = cmd.reply.send(result);
          });
        }
      , Some(cmd) = kill_process_rx.recv() => {
          debug!("Received KillProcess");
          let _ = cmd.reply.send(Ok(()));
          info!("GenerationService shutting down");
          break;
        }
      , else => {
          debug!("All command channels closed");
          break;
        }
      }
    }
}
