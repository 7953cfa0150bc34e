pub mod error;
pub mod config;
pub mod request;
pub mod prompt;
pub mod partition;
pub mod providers;
pub mod extract;
pub mod retry;
pub mod assemble;
pub mod meal;
pub mod client;

/*

plangen: gets structured diet/exercise plans out of a remote LLM
endpoint that is slow, token-limited and sloppy about JSON.

  GenerationRequest
    -> PromptPartitioner   (split slots into calls under the token ceiling)
    -> RetryOrchestrator   (per partition, concurrently:
                              submit -> poll -> ResponseExtractor,
                              retried with backoff)
    -> PlanAssembler       (key union + manifest of unfilled slots)
    -> AssembledResult

*/

pub use error::{Error, Result};
pub use config::{
  EndpointConfig, EndpointFlavor, PartitionConfig, PlanGenConfig, RetryConfig
};
pub use request::{
  GenerationJob, GenerationRequest, JobStatus, ParsedSlotResult
, Partition, PartitionPlan, RawCompletion, Slot
};
pub use partition::PromptPartitioner;
pub use providers::{GenerationBackend, HttpGenerationClient};
pub use extract::ResponseExtractor;
pub use retry::{PartitionOutcome, RetryOrchestrator, RetryPolicy};
pub use assemble::{
  AssembledResult, Manifest, PartialResultWarning, PlanAssembler
, UnfilledReason, UnfilledSlot
};
pub use client::{GenerationService, Orchestrator};

/// PLANGEN SERVICE INTERFACE:

// ===== Generate =====

pub type GenerateReply = Result<AssembledResult>;
pub type GenerateReplySender
  = tokio::sync::mpsc::UnboundedSender<GenerateReply>;

pub struct GenerateArgs
{   pub request: GenerationRequest
  , pub deadline: Option<std::time::Duration>
  , pub reply: GenerateReplySender
}

// ===== KillProcess =====

pub type KillProcessReply = Result<()>;
pub type KillProcessReplySender
  = tokio::sync::mpsc::UnboundedSender<KillProcessReply>;

pub struct KillProcessArgs
{   pub reply: KillProcessReplySender
}

// ===== PlanGenHand (sender side) =====

pub struct PlanGenHand
{   pub generate_tx
      : tokio::sync::mpsc::UnboundedSender<GenerateArgs>
  , pub kill_process_tx
      : tokio::sync::mpsc::UnboundedSender<KillProcessArgs>
}

// ===== PlanGenFoot (receiver side) =====

pub struct PlanGenFoot
{   pub generate_rx
      : tokio::sync::mpsc::UnboundedReceiver<GenerateArgs>
  , pub kill_process_rx
      : tokio::sync::mpsc::UnboundedReceiver<KillProcessArgs>
}
