//! The pipeline engine.
//!
//! | Module         | Responsibility                                        |
//! |----------------|-------------------------------------------------------|
//! | `orchestrator` | Project lifecycles, one driver task per project       |
//! | `executor`     | One stage under the retry policy and attempt timeout  |
//! | `recovery`     | Failure classification and retry/escalate/abort       |
//! | `intervention` | Human checkpoints and resolution semantics            |
//! | `queue`        | Durable agent-to-agent messages                       |
//! | `registry`     | Stage to adapter lookup                               |

pub mod executor;
pub mod intervention;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod registry;

pub use executor::{FailureOutcome, StageExecutor, StageResult};
pub use intervention::{InterventionManager, Resolution, ResolutionAction, ResumeHook};
pub use orchestrator::{Orchestrator, PipelineReport, PipelineSettings};
pub use queue::MessageQueue;
pub use recovery::{ClassifiedError, ErrorRecoveryManager, RecoveryDecision};
pub use registry::AgentRegistry;
