//! Shared domain vocabulary for the BotArmy pipeline.
//!
//! Everything an agent implementation needs to plug into the orchestrator
//! lives here: identifiers, the stage sequence, lifecycle statuses, the retry
//! policy value object, and the [`AgentAdapter`] contract.

pub mod agent;
pub mod ids;
pub mod retry;
pub mod stage;
pub mod status;

pub use agent::{
    AgentAdapter, AgentError, AgentOutput, DecisionOrigin, HumanDecision, PriorOutput, StageInput,
};
pub use ids::{MessageId, ProjectId, RequestId};
pub use retry::RetryPolicy;
pub use stage::{AgentRole, Stage};
pub use status::{InterventionStatus, MessageStatus, Priority, ProjectStatus};
