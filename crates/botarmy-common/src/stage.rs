//! The fixed stage sequence and the agent roles that own each stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Position of a project in the pipeline.
///
/// `Analyzing` through `Testing` are the work stages, executed strictly in
/// declaration order. `Idle`, `Completed` and `Error` are pseudo-stages that
/// bracket the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Analyzing,
    Architecting,
    Developing,
    Testing,
    Completed,
    Error,
}

impl Stage {
    /// The work stages in execution order.
    pub const PIPELINE: [Stage; 4] = [
        Stage::Analyzing,
        Stage::Architecting,
        Stage::Developing,
        Stage::Testing,
    ];

    pub fn first() -> Stage {
        Stage::Analyzing
    }

    /// The stage that follows this one. `Testing` is followed by the
    /// `Completed` pseudo-stage; terminal pseudo-stages map to themselves.
    pub fn next(self) -> Stage {
        match self {
            Stage::Idle => Stage::Analyzing,
            Stage::Analyzing => Stage::Architecting,
            Stage::Architecting => Stage::Developing,
            Stage::Developing => Stage::Testing,
            Stage::Testing => Stage::Completed,
            Stage::Completed => Stage::Completed,
            Stage::Error => Stage::Error,
        }
    }

    pub fn is_work_stage(self) -> bool {
        Self::PIPELINE.contains(&self)
    }

    /// The agent responsible for executing this stage.
    pub fn agent(self) -> Option<AgentRole> {
        match self {
            Stage::Analyzing => Some(AgentRole::Analyst),
            Stage::Architecting => Some(AgentRole::Architect),
            Stage::Developing => Some(AgentRole::Developer),
            Stage::Testing => Some(AgentRole::Tester),
            Stage::Idle | Stage::Completed | Stage::Error => None,
        }
    }

    /// Recipient of this stage's output: the next stage's agent, or the
    /// orchestrator once the sequence is exhausted.
    pub fn downstream(self) -> AgentRole {
        self.next().agent().unwrap_or(AgentRole::Orchestrator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Analyzing => "analyzing",
            Stage::Architecting => "architecting",
            Stage::Developing => "developing",
            Stage::Testing => "testing",
            Stage::Completed => "completed",
            Stage::Error => "error",
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Stage::Idle),
            "analyzing" => Ok(Stage::Analyzing),
            "architecting" => Ok(Stage::Architecting),
            "developing" => Ok(Stage::Developing),
            "testing" => Ok(Stage::Testing),
            "completed" => Ok(Stage::Completed),
            "error" => Ok(Stage::Error),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sender or recipient of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Analyst,
    Architect,
    Developer,
    Tester,
    /// Operator resolving an intervention.
    Human,
    /// Sink for the final stage's output.
    Orchestrator,
}

impl AgentRole {
    pub const WORKERS: [AgentRole; 4] = [
        AgentRole::Analyst,
        AgentRole::Architect,
        AgentRole::Developer,
        AgentRole::Tester,
    ];

    /// The stage this role executes, if it is a worker role.
    pub fn stage(self) -> Option<Stage> {
        match self {
            AgentRole::Analyst => Some(Stage::Analyzing),
            AgentRole::Architect => Some(Stage::Architecting),
            AgentRole::Developer => Some(Stage::Developing),
            AgentRole::Tester => Some(Stage::Testing),
            AgentRole::Human | AgentRole::Orchestrator => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Analyst => "analyst",
            AgentRole::Architect => "architect",
            AgentRole::Developer => "developer",
            AgentRole::Tester => "tester",
            AgentRole::Human => "human",
            AgentRole::Orchestrator => "orchestrator",
        }
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyst" => Ok(AgentRole::Analyst),
            "architect" => Ok(AgentRole::Architect),
            "developer" => Ok(AgentRole::Developer),
            "tester" => Ok(AgentRole::Tester),
            "human" => Ok(AgentRole::Human),
            "orchestrator" => Ok(AgentRole::Orchestrator),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence() {
        let mut stage = Stage::Idle;
        let mut seen = Vec::new();
        while stage != Stage::Completed {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::Analyzing,
                Stage::Architecting,
                Stage::Developing,
                Stage::Testing,
                Stage::Completed
            ]
        );
        assert_eq!(Stage::Error.next(), Stage::Error);
    }

    #[test]
    fn test_stage_order_is_total() {
        assert!(Stage::Analyzing < Stage::Architecting);
        assert!(Stage::Developing < Stage::Testing);
        for pair in Stage::PIPELINE.windows(2) {
            assert_eq!(pair[0].next(), pair[1]);
        }
    }

    #[test]
    fn test_stage_agents() {
        for stage in Stage::PIPELINE {
            let role = stage.agent().unwrap();
            assert_eq!(role.stage(), Some(stage));
        }
        assert_eq!(Stage::Idle.agent(), None);
        assert_eq!(Stage::Analyzing.downstream(), AgentRole::Architect);
        assert_eq!(Stage::Testing.downstream(), AgentRole::Orchestrator);
    }

    #[test]
    fn test_stage_from_str() {
        for stage in [Stage::Idle, Stage::Developing, Stage::Completed, Stage::Error] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("deploying".parse::<Stage>().is_err());
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("human".parse::<AgentRole>().unwrap(), AgentRole::Human);
        assert_eq!(AgentRole::Tester.to_string(), "tester");
        assert!("manager".parse::<AgentRole>().is_err());
    }
}
