//! Lifecycle statuses for projects, messages and intervention requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Processing,
    WaitingApproval,
    Completed,
    Error,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Processing => "processing",
            ProjectStatus::WaitingApproval => "waiting_approval",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Error => "error",
            ProjectStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Error | ProjectStatus::Cancelled
        )
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ProjectStatus::Created),
            "processing" => Ok(ProjectStatus::Processing),
            "waiting_approval" => Ok(ProjectStatus::WaitingApproval),
            "completed" => Ok(ProjectStatus::Completed),
            "error" => Ok(ProjectStatus::Error),
            "cancelled" => Ok(ProjectStatus::Cancelled),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Error => "error",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "completed" => Ok(MessageStatus::Completed),
            "error" => Ok(MessageStatus::Error),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    Resolved,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionStatus::Pending => "pending",
            InterventionStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for InterventionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InterventionStatus::Pending),
            "resolved" => Ok(InterventionStatus::Resolved),
            _ => Err(format!("Invalid intervention status: {}", s)),
        }
    }
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Sort key with the most urgent priority first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_status_terminal() {
        assert!(ProjectStatus::Completed.is_terminal());
        assert!(ProjectStatus::Error.is_terminal());
        assert!(ProjectStatus::Cancelled.is_terminal());
        assert!(!ProjectStatus::Processing.is_terminal());
        assert!(!ProjectStatus::WaitingApproval.is_terminal());
        assert!(!ProjectStatus::Created.is_terminal());
    }

    #[test]
    fn test_project_status_serde_matches_as_str() {
        let json = serde_json::to_string(&ProjectStatus::WaitingApproval).unwrap();
        assert_eq!(json, "\"waiting_approval\"");
        assert_eq!(
            "waiting_approval".parse::<ProjectStatus>().unwrap(),
            ProjectStatus::WaitingApproval
        );
    }

    #[test]
    fn test_invalid_statuses() {
        assert!("done".parse::<ProjectStatus>().is_err());
        assert!("queued".parse::<MessageStatus>().is_err());
        assert!("open".parse::<InterventionStatus>().is_err());
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_rank() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Medium];
        priorities.sort_by_key(|p| p.rank());
        assert_eq!(priorities, vec![Priority::High, Priority::Medium, Priority::Low]);
    }
}
