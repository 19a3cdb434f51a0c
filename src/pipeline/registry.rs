use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use botarmy_common::{AgentAdapter, Stage};

/// Adapters keyed by the work stage they execute.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    adapters: HashMap<Stage, Arc<dyn AgentAdapter>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for the stage its role works on, replacing any
    /// previous adapter for that stage.
    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) -> Result<()> {
        let role = adapter.role();
        let Some(stage) = role.stage() else {
            bail!("Agent role '{}' does not execute a pipeline stage", role);
        };
        self.adapters.insert(stage, adapter);
        Ok(())
    }

    pub fn with(mut self, adapter: Arc<dyn AgentAdapter>) -> Result<Self> {
        self.register(adapter)?;
        Ok(self)
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(&stage).cloned()
    }

    /// Work stages with no adapter, in pipeline order.
    pub fn missing(&self) -> Vec<Stage> {
        Stage::PIPELINE
            .iter()
            .copied()
            .filter(|s| !self.adapters.contains_key(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use botarmy_common::{AgentError, AgentOutput, AgentRole, StageInput};
    use serde_json::json;

    use super::*;

    struct Fixed(AgentRole);

    #[async_trait]
    impl AgentAdapter for Fixed {
        fn role(&self) -> AgentRole {
            self.0
        }

        async fn execute(&self, _input: &StageInput) -> Result<AgentOutput, AgentError> {
            Ok(AgentOutput::new(json!({"ok": true})))
        }
    }

    #[test]
    fn test_registers_by_role_stage() {
        let registry = AgentRegistry::new()
            .with(Arc::new(Fixed(AgentRole::Analyst)))
            .unwrap()
            .with(Arc::new(Fixed(AgentRole::Tester)))
            .unwrap();
        assert!(registry.get(Stage::Analyzing).is_some());
        assert!(registry.get(Stage::Architecting).is_none());
        assert_eq!(
            registry.missing(),
            vec![Stage::Architecting, Stage::Developing]
        );
    }

    #[test]
    fn test_rejects_non_worker_roles() {
        let mut registry = AgentRegistry::new();
        let err = registry
            .register(Arc::new(Fixed(AgentRole::Human)))
            .unwrap_err();
        assert!(err.to_string().contains("human"));
    }
}
