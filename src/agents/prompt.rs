//! Prompt text sent to command agents on stdin.

use botarmy_common::{AgentRole, StageInput};

const ANALYST_INSTRUCTIONS: &str = "You are the analyst. Read the requirement and produce \
an analysis of the problem plus a list of user stories with acceptance criteria.";

const ARCHITECT_INSTRUCTIONS: &str = "You are the architect. Using the analysis, design a \
system architecture and list its components, their responsibilities and interfaces.";

const DEVELOPER_INSTRUCTIONS: &str = "You are the developer. Implement the architecture. \
Return every generated file with its path and full contents.";

const TESTER_INSTRUCTIONS: &str = "You are the tester. Review the generated files against \
the user stories, write tests for them and report the results.";

pub fn default_instructions(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Analyst => ANALYST_INSTRUCTIONS,
        AgentRole::Architect => ARCHITECT_INSTRUCTIONS,
        AgentRole::Developer => DEVELOPER_INSTRUCTIONS,
        AgentRole::Tester => TESTER_INSTRUCTIONS,
        AgentRole::Orchestrator | AgentRole::Human => "",
    }
}

/// Build the full prompt: instructions, the stage input as JSON, and the
/// response shape the output parser expects.
pub fn render_prompt(
    instructions: &str,
    input: &StageInput,
    required_fields: &[String],
) -> serde_json::Result<String> {
    let input_json = serde_json::to_string_pretty(input)?;
    let fields = if required_fields.is_empty() {
        "any fields that describe your work".to_string()
    } else {
        required_fields.join(", ")
    };

    let mut prompt = String::new();
    prompt.push_str(instructions.trim());
    prompt.push_str("\n\n## Stage input\n\n```json\n");
    prompt.push_str(&input_json);
    prompt.push_str("\n```\n\n");

    if let Some(decision) = &input.human_decision {
        prompt.push_str("## Operator decision\n\n");
        prompt.push_str(&format!(
            "An operator reviewed the previous attempt ({}) and chose '{}'. \
             Take that into account.\n\n",
            decision.description, decision.choice
        ));
    }

    prompt.push_str("## Response format\n\n");
    prompt.push_str(
        "Reply with a single JSON object:\n\n```json\n{\n  \"payload\": { ... },\n  \
         \"confidence\": 0.0-1.0,\n  \"requires_intervention\": false,\n  \
         \"intervention_reason\": null\n}\n```\n\n",
    );
    prompt.push_str(&format!("The payload must contain: {}.\n", fields));
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use botarmy_common::{DecisionOrigin, HumanDecision, ProjectId, RequestId, Stage};

    fn input() -> StageInput {
        StageInput {
            project_id: ProjectId::new(),
            stage: Stage::Analyzing,
            requirement: "Build a todo app".to_string(),
            previous_stage_outputs: Vec::new(),
            human_decision: None,
        }
    }

    #[test]
    fn test_prompt_contains_requirement_and_fields() {
        let fields = vec!["analysis".to_string(), "user_stories".to_string()];
        let prompt = render_prompt(ANALYST_INSTRUCTIONS, &input(), &fields).unwrap();
        assert!(prompt.starts_with("You are the analyst."));
        assert!(prompt.contains("Build a todo app"));
        assert!(prompt.contains("The payload must contain: analysis, user_stories."));
        assert!(!prompt.contains("Operator decision"));
    }

    #[test]
    fn test_prompt_includes_operator_decision() {
        let mut input = input();
        input.human_decision = Some(HumanDecision {
            request_id: RequestId::new(),
            choice: "retry".to_string(),
            description: "Analyzing failed after 3 attempts".to_string(),
            origin: DecisionOrigin::Failure,
        });
        let prompt = render_prompt("Do it.", &input, &[]).unwrap();
        assert!(prompt.contains("## Operator decision"));
        assert!(prompt.contains("chose 'retry'"));
        assert!(prompt.contains("any fields that describe your work"));
    }

    #[test]
    fn test_coordinator_roles_have_no_instructions() {
        assert!(default_instructions(AgentRole::Orchestrator).is_empty());
        assert!(!default_instructions(AgentRole::Tester).is_empty());
    }
}
