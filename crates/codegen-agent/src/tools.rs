//! FSM-control tool definitions (§4.G) — the tool-call surface a session
//! exposes to the driving client: `start_application`, `confirm_state`,
//! `provide_feedback`, `complete`, `get_state`, `get_available_actions`,
//! `get_state_output`. Argument/result shapes follow `tool_schema.rs`'s
//! typed-struct-plus-`schemars` pattern.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::message::Tool;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct StartApplicationArgs {
    pub user_prompt: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConfirmStateArgs {}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProvideFeedbackArgs {
    pub feedback: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CompleteArgs {}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetStateArgs {}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetAvailableActionsArgs {}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetStateOutputArgs {}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: String,
    pub context: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CoderCompleteArgs {}

fn tool(name: &str, description: &str, schema: serde_json::Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: schema,
    }
}

/// The fixed tool bundle offered to the model on every turn. Schemas are
/// generated from the argument structs above so the wire shape and the
/// processor's deserialization target can never drift apart.
pub fn fsm_control_tools() -> Vec<Tool> {
    vec![
        tool(
            "start_application",
            "Begin a new application build from a user prompt.",
            serde_json::to_value(schemars::schema_for!(StartApplicationArgs)).unwrap(),
        ),
        tool(
            "confirm_state",
            "Confirm the current generated stage and advance the machine.",
            serde_json::to_value(schemars::schema_for!(ConfirmStateArgs)).unwrap(),
        ),
        tool(
            "provide_feedback",
            "Send free-form feedback that re-queues the current stage with the feedback appended.",
            serde_json::to_value(schemars::schema_for!(ProvideFeedbackArgs)).unwrap(),
        ),
        tool(
            "complete",
            "Mark the session complete.",
            serde_json::to_value(schemars::schema_for!(CompleteArgs)).unwrap(),
        ),
        tool(
            "get_state",
            "Return the current FSM state name and context.",
            serde_json::to_value(schemars::schema_for!(GetStateArgs)).unwrap(),
        ),
        tool(
            "get_available_actions",
            "List event names the machine will currently accept.",
            serde_json::to_value(schemars::schema_for!(GetAvailableActionsArgs)).unwrap(),
        ),
        tool(
            "get_state_output",
            "Return the files produced by the current stage.",
            serde_json::to_value(schemars::schema_for!(GetStateOutputArgs)).unwrap(),
        ),
    ]
}

/// The tool bundle offered to a beam search candidate: file edits land as
/// `<file path="...">` blocks in the turn's own text (parsed by
/// [`crate::beam::FileEdit`]), so only the read/delete/close-out actions
/// need a tool-call surface.
pub fn coder_tools() -> Vec<Tool> {
    vec![
        tool(
            "read_file",
            "Read a file's current contents from the workspace.",
            serde_json::to_value(schemars::schema_for!(ReadFileArgs)).unwrap(),
        ),
        tool(
            "delete_file",
            "Delete a file from the workspace.",
            serde_json::to_value(schemars::schema_for!(DeleteFileArgs)).unwrap(),
        ),
        tool(
            "complete",
            "Signal that this stage's files are ready for validation.",
            serde_json::to_value(schemars::schema_for!(CoderCompleteArgs)).unwrap(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_control_tools_are_all_named_and_unique() {
        let tools = fsm_control_tools();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), tools.len());
        assert!(tools.iter().all(|t| t.description.is_some()));
    }

    #[test]
    fn coder_tools_are_all_named_and_unique() {
        let tools = coder_tools();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), tools.len());
    }
}
