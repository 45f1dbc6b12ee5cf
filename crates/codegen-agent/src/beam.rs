//! Beam-search LLM actor (§4.D).
//!
//! The concrete original is `shared_fsm.py`'s `BFSExpandActor`: candidates
//! are either `beam_width` replicas of the root (if the root is itself a
//! leaf) or every current leaf, each candidate is expanded in its own
//! cloned workspace via a bounded parallel fan-out, and the result is
//! validated by a gate battery before being accepted as a child node.
//! `search` drives the select/expand/evaluate/terminate loop of §4.D to
//! completion: it returns the first node whose `complete()` tool call
//! passed the gate battery, or fails with `NoSolutions` once the candidate
//! pool and `max_depth` bound are exhausted.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::errors::{ActorError, AgentResult};
use crate::llm::{completion, LlmClient, ModelParams, UsageTotals};
use crate::message::{ContentBlock, Message, Role, ToolResult, ToolUse, ToolUseResult};
use crate::tree::{NodeId, Tree};
use crate::workspace::Workspace;

/// A `<file path="...">...</file>` block, either a full replacement or a
/// SEARCH/REPLACE patch against the file's current contents.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEdit {
    Full { path: String, content: String },
    Patch { path: String, search: String, replace: String },
}

impl FileEdit {
    pub fn path(&self) -> &str {
        match self {
            Self::Full { path, .. } => path,
            Self::Patch { path, .. } => path,
        }
    }
}

static FILE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<file path="([^"]+)">(.*?)</file>"#).expect("valid regex"));

const SEARCH_MARKER: &str = "<<<<<<< SEARCH\n";
const DIVIDER_MARKER: &str = "\n=======\n";
const REPLACE_MARKER: &str = "\n>>>>>>> REPLACE";

/// Split a captured file block's body into SEARCH/REPLACE halves, if it is
/// one of those blocks rather than a plain full-file replacement.
fn split_search_replace(body: &str) -> Option<(String, String)> {
    let start = body.find(SEARCH_MARKER)?;
    let search_begin = start + SEARCH_MARKER.len();
    let divider = body[search_begin..].find(DIVIDER_MARKER)? + search_begin;
    let search = body[search_begin..divider].to_string();
    let replace_begin = divider + DIVIDER_MARKER.len();
    let end = body[replace_begin..].find(REPLACE_MARKER)? + replace_begin;
    let replace = body[replace_begin..end].to_string();
    Some((search, replace))
}

impl FileEdit {
    /// Parse every file block out of a raw text body, trimming a single
    /// leading/trailing newline from the captured content.
    pub fn parse_all(text: &str) -> Vec<FileEdit> {
        FILE_BLOCK_RE
            .captures_iter(text)
            .map(|caps| {
                let path = caps[1].to_string();
                let body = caps[2].trim_matches('\n').to_string();
                match split_search_replace(&body) {
                    Some((search, replace)) => FileEdit::Patch { path, search, replace },
                    None => FileEdit::Full { path, content: body },
                }
            })
            .collect()
    }
}

/// Apply one `FileEdit` to `workspace`, returning the path and the content
/// that ended up on disk.
async fn apply_edit(workspace: &Workspace, edit: &FileEdit) -> AgentResult<(String, String)> {
    match edit {
        FileEdit::Full { path, content } => {
            workspace.write_file(path, content, false).await?;
            Ok((path.clone(), content.clone()))
        }
        FileEdit::Patch { path, search, replace } => {
            let current = workspace.read_file(path).await?;
            let count = current.matches(search.as_str()).count();
            if count != 1 {
                return Err(crate::errors::WorkspaceError::DiffMismatch {
                    path: path.clone(),
                    count,
                }
                .into());
            }
            let updated = current.replacen(search.as_str(), replace, 1);
            workspace.write_file(path, &updated, false).await?;
            Ok((path.clone(), updated))
        }
    }
}

/// A gate battery run against a workspace after a candidate's `complete()`
/// tool call — the generalized form of `eval_backend`/`eval_backend_handlers`/
/// `eval_backend_index`: compile, test, lint, or any arbitrary command the
/// stage configures.
#[async_trait::async_trait]
pub trait ValidatorBattery: Send + Sync {
    async fn validate(&self, workspace: &Workspace) -> AgentResult<ValidationOutcome>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    /// Combined stdout/stderr of the failing gate, fed back to the LLM as
    /// an error `TextRaw` block on the next turn.
    pub feedback: Option<String>,
}

/// Data carried at every node of the beam tree: the workspace the
/// candidate's turn ran in, its messages (the assistant turn, plus a
/// synthetic user follow-up when the turn didn't close out the stage),
/// whether it closed out as a validated solution, and `files` — seeded
/// from the parent's accumulated `files` before this turn's own edits are
/// folded in (`execute` passes that seed as `parent_files`), so a node's
/// `files` is always the full root→node view, not just this turn's diff.
pub struct NodeData {
    pub workspace: Workspace,
    pub messages: Vec<Message>,
    pub files: HashMap<String, String>,
    pub validation: Option<ValidationOutcome>,
    pub solved: bool,
    /// Opt-in per §9 design note (b): off unless an actor explicitly sets
    /// it on a node it wants fanned out to the full beam width next round
    /// instead of the default single successor.
    pub should_branch: bool,
}

impl NodeData {
    pub fn root(workspace: Workspace) -> Self {
        Self {
            workspace,
            messages: Vec::new(),
            files: HashMap::new(),
            validation: None,
            solved: false,
            should_branch: false,
        }
    }

    /// The single assistant message this node's turn produced. Mirrors the
    /// original's `head()` invariant: exactly one message, assistant role.
    pub fn head(&self) -> &Message {
        assert_eq!(self.messages.len(), 1, "node must carry exactly one message");
        assert_eq!(self.messages[0].role, Role::Assistant);
        &self.messages[0]
    }
}

/// The serializable projection of a [`NodeData`] — everything but the live
/// `Workspace`/`ContainerEngine` handle, which can't round-trip through
/// JSON. `Tree::map` produces a `Tree<NodeSnapshot>` from a `Tree<NodeData>`
/// for checkpointing a search tree's trajectory.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeSnapshot {
    pub messages: Vec<Message>,
    pub files: HashMap<String, String>,
    pub validation: Option<ValidationOutcome>,
    pub solved: bool,
    pub should_branch: bool,
}

impl From<&NodeData> for NodeSnapshot {
    fn from(data: &NodeData) -> Self {
        Self {
            messages: data.messages.clone(),
            files: data.files.clone(),
            validation: data.validation.clone(),
            solved: data.solved,
            should_branch: data.should_branch,
        }
    }
}

/// Wrap a set of files as `<file path="...">...</file>` blocks for
/// inclusion in a prompt, mirroring `grab_file_ctx`.
pub fn render_file_context(files: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let mut paths: Vec<&String> = files.keys().collect();
    paths.sort();
    for path in paths {
        out.push_str(&format!("<file path=\"{path}\">\n{}\n</file>\n", files[path]));
    }
    out
}

pub struct BeamSearchActor {
    pub client: Arc<dyn LlmClient>,
    pub model_params: ModelParams,
    pub beam_width: usize,
    pub max_continuation_turns: usize,
    pub max_depth: usize,
}

impl BeamSearchActor {
    /// Leaves eligible for expansion this round: all current leaves at
    /// depth ≤ `max_depth`, or `beam_width` replicas of the root if the
    /// tree hasn't been expanded yet. A leaf flagged `should_branch` is
    /// fanned out to the full beam width; every other leaf contributes a
    /// single candidate slot.
    fn select_candidates(&self, tree: &Tree<NodeData>) -> Vec<NodeId> {
        let root = tree.root();
        if tree.is_leaf(root) {
            return vec![root; self.beam_width];
        }
        let mut out = Vec::new();
        for leaf in tree.leaves(root) {
            if tree.depth(leaf) > self.max_depth {
                continue;
            }
            let width = if tree.data(leaf).should_branch { self.beam_width.max(1) } else { 1 };
            for _ in 0..width {
                out.push(leaf);
            }
        }
        out
    }

    /// Expand every selected candidate in parallel, pushing each result as
    /// a new child of the candidate it came from. Failed branches are
    /// logged and dropped; other branches continue.
    #[instrument(skip(self, tree, validator))]
    pub async fn execute(
        &self,
        tree: &mut Tree<NodeData>,
        candidates: Vec<NodeId>,
        validator: Arc<dyn ValidatorBattery>,
    ) -> Vec<NodeId> {
        let mut set: JoinSet<(NodeId, AgentResult<NodeData>)> = JoinSet::new();
        for candidate in candidates {
            // Only the trajectory and a scoped workspace clone are taken
            // from `tree` here; the LLM call and container exec run on
            // owned data inside the spawned task.
            let trajectory: Vec<Message> = tree
                .trajectory(candidate)
                .into_iter()
                .flat_map(|id| tree.data(id).messages.clone())
                .collect();
            let parent_files: HashMap<String, String> = tree
                .trajectory(candidate)
                .into_iter()
                .flat_map(|id| tree.data(id).files.clone())
                .collect();
            let (protected, allowed) = tree.data(candidate).workspace.permissions();
            let workspace = match tree.data(candidate).workspace.clone_scoped(protected.clone(), allowed.clone()).await {
                Ok(ws) => ws,
                Err(err) => {
                    warn!(%err, "failed to snapshot candidate workspace");
                    continue;
                }
            };
            let client = Arc::clone(&self.client);
            let params = self.model_params.clone();
            let max_turns = self.max_continuation_turns;
            let validator = Arc::clone(&validator);

            set.spawn(async move {
                let result = run_candidate_turn(
                    client, params, max_turns, trajectory, parent_files, workspace, validator,
                )
                .await;
                (candidate, result)
            });
        }

        let mut new_children = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined.expect("candidate task panicked") {
                (parent, Ok(data)) => new_children.push(tree.push_child(parent, data)),
                (_, Err(err)) => warn!(%err, "candidate expansion failed"),
            }
        }
        new_children
    }

    /// Drive the full §4.D loop: select, expand in parallel, check for a
    /// validated solution, repeat. Returns the first solved leaf, or
    /// `NoSolutions` once a round's candidate pool is empty.
    #[instrument(skip(self, tree, validator))]
    pub async fn search(
        &self,
        tree: &mut Tree<NodeData>,
        validator: Arc<dyn ValidatorBattery>,
    ) -> AgentResult<NodeId> {
        loop {
            let candidates = self.select_candidates(tree);
            if candidates.is_empty() {
                return Err(ActorError::NoSolutions.into());
            }
            let children = self.execute(tree, candidates, Arc::clone(&validator)).await;
            if children.is_empty() {
                return Err(ActorError::NoSolutions.into());
            }
            if let Some(solved) = children.iter().copied().find(|&id| tree.data(id).solved) {
                info!(node = solved, "beam search found a solution");
                return Ok(solved);
            }
        }
    }
}

fn ok_result(tool_use: &ToolUse, content: String) -> ToolUseResult {
    ToolUseResult::from_tool_use(
        tool_use.clone(),
        ToolResult {
            content,
            tool_use_id: tool_use.id.clone(),
            name: Some(tool_use.name.clone()),
            is_error: false,
        },
    )
}

fn err_result(tool_use: &ToolUse, content: String) -> ToolUseResult {
    ToolUseResult::from_tool_use(
        tool_use.clone(),
        ToolResult {
            content,
            tool_use_id: tool_use.id.clone(),
            name: Some(tool_use.name.clone()),
            is_error: true,
        },
    )
}

/// Free function so `execute`'s spawned tasks don't hold a borrow of `self`
/// across the `.await` — only the pieces of `BeamSearchActor` each turn
/// actually needs travel into the task.
async fn run_candidate_turn(
    client: Arc<dyn LlmClient>,
    params: ModelParams,
    max_turns: usize,
    trajectory: Vec<Message>,
    parent_files: HashMap<String, String>,
    workspace: Workspace,
    validator: Arc<dyn ValidatorBattery>,
) -> AgentResult<NodeData> {
    let mut usage = UsageTotals::default();
    let content = completion(client.as_ref(), &trajectory, &params, max_turns, &mut usage)
        .await
        .map_err(|e| ActorError::Llm(e.to_string()))?;

    let assistant_message = Message::assistant(content.clone());
    let text: String = content
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect::<Vec<_>>()
        .join("\n");

    let edits = FileEdit::parse_all(&text);
    let mut files = parent_files;
    let mut edit_errors: Vec<(String, String)> = Vec::new();
    for edit in &edits {
        match apply_edit(&workspace, edit).await {
            Ok((path, written)) => {
                files.insert(path, written);
            }
            Err(err) => edit_errors.push((edit.path().to_string(), err.to_string())),
        }
    }

    let tool_uses: Vec<ToolUse> = content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse(t) => Some(t.clone()),
            _ => None,
        })
        .collect();

    let mut tool_results: Vec<ToolUseResult> = Vec::new();
    let mut validation = None;
    let mut solved = false;

    for tool_use in &tool_uses {
        let result = match tool_use.name.as_str() {
            "read_file" => {
                let path = tool_use.input.get("path").and_then(|v| v.as_str()).unwrap_or_default();
                match workspace.read_file(path).await {
                    Ok(contents) => ok_result(tool_use, contents),
                    Err(err) => err_result(tool_use, err.to_string()),
                }
            }
            "delete_file" => {
                let path = tool_use.input.get("path").and_then(|v| v.as_str()).unwrap_or_default();
                match workspace.rm(path).await {
                    Ok(()) => ok_result(tool_use, format!("deleted {path}")),
                    Err(err) => err_result(tool_use, err.to_string()),
                }
            }
            "complete" => {
                if files.is_empty() {
                    err_result(
                        tool_use,
                        "complete() called with no prior file modification".to_string(),
                    )
                } else {
                    match validator.validate(&workspace).await {
                        Ok(outcome) => {
                            let passed = outcome.passed;
                            let feedback = outcome.feedback.clone();
                            validation = Some(outcome);
                            if passed {
                                solved = true;
                                ok_result(tool_use, "validation passed".to_string())
                            } else {
                                err_result(
                                    tool_use,
                                    feedback.unwrap_or_else(|| "validation failed".to_string()),
                                )
                            }
                        }
                        Err(err) => err_result(tool_use, err.to_string()),
                    }
                }
            }
            other => err_result(tool_use, format!("unknown tool: {other}")),
        };
        tool_results.push(result);
    }

    let mut messages = vec![assistant_message];
    if !solved {
        let mut follow_up: Vec<ContentBlock> = tool_results.into_iter().map(ContentBlock::ToolUseResult).collect();
        for (path, error) in &edit_errors {
            follow_up.push(ContentBlock::ToolUseResult(ToolUseResult::from_tool_use(
                ToolUse {
                    name: "file_edit".to_string(),
                    input: serde_json::json!({ "path": path }),
                    id: None,
                },
                ToolResult {
                    content: error.clone(),
                    tool_use_id: None,
                    name: Some("file_edit".to_string()),
                    is_error: true,
                },
            )));
        }
        if follow_up.is_empty() {
            follow_up.push(ContentBlock::text(
                "No file changes or tool calls were detected. Continue making changes, \
                 or call complete() once the stage is finished.",
            ));
        }
        messages.push(Message {
            role: Role::User,
            content: follow_up,
        });
    }

    Ok(NodeData {
        workspace,
        messages,
        files,
        validation,
        solved,
        should_branch: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_full_file_block() {
        let text = r#"Here is the file:
<file path="src/main.rs">
fn main() {}
</file>
Done."#;
        let edits = FileEdit::parse_all(text);
        assert_eq!(edits.len(), 1);
        match &edits[0] {
            FileEdit::Full { path, content } => {
                assert_eq!(path, "src/main.rs");
                assert_eq!(content, "fn main() {}");
            }
            _ => panic!("expected a full-file edit"),
        }
    }

    #[test]
    fn parses_multiple_file_blocks() {
        let text = r#"<file path="a.ts">a</file><file path="b.ts">b</file>"#;
        let edits = FileEdit::parse_all(text);
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[1].path(), "b.ts");
    }

    #[test]
    fn parses_search_replace_block() {
        let text = "<file path=\"a.ts\">\n<<<<<<< SEARCH\nold\n=======\nnew\n>>>>>>> REPLACE\n</file>";
        let edits = FileEdit::parse_all(text);
        assert_eq!(edits.len(), 1);
        match &edits[0] {
            FileEdit::Patch { path, search, replace } => {
                assert_eq!(path, "a.ts");
                assert_eq!(search, "old");
                assert_eq!(replace, "new");
            }
            _ => panic!("expected a patch edit"),
        }
    }

    #[test]
    fn render_file_context_sorts_paths() {
        let mut files = HashMap::new();
        files.insert("z.ts".to_string(), "zzz".to_string());
        files.insert("a.ts".to_string(), "aaa".to_string());
        let rendered = render_file_context(&files);
        assert!(rendered.find("a.ts").unwrap() < rendered.find("z.ts").unwrap());
    }

    struct FileEditingClient {
        reply: String,
    }

    #[async_trait::async_trait]
    impl LlmClient for FileEditingClient {
        async fn completion_once(
            &self,
            _messages: &[Message],
            _params: &ModelParams,
        ) -> AgentResult<crate::llm::RawCompletion> {
            Ok(crate::llm::RawCompletion {
                content: vec![ContentBlock::text(self.reply.clone())],
                input_tokens: 1,
                output_tokens: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    async fn test_workspace() -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let engine: Arc<dyn crate::workspace::ContainerEngine> =
            Arc::new(crate::workspace::LocalFsEngine::new(dir.keep()));
        Workspace::create(
            engine,
            "scratch",
            None,
            crate::workspace::PathSet::default(),
            crate::workspace::PathSet::default(),
        )
        .await
        .unwrap()
    }

    fn test_params() -> ModelParams {
        ModelParams {
            model: "test".to_string(),
            max_tokens: 256,
            temperature: None,
            stop_sequences: Vec::new(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn a_later_turn_accumulates_files_written_by_an_earlier_one() {
        let client: Arc<dyn LlmClient> = Arc::new(FileEditingClient {
            reply: r#"<file path="a.ts">first</file>"#.to_string(),
        });
        let first = run_candidate_turn(
            Arc::clone(&client),
            test_params(),
            0,
            Vec::new(),
            HashMap::new(),
            test_workspace().await,
            Arc::new(AlwaysPass),
        )
        .await
        .unwrap();
        assert_eq!(first.files.get("a.ts").map(String::as_str), Some("first"));

        let client: Arc<dyn LlmClient> = Arc::new(FileEditingClient {
            reply: r#"<file path="b.ts">second</file>"#.to_string(),
        });
        let second = run_candidate_turn(
            client,
            test_params(),
            0,
            Vec::new(),
            first.files.clone(),
            first.workspace,
            Arc::new(AlwaysPass),
        )
        .await
        .unwrap();

        assert_eq!(second.files.get("a.ts").map(String::as_str), Some("first"));
        assert_eq!(second.files.get("b.ts").map(String::as_str), Some("second"));
    }

    struct AlwaysPass;

    #[async_trait::async_trait]
    impl ValidatorBattery for AlwaysPass {
        async fn validate(&self, _workspace: &Workspace) -> AgentResult<ValidationOutcome> {
            Ok(ValidationOutcome { passed: true, feedback: None })
        }
    }

    #[tokio::test]
    async fn tree_of_node_data_round_trips_through_its_serializable_snapshot() {
        let mut tree = crate::tree::Tree::new(NodeData {
            workspace: test_workspace().await,
            messages: vec![Message::assistant(vec![ContentBlock::text("root turn")])],
            files: HashMap::new(),
            validation: None,
            solved: false,
            should_branch: false,
        });
        let mut child_files = HashMap::new();
        child_files.insert("a.ts".to_string(), "contents".to_string());
        tree.push_child(
            tree.root(),
            NodeData {
                workspace: test_workspace().await,
                messages: vec![Message::assistant(vec![ContentBlock::text("child turn")])],
                files: child_files,
                validation: Some(ValidationOutcome { passed: true, feedback: None }),
                solved: true,
                should_branch: false,
            },
        );

        let snapshot_tree = tree.map(NodeSnapshot::from);
        let dump = snapshot_tree.dump();
        let restored: crate::tree::Tree<NodeSnapshot> = crate::tree::Tree::load(dump).unwrap();

        let child = restored.data(1);
        assert_eq!(child.files.get("a.ts").map(String::as_str), Some("contents"));
        assert!(child.solved);
        assert_eq!(
            restored.trajectory(1).iter().map(|&id| restored.data(id).messages[0].content[0].as_text().unwrap()).collect::<Vec<_>>(),
            vec!["root turn", "child turn"],
        );
    }
}
