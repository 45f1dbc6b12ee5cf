//! Tool processor & session (§4.G), ported from `async_agent_session.py`.
//!
//! A `Session` owns one `ApplicationFsm`, the beam trees backing each of
//! its four stages, the running message history, and a `work_in_progress`
//! lock preventing concurrent `process_step` calls. `SessionRegistry` is
//! the process-local `"{application_id}:{trace_id}"` map `async_server.py`'s
//! `SessionManager` keeps.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::instrument;

use crate::app_fsm::{build_trpc_agent_root, AppContext, ApplicationFsm, FileBucket, FsmEvent, SeedTree};
use crate::beam::{BeamSearchActor, NodeData};
use crate::errors::{AgentError, AgentResult, HsmError};
use crate::hsm::MachineCheckpoint;
use crate::llm::{completion, LlmClient, ModelParams, UsageTotals};
use crate::message::{ContentBlock, Message, Role, ToolResult, ToolUseResult};
use crate::tools::fsm_control_tools;
use crate::tree::{NodeId, Tree};
use crate::validator::CommandValidator;
use crate::workspace::{ContainerEngine, PathSet, Workspace};

pub const STAGE_GEN_NAMES: [&str; 4] = ["Draft", "Handlers", "Index", "Frontend"];
pub const STAGE_REVIEW_NAMES: [&str; 4] = ["ReviewDraft", "ReviewHandlers", "ReviewIndex", "ReviewFrontend"];
const STAGE_BUCKETS: [FileBucket; 4] =
    [FileBucket::Draft, FileBucket::Server, FileBucket::Server, FileBucket::Frontend];

/// Status reported on each SSE event, mirroring `AgentSseEvent.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Idle,
}

/// One step's output: whether the session is now complete, the text (if
/// any) to surface to the caller, and a snapshot of FSM state for the
/// caller's `agent_state`.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: SessionStatus,
    pub content: Option<String>,
    pub agent_state: Option<serde_json::Value>,
}

fn find_solved(tree: &Tree<NodeData>) -> Option<NodeId> {
    tree.leaves(tree.root()).into_iter().find(|&id| tree.data(id).solved)
}

fn seed_message_for(ctx: &AppContext, bucket: FileBucket) -> Message {
    let files = match bucket {
        FileBucket::Draft => &ctx.draft,
        FileBucket::Server => &ctx.server_files,
        FileBucket::Frontend => &ctx.frontend_files,
    };
    crate::app_fsm::render_stage_prompt(ctx, files)
}

pub struct Session {
    pub application_id: String,
    pub trace_id: String,
    fsm: Option<ApplicationFsm>,
    messages: Vec<Message>,
    llm_client: Arc<dyn LlmClient>,
    llm_model: String,
    actor: Arc<BeamSearchActor>,
    engine: Arc<dyn ContainerEngine>,
    stage_trees: [SeedTree; 4],
    usage: UsageTotals,
    is_complete: bool,
    last_tool_output: Option<serde_json::Value>,
    template_diff_sent: bool,
    app_name: Option<String>,
    pub work_in_progress: Mutex<()>,
}

impl Session {
    pub fn new(
        application_id: String,
        trace_id: String,
        llm_client: Arc<dyn LlmClient>,
        llm_model: String,
        actor: Arc<BeamSearchActor>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            application_id,
            trace_id,
            fsm: None,
            messages: Vec::new(),
            llm_client,
            llm_model,
            actor,
            engine,
            stage_trees: [
                Arc::new(Mutex::new(None)),
                Arc::new(Mutex::new(None)),
                Arc::new(Mutex::new(None)),
                Arc::new(Mutex::new(None)),
            ],
            usage: UsageTotals::default(),
            is_complete: false,
            last_tool_output: None,
            template_diff_sent: false,
            app_name: None,
            work_in_progress: Mutex::new(()),
        }
    }

    pub fn key(application_id: &str, trace_id: &str) -> String {
        format!("{application_id}:{trace_id}")
    }

    /// Seed the conversation with the incoming messages' user-role text,
    /// joined into one app description, mirroring `initialize_fsm`.
    pub fn initialize(&mut self, incoming: &[Message]) {
        let app_description = incoming
            .iter()
            .filter(|m| m.role == Role::User)
            .flat_map(|m| m.content.iter().filter_map(ContentBlock::as_text))
            .collect::<Vec<_>>()
            .join("\n");
        self.messages = vec![Message::user(app_description)];
    }

    /// `{state, context}` read by the SSE layer for `agent_state`.
    pub fn snapshot_state(&self) -> Option<serde_json::Value> {
        let fsm = self.fsm.as_ref()?;
        Some(serde_json::json!({
            "state": fsm.stack_path().last().cloned().unwrap_or_default(),
            "context": serde_json::to_value(fsm.context()).ok()?,
        }))
    }

    /// Don't drive the loop until the last message in the conversation is
    /// from the user.
    pub fn awaiting_user_input(&self) -> bool {
        self.messages
            .last()
            .map(|m| m.role == Role::User)
            .unwrap_or(true)
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Whether this session has ever had anything said to it — distinguishes
    /// a brand-new conversation (seed with [`Session::initialize`]) from one
    /// continuing in-process (append a turn with [`Session::push_user_turn`]).
    pub fn has_started(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Append a new user turn onto an already-running conversation, instead
    /// of replacing the whole history the way [`Session::initialize`] does.
    pub fn push_user_turn(&mut self, text: String) {
        self.messages.push(Message::user(text));
    }

    pub fn has_fsm(&self) -> bool {
        self.fsm.is_some()
    }

    pub fn template_diff_sent(&self) -> bool {
        self.template_diff_sent
    }

    pub fn mark_template_diff_sent(&mut self) {
        self.template_diff_sent = true;
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn set_app_name(&mut self, name: String) {
        self.app_name = Some(name);
    }

    /// The prompt the running application was started from, read by the SSE
    /// layer for the app-name/commit-message generation calls.
    pub fn user_prompt(&self) -> Option<String> {
        self.fsm.as_ref().map(|fsm| fsm.context().user_prompt.clone())
    }

    /// A resumable checkpoint of the FSM, if one is running — fed to the
    /// snapshot saver at `fsm_enter`/`fsm_exit` points.
    pub fn checkpoint(&self) -> Option<MachineCheckpoint<AppContext>> {
        self.fsm.as_ref().map(|fsm| fsm.checkpoint())
    }

    pub fn llm_client(&self) -> Arc<dyn LlmClient> {
        Arc::clone(&self.llm_client)
    }

    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    /// Name of the FSM's current leaf state, read by the SSE layer to pick
    /// an event's `kind`.
    pub fn current_stage_name(&self) -> Option<String> {
        self.fsm.as_ref().map(|fsm| fsm.stack_path().last().cloned().unwrap_or_default())
    }

    /// Every file produced across all stages so far (draft + server +
    /// frontend), read by the SSE layer for the terminal `review_result`
    /// diff base when resuming without a live workspace.
    pub fn all_produced_files(&self) -> HashMap<String, String> {
        let Some(fsm) = self.fsm.as_ref() else {
            return HashMap::new();
        };
        let ctx = fsm.context();
        let mut files = ctx.draft.clone();
        files.extend(ctx.server_files.clone());
        files.extend(ctx.frontend_files.clone());
        files
    }

    /// The most advanced stage's solved workspace diff against the
    /// original template checkpoint — each stage seeds its workspace from
    /// the previous stage's solved snapshot via `clone_scoped`, so the diff
    /// accumulates across stages automatically even though every stage now
    /// works in its own independent copy.
    pub async fn latest_workspace_diff(&self) -> AgentResult<Option<String>> {
        for tree_lock in self.stage_trees.iter().rev() {
            let guard = tree_lock.lock().await;
            if let Some(tree) = guard.as_ref() {
                if let Some(solved) = find_solved(tree) {
                    return Ok(Some(tree.data(solved).workspace.diff().await?));
                }
            }
        }
        Ok(None)
    }

    /// Whether the next `process_step` should run at all: not already
    /// complete, not mid-step, and awaiting the user's turn.
    pub async fn should_advance(&self) -> bool {
        if self.is_complete {
            return false;
        }
        if self.work_in_progress.try_lock().is_err() {
            return false;
        }
        self.awaiting_user_input()
    }

    /// Run one LLM turn against the current message history and fold any
    /// resulting tool call back into the FSM, matching `process_step` ->
    /// `run_with_claude`.
    #[instrument(skip(self))]
    pub async fn process_step(&mut self) -> AgentResult<StepResult> {
        let _guard = self.work_in_progress.lock().await;

        let params = ModelParams {
            model: self.llm_model.clone(),
            max_tokens: 4096,
            temperature: None,
            stop_sequences: Vec::new(),
            tools: fsm_control_tools(),
        };

        let content = completion(self.llm_client.as_ref(), &self.messages, &params, 4, &mut self.usage)
            .await?;
        self.messages.push(Message::assistant(content.clone()));

        let mut final_text = None;
        let mut follow_up: Vec<ContentBlock> = Vec::new();
        self.last_tool_output = None;
        for block in &content {
            match block {
                ContentBlock::Text(t) => final_text = Some(t.text.clone()),
                ContentBlock::ToolUse(tool_use) => {
                    let result = match self.dispatch_tool(tool_use).await {
                        Ok(()) => {
                            let content = self
                                .last_tool_output
                                .take()
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "ok".to_string());
                            ToolResult {
                                content,
                                tool_use_id: tool_use.id.clone(),
                                name: Some(tool_use.name.clone()),
                                is_error: false,
                            }
                        }
                        // An invalid event against the current state stack is
                        // a programming bug in the driving model's tool call
                        // pattern, not a recoverable user-facing condition —
                        // surface it and abort the turn.
                        Err(AgentError::Hsm(HsmError::InvalidEvent { event })) => {
                            return Err(HsmError::InvalidEvent { event }.into());
                        }
                        Err(err) => ToolResult {
                            content: err.to_string(),
                            tool_use_id: tool_use.id.clone(),
                            name: Some(tool_use.name.clone()),
                            is_error: true,
                        },
                    };
                    follow_up.push(ContentBlock::ToolUseResult(ToolUseResult::from_tool_use(
                        tool_use.clone(),
                        result,
                    )));
                }
                _ => {}
            }
        }

        let will_continue = !follow_up.is_empty() && !self.is_complete;
        if !follow_up.is_empty() {
            self.messages.push(Message {
                role: Role::User,
                content: follow_up,
            });
        }

        let status = if will_continue {
            SessionStatus::Running
        } else {
            SessionStatus::Idle
        };
        Ok(StepResult {
            status,
            content: final_text,
            agent_state: self.snapshot_state(),
        })
    }

    async fn fresh_workspace(&self) -> AgentResult<Workspace> {
        Workspace::create(Arc::clone(&self.engine), "trpc_agent_template", None, PathSet::default(), PathSet::default())
            .await
    }

    async fn start_application(&mut self, user_prompt: String) -> AgentResult<()> {
        for tree in &self.stage_trees {
            *tree.lock().await = None;
        }

        let ctx = AppContext {
            user_prompt,
            ..Default::default()
        };
        let validators = [
            Arc::new(CommandValidator::draft()),
            Arc::new(CommandValidator::handlers()),
            Arc::new(CommandValidator::index()),
            Arc::new(CommandValidator::frontend()),
        ];
        let root = build_trpc_agent_root(Arc::clone(&self.actor), validators, self.stage_trees.clone());

        let mut fsm = ApplicationFsm::new(root, ctx);
        let seed = seed_message_for(fsm.context(), FileBucket::Draft);
        let workspace = self.fresh_workspace().await?;
        let mut root_data = NodeData::root(workspace);
        root_data.messages = vec![seed];
        *self.stage_trees[0].lock().await = Some(Tree::new(root_data));

        fsm.start().await?;
        self.fsm = Some(fsm);
        Ok(())
    }

    /// Rebuild the FSM at a previously checkpointed stack path and context,
    /// without re-running `Draft`/`Handlers`/etc. — the `agentState` path
    /// through `/message`. Trees aren't part of the checkpoint, so the
    /// resumed machine has no in-memory beam tree for its current stage;
    /// `confirm_state` falls back to a fresh workspace for the next stage
    /// when it finds none.
    pub async fn resume_application(&mut self, agent_state: serde_json::Value) -> AgentResult<()> {
        let checkpoint: MachineCheckpoint<AppContext> = serde_json::from_value(agent_state)
            .map_err(|e| AgentError::Other(anyhow::anyhow!("invalid agent_state checkpoint: {e}")))?;

        for tree in &self.stage_trees {
            *tree.lock().await = None;
        }
        let validators = [
            Arc::new(CommandValidator::draft()),
            Arc::new(CommandValidator::handlers()),
            Arc::new(CommandValidator::index()),
            Arc::new(CommandValidator::frontend()),
        ];
        let root = build_trpc_agent_root(Arc::clone(&self.actor), validators, self.stage_trees.clone());
        self.fsm = Some(ApplicationFsm::resume(root, checkpoint)?);
        Ok(())
    }

    async fn confirm_state(&mut self) -> AgentResult<()> {
        let fsm = self
            .fsm
            .as_mut()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("no active application")))?;
        let current = fsm.stack_path().last().cloned().unwrap_or_default();
        let stage_idx = STAGE_REVIEW_NAMES
            .iter()
            .position(|&n| n == current)
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("confirm_state called outside a review state")))?;

        // `fsm.context()` already reflects this stage's output — `on_done`
        // folded the solved leaf's files in when the machine entered this
        // Review state (see `app_fsm::build_stage`). All that's left to
        // pull from the tree directly is the solved workspace handle, to
        // seed the next stage's tree. A session resumed from a checkpoint
        // has no in-memory tree for the stage it resumed into (trees
        // aren't part of the checkpoint); fall back to a fresh workspace
        // in that case rather than failing the confirm.
        let solved_workspace = {
            let guard = self.stage_trees[stage_idx].lock().await;
            match guard.as_ref().and_then(|tree| find_solved(tree).map(|solved| (tree, solved))) {
                Some((tree, solved)) => {
                    let data = tree.data(solved);
                    let (protected, allowed) = data.workspace.permissions();
                    Some(data.workspace.clone_scoped(protected.clone(), allowed.clone()).await?)
                }
                None => None,
            }
        };
        let next_workspace = match solved_workspace {
            Some(ws) => ws,
            None => {
                Workspace::create(
                    Arc::clone(&self.engine),
                    "trpc_agent_template",
                    None,
                    PathSet::default(),
                    PathSet::default(),
                )
                .await?
            }
        };

        if stage_idx + 1 < STAGE_GEN_NAMES.len() {
            let seed = seed_message_for(fsm.context(), STAGE_BUCKETS[stage_idx + 1]);
            let mut root_data = NodeData::root(next_workspace);
            root_data.messages = vec![seed];
            *self.stage_trees[stage_idx + 1].lock().await = Some(Tree::new(root_data));
        }

        fsm.send(FsmEvent::Confirm).await
    }

    /// `complete()`'s handler: fast-forward through every remaining review
    /// gate by confirming each stage in turn, rather than waiting for a
    /// `Confirm` event per client round-trip. Stops at the first stage that
    /// isn't a review state (`Complete` or `Failure`), or the first
    /// `confirm_state` failure.
    async fn drive_to_completion(&mut self) -> AgentResult<()> {
        loop {
            let current = self
                .fsm
                .as_ref()
                .and_then(|fsm| fsm.stack_path().last().cloned())
                .unwrap_or_default();
            if !STAGE_REVIEW_NAMES.iter().any(|&n| n == current) {
                break;
            }
            self.confirm_state().await?;
        }
        self.is_complete = true;
        Ok(())
    }

    async fn provide_feedback(&mut self, feedback: String) -> AgentResult<()> {
        let fsm = self
            .fsm
            .as_mut()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("no active application")))?;
        let current = fsm.stack_path().last().cloned().unwrap_or_default();
        let stage_idx = STAGE_REVIEW_NAMES
            .iter()
            .position(|&n| n == current)
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("provide_feedback called outside a review state")))?;

        let retry_workspace = {
            let guard = self.stage_trees[stage_idx].lock().await;
            let tree = guard
                .as_ref()
                .ok_or_else(|| AgentError::Other(anyhow::anyhow!("stage tree missing at review time")))?;
            let solved = find_solved(tree)
                .ok_or_else(|| AgentError::Other(anyhow::anyhow!("review state entered without a solved leaf")))?;
            let data = tree.data(solved);
            let (protected, allowed) = data.workspace.permissions();
            data.workspace.clone_scoped(protected.clone(), allowed.clone()).await?
        };

        fsm.context_mut().feedback_data = Some(feedback);
        let seed = seed_message_for(fsm.context(), STAGE_BUCKETS[stage_idx]);
        let mut root_data = NodeData::root(retry_workspace);
        root_data.messages = vec![seed];
        *self.stage_trees[stage_idx].lock().await = Some(Tree::new(root_data));

        fsm.send(FsmEvent::Feedback).await
    }

    fn get_state_output(&self) -> AgentResult<serde_json::Value> {
        let fsm = self
            .fsm
            .as_ref()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("no active application")))?;
        let current = fsm.stack_path().last().cloned().unwrap_or_default();
        let stage_idx = STAGE_REVIEW_NAMES.iter().position(|&n| n == current);
        let Some(stage_idx) = stage_idx else {
            return Ok(serde_json::json!({ "files": {} }));
        };
        Ok(serde_json::json!({ "stage": STAGE_GEN_NAMES[stage_idx] }))
    }

    async fn dispatch_tool(&mut self, tool_use: &crate::message::ToolUse) -> AgentResult<()> {
        match tool_use.name.as_str() {
            "start_application" => {
                let prompt = tool_use
                    .input
                    .get("user_prompt")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.start_application(prompt).await?;
            }
            "confirm_state" => self.confirm_state().await?,
            "provide_feedback" => {
                let feedback = tool_use
                    .input
                    .get("feedback")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.provide_feedback(feedback).await?;
            }
            "complete" => self.drive_to_completion().await?,
            "get_state" => self.last_tool_output = self.snapshot_state(),
            "get_available_actions" => {
                let actions = self
                    .fsm
                    .as_ref()
                    .map(|fsm| fsm.available_events().iter().map(|e| format!("{e:?}")).collect::<Vec<_>>())
                    .unwrap_or_default();
                self.last_tool_output = Some(serde_json::json!({ "actions": actions }));
            }
            "get_state_output" => self.last_tool_output = Some(self.get_state_output()?),
            other => {
                return Err(AgentError::Other(anyhow::anyhow!("unknown tool: {other}")));
            }
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.fsm = None;
        self.messages.clear();
    }
}

/// Process-local registry of sessions keyed `"{application_id}:{trace_id}"`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_or_create(
        &self,
        application_id: &str,
        trace_id: &str,
        llm_client: Arc<dyn LlmClient>,
        llm_model: &str,
        actor: Arc<BeamSearchActor>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Arc<Mutex<Session>> {
        let key = Session::key(application_id, trace_id);
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(Session::new(
                application_id.to_string(),
                trace_id.to_string(),
                llm_client,
                llm_model.to_string(),
                actor,
                engine,
            )))
        }))
    }

    /// Remove a session when the request carried no prior `agent_state`
    /// and the final tracked state is empty/absent.
    pub async fn cleanup_if_empty(
        &self,
        application_id: &str,
        trace_id: &str,
        request_had_agent_state: bool,
        final_state: &Option<serde_json::Value>,
    ) {
        let should_cleanup = !request_had_agent_state
            && final_state
                .as_ref()
                .map(|v| v.is_null() || v == &serde_json::json!({}))
                .unwrap_or(true);
        if should_cleanup {
            let key = Session::key(application_id, trace_id);
            self.sessions.lock().await.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::LocalFsEngine;
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn completion_once(
            &self,
            _messages: &[Message],
            _params: &ModelParams,
        ) -> AgentResult<crate::llm::RawCompletion> {
            Ok(crate::llm::RawCompletion {
                content: vec![ContentBlock::text("ack")],
                input_tokens: 1,
                output_tokens: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    fn test_actor(client: Arc<dyn LlmClient>) -> Arc<BeamSearchActor> {
        Arc::new(BeamSearchActor {
            client,
            model_params: ModelParams {
                model: "test".to_string(),
                max_tokens: 256,
                temperature: None,
                stop_sequences: Vec::new(),
                tools: Vec::new(),
            },
            beam_width: 1,
            max_continuation_turns: 0,
            max_depth: 1,
        })
    }

    fn test_engine() -> Arc<dyn ContainerEngine> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(LocalFsEngine::new(dir.keep()))
    }

    fn new_session() -> Session {
        let client: Arc<dyn LlmClient> = Arc::new(EchoClient);
        Session::new(
            "app1".into(),
            "trace1".into(),
            Arc::clone(&client),
            "test-model".into(),
            test_actor(client),
            test_engine(),
        )
    }

    #[tokio::test]
    async fn initialize_joins_user_text() {
        let mut session = new_session();
        session.initialize(&[Message::user("build a todo app")]);
        assert!(session.awaiting_user_input());
    }

    #[tokio::test]
    async fn process_step_produces_final_text() {
        let mut session = new_session();
        session.initialize(&[Message::user("build a todo app")]);
        let result = session.process_step().await.unwrap();
        assert_eq!(result.content.as_deref(), Some("ack"));
        // A turn with no tool call closes out the exchange — nothing queues
        // another automatic step, so this is the stream's terminal status.
        assert_eq!(result.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn process_step_with_tool_call_keeps_the_turn_running() {
        struct ToolCallingClient;

        #[async_trait]
        impl LlmClient for ToolCallingClient {
            async fn completion_once(
                &self,
                _messages: &[Message],
                _params: &ModelParams,
            ) -> AgentResult<crate::llm::RawCompletion> {
                Ok(crate::llm::RawCompletion {
                    content: vec![ContentBlock::ToolUse(crate::message::ToolUse {
                        name: "get_state".to_string(),
                        input: serde_json::json!({}),
                        id: Some("call-1".to_string()),
                    })],
                    input_tokens: 1,
                    output_tokens: 1,
                    stop_reason: "end_turn".to_string(),
                })
            }
        }

        let client: Arc<dyn LlmClient> = Arc::new(ToolCallingClient);
        let mut session = Session::new(
            "app1".into(),
            "trace1".into(),
            Arc::clone(&client),
            "test-model".into(),
            test_actor(client),
            test_engine(),
        );
        session.initialize(&[Message::user("build a todo app")]);
        let result = session.process_step().await.unwrap();
        assert_eq!(result.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn exhausted_beam_search_lands_in_failure() {
        let mut session = new_session();
        session.start_application("build a todo app".to_string()).await.unwrap();
        let state = session.fsm.as_ref().unwrap().stack_path().last().cloned();
        assert_eq!(state.as_deref(), Some("Failure"));
    }

    #[tokio::test]
    async fn resume_application_restores_review_stage_and_skips_earlier_stages() {
        let mut session = new_session();
        let checkpoint = MachineCheckpoint {
            stack_path: vec!["ReviewHandlers".to_string()],
            context: AppContext {
                user_prompt: "build a todo app".to_string(),
                server_files: HashMap::from([("server/handlers.ts".to_string(), "export {}".to_string())]),
                ..Default::default()
            },
            actors: Vec::new(),
        };
        session
            .resume_application(serde_json::to_value(&checkpoint).unwrap())
            .await
            .unwrap();
        assert_eq!(session.fsm.as_ref().unwrap().stack_path(), &["ReviewHandlers".to_string()]);

        session.confirm_state().await.unwrap();
        assert!(session.stage_trees[0].lock().await.is_none());
        assert!(session.stage_trees[1].lock().await.is_none());
        assert!(session.stage_trees[2].lock().await.is_some());
    }

    #[tokio::test]
    async fn registry_reuses_session_for_same_key() {
        let registry = SessionRegistry::new();
        let client: Arc<dyn LlmClient> = Arc::new(EchoClient);
        let a = registry
            .get_or_create(
                "app1",
                "trace1",
                Arc::clone(&client),
                "test-model",
                test_actor(Arc::clone(&client)),
                test_engine(),
            )
            .await;
        let b = registry
            .get_or_create("app1", "trace1", client.clone(), "test-model", test_actor(client), test_engine())
            .await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
