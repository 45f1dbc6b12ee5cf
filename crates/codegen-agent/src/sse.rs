//! SSE event stream (§4.H), ported from `agent_session.py`'s
//! `TrpcAgentSession.process()`/`send_event()` and `async_server.py`'s
//! `run_agent()` channel-driven request loop.
//!
//! One call to [`run_session`] drives a [`Session`] through as many
//! automatic `process_step` turns as the tool-call loop produces (a model
//! turn that closes with a `ToolUseResult` follow-up keeps going; one that
//! doesn't is the stream's last word), translating each turn into an
//! [`AgentSseEvent`] and writing it to the bounded channel the HTTP layer
//! reads from. Every event but the last carries `status=running`; the
//! stream closes with exactly one `status=idle` event.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{instrument, warn};

use crate::diff_utils::{compute_diff_stat, unified_diff_between, DiffStatEntry};
use crate::errors::AgentError;
use crate::llm::{completion, LlmClient, ModelParams, UsageTotals};
use crate::message::{ContentBlock, Message, Role};
use crate::session::{Session, SessionRegistry, SessionStatus};
use crate::snapshot::{Phase, SnapshotSaver};

/// `AgentSseEvent.status` — whether more automatic turns follow this event
/// within the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Idle,
}

/// `AgentMessage.kind` — what the event's content represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StageResult,
    ReviewResult,
    RefinementRequest,
    RuntimeError,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMessage {
    pub role: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_stat: Option<Vec<DiffStatEntry>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSseEvent {
    pub status: AgentStatus,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    pub message: AgentMessage,
}

impl AgentSseEvent {
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"idle","traceId":"","message":{"role":"assistant","kind":"runtime_error","content":"event serialization failed"}}"#.to_string()
        })
    }
}

/// A single turn of the client-supplied conversation (`allMessages[i]`).
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// One entry of a client-supplied file snapshot (`allFiles[i]`).
#[derive(Debug, Clone, Deserialize)]
pub struct WireFile {
    pub path: String,
    pub content: String,
}

/// Body of `POST /message`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRequest {
    #[serde(rename = "allMessages")]
    pub all_messages: Vec<WireMessage>,
    #[serde(rename = "applicationId")]
    pub application_id: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "agentState", default)]
    pub agent_state: Option<serde_json::Value>,
    #[serde(rename = "allFiles", default)]
    pub all_files: Option<Vec<WireFile>>,
    #[serde(rename = "templateId", default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

fn wire_to_message(wire: &WireMessage) -> Message {
    let role = if wire.role.eq_ignore_ascii_case("assistant") {
        Role::Assistant
    } else {
        Role::User
    };
    Message {
        role,
        content: vec![ContentBlock::text(wire.content.clone())],
    }
}

static NON_SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\-]+").expect("valid regex"));
static REPEATED_HYPHENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("valid regex"));

/// Fold arbitrary model output into a kebab-case slug: lowercase, anything
/// that isn't `[a-z0-9-]` becomes a hyphen, runs of hyphens collapse, and
/// leading/trailing hyphens are trimmed.
fn slugify(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let hyphenated = NON_SLUG_CHARS.replace_all(&lowered, "-");
    let collapsed = REPEATED_HYPHENS.replace_all(&hyphenated, "-");
    collapsed.trim_matches('-').to_string()
}

/// A cheap, separate completion call naming the application from its
/// prompt. Falls back to a fixed name on any failure — a naming hiccup must
/// never abort the build.
async fn generate_app_name(client: &dyn LlmClient, model: &str, user_prompt: &str) -> String {
    let params = ModelParams {
        model: model.to_string(),
        max_tokens: 32,
        temperature: Some(0.0),
        stop_sequences: Vec::new(),
        tools: Vec::new(),
    };
    let messages = vec![Message::user(format!(
        "Generate a short, kebab-case application name (2-4 words, lowercase, \
         hyphen-separated, no punctuation) for this request. Reply with only the name.\n\n{user_prompt}"
    ))];
    let mut usage = UsageTotals::default();
    match completion(client, &messages, &params, 0, &mut usage).await {
        Ok(content) => {
            let text = content.iter().filter_map(ContentBlock::as_text).collect::<Vec<_>>().join(" ");
            let slug = slugify(&text);
            if slug.is_empty() {
                "generated-application".to_string()
            } else {
                slug
            }
        }
        Err(err) => {
            warn!(%err, "app name generation failed, using fallback");
            "generated-application".to_string()
        }
    }
}

/// A cheap, separate completion call writing a conventional-commit-style
/// summary of the produced diff. Falls back to a fixed message on failure.
async fn generate_commit_message(client: &dyn LlmClient, model: &str, user_prompt: &str) -> String {
    let params = ModelParams {
        model: model.to_string(),
        max_tokens: 64,
        temperature: Some(0.0),
        stop_sequences: Vec::new(),
        tools: Vec::new(),
    };
    let messages = vec![Message::user(format!(
        "Write a one-line conventional commit message summarizing this change. \
         Reply with only the message.\n\n{user_prompt}"
    ))];
    let mut usage = UsageTotals::default();
    match completion(client, &messages, &params, 0, &mut usage).await {
        Ok(content) => {
            let text = content
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            if text.is_empty() {
                "Initial commit".to_string()
            } else {
                text
            }
        }
        Err(err) => {
            warn!(%err, "commit message generation failed, using fallback");
            "Initial commit".to_string()
        }
    }
}

fn event(trace_id: &str, status: AgentStatus, message: AgentMessage) -> AgentSseEvent {
    AgentSseEvent {
        status,
        trace_id: trace_id.to_string(),
        message,
    }
}

fn runtime_error_event(trace_id: &str, err: &AgentError) -> AgentSseEvent {
    event(
        trace_id,
        AgentStatus::Idle,
        AgentMessage {
            role: "assistant".to_string(),
            kind: MessageKind::RuntimeError,
            content: err.to_string(),
            agent_state: None,
            unified_diff: None,
            app_name: None,
            commit_message: None,
            diff_stat: None,
        },
    )
}

/// Drive one `/message` exchange to completion, writing each event to `tx`
/// as it's produced. Never returns an `Err` — a failure becomes a
/// `runtime_error` event, matching the original's "uncaught exception -> one
/// RUNTIME_ERROR event, then stop" rule.
#[instrument(skip(session, request, tx, snapshot_saver))]
pub async fn run_session(
    session: Arc<Mutex<Session>>,
    request: MessageRequest,
    tx: mpsc::Sender<AgentSseEvent>,
    snapshot_saver: Option<Arc<SnapshotSaver>>,
) {
    let trace_id = request.trace_id.clone();
    let had_agent_state = request.agent_state.is_some();
    let all_files: HashMap<String, String> = request
        .all_files
        .unwrap_or_default()
        .into_iter()
        .map(|f| (f.path, f.content))
        .collect();
    let skip_template_event = !had_agent_state && !all_files.is_empty();
    let incoming: Vec<Message> = request.all_messages.iter().map(wire_to_message).collect();

    let mut guard = session.lock().await;

    if !guard.has_started() {
        if let Some(state) = request.agent_state.clone() {
            if let Err(err) = guard.resume_application(state).await {
                let _ = tx.send(runtime_error_event(&trace_id, &err)).await;
                return;
            }
        }
        guard.initialize(&incoming);
    } else if let Some(last) = incoming.last() {
        if last.role == Role::User {
            if let Some(text) = last.content.iter().find_map(ContentBlock::as_text) {
                guard.push_user_turn(text.to_string());
            }
        }
    }

    if let Some(saver) = &snapshot_saver {
        if let Some(checkpoint) = guard.checkpoint() {
            saver.save(&trace_id, Phase::FsmEnter, &checkpoint).await;
        }
    }

    loop {
        if !guard.should_advance().await {
            break;
        }

        let had_fsm_before = guard.has_fsm();
        let step = match guard.process_step().await {
            Ok(step) => step,
            Err(err) => {
                let _ = tx.send(runtime_error_event(&trace_id, &err)).await;
                return;
            }
        };

        if !had_fsm_before && guard.has_fsm() && !skip_template_event && !guard.template_diff_sent() {
            guard.mark_template_diff_sent();
            let prompt = guard.user_prompt().unwrap_or_default();
            let app_name =
                generate_app_name(guard.llm_client().as_ref(), guard.llm_model(), &prompt).await;
            guard.set_app_name(app_name.clone());
            let first_event = event(
                &trace_id,
                AgentStatus::Running,
                AgentMessage {
                    role: "assistant".to_string(),
                    kind: MessageKind::ReviewResult,
                    content: step.content.clone().unwrap_or_default(),
                    agent_state: step.agent_state.clone(),
                    unified_diff: Some(String::new()),
                    app_name: Some(app_name),
                    commit_message: Some("Initial commit".to_string()),
                    diff_stat: Some(Vec::new()),
                },
            );
            if tx.send(first_event).await.is_err() {
                return;
            }
        }

        if guard.is_complete() {
            let produced = guard.all_produced_files();
            let diff = unified_diff_between(&all_files, &produced);
            let diff_stat = compute_diff_stat(&diff);
            let prompt = guard.user_prompt().unwrap_or_default();
            let commit_message =
                generate_commit_message(guard.llm_client().as_ref(), guard.llm_model(), &prompt).await;
            let final_event = event(
                &trace_id,
                AgentStatus::Idle,
                AgentMessage {
                    role: "assistant".to_string(),
                    kind: MessageKind::ReviewResult,
                    content: step.content.unwrap_or_default(),
                    agent_state: step.agent_state,
                    unified_diff: Some(diff),
                    app_name: guard.app_name().map(str::to_string),
                    commit_message: Some(commit_message),
                    diff_stat: Some(diff_stat),
                },
            );
            let _ = tx.send(final_event).await;
            break;
        }

        match step.status {
            SessionStatus::Running => {
                let running_event = event(
                    &trace_id,
                    AgentStatus::Running,
                    AgentMessage {
                        role: "assistant".to_string(),
                        kind: MessageKind::StageResult,
                        content: step.content.unwrap_or_default(),
                        agent_state: step.agent_state,
                        unified_diff: None,
                        app_name: guard.app_name().map(str::to_string),
                        commit_message: None,
                        diff_stat: None,
                    },
                );
                if tx.send(running_event).await.is_err() {
                    return;
                }
            }
            SessionStatus::Idle => {
                let idle_event = event(
                    &trace_id,
                    AgentStatus::Idle,
                    AgentMessage {
                        role: "assistant".to_string(),
                        kind: MessageKind::RefinementRequest,
                        content: step.content.unwrap_or_default(),
                        agent_state: step.agent_state,
                        unified_diff: None,
                        app_name: guard.app_name().map(str::to_string),
                        commit_message: None,
                        diff_stat: None,
                    },
                );
                let _ = tx.send(idle_event).await;
                break;
            }
        }
    }

    if let Some(saver) = &snapshot_saver {
        if let Some(checkpoint) = guard.checkpoint() {
            saver.save(&trace_id, Phase::FsmExit, &checkpoint).await;
        }
    }
}

/// Spawn `run_session` and return the receiving half the HTTP layer streams
/// from. Once the stream ends, asks the registry to forget the session if
/// the request carried no prior `agent_state` and nothing is left to
/// resume — mirroring `SessionManager`'s end-of-request cleanup rule.
pub fn spawn_session_stream(
    session: Arc<Mutex<Session>>,
    registry: Arc<SessionRegistry>,
    request: MessageRequest,
    snapshot_saver: Option<Arc<SnapshotSaver>>,
) -> mpsc::Receiver<AgentSseEvent> {
    let (tx, rx) = mpsc::channel(1);
    let application_id = request.application_id.clone();
    let trace_id = request.trace_id.clone();
    let had_agent_state = request.agent_state.is_some();

    tokio::spawn(async move {
        run_session(Arc::clone(&session), request, tx, snapshot_saver).await;
        let final_state = session.lock().await.snapshot_state();
        registry
            .cleanup_if_empty(&application_id, &trace_id, had_agent_state, &final_state)
            .await;
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RawCompletion;
    use crate::workspace::{ContainerEngine, LocalFsEngine};
    use async_trait::async_trait;

    struct ScriptedClient {
        replies: Mutex<Vec<Vec<ContentBlock>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn completion_once(
            &self,
            _messages: &[Message],
            _params: &ModelParams,
        ) -> crate::errors::AgentResult<RawCompletion> {
            let mut replies = self.replies.lock().await;
            let content = if replies.is_empty() {
                vec![ContentBlock::text("done")]
            } else {
                replies.remove(0)
            };
            Ok(RawCompletion {
                content,
                input_tokens: 1,
                output_tokens: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    fn test_engine() -> Arc<dyn ContainerEngine> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(LocalFsEngine::new(dir.keep()))
    }

    fn test_actor(client: Arc<dyn LlmClient>) -> Arc<crate::beam::BeamSearchActor> {
        Arc::new(crate::beam::BeamSearchActor {
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

    fn request(all_files: Vec<WireFile>) -> MessageRequest {
        MessageRequest {
            all_messages: vec![WireMessage {
                role: "user".to_string(),
                content: "Hello".to_string(),
            }],
            application_id: "app1".to_string(),
            trace_id: "trace1".to_string(),
            agent_state: None,
            all_files: if all_files.is_empty() { None } else { Some(all_files) },
            template_id: None,
            settings: None,
        }
    }

    #[tokio::test]
    async fn plain_conversation_yields_a_single_idle_refinement_request() {
        let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient {
            replies: Mutex::new(vec![vec![ContentBlock::text("Hi there!")]]),
        });
        let session = Arc::new(Mutex::new(Session::new(
            "app1".to_string(),
            "trace1".to_string(),
            Arc::clone(&client),
            "test-model".to_string(),
            test_actor(client),
            test_engine(),
        )));
        let (tx, mut rx) = mpsc::channel(8);
        run_session(session, request(Vec::new()), tx, None).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AgentStatus::Idle);
        assert_eq!(events[0].message.kind, MessageKind::RefinementRequest);
        assert!(events[0].message.unified_diff.is_none());
    }

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("  Todo  App!! "), "todo-app");
        assert_eq!(slugify("Counter---App"), "counter-app");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn event_serializes_with_expected_field_names() {
        let e = event(
            "trace-1",
            AgentStatus::Running,
            AgentMessage {
                role: "assistant".to_string(),
                kind: MessageKind::StageResult,
                content: "working".to_string(),
                agent_state: None,
                unified_diff: None,
                app_name: None,
                commit_message: None,
                diff_stat: None,
            },
        );
        let json = e.to_sse_data();
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"traceId\":\"trace-1\""));
        assert!(json.contains("\"kind\":\"stage_result\""));
        assert!(!json.contains("unified_diff"));
    }
}
