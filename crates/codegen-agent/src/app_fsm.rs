//! Concrete application FSM (§4.F): Draft → ReviewDraft → Handlers →
//! ReviewHandlers → Index → ReviewIndex → Frontend → ReviewFrontend →
//! Complete, with a `Failure` terminal reachable from any stage.
//!
//! Grounded on `fullstack/backend_fsm.py`'s `make_fsm_states`: each
//! generative stage runs the beam search to a validated solution (the
//! `eval_backend`/`eval_backend_handlers`/`eval_backend_index` gate loop
//! now lives inside `BeamSearchActor::search` itself), then parks in a
//! Review state awaiting the client's `CONFIRM` or `FEEDBACK` event. Only
//! the trpc_agent template's graph is wired concretely; other templates
//! reuse the same `build_stage` helper with different gate batteries, so
//! adding one is new wiring, not new machinery.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::beam::{render_file_context, BeamSearchActor, NodeData, ValidatorBattery};
use crate::hsm::{Action, DoneAction, Hsm, Invoke, StateNode};
use crate::message::Message;
use crate::tree::Tree;

/// Events the tool processor drives the machine with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmEvent {
    Confirm,
    Feedback,
}

/// Context threaded through every stage, matching §3 `ApplicationContext`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppContext {
    pub user_prompt: String,
    pub feedback_data: Option<String>,
    pub feedback_component: Option<String>,
    pub server_files: HashMap<String, String>,
    pub frontend_files: HashMap<String, String>,
    pub draft: HashMap<String, String>,
    pub error: Option<String>,
}

/// Which context bucket a stage's solved files belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileBucket {
    Draft,
    Server,
    Frontend,
}

/// A stage's identity within the graph.
pub struct StageSpec {
    pub gen_name: &'static str,
    pub review_name: &'static str,
    /// Target entered on `Confirm` — the next stage's gen state, or
    /// `"Complete"` for the last stage.
    pub next_on_confirm: &'static str,
    pub bucket: FileBucket,
}

/// The beam tree a stage's `Gen` state drives. The session/HTTP layer
/// seeds this with a freshly cloned workspace (`NodeData::root(workspace)`)
/// before transitioning into the state; the invoke errors with "beam tree
/// not seeded" otherwise.
pub type SeedTree = Arc<tokio::sync::Mutex<Option<Tree<NodeData>>>>;

/// Wires a `Gen -> Review` pair into `parent`. `Gen`'s invoke runs the beam
/// search to completion (internally looping generate/validate until a
/// solution or `NoSolutions`), then folds the solved leaf's files straight
/// into `AppContext`'s matching bucket via `on_done` — so by the time the
/// machine parks in `Review`, `AppContext` already reflects the stage's
/// output and a checkpoint taken there is a complete, resumable snapshot.
/// `Session` still reaches into the seed tree itself for one thing this
/// can't carry: the solved node's `Workspace` handle (not serializable,
/// so it can't ride in the invoke's settled value) that seeds the next
/// stage's tree.
pub fn build_stage<V: ValidatorBattery + 'static>(
    parent: &mut StateNode<AppContext, FsmEvent>,
    spec: StageSpec,
    actor: Arc<BeamSearchActor>,
    validator: Arc<V>,
    seed_tree: SeedTree,
) {
    let mut gen_state = StateNode::default();
    {
        let validator: Arc<dyn ValidatorBattery> = validator;
        let review_target = spec.review_name.to_string();
        let bucket = spec.bucket;
        gen_state.invoke = Some(Invoke {
            run: Arc::new(move |_ctx: &AppContext| {
                let actor = Arc::clone(&actor);
                let validator = Arc::clone(&validator);
                let seed_tree = Arc::clone(&seed_tree);
                Box::pin(async move {
                    let mut guard = seed_tree.lock().await;
                    let tree = guard.as_mut().ok_or_else(|| "beam tree not seeded".to_string())?;
                    let solved = actor.search(tree, validator).await.map_err(|e| e.to_string())?;
                    let files = tree.data(solved).files.clone();
                    Ok(serde_json::json!({ "files": files }))
                })
            }),
            on_done: Some((review_target, vec![merge_files(bucket), clear_error()])),
            on_error: Some(("Failure".to_string(), vec![record_error()])),
        });
    }

    let mut review_state = StateNode::default();
    review_state.on.insert(FsmEvent::Confirm, spec.next_on_confirm.to_string());
    review_state.on.insert(FsmEvent::Feedback, spec.gen_name.to_string());
    // Leaving Review on Feedback re-enters Gen; its entry clears the
    // feedback text so it isn't replayed on the following Confirm.
    review_state.exit.push(Arc::new(|ctx: &mut AppContext| {
        ctx.feedback_data = None;
        ctx.feedback_component = None;
    }));

    parent.states.insert(spec.gen_name.to_string(), gen_state);
    parent.states.insert(spec.review_name.to_string(), review_state);
}

/// Deserialize the invoke's `{"files": {...}}` settled value and extend the
/// bucket the stage writes to.
fn merge_files(bucket: FileBucket) -> DoneAction<AppContext> {
    Arc::new(move |ctx: &mut AppContext, value: &serde_json::Value| {
        let files: HashMap<String, String> = value
            .get("files")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        match bucket {
            FileBucket::Draft => ctx.draft.extend(files),
            FileBucket::Server => ctx.server_files.extend(files),
            FileBucket::Frontend => ctx.frontend_files.extend(files),
        }
    })
}

fn clear_error() -> Action<AppContext> {
    Arc::new(|ctx: &mut AppContext| ctx.error = None)
}

fn record_error() -> Action<AppContext> {
    Arc::new(|ctx: &mut AppContext| ctx.error = Some("beam search exhausted its candidate pool".to_string()))
}

/// Render the standard "project context + user prompt (+ feedback)"
/// body used by every stage's generation prompt.
pub fn render_stage_prompt(ctx: &AppContext, files: &HashMap<String, String>) -> Message {
    let mut body = String::new();
    if !files.is_empty() {
        body.push_str(&render_file_context(files));
        body.push('\n');
    }
    body.push_str(&ctx.user_prompt);
    if let Some(feedback) = &ctx.feedback_data {
        body.push_str("\n\nReviewer feedback");
        if let Some(component) = &ctx.feedback_component {
            body.push_str(&format!(" on {component}"));
        }
        body.push_str(&format!(": {feedback}"));
    }
    Message::user(body)
}

/// Build the concrete `trpc_agent` Draft→Handlers→Index→Frontend→Complete
/// graph. Each stage reuses [`build_stage`] with its own gate battery.
pub fn build_trpc_agent_root<V: ValidatorBattery + 'static>(
    actor: Arc<BeamSearchActor>,
    validators: [Arc<V>; 4],
    seed_trees: [SeedTree; 4],
) -> StateNode<AppContext, FsmEvent> {
    let [draft_validator, handlers_validator, index_validator, frontend_validator] = validators;
    let [draft_tree, handlers_tree, index_tree, frontend_tree] = seed_trees;
    let mut root = StateNode::default();

    build_stage(
        &mut root,
        StageSpec {
            gen_name: "Draft",
            review_name: "ReviewDraft",
            next_on_confirm: "Handlers",
            bucket: FileBucket::Draft,
        },
        Arc::clone(&actor),
        draft_validator,
        draft_tree,
    );
    build_stage(
        &mut root,
        StageSpec {
            gen_name: "Handlers",
            review_name: "ReviewHandlers",
            next_on_confirm: "Index",
            bucket: FileBucket::Server,
        },
        Arc::clone(&actor),
        handlers_validator,
        handlers_tree,
    );
    build_stage(
        &mut root,
        StageSpec {
            gen_name: "Index",
            review_name: "ReviewIndex",
            next_on_confirm: "Frontend",
            bucket: FileBucket::Server,
        },
        Arc::clone(&actor),
        index_validator,
        index_tree,
    );
    build_stage(
        &mut root,
        StageSpec {
            gen_name: "Frontend",
            review_name: "ReviewFrontend",
            next_on_confirm: "Complete",
            bucket: FileBucket::Frontend,
        },
        actor,
        frontend_validator,
        frontend_tree,
    );

    root.states.insert("Complete".to_string(), StateNode::default());
    root.states.insert("Failure".to_string(), StateNode::default());
    root.initial = Some("Draft".to_string());

    root
}

pub type ApplicationFsm = Hsm<AppContext, FsmEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_stage_prompt_includes_prior_files_and_user_prompt() {
        let ctx = AppContext {
            user_prompt: "build a todo app".to_string(),
            ..Default::default()
        };
        let mut files = HashMap::new();
        files.insert("schema.ts".to_string(), "export const x = 1;".to_string());

        let message = render_stage_prompt(&ctx, &files);
        let text = message.content[0].as_text().unwrap();
        assert!(text.contains("schema.ts"));
        assert!(text.contains("build a todo app"));
    }

    #[test]
    fn render_stage_prompt_appends_feedback() {
        let ctx = AppContext {
            user_prompt: "build a todo app".to_string(),
            feedback_data: Some("use snake_case columns".to_string()),
            feedback_component: Some("schema".to_string()),
            ..Default::default()
        };
        let message = render_stage_prompt(&ctx, &HashMap::new());
        let text = message.content[0].as_text().unwrap();
        assert!(text.contains("Reviewer feedback on schema"));
        assert!(text.contains("use snake_case columns"));
    }
}
