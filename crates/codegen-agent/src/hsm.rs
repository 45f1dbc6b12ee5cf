//! Generic hierarchical state machine (§4.E).
//!
//! Ported from `agent/core/statemachine.py`: a tree of named states, each
//! with `entry`/`exit`/`invoke`/`on`/`always` actions. `send(event)`
//! searches the current state stack from the leaf upward for a matching
//! `on` handler; `_transition` pops the stack until a common ancestor
//! holds the target state, running `exit` on each popped level and
//! `entry`/`invoke`/`always` on each pushed one. Two isomorphic Python
//! originals (`core/statemachine.py`'s Protocol-based version and
//! `fullstack/statemachine.py`'s TypedDict version) collapse into this one
//! generic type.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::{AgentResult, HsmError};

pub type Action<C> = Arc<dyn Fn(&mut C) + Send + Sync>;
pub type Guard<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;
pub type InvokeFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>;
pub type InvokeFn<C> = Arc<dyn Fn(&C) -> InvokeFuture + Send + Sync>;
/// Like [`Action`], but run with the invoke's settled `Ok` value at hand —
/// lets `on_done` actions fold the result of the async step into context
/// without a second round trip through the invoked actor.
pub type DoneAction<C> = Arc<dyn Fn(&mut C, &serde_json::Value) + Send + Sync>;

/// A guarded, unconditional-or-conditional transition evaluated right
/// after a state is entered (and after its invoke settles).
pub struct AlwaysRule<C> {
    pub guard: Option<Guard<C>>,
    pub target: String,
    pub actions: Vec<Action<C>>,
}

/// An async actor invocation bound to a state. `on_done`/`on_error` name
/// the transition to queue once the future settles; `on_done`'s actions
/// additionally receive the settled `Ok` value so the result of the async
/// step can be folded into context directly.
pub struct Invoke<C> {
    pub run: InvokeFn<C>,
    pub on_done: Option<(String, Vec<DoneAction<C>>)>,
    pub on_error: Option<(String, Vec<Action<C>>)>,
}

/// One node in the state tree.
pub struct StateNode<C, E: Eq + Hash> {
    pub entry: Vec<Action<C>>,
    pub exit: Vec<Action<C>>,
    pub on: HashMap<E, String>,
    pub always: Vec<AlwaysRule<C>>,
    pub invoke: Option<Invoke<C>>,
    pub states: HashMap<String, StateNode<C, E>>,
    pub initial: Option<String>,
}

impl<C, E: Eq + Hash> Default for StateNode<C, E> {
    fn default() -> Self {
        Self {
            entry: Vec::new(),
            exit: Vec::new(),
            on: HashMap::new(),
            always: Vec::new(),
            invoke: None,
            states: HashMap::new(),
            initial: None,
        }
    }
}

/// In-flight actor state recorded alongside a checkpoint: the state path the
/// actor is invoked from, and whatever data it chose to dump. `Hsm::invoke`
/// runs to completion before a checkpoint can observe it, so `checkpoint()`
/// always records this empty; the field exists so the on-disk shape has
/// room for actors that outlive a single transition once one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorDump {
    pub path: Vec<String>,
    pub data: serde_json::Value,
}

/// A checkpoint of everything needed to resume an `Hsm`: the stack path,
/// the serialized context, and any actor data recorded by `dump()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineCheckpoint<C> {
    pub stack_path: Vec<String>,
    pub context: C,
    pub actors: Vec<ActorDump>,
}

pub struct Hsm<C, E: Eq + Hash + Clone> {
    root: StateNode<C, E>,
    context: C,
    stack: Vec<String>,
    queued: Option<String>,
}

impl<C, E: Eq + Hash + Clone + std::fmt::Debug> Hsm<C, E> {
    pub fn new(root: StateNode<C, E>, context: C) -> Self {
        let mut machine = Self {
            root,
            context,
            stack: Vec::new(),
            queued: None,
        };
        let initial = machine.root.initial.clone();
        if let Some(initial) = initial {
            machine.queued = Some(initial);
        }
        machine
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Names of every state on the path from root to the current leaf.
    pub fn stack_path(&self) -> &[String] {
        &self.stack
    }

    fn node_at(&self, path: &[String]) -> &StateNode<C, E> {
        let mut node = &self.root;
        for name in path {
            node = node
                .states
                .get(name)
                .unwrap_or_else(|| panic!("invalid state in stack path: {name}"));
        }
        node
    }

    /// Find an `on` handler for `event`, searching the stack leaf-first.
    fn find_handler(&self, event: &E) -> Option<String> {
        for depth in (0..=self.stack.len()).rev() {
            let node = self.node_at(&self.stack[..depth]);
            if let Some(target) = node.on.get(event) {
                return Some(target.clone());
            }
        }
        None
    }

    /// Queue a transition for `event`, then run it and any further
    /// `always`-triggered transitions it produces.
    #[instrument(skip(self), fields(?event))]
    pub async fn send(&mut self, event: E) -> AgentResult<()> {
        let target = self.find_handler(&event).ok_or_else(|| HsmError::InvalidEvent {
            event: format!("{event:?}"),
        })?;
        self.queued = Some(target);
        self.process_transitions().await
    }

    async fn process_transitions(&mut self) -> AgentResult<()> {
        while let Some(target) = self.queued.take() {
            self.transition(&target).await?;
        }
        Ok(())
    }

    /// Pop the stack until a common ancestor holds `target`, run exit
    /// actions on every popped level (leaf to root order), push `target`,
    /// then run entry, invoke, and always on it.
    async fn transition(&mut self, target: &str) -> AgentResult<()> {
        let mut probe = self.stack.clone();
        loop {
            if self.node_at(&probe).states.contains_key(target) {
                break;
            }
            if probe.is_empty() {
                return Err(HsmError::InvalidTransition(target.to_string()).into());
            }
            probe.pop();
        }

        let saved_stack = self.stack.clone();
        while self.stack.len() > probe.len() {
            let name = self.stack.pop().expect("stack non-empty in loop guard");
            let mut popped_path = self.stack.clone();
            popped_path.push(name);
            let exit_actions: Vec<Action<C>> = self.node_at(&popped_path).exit.clone_actions();
            for action in &exit_actions {
                action(&mut self.context);
            }
        }

        self.stack.push(target.to_string());
        debug!(stack = ?self.stack, "transitioned");

        if let Err(err) = self.enter_current().await {
            self.stack = saved_stack;
            return Err(err);
        }
        Ok(())
    }

    async fn enter_current(&mut self) -> AgentResult<()> {
        let path = self.stack.clone();
        let entry_actions: Vec<Action<C>> = self.node_at(&path).entry.clone_actions();
        for action in &entry_actions {
            action(&mut self.context);
        }

        self.run_invoke().await?;
        self.run_always();

        // Descend into the child's own initial substate, if it declares one.
        let initial = self.node_at(&self.stack.clone()).initial.clone();
        if let Some(initial) = initial {
            self.queued = Some(initial);
        }
        Ok(())
    }

    async fn run_invoke(&mut self) -> AgentResult<()> {
        let path = self.stack.clone();
        let (run, on_done, on_error) = match &self.node_at(&path).invoke {
            Some(invoke) => (
                Arc::clone(&invoke.run),
                invoke.on_done.as_ref().map(|(t, a)| (t.clone(), a.clone())),
                invoke.on_error.as_ref().map(|(t, a)| (t.clone(), a.clone())),
            ),
            None => return Ok(()),
        };

        match run(&self.context).await {
            Ok(value) => {
                if let Some((target, actions)) = on_done {
                    for action in &actions {
                        action(&mut self.context, &value);
                    }
                    self.queued = Some(target);
                }
            }
            Err(err) => {
                warn!(%err, "invoke failed");
                match on_error {
                    Some((target, actions)) => {
                        for action in &actions {
                            action(&mut self.context);
                        }
                        self.queued = Some(target);
                    }
                    None => return Err(HsmError::ActorFailed(Box::new(
                        crate::errors::ActorError::Llm(err),
                    ))
                    .into()),
                }
            }
        }
        Ok(())
    }

    fn run_always(&mut self) {
        let path = self.stack.clone();
        let node = self.node_at(&path);
        for rule in &node.always {
            let passes = rule.guard.as_ref().map_or(true, |g| g(&self.context));
            if passes {
                for action in &rule.actions {
                    action(&mut self.context);
                }
                self.queued = Some(rule.target.clone());
                return;
            }
        }
    }

    /// Process the initial transition queued by `new`, entering the root's
    /// declared initial state (and any of its descendants' initials in
    /// turn). Must be called once before the first `send`.
    pub async fn start(&mut self) -> AgentResult<()> {
        self.process_transitions().await
    }

    /// Event names the current stack's `on` handlers will currently
    /// accept, leaf to root, read by `get_available_actions`.
    pub fn available_events(&self) -> Vec<E> {
        let mut out = Vec::new();
        for depth in (0..=self.stack.len()).rev() {
            let node = self.node_at(&self.stack[..depth]);
            out.extend(node.on.keys().cloned());
        }
        out
    }

    pub fn is_terminal(&self, terminal_names: &[&str]) -> bool {
        self.stack
            .last()
            .is_some_and(|name| terminal_names.contains(&name.as_str()))
    }
}

impl<C: Clone + Serialize + for<'de> Deserialize<'de>, E: Eq + Hash + Clone + std::fmt::Debug>
    Hsm<C, E>
{
    /// Snapshot the stack path and context for later `resume`.
    pub fn checkpoint(&self) -> MachineCheckpoint<C> {
        MachineCheckpoint {
            stack_path: self.stack.clone(),
            context: self.context.clone(),
            actors: Vec::new(),
        }
    }

    /// Rebuild a machine at the checkpoint's stack path without re-running
    /// any entry/invoke actions (a resume, not a replay).
    pub fn resume(root: StateNode<C, E>, checkpoint: MachineCheckpoint<C>) -> AgentResult<Self> {
        let machine = Self {
            root,
            context: checkpoint.context,
            stack: Vec::new(),
            queued: None,
        };
        // Validate the path resolves before accepting it.
        let mut node = &machine.root;
        for name in &checkpoint.stack_path {
            node = node
                .states
                .get(name)
                .ok_or_else(|| HsmError::InvalidTransition(name.clone()))?;
        }
        let _ = node;
        Ok(Self {
            stack: checkpoint.stack_path,
            ..machine
        })
    }
}

trait CloneActions<C> {
    fn clone_actions(&self) -> Vec<Action<C>>;
}

impl<C> CloneActions<C> for Vec<Action<C>> {
    fn clone_actions(&self) -> Vec<Action<C>> {
        self.iter().map(Arc::clone).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Ev {
        Go,
        Back,
    }

    #[derive(Clone, Default)]
    struct Ctx {
        entered_b: Arc<AtomicU32>,
    }

    fn leaf() -> StateNode<Ctx, Ev> {
        StateNode::default()
    }

    #[tokio::test]
    async fn basic_transition_runs_entry_and_updates_stack() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = Arc::clone(&counter);

        let mut b = leaf();
        b.entry.push(Arc::new(move |_ctx: &mut Ctx| {
            counter2.fetch_add(1, Ordering::SeqCst);
        }));

        let mut a = leaf();
        a.on.insert(Ev::Go, "b".to_string());
        a.states.insert("b".to_string(), b);

        let mut root = leaf();
        root.initial = Some("a".to_string());
        root.states.insert("a".to_string(), a);

        let mut machine = Hsm::new(root, Ctx { entered_b: Arc::clone(&counter) });
        machine.start().await.unwrap();
        assert_eq!(machine.stack_path(), &["a".to_string()]);

        machine.send(Ev::Go).await.unwrap();
        assert_eq!(machine.stack_path(), &["b".to_string()]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhandled_event_is_an_error() {
        let mut root = leaf();
        root.initial = Some("a".to_string());
        root.states.insert("a".to_string(), leaf());
        let mut machine = Hsm::new(root, Ctx::default());
        machine.start().await.unwrap();

        let err = machine.send(Ev::Back).await.unwrap_err();
        assert!(matches!(
            err,
            crate::errors::AgentError::Hsm(HsmError::InvalidEvent { .. })
        ));
    }
}
