//! Local function handlers and the bridge that answers the model's tool calls.

use crate::events::{EventSender, SessionEvent};
use crate::protocol::{FunctionDeclaration, FunctionResponse, ToolCall};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A locally executed function.
///
/// Handlers are synchronous and expected to finish after bounded local work.
/// They run on the blocking pool, never on the session task.
pub trait ToolHandler: Send + Sync {
    fn call(&self, args: &Value) -> Result<Value, String>;
}

/// A closure-based tool handler.
pub struct FnToolHandler<F>
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    handler: F,
}

impl<F> FnToolHandler<F>
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn call(&self, args: &Value) -> Result<Value, String> {
        (self.handler)(args)
    }
}

struct RegisteredTool {
    declaration: FunctionDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// Named handlers plus the declarations advertised in the setup message.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration under the same name replaces the first.
    pub fn register(&mut self, declaration: FunctionDeclaration, handler: impl ToolHandler + 'static) -> &mut Self {
        let name = declaration.name.clone();
        if self.tools.contains_key(&name) {
            warn!("Replacing tool handler '{}'", name);
        }
        self.tools.insert(
            name,
            RegisteredTool {
                declaration,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn register_fn<F>(&mut self, name: &str, description: &str, parameters: Value, handler: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(
            FunctionDeclaration {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
            FnToolHandler::new(handler),
        )
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|tool| tool.handler.clone())
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.values().map(|tool| tool.declaration.clone()).collect()
    }
}

/// Result of one tool call, tagged with the call's id and name.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub outcome: Result<Value, String>,
}

impl ToolResponse {
    pub fn error(id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outcome: Err(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Wire form: `{"result": ...}` on success, `{"error": "..."}` otherwise.
    pub fn into_function_response(self) -> FunctionResponse {
        let response = match self.outcome {
            Ok(value) => json!({ "result": value }),
            Err(message) => json!({ "error": message }),
        };
        FunctionResponse {
            id: self.id,
            name: self.name,
            response,
        }
    }
}

/// What the bridge did with an incoming call.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// The handler is running; its response arrives as
    /// [`SessionEvent::ToolFinished`].
    Running { name: String },
    /// Answer now. Used for calls nothing can handle.
    Immediate(ToolResponse),
    /// A call with this id is already running and will be answered once.
    Duplicate,
}

/// Correlates tool calls with handler runs and their responses.
///
/// Every accepted call produces exactly one response: either through
/// [`ToolCallBridge::complete`], as an immediate error, or from
/// [`ToolCallBridge::drain_pending`] at teardown. Cancelled calls are the
/// exception; the server has withdrawn them.
pub struct ToolCallBridge {
    registry: Arc<ToolRegistry>,
    timeout: Option<Duration>,
    pending: HashMap<String, String>,
}

impl ToolCallBridge {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Option<Duration>) -> Self {
        Self {
            registry,
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn accept(&mut self, call: ToolCall, events: &EventSender) -> Dispatch {
        if call.id.is_empty() {
            warn!("Tool call '{}' has no id", call.name);
            return Dispatch::Immediate(ToolResponse::error(call.id, call.name, "missing call id"));
        }
        if self.pending.contains_key(&call.id) {
            warn!("Duplicate tool call id {}, ignoring", call.id);
            return Dispatch::Duplicate;
        }

        let Some(handler) = self.registry.handler(&call.name) else {
            warn!("Model called unknown tool '{}' (id {})", call.name, call.id);
            return Dispatch::Immediate(ToolResponse::error(
                call.id,
                call.name.clone(),
                format!("unknown tool '{}'", call.name),
            ));
        };

        info!("Executing tool '{}' (id {})", call.name, call.id);
        self.pending.insert(call.id.clone(), call.name.clone());

        let name = call.name.clone();
        let timeout = self.timeout;
        let events = events.clone();
        tokio::spawn(async move {
            let response = execute(handler, call, timeout).await;
            events.send(SessionEvent::ToolFinished(response));
        });

        Dispatch::Running { name }
    }

    /// Claim a finished run. `None` when the call was cancelled or already
    /// answered, in which case the result must be discarded.
    pub fn complete(&mut self, response: ToolResponse) -> Option<ToolResponse> {
        if self.pending.remove(&response.id).is_none() {
            debug!("Discarding result for withdrawn tool call {}", response.id);
            return None;
        }
        Some(response)
    }

    /// Withdraw calls the server cancelled. Returns the `(id, name)` pairs
    /// that were still pending.
    pub fn cancel(&mut self, ids: &[String]) -> Vec<(String, String)> {
        ids.iter()
            .filter_map(|id| self.pending.remove_entry(id))
            .inspect(|(id, name)| info!("Tool call {} ({}) cancelled by server", id, name))
            .collect()
    }

    /// Take every call still in flight, as `(id, name)` sorted by id.
    pub fn drain_pending(&mut self) -> Vec<(String, String)> {
        let mut pending: Vec<_> = self.pending.drain().collect();
        pending.sort();
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Run `handler` for `call` off the async threads, bounded by `timeout`.
pub async fn execute(handler: Arc<dyn ToolHandler>, call: ToolCall, timeout: Option<Duration>) -> ToolResponse {
    let ToolCall { id, name, args } = call;
    let run = tokio::task::spawn_blocking(move || handler.call(&args));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Tool '{}' timed out after {}ms", name, limit.as_millis());
                return ToolResponse::error(id, name, format!("timed out after {}ms", limit.as_millis()));
            }
        },
        None => run.await,
    };

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(format!("handler failed: {}", e)),
    };
    if let Err(message) = &outcome {
        debug!("Tool '{}' returned error: {}", name, message);
    }
    ToolResponse { id, name, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SessionId, SessionInput};
    use tokio::sync::mpsc;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("add", "Add two numbers", json!({"type": "object"}), |args| {
                let a = args["a"].as_i64().ok_or("missing a")?;
                let b = args["b"].as_i64().ok_or("missing b")?;
                Ok(json!(a + b))
            })
            .register_fn("slow", "", json!({"type": "object"}), |_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(Value::Null)
            });
        Arc::new(registry)
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    fn sender() -> (EventSender, mpsc::UnboundedReceiver<SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender::new(SessionId("tools".to_string()), tx), rx)
    }

    async fn finished(rx: &mut mpsc::UnboundedReceiver<SessionInput>) -> ToolResponse {
        match rx.recv().await.unwrap() {
            SessionInput::Session {
                event: SessionEvent::ToolFinished(response),
                ..
            } => response,
            other => panic!("Unexpected input: {:?}", other),
        }
    }

    #[test]
    fn registry_declares_registered_tools() {
        let registry = registry();
        let names: Vec<_> = registry.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add", "slow"]);
        assert!(registry.handler("add").is_some());
        assert!(registry.handler("missing").is_none());
    }

    #[test]
    fn response_wire_shape() {
        let ok = ToolResponse {
            id: "1".to_string(),
            name: "add".to_string(),
            outcome: Ok(json!(3)),
        }
        .into_function_response();
        assert_eq!(ok.response, json!({"result": 3}));

        let err = ToolResponse::error("2", "add", "boom").into_function_response();
        assert_eq!(err.id, "2");
        assert_eq!(err.response, json!({"error": "boom"}));
    }

    #[tokio::test]
    async fn unknown_tool_is_answered_with_error() {
        let (events, _rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), None);

        match bridge.accept(call("c-9", "doSomethingUnknown", json!({})), &events) {
            Dispatch::Immediate(response) => {
                assert_eq!(response.id, "c-9");
                assert_eq!(response.name, "doSomethingUnknown");
                assert!(response.is_error());
            }
            other => panic!("Unexpected dispatch: {:?}", other),
        }
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn known_tool_result_comes_back_with_same_id() {
        let (events, mut rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), None);

        let dispatch = bridge.accept(call("c-1", "add", json!({"a": 2, "b": 3})), &events);
        assert_eq!(dispatch, Dispatch::Running { name: "add".to_string() });
        assert_eq!(bridge.pending_count(), 1);

        let response = bridge.complete(finished(&mut rx).await).unwrap();
        assert_eq!(response.id, "c-1");
        assert_eq!(response.outcome, Ok(json!(5)));
        assert_eq!(bridge.pending_count(), 0);

        // A handler error is still a response for the same call.
        bridge.accept(call("c-2", "add", json!({"a": 1})), &events);
        let response = bridge.complete(finished(&mut rx).await).unwrap();
        assert_eq!(response.id, "c-2");
        assert_eq!(response.outcome, Err("missing b".to_string()));
    }

    #[tokio::test]
    async fn duplicate_id_runs_once() {
        let (events, mut rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), None);

        let first = bridge.accept(call("c-5", "add", json!({"a": 1, "b": 2})), &events);
        assert_eq!(first, Dispatch::Running { name: "add".to_string() });
        assert_eq!(bridge.accept(call("c-5", "add", json!({"a": 1, "b": 2})), &events), Dispatch::Duplicate);
        // An unknown name under a running id must not produce a second answer either.
        assert_eq!(bridge.accept(call("c-5", "nope", Value::Null), &events), Dispatch::Duplicate);
        assert_eq!(bridge.pending_count(), 1);

        assert!(bridge.complete(finished(&mut rx).await).is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "handler ran more than once");

        // Once answered, the id may be reused.
        assert!(matches!(
            bridge.accept(call("c-5", "add", json!({"a": 0, "b": 0})), &events),
            Dispatch::Running { .. }
        ));
    }

    #[tokio::test]
    async fn calls_without_id_are_answered_with_error() {
        let (events, _rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), None);

        for _ in 0..2 {
            match bridge.accept(call("", "add", json!({"a": 1, "b": 1})), &events) {
                Dispatch::Immediate(response) => {
                    assert_eq!(response.name, "add");
                    assert_eq!(response.outcome, Err("missing call id".to_string()));
                }
                other => panic!("Unexpected dispatch: {:?}", other),
            }
        }
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let (events, mut rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), Some(Duration::from_millis(20)));

        bridge.accept(call("c-3", "slow", Value::Null), &events);
        let response = bridge.complete(finished(&mut rx).await).unwrap();
        assert_eq!(response.id, "c-3");
        assert!(response.outcome.unwrap_err().contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_call_result_is_discarded() {
        let (events, mut rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), None);

        bridge.accept(call("c-4", "add", json!({"a": 1, "b": 1})), &events);
        let cancelled = bridge.cancel(&["c-4".to_string(), "never-seen".to_string()]);
        assert_eq!(cancelled, vec![("c-4".to_string(), "add".to_string())]);

        assert!(bridge.complete(finished(&mut rx).await).is_none());
    }

    #[tokio::test]
    async fn drain_returns_calls_in_flight() {
        let (events, _rx) = sender();
        let mut bridge = ToolCallBridge::new(registry(), None);

        bridge.accept(call("b", "slow", Value::Null), &events);
        bridge.accept(call("a", "slow", Value::Null), &events);

        assert_eq!(
            bridge.drain_pending(),
            vec![("a".to_string(), "slow".to_string()), ("b".to_string(), "slow".to_string())]
        );
        assert_eq!(bridge.pending_count(), 0);
    }
}
