//! Progress reporting from the agent loop
//!
//! Callbacks run synchronously on the task executing
//! [`Agent::process_message`](crate::Agent::process_message). A slow
//! callback stalls the loop, so hand work off to a channel if rendering is
//! expensive.

use parking_lot::Mutex;
use std::sync::Arc;

/// Receives loop progress. Every method has a no-op default.
pub trait AgentCallback: Send + Sync {
    /// A model call is about to start (`turn` is 1-based)
    fn on_turn_start(&self, _turn: u32, _max_turns: u32) {}

    /// The model is working and nothing visible has arrived yet
    fn on_thinking(&self) {}

    /// First visible output of the turn is about to be reported
    fn on_thinking_done(&self) {}

    /// The model used a tool of its own (subprocess mode) or announced one
    fn on_tool_use(&self, _name: &str, _detail: &str) {}

    /// Assistant text with script directives removed
    fn on_text(&self, _text: &str) {}

    /// A script is about to run
    fn on_script_code(&self, _code: &str) {}

    /// A script finished successfully
    fn on_script_output(&self, _output: &str) {}

    /// Something failed; also used for failing scripts
    fn on_error(&self, _message: &str) {}

    /// The request finished; `cost` is `None` when unknown
    fn on_result(&self, _turns: u32, _cost: Option<f64>) {}
}

impl<T: AgentCallback + ?Sized> AgentCallback for Arc<T> {
    fn on_turn_start(&self, turn: u32, max_turns: u32) {
        (**self).on_turn_start(turn, max_turns)
    }

    fn on_thinking(&self) {
        (**self).on_thinking()
    }

    fn on_thinking_done(&self) {
        (**self).on_thinking_done()
    }

    fn on_tool_use(&self, name: &str, detail: &str) {
        (**self).on_tool_use(name, detail)
    }

    fn on_text(&self, text: &str) {
        (**self).on_text(text)
    }

    fn on_script_code(&self, code: &str) {
        (**self).on_script_code(code)
    }

    fn on_script_output(&self, output: &str) {
        (**self).on_script_output(output)
    }

    fn on_error(&self, message: &str) {
        (**self).on_error(message)
    }

    fn on_result(&self, turns: u32, cost: Option<f64>) {
        (**self).on_result(turns, cost)
    }
}

/// Ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCallback;

impl AgentCallback for NullCallback {}

/// One recorded callback invocation
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    TurnStart { turn: u32, max_turns: u32 },
    Thinking,
    ThinkingDone,
    ToolUse { name: String, detail: String },
    Text(String),
    ScriptCode(String),
    ScriptOutput(String),
    Error(String),
    Result { turns: u32, cost: Option<f64> },
}

/// Records every callback in order; handy for tests and batch callers
#[derive(Debug, Default)]
pub struct CollectingCallback {
    events: Mutex<Vec<CallbackEvent>>,
}

impl CollectingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    /// All `on_text` chunks concatenated
    pub fn text(&self) -> String {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: CallbackEvent) {
        self.events.lock().push(event);
    }
}

impl AgentCallback for CollectingCallback {
    fn on_turn_start(&self, turn: u32, max_turns: u32) {
        self.push(CallbackEvent::TurnStart { turn, max_turns });
    }

    fn on_thinking(&self) {
        self.push(CallbackEvent::Thinking);
    }

    fn on_thinking_done(&self) {
        self.push(CallbackEvent::ThinkingDone);
    }

    fn on_tool_use(&self, name: &str, detail: &str) {
        self.push(CallbackEvent::ToolUse {
            name: name.to_string(),
            detail: detail.to_string(),
        });
    }

    fn on_text(&self, text: &str) {
        self.push(CallbackEvent::Text(text.to_string()));
    }

    fn on_script_code(&self, code: &str) {
        self.push(CallbackEvent::ScriptCode(code.to_string()));
    }

    fn on_script_output(&self, output: &str) {
        self.push(CallbackEvent::ScriptOutput(output.to_string()));
    }

    fn on_error(&self, message: &str) {
        self.push(CallbackEvent::Error(message.to_string()));
    }

    fn on_result(&self, turns: u32, cost: Option<f64>) {
        self.push(CallbackEvent::Result { turns, cost });
    }
}
