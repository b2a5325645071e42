//! The agent loop: model call, directive scan, script run, feedback
//!
//! [`Agent`] owns one [`Transport`], the running conversation and an optional
//! [`HistorySink`]. A call to [`Agent::process_message`] runs up to
//! `max_turns` model calls:
//!
//! ```text
//! user text ──► run_turn ──► scan for <run>..</run>
//!                  ▲               │ none: done
//!                  │               ▼
//!                  └── feedback ◄── execute each script in order
//! ```
//!
//! # Cancellation
//!
//! [`Agent::request_cancel`] (or an [`AgentHandle`] held by another task)
//! sets a shared [`Interrupt`]. The flag is checked before each turn, before
//! each script, and inside the transport's read loop. Once set it stays set
//! until `process_message` returns, and the call reports
//! [`Outcome::Cancelled`] rather than an error. A cancel requested before the
//! call starts makes it return without touching the transport.
//!
//! # Example
//!
//! ```rust,no_run
//! use script_agent::{Agent, AgentOptions, NullCallback, ScriptResult};
//!
//! # async fn example() -> script_agent::Result<()> {
//! let options = AgentOptions::builder()
//!     .system_prompt("Wrap code to run in <run></run>.")
//!     .build()?;
//!
//! let executor = |code: &str| ScriptResult::success(format!("ran {} bytes", code.len()));
//! let mut agent = Agent::new(options, NullCallback, executor)?;
//! agent.connect(None).await?;
//!
//! let result = agent.process_message("What is 2 + 2?").await;
//! println!("{} ({} turns)", result.response, result.turns_used);
//! # Ok(())
//! # }
//! ```

use crate::callback::AgentCallback;
use crate::config::{AgentOptions, Credentials, load_system_prompt};
use crate::directive::{DirectiveScanner, format_feedback};
use crate::error::{Error, Result};
use crate::executor::{ScriptExecutor, timed_execute};
use crate::history::HistorySink;
use crate::identity::CredentialSources;
use crate::interrupt::Interrupt;
use crate::network::ApiClient;
use crate::subprocess::{CliTransport, find_cli, is_executable};
use crate::transport::{Transport, TransportKind, TurnEvent, TurnRequest};
use crate::types::{ContentBlock, Message, TokenUsage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info, warn};

/// Lifecycle of an [`Agent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Idle = 2,
    Processing = 3,
    /// The last request was cancelled; the agent accepts new requests
    Cancelled = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Idle,
            3 => SessionState::Processing,
            4 => SessionState::Cancelled,
            _ => SessionState::Disconnected,
        }
    }
}

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error(String),
    Cancelled,
}

/// What [`Agent::process_message`] hands back
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    /// Marker-stripped text of every assistant turn, separated by blank lines
    pub response: String,
    /// Model calls started, including one that failed or was cancelled
    pub turns_used: u32,
    /// Session spend so far in USD, if the transport can tell
    pub cost: Option<f64>,
    pub outcome: Outcome,
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == Outcome::Cancelled
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Cancels and observes an [`Agent`] from another task
#[derive(Debug, Clone)]
pub struct AgentHandle {
    interrupt: Interrupt,
    state: Arc<AtomicU8>,
}

impl AgentHandle {
    pub fn request_cancel(&self) {
        self.interrupt.trigger();
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Conversation engine that runs model-requested scripts
///
/// The agent is driven from one task at a time; `process_message` takes
/// `&mut self`. Use [`Agent::handle`] to cancel or watch it from elsewhere.
pub struct Agent {
    /// Immutable apart from the system prompt
    options: AgentOptions,

    scanner: DirectiveScanner,

    callback: Arc<dyn AgentCallback>,

    executor: Arc<dyn ScriptExecutor>,

    /// Optional append-only log; failures here never stop the loop
    history: Option<Box<dyn HistorySink>>,

    /// Consulted by `connect` when credentials defer to the ambient identity
    sources: Arc<CredentialSources>,

    /// Chosen once per connect; `None` while disconnected
    transport: Option<Box<dyn Transport>>,

    /// Every message exchanged this session. The network transport replays
    /// it each turn; the subprocess transport only sends the newest input.
    conversation: Vec<Message>,

    /// Shared with the transport and every [`AgentHandle`]
    interrupt: Interrupt,

    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("options", &self.options)
            .field("transport", &self.transport.as_ref().map(|t| t.kind()))
            .field("messages", &self.conversation.len())
            .field("history", &self.history.is_some())
            .field("state", &self.state())
            .finish()
    }
}

impl Agent {
    /// Creates a disconnected agent. Fails if the directive markers in
    /// `options` are unusable.
    pub fn new<C, E>(options: AgentOptions, callback: C, executor: E) -> Result<Self>
    where
        C: AgentCallback + 'static,
        E: ScriptExecutor + 'static,
    {
        let scanner = DirectiveScanner::new(options.markers.clone())?;
        Ok(Self {
            options,
            scanner,
            callback: Arc::new(callback),
            executor: Arc::new(executor),
            history: None,
            sources: Arc::new(CredentialSources::system()),
            transport: None,
            conversation: Vec::new(),
            interrupt: Interrupt::new(),
            state: Arc::new(AtomicU8::new(SessionState::Disconnected as u8)),
        })
    }

    /// Attaches a history log
    pub fn with_history(mut self, history: Box<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    /// Replaces where ambient credentials are looked up
    pub fn with_credential_sources(mut self, sources: Arc<CredentialSources>) -> Self {
        self.sources = sources;
        self
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            interrupt: self.interrupt.clone(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Picks a transport.
    ///
    /// Absent or ambient credentials try the local CLI agent first (when
    /// `cli_enabled`); if one is found the session stays in subprocess mode
    /// and nothing is sent over the network. Otherwise an [`ApiClient`] is
    /// built from the credentials and must find a usable key or token.
    pub async fn connect(&mut self, credentials: Option<Credentials>) -> Result<()> {
        self.disconnect().await?;
        self.set_state(SessionState::Connecting);

        let credentials = credentials.unwrap_or_else(Credentials::system);
        let opened = open_transport(
            credentials,
            self.options.clone(),
            self.interrupt.clone(),
            Arc::clone(&self.sources),
        )
        .await;
        match opened {
            Ok(transport) => {
                info!(kind = ?transport.kind(), "agent connected");
                self.transport = Some(transport);
                self.set_state(SessionState::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Uses a caller-supplied transport
    pub async fn connect_with(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.disconnect().await?;
        debug!(kind = ?transport.kind(), "agent connected with injected transport");
        self.transport = Some(transport);
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Closes the transport. Conversation and history are kept.
    pub async fn disconnect(&mut self) -> Result<()> {
        let result = match self.transport.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        };
        self.set_state(SessionState::Disconnected);
        result
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_cli_mode(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.kind() == TransportKind::Subprocess)
    }

    /// Asks the running request to stop
    pub fn request_cancel(&self) {
        self.interrupt.trigger();
    }

    /// Handles one user request end to end. Never fails; problems are
    /// reported through [`ProcessResult::outcome`] and `on_error`.
    pub async fn process_message(&mut self, text: &str) -> ProcessResult {
        self.set_state(SessionState::Processing);

        let (responses, turns_used, outcome) = self.run_loop(text).await;

        let cost = self.estimate_cost();
        let result = ProcessResult {
            response: responses.join("\n\n"),
            turns_used,
            cost,
            outcome,
        };
        self.callback.on_result(turns_used, cost);

        self.interrupt.clear();
        let state = match (&result.outcome, self.transport.is_some()) {
            (Outcome::Cancelled, _) => SessionState::Cancelled,
            (_, true) => SessionState::Idle,
            (_, false) => SessionState::Disconnected,
        };
        self.set_state(state);
        info!(turns = turns_used, outcome = ?result.outcome, "request finished");
        result
    }

    async fn run_loop(&mut self, text: &str) -> (Vec<String>, u32, Outcome) {
        let callback = Arc::clone(&self.callback);
        let executor = Arc::clone(&self.executor);
        let max_turns = self.options.max_turns;
        let mut responses = Vec::new();
        let mut turns_used = 0;

        if self.transport.is_none() {
            let message = "agent is not connected";
            callback.on_error(message);
            return (responses, 0, Outcome::Error(message.to_string()));
        }

        self.record(|h| h.append_user_message(text));
        self.conversation.push(Message::user(text));
        let mut input = text.to_string();

        for turn in 1..=max_turns {
            if self.interrupt.is_triggered() {
                debug!(turn, "cancelled before turn");
                return (responses, turns_used, Outcome::Cancelled);
            }

            turns_used = turn;
            callback.on_turn_start(turn, max_turns);
            callback.on_thinking();

            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            let request = TurnRequest {
                conversation: &self.conversation,
                input: &input,
                system_prompt: &self.options.system_prompt,
            };

            let mut filter = self.scanner.filter();
            let mut shown = false;
            let result = {
                let callback = &callback;
                let mut on_event = |event: TurnEvent| match event {
                    TurnEvent::Text(chunk) => {
                        let visible = filter.push(&chunk);
                        if !visible.is_empty() {
                            if !shown {
                                shown = true;
                                callback.on_thinking_done();
                            }
                            callback.on_text(&visible);
                        }
                    }
                    TurnEvent::Thinking(_) => {}
                    TurnEvent::ToolUse { name, detail } => callback.on_tool_use(&name, &detail),
                };
                transport.run_turn(request, &mut on_event).await
            };

            let tail = filter.finish();
            if !shown {
                callback.on_thinking_done();
            }
            if !tail.is_empty() {
                callback.on_text(&tail);
            }

            let reply = match result {
                Ok(reply) => reply,
                Err(e) if e.is_cancelled() || self.interrupt.is_triggered() => {
                    debug!(turn, "cancelled during turn");
                    return (responses, turns_used, Outcome::Cancelled);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(turn, error = %message, "model call failed");
                    callback.on_error(&message);
                    return (responses, turns_used, Outcome::Error(message));
                }
            };

            let turn_text = reply.text();
            self.record_reply(&reply.content, &turn_text, reply.usage);
            self.conversation.push(Message::assistant(reply.content));

            // kept verbatim; a turn that was nothing but scripts adds nothing
            let visible = self.scanner.strip(&turn_text);
            if !visible.trim().is_empty() {
                responses.push(visible);
            }

            let directives = self.scanner.extract(&turn_text);
            if directives.is_empty() {
                return (responses, turns_used, Outcome::Success);
            }
            if turn == max_turns {
                info!(pending = directives.len(), "turn budget exhausted; scripts not run");
                break;
            }

            let mut outputs = Vec::with_capacity(directives.len());
            for directive in &directives {
                if self.interrupt.is_triggered() {
                    return (responses, turns_used, Outcome::Cancelled);
                }
                callback.on_script_code(&directive.code);
                let result = timed_execute(executor.as_ref(), &directive.code);
                debug!(success = result.success, elapsed = ?result.elapsed, "script finished");

                let feedback = result.feedback_text();
                if result.success {
                    callback.on_script_output(&result.output);
                } else {
                    callback.on_error(&feedback);
                }
                self.record(|h| h.append_script_execution(&directive.code, &feedback, !result.success));
                outputs.push(feedback);
            }

            input = format_feedback(&outputs);
            self.conversation.push(Message::user(input.clone()));
        }

        (responses, turns_used, Outcome::Success)
    }

    fn record_reply(&mut self, content: &[ContentBlock], text: &str, usage: TokenUsage) {
        let model = self.options.model.clone();
        for block in content {
            match block {
                ContentBlock::Thinking(thinking) => {
                    self.record(|h| h.append_thinking(&thinking.thinking))
                }
                ContentBlock::ToolUse(tool) => {
                    self.record(|h| h.append_tool_use(&tool.id, &tool.name, tool.input.clone()))
                }
                ContentBlock::Text(_) | ContentBlock::ToolResult(_) | ContentBlock::Other(_) => {}
            }
        }
        self.record(|h| h.append_assistant_message(text, &model, Some(usage)));
    }

    fn record<F>(&mut self, write: F)
    where
        F: FnOnce(&mut dyn HistorySink) -> Result<String>,
    {
        if let Some(history) = self.history.as_deref_mut() {
            if let Err(e) = write(history) {
                warn!(error = %e, "failed to write history");
            }
        }
    }

    /// Usage reported by the transport since connect
    pub fn total_usage(&self) -> TokenUsage {
        self.transport
            .as_ref()
            .map(|t| t.total_usage())
            .unwrap_or_default()
    }

    pub fn estimate_cost(&self) -> Option<f64> {
        self.transport.as_ref().and_then(|t| t.estimate_cost())
    }

    /// Takes effect on the next turn; the CLI agent is respawned to pick it up
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.options.system_prompt = prompt.into();
    }

    /// Replaces the system prompt with the documents found in `dir`
    pub fn load_system_prompt(&mut self, dir: impl AsRef<Path>, include_host_notes: bool) -> Result<()> {
        self.options.system_prompt = load_system_prompt(dir, include_host_notes)?;
        Ok(())
    }

    /// Forgets the conversation without touching history or the CLI session
    pub fn clear_conversation(&mut self) {
        self.conversation.clear();
    }

    /// Clears the conversation, drops the CLI session and starts a new
    /// history session
    pub fn start_new_session(&mut self) -> Result<()> {
        self.conversation.clear();
        if let Some(transport) = self.transport.as_mut() {
            transport.reset_session();
        }
        if let Some(history) = self.history.as_mut() {
            let session = history.start_new_session()?;
            debug!(session, "history session started");
        }
        Ok(())
    }

    pub fn message_count(&self) -> usize {
        self.conversation.len()
    }

    /// Continuation id of the CLI session, if any
    pub fn session_id(&self) -> Option<&str> {
        self.transport.as_ref().and_then(|t| t.session_id())
    }

    /// One cheap round trip through the connected transport
    pub async fn test_connection(&mut self) -> Result<String> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::config("agent is not connected"))?;
        transport.test_connection().await
    }
}

async fn open_transport(
    credentials: Credentials,
    options: AgentOptions,
    interrupt: Interrupt,
    sources: Arc<CredentialSources>,
) -> Result<Box<dyn Transport>> {
    if credentials.is_ambient() && options.cli_enabled {
        if let Some(path) = locate_cli(options.cli_path.as_deref()).await {
            info!(path = %path.display(), "using local CLI agent");
            return Ok(Box::new(CliTransport::new(path, options, interrupt)));
        }
        debug!("no CLI agent found; falling back to the network");
    }

    // keychain and file lookups block
    let client = tokio::task::spawn_blocking(move || {
        ApiClient::with_sources(credentials, options, interrupt, &sources)
    })
    .await
    .map_err(|e| Error::other(format!("credential lookup failed: {e}")))??;

    if !client.is_configured() {
        return Err(Error::config(
            "no API key or agent identity found; set ANTHROPIC_API_KEY or sign in",
        ));
    }
    Ok(Box::new(client))
}

async fn locate_cli(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if is_executable(path) {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "configured CLI path is not executable");
    }
    find_cli().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackEvent, CollectingCallback, NullCallback};
    use crate::executor::ScriptResult;

    fn agent() -> Agent {
        Agent::new(
            AgentOptions::default(),
            NullCallback,
            |_: &str| ScriptResult::success(""),
        )
        .unwrap()
    }

    #[test]
    fn test_new_agent_is_disconnected() {
        let agent = agent();
        assert_eq!(agent.state(), SessionState::Disconnected);
        assert!(!agent.is_connected());
        assert!(!agent.is_cli_mode());
        assert_eq!(agent.message_count(), 0);
        assert_eq!(agent.estimate_cost(), None);
        assert_eq!(agent.total_usage(), TokenUsage::default());
    }

    #[test]
    fn test_rejects_empty_markers() {
        let mut options = AgentOptions::default();
        options.markers.close.clear();
        let result = Agent::new(options, NullCallback, |_: &str| ScriptResult::success(""));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_handle_shares_state_and_interrupt() {
        let agent = agent();
        let handle = agent.handle();
        handle.request_cancel();
        assert!(agent.interrupt.is_triggered());

        agent.set_state(SessionState::Processing);
        assert_eq!(handle.state(), SessionState::Processing);
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Idle,
            SessionState::Processing,
            SessionState::Cancelled,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_process_result_helpers() {
        let result = ProcessResult {
            response: String::new(),
            turns_used: 1,
            cost: None,
            outcome: Outcome::Error("boom".into()),
        };
        assert!(!result.is_success());
        assert!(!result.is_cancelled());
        assert_eq!(result.error(), Some("boom"));
    }

    #[tokio::test]
    async fn test_process_without_transport_reports_error() {
        let callback = Arc::new(CollectingCallback::new());
        let mut agent = Agent::new(
            AgentOptions::default(),
            callback.clone(),
            |_: &str| ScriptResult::success(""),
        )
        .unwrap();

        let result = agent.process_message("hi").await;
        assert_eq!(result.error(), Some("agent is not connected"));
        assert_eq!(result.turns_used, 0);
        assert_eq!(callback.errors(), vec!["agent is not connected"]);
        assert_eq!(
            callback.events().last(),
            Some(&CallbackEvent::Result { turns: 0, cost: None })
        );
        assert_eq!(agent.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_without_credentials_fails() {
        let options = AgentOptions::builder().cli_enabled(false).build().unwrap();
        let mut agent = Agent::new(options, NullCallback, |_: &str| ScriptResult::success(""))
            .unwrap()
            .with_credential_sources(Arc::new(CredentialSources::empty()));

        let err = agent.connect(None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(agent.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_with_api_key_uses_network() {
        let options = AgentOptions::builder().cli_enabled(true).build().unwrap();
        let mut agent = Agent::new(options, NullCallback, |_: &str| ScriptResult::success(""))
            .unwrap()
            .with_credential_sources(Arc::new(CredentialSources::empty()));

        agent.connect(Some(Credentials::api_key("sk-test"))).await.unwrap();
        assert!(agent.is_connected());
        assert!(!agent.is_cli_mode());
        assert_eq!(agent.state(), SessionState::Idle);
        assert_eq!(agent.estimate_cost(), Some(0.0));

        agent.disconnect().await.unwrap();
        assert_eq!(agent.state(), SessionState::Disconnected);
    }
}
