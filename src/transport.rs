//! The seam between the agent loop and the two ways of reaching the model
//!
//! [`ApiClient`](crate::ApiClient) talks HTTP to the Messages endpoint and
//! replays the whole conversation every turn. [`CliTransport`](crate::CliTransport)
//! drives a local CLI agent over line-delimited JSON and only sends the
//! newest input, relying on the CLI's session to hold context. The loop
//! picks one at connect time and only ever talks to it through this trait.

use crate::error::Result;
use crate::types::{ContentBlock, Message, StopReason, TokenUsage};
use async_trait::async_trait;

/// Which strategy is behind a [`Transport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Network,
    Subprocess,
}

/// Progress surfaced while a turn is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A chunk of visible assistant text (markers not yet removed)
    Text(String),
    /// A chunk of extended-thinking text
    Thinking(String),
    /// The model invoked a tool on its own
    ToolUse { name: String, detail: String },
}

/// Everything a transport needs for one model call
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    /// Full conversation, ending with the newest user message
    pub conversation: &'a [Message],
    /// Text of the newest user message
    pub input: &'a str,
    pub system_prompt: &'a str,
}

/// Result of one model call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnReply {
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub stop_reason: Option<StopReason>,
}

impl TurnReply {
    /// Assistant text of this turn, blocks joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A way of reaching the model
///
/// Implementations observe the agent's shared [`Interrupt`](crate::Interrupt)
/// inside their read loops and return [`Error::Cancelled`](crate::Error::Cancelled)
/// when it fires.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Runs one model call, reporting progress through `on_event`
    async fn run_turn(
        &mut self,
        request: TurnRequest<'_>,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> Result<TurnReply>;

    /// Usage accumulated over every successful call
    fn total_usage(&self) -> TokenUsage;

    /// Estimated spend in USD, `None` if it cannot be known
    fn estimate_cost(&self) -> Option<f64>;

    /// Continuation identifier, for transports that keep one
    fn session_id(&self) -> Option<&str> {
        None
    }

    /// Forgets any continuation state so the next call starts fresh
    fn reset_session(&mut self) {}

    /// One cheap round trip; returns the model's reply text
    async fn test_connection(&mut self) -> Result<String>;

    /// Releases processes or connections
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
