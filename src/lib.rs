//! # Script Agent
//!
//! An agentic conversation engine: it sends user text to a language model,
//! finds code the model asks to have run, hands that code to a host-supplied
//! executor and feeds the output back until the model answers without asking
//! for more.
//!
//! ## Overview
//!
//! The model is reached one of two ways, chosen once at connect time:
//!
//! - **Network**: direct HTTPS calls to the Messages endpoint with
//!   server-sent-event streaming, parsed incrementally into content blocks
//! - **Subprocess**: a locally installed CLI agent driven over
//!   line-delimited JSON on its stdin and stdout
//!
//! Script requests are plain text wrapped in a marker pair (`<run>` and
//! `</run>` by default). Markers and the code between them are hidden from
//! what the user sees, even when a marker is split across two stream deltas.
//!
//! ## Key Features
//!
//! - **Streaming parser**: chunk-boundary independent reassembly of SSE
//!   frames, including thinking and tool-input deltas
//! - **Cooperative cancellation**: one shared flag, observed between turns
//!   and inside every transport read loop
//! - **Credential resolution**: explicit keys, OAuth tokens, or the ambient
//!   identity stored by the CLI
//! - **Callbacks**: turn, text, script and result progress for live UIs
//! - **History**: optional append-only JSONL log of every exchange
//!
//! ## Example
//!
//! ```rust,no_run
//! use script_agent::{Agent, AgentOptions, CollectingCallback, Credentials, ScriptResult};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder()
//!         .system_prompt("Put code to run between <run> and </run>.")
//!         .max_turns(5)
//!         .build()?;
//!
//!     let callback = Arc::new(CollectingCallback::new());
//!     let executor = |code: &str| ScriptResult::success(format!("echo: {code}"));
//!
//!     let mut agent = Agent::new(options, callback.clone(), executor)?;
//!     agent.connect(Some(Credentials::api_key("sk-ant-..."))).await?;
//!
//!     let result = agent.process_message("How many files are open?").await;
//!     if let Some(error) = result.error() {
//!         eprintln!("failed: {error}");
//!     }
//!     println!("{}", result.response);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: the turn loop, session state and cancellation handle
//! - **transport**: the seam the loop talks through
//! - **network**: HTTP transport, request headers and cost estimation
//! - **parser**: incremental SSE frame parser
//! - **subprocess**: CLI discovery, spawning and the JSON-lines protocol
//! - **directive**: marker scanning, stripping and live filtering
//! - **identity**: ambient credential lookup
//! - **history**: append-only conversation log
//! - **types**: wire types for messages, content blocks and stream events

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Turn loop controller and its session state.
mod agent;

/// Progress callbacks invoked synchronously from the loop.
mod callback;

/// Agent options, credentials and environment helpers.
mod config;

/// Script directive scanning and live marker filtering.
mod directive;

/// Error type and `Result` alias used across the crate.
mod error;

/// Host-supplied script execution capability.
mod executor;

/// Ambient identity lookup from the keychain, credentials file and environment.
mod identity;

/// Shared cancellation flag.
mod interrupt;

/// HTTP transport for the Messages endpoint.
mod network;

/// Incremental parser for server-sent event streams.
mod parser;

/// CLI agent transport over line-delimited JSON.
mod subprocess;

/// The capability interface both transports implement.
mod transport;

/// Wire types for requests, responses and stream events.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Append-only conversation log and its record types.
pub mod history;

// --- Agent ---

pub use agent::{Agent, AgentHandle, Outcome, ProcessResult, SessionState};

// --- Callbacks ---

pub use callback::{AgentCallback, CallbackEvent, CollectingCallback, NullCallback};

// --- Configuration ---

pub use config::{
    AgentOptions, AgentOptionsBuilder, AuthKind, Credentials, DEFAULT_BASE_URL, DEFAULT_MAX_TURNS,
    DEFAULT_MODEL, get_base_url, get_model, load_system_prompt,
};

// --- Directives ---

pub use directive::{DirectiveMarkers, DirectiveScanner, MarkupFilter, ScriptDirective, format_feedback};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Script Execution ---

pub use executor::{ScriptExecutor, ScriptResult};

// --- History ---

pub use history::{HistorySink, JsonlHistory, MemoryHistory};

// --- Credentials ---

pub use identity::{AgentIdentity, CredentialSources};

// --- Cancellation ---

pub use interrupt::Interrupt;

// --- Transports ---

pub use network::{ApiClient, PriceTable};
pub use parser::StreamingParser;
pub use subprocess::{
    CliAssistantMessage, CliMessage, CliTransport, build_args, candidate_paths, find_cli, test_cli_connection,
};
pub use transport::{Transport, TransportKind, TurnEvent, TurnReply, TurnRequest};

// --- Core Types ---

pub use types::{
    ContentBlock, ContentDelta, Message, MessageDeltaBody, MessageRequest, MessageRole,
    ModelResponse, StopReason, StreamError, StreamEvent, TextBlock, ThinkingBlock, ThinkingConfig,
    TokenUsage, ToolDefinition, ToolResultBlock, ToolUseBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most callers need.
///
/// `use script_agent::prelude::*;` brings in the agent, its options, the
/// callback and executor traits, credentials and the error type.
pub mod prelude {
    pub use crate::{
        Agent, AgentCallback, AgentOptions, AgentOptionsBuilder, CollectingCallback, Credentials,
        Error, NullCallback, Outcome, ProcessResult, Result, ScriptExecutor, ScriptResult,
    };
}
