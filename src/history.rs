//! Conversation history collaborators
//!
//! The agent appends every user message, assistant message, thinking trace
//! and script execution to an optional [`HistorySink`]. It never reads the
//! log back during a live session. Entries are chained: each carries its
//! own `uuid`, the `parentUuid` of the entry before it in the same session,
//! a millisecond `timestamp` and the `sessionId`.
//!
//! Two sinks ship with the crate: [`MemoryHistory`] (shared, in-memory) and
//! [`JsonlHistory`] (one `<session>.jsonl` file per session).

use crate::error::Result;
use crate::types::{MessageRole, TokenUsage};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Tool name under which script executions are recorded
pub const SCRIPT_TOOL_NAME: &str = "script";

/// Format version written into session summaries
pub const HISTORY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Role plus flattened text, as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Payload of one history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HistoryRecord {
    Summary {
        version: String,
    },
    User {
        message: HistoryMessage,
    },
    Assistant {
        message: HistoryMessage,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        tool_input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
    System {
        content: String,
        level: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
    },
}

/// A record with its chain metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub session_id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub record: HistoryRecord,
}

/// Append-only conversation log
pub trait HistorySink: Send {
    /// Appends one record, returning the new entry's id
    fn append(&mut self, record: HistoryRecord) -> Result<String>;

    /// Starts a fresh session and returns its id
    fn start_new_session(&mut self) -> Result<String>;

    fn append_user_message(&mut self, text: &str) -> Result<String> {
        self.append(HistoryRecord::User {
            message: HistoryMessage {
                role: MessageRole::User,
                content: text.to_string(),
            },
        })
    }

    fn append_assistant_message(
        &mut self,
        text: &str,
        model: &str,
        usage: Option<TokenUsage>,
    ) -> Result<String> {
        self.append(HistoryRecord::Assistant {
            message: HistoryMessage {
                role: MessageRole::Assistant,
                content: text.to_string(),
            },
            model: model.to_string(),
            usage,
        })
    }

    fn append_thinking(&mut self, thinking: &str) -> Result<String> {
        self.append(HistoryRecord::Thinking {
            thinking: thinking.to_string(),
        })
    }

    fn append_tool_use(&mut self, tool_use_id: &str, tool_name: &str, input: Value) -> Result<String> {
        self.append(HistoryRecord::ToolUse {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input: input,
        })
    }

    fn append_tool_result(&mut self, tool_use_id: &str, content: &str, is_error: bool) -> Result<String> {
        self.append(HistoryRecord::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.to_string(),
            is_error,
        })
    }

    fn append_system(&mut self, content: &str, level: &str) -> Result<String> {
        self.append(HistoryRecord::System {
            content: content.to_string(),
            level: level.to_string(),
            subtype: None,
        })
    }

    /// Records a script run as a linked tool-use/tool-result pair and
    /// returns the tool-result entry id
    fn append_script_execution(&mut self, code: &str, output: &str, is_error: bool) -> Result<String> {
        let tool_use_id = format!("script_{}", Uuid::new_v4().simple());
        self.append_tool_use(&tool_use_id, SCRIPT_TOOL_NAME, json!({ "code": code }))?;
        self.append_tool_result(&tool_use_id, output, is_error)
    }
}

/// Links successive records of one session
#[derive(Debug, Clone)]
struct EntryChain {
    session_id: String,
    last_uuid: Option<String>,
}

impl EntryChain {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            last_uuid: None,
        }
    }

    fn link(&mut self, record: HistoryRecord) -> HistoryEntry {
        let uuid = Uuid::new_v4().to_string();
        HistoryEntry {
            uuid: uuid.clone(),
            parent_uuid: self.last_uuid.replace(uuid),
            session_id: self.session_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            record,
        }
    }

    fn summary() -> HistoryRecord {
        HistoryRecord::Summary {
            version: HISTORY_VERSION.to_string(),
        }
    }
}

#[derive(Debug)]
struct MemoryState {
    chain: EntryChain,
    entries: Vec<HistoryEntry>,
}

/// In-memory history. Clones share the same log.
#[derive(Debug, Clone)]
pub struct MemoryHistory {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHistory {
    pub fn new() -> Self {
        let mut chain = EntryChain::new();
        let summary = chain.link(EntryChain::summary());
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                chain,
                entries: vec![summary],
            })),
        }
    }

    /// Every entry across all sessions, in append order
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.state.lock().entries.clone()
    }

    /// Records of the current session, without chain metadata or the summary
    pub fn records(&self) -> Vec<HistoryRecord> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.session_id == state.chain.session_id)
            .filter(|e| !matches!(e.record, HistoryRecord::Summary { .. }))
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn session_id(&self) -> String {
        self.state.lock().chain.session_id.clone()
    }
}

impl HistorySink for MemoryHistory {
    fn append(&mut self, record: HistoryRecord) -> Result<String> {
        let mut state = self.state.lock();
        let entry = state.chain.link(record);
        let id = entry.uuid.clone();
        state.entries.push(entry);
        Ok(id)
    }

    fn start_new_session(&mut self) -> Result<String> {
        let mut state = self.state.lock();
        state.chain = EntryChain::new();
        let summary = state.chain.link(EntryChain::summary());
        state.entries.push(summary);
        Ok(state.chain.session_id.clone())
    }
}

/// JSON-lines history, one file per session under a directory
#[derive(Debug)]
pub struct JsonlHistory {
    dir: PathBuf,
    chain: EntryChain,
    file: File,
}

impl JsonlHistory {
    /// Opens `dir` (creating it if needed) and starts a new session file
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let chain = EntryChain::new();
        let file = open_session_file(&dir, &chain.session_id)?;
        let mut history = Self { dir, chain, file };
        history.append(EntryChain::summary())?;
        Ok(history)
    }

    pub fn session_id(&self) -> &str {
        &self.chain.session_id
    }

    /// Path of the current session file
    pub fn session_path(&self) -> PathBuf {
        session_path(&self.dir, &self.chain.session_id)
    }

    /// Reads a session file back. Lines that do not parse are skipped.
    pub fn load_session(path: impl AsRef<Path>) -> Result<Vec<HistoryEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!(error = %e, "skipping unreadable history line"),
            }
        }
        Ok(entries)
    }
}

impl HistorySink for JsonlHistory {
    fn append(&mut self, record: HistoryRecord) -> Result<String> {
        let entry = self.chain.link(record);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(entry.uuid)
    }

    fn start_new_session(&mut self) -> Result<String> {
        let chain = EntryChain::new();
        self.file = open_session_file(&self.dir, &chain.session_id)?;
        self.chain = chain;
        self.append(EntryChain::summary())?;
        Ok(self.chain.session_id.clone())
    }
}

fn session_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.jsonl"))
}

fn open_session_file(dir: &Path, session_id: &str) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(session_path(dir, session_id))?)
}
