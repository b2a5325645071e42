//! Subprocess transport: a local CLI agent spoken to over JSON lines
//!
//! The CLI is started once with `--input-format stream-json
//! --output-format stream-json` and kept alive for the session. Each turn
//! writes one user message to its stdin and then reads stdout line by line
//! until a `result` record arrives. Every line is a complete JSON document,
//! so there is no delta reassembly on this path.
//!
//! ```text
//! stdin  <- {"type":"user","message":{"role":"user","content":".."},"session_id":".."}
//! stdout -> {"type":"system","subtype":"init","session_id":".."}
//!        -> {"type":"assistant","message":{"content":[..]}}
//!        -> {"type":"result","is_error":false,"total_cost_usd":0.01,..}
//! stderr -> free-text diagnostics, forwarded line by line to a sink
//! ```
//!
//! A cancelled turn sends SIGINT, tears the process down and leaves the
//! session id in place; the next turn respawns the CLI with `--resume`.

use crate::config::AgentOptions;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::transport::{Transport, TransportKind, TurnEvent, TurnReply, TurnRequest};
use crate::types::{ContentBlock, TokenUsage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Executable name looked up on `PATH` when no well-known location has it
pub const CLI_NAME: &str = "claude";

/// Value of `CLAUDE_CODE_ENTRYPOINT` passed to the child
pub const ENTRYPOINT: &str = "sdk-rust";

/// Session id used until the CLI reports its own
pub const DEFAULT_SESSION: &str = "default";

const CONNECTION_TEST_PROMPT: &str = "Say exactly: Hello from the agent";

/// Receives each line the child writes to stderr
pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Well-known install locations, in search order
pub fn candidate_paths(home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home {
        paths.push(home.join(".local/bin").join(CLI_NAME));
    }
    paths.push(PathBuf::from("/usr/local/bin").join(CLI_NAME));
    if let Some(home) = home {
        paths.push(home.join(".npm-global/bin").join(CLI_NAME));
        paths.push(home.join("node_modules/.bin").join(CLI_NAME));
        paths.push(home.join(".yarn/bin").join(CLI_NAME));
        paths.push(home.join(".claude/local").join(CLI_NAME));
    }
    paths
}

/// Locates the CLI: well-known locations first, then `which`
pub async fn find_cli() -> Option<PathBuf> {
    let home = dirs::home_dir();
    if let Some(path) = candidate_paths(home.as_deref())
        .into_iter()
        .find(|p| is_executable(p))
    {
        return Some(path);
    }

    let output = Command::new("which").arg(CLI_NAME).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?;
    let path = path.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

pub(crate) fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Argument vector for a long-lived stream-json session
pub fn build_args(options: &AgentOptions, system_prompt: &str, resume: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];
    if !system_prompt.is_empty() {
        args.push("--append-system-prompt".into());
        args.push(system_prompt.into());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".into());
        args.push(options.allowed_tools.join(","));
    }
    if !options.permission_mode.is_empty() {
        args.push("--permission-mode".into());
        args.push(options.permission_mode.clone());
    }
    args.push("--max-turns".into());
    args.push(options.max_turns.to_string());
    if !options.model.is_empty() {
        args.push("--model".into());
        args.push(options.model.clone());
    }
    if let Some(session) = resume {
        args.push("--resume".into());
        args.push(session.into());
    }
    args.push("--setting-sources".into());
    args.push(String::new());
    args.push("--input-format".into());
    args.push("stream-json".into());
    args
}

/// One line of CLI output
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
    Assistant {
        message: CliAssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    User {
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CliAssistantMessage {
    #[serde(default, deserialize_with = "crate::types::known_blocks")]
    pub content: Vec<ContentBlock>,
}

impl CliMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CliMessage::System { session_id, .. }
            | CliMessage::Assistant { session_id, .. }
            | CliMessage::User { session_id }
            | CliMessage::Result { session_id, .. } => session_id.as_deref(),
            CliMessage::Other => None,
        }
    }

    /// Error text if this line reports a failure
    pub fn error(&self) -> Option<String> {
        match self {
            CliMessage::Result {
                is_error: true,
                result,
                subtype,
                ..
            } => Some(result.clone().unwrap_or_else(|| subtype.clone())),
            CliMessage::System { subtype, data, .. } if subtype == "error" => Some(
                data.as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("System error")
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// The spawned child and its pipes
struct CliProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: JoinHandle<()>,
    system_prompt: String,
}

/// Drives a local CLI agent over line-delimited JSON
pub struct CliTransport {
    path: PathBuf,
    options: AgentOptions,
    interrupt: Interrupt,
    stderr_sink: StderrSink,
    process: Option<CliProcess>,
    session_id: Option<String>,
    /// Set when the running child holds a session that was reset
    stale: bool,
    usage: TokenUsage,
    cost: f64,
}

impl std::fmt::Debug for CliTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliTransport")
            .field("path", &self.path)
            .field("connected", &self.process.is_some())
            .field("session_id", &self.session_id)
            .field("usage", &self.usage)
            .field("cost", &self.cost)
            .finish()
    }
}

impl CliTransport {
    pub fn new(path: impl Into<PathBuf>, options: AgentOptions, interrupt: Interrupt) -> Self {
        let session_id = options.resume_session.clone();
        Self {
            path: path.into(),
            options,
            interrupt,
            stderr_sink: Arc::new(|line| warn!(target: "script_agent::cli", "{line}")),
            process: None,
            session_id,
            stale: false,
            usage: TokenUsage::default(),
            cost: 0.0,
        }
    }

    /// Routes stderr lines somewhere other than the log
    pub fn with_stderr_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stderr_sink = Arc::new(sink);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while a child is running
    pub fn is_connected(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawns the CLI with stdin, stdout and stderr piped
    pub async fn connect(&mut self, system_prompt: &str) -> Result<()> {
        if self.process.is_some() {
            self.disconnect().await?;
        }

        let args = build_args(&self.options, system_prompt, self.session_id.as_deref());
        debug!(path = %self.path.display(), resume = ?self.session_id, "spawning CLI agent");

        let mut child = Command::new(&self.path)
            .args(&args)
            .env("CLAUDE_CODE_ENTRYPOINT", ENTRYPOINT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::transport(format!("failed to spawn {}: {e}", self.path.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::transport("failed to capture stderr"))?;

        let sink = Arc::clone(&self.stderr_sink);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end();
                if !line.is_empty() {
                    sink(line);
                }
            }
            debug!("CLI stderr closed");
        });

        info!(pid = ?child.id(), "CLI agent started");
        self.process = Some(CliProcess {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
            system_prompt: system_prompt.to_string(),
        });
        Ok(())
    }

    /// Writes one user message to the child's stdin
    pub async fn query(&mut self, text: &str, session_id: &str) -> Result<()> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::transport("CLI agent is not running"))?;
        let stdin = process
            .stdin
            .as_mut()
            .ok_or_else(|| Error::transport("CLI stdin is closed"))?;

        let message = json!({
            "type": "user",
            "message": {"role": "user", "content": text},
            "parent_tool_use_id": null,
            "session_id": session_id,
        });
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Reads stdout lines, handing each parsed document to `sink`, until a
    /// `result` line arrives.
    ///
    /// Lines that are not JSON are skipped. Waiting longer than the response
    /// timeout for a line is [`Error::Timeout`]; stdout closing first is a
    /// transport error; a cancel sends SIGINT and returns [`Error::Cancelled`].
    pub async fn receive_messages<F>(&mut self, mut sink: F) -> Result<()>
    where
        F: FnMut(&Value),
    {
        let wait = Duration::from_secs(self.options.response_timeout);
        let interrupt = self.interrupt.clone();

        loop {
            let process = self
                .process
                .as_mut()
                .ok_or_else(|| Error::transport("CLI agent is not running"))?;

            let next = tokio::select! {
                _ = interrupt.cancelled() => None,
                line = tokio::time::timeout(wait, process.stdout.next_line()) => Some(line),
            };
            let Some(next) = next else {
                self.interrupt().await?;
                return Err(Error::cancelled());
            };

            let line = match next {
                Err(_) => return Err(Error::timeout()),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(None)) => {
                    return Err(Error::transport("CLI agent closed its output"));
                }
                Ok(Ok(Some(line))) => line,
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(e) => {
                    debug!(error = %e, "skipping non-JSON line from CLI agent");
                    continue;
                }
            };

            sink(&value);
            if value.get("type").and_then(Value::as_str) == Some("result") {
                return Ok(());
            }
            if interrupt.is_triggered() {
                self.interrupt().await?;
                return Err(Error::cancelled());
            }
        }
    }

    /// Sends SIGINT to the child without closing its pipes
    pub async fn interrupt(&mut self) -> Result<()> {
        let Some(pid) = self.process.as_ref().and_then(|p| p.child.id()) else {
            return Ok(());
        };
        debug!(pid, "interrupting CLI agent");

        #[cfg(unix)]
        {
            let status = Command::new("kill")
                .args(["-INT", &pid.to_string()])
                .status()
                .await?;
            if !status.success() {
                warn!(pid, "failed to deliver SIGINT");
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(Error::transport("interrupt is only supported on unix"))
        }
    }

    /// Closes all pipes, joins the stderr reader and kills the child if it
    /// is still running
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };

        drop(process.stdin.take());
        drop(process.stdout);

        if process.child.try_wait()?.is_none() {
            if let Err(e) = process.child.kill().await {
                warn!(error = %e, "failed to kill CLI agent");
            }
        }

        let mut stderr_task = process.stderr_task;
        if tokio::time::timeout(Duration::from_secs(1), &mut stderr_task)
            .await
            .is_err()
        {
            stderr_task.abort();
        }
        debug!("CLI agent stopped");
        Ok(())
    }

    /// Spawns the CLI if it is not running, has exited, was started with a
    /// different system prompt, or holds a session that was reset
    async fn ensure_connected(&mut self, system_prompt: &str) -> Result<()> {
        let prompt_changed = self
            .process
            .as_ref()
            .is_some_and(|p| p.system_prompt != system_prompt);
        if self.stale || prompt_changed || !self.is_connected() {
            self.connect(system_prompt).await?;
            self.stale = false;
        }
        Ok(())
    }
}

/// What one turn collected from the CLI output
#[derive(Default)]
struct TurnState {
    reply: TurnReply,
    session_id: Option<String>,
    error: Option<String>,
    cost: f64,
}

impl TurnState {
    fn absorb(&mut self, line: &Value, on_event: &mut (dyn FnMut(TurnEvent) + Send)) {
        let message = match CliMessage::deserialize(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "unrecognised CLI record");
                return;
            }
        };

        if let Some(id) = message.session_id() {
            self.session_id = Some(id.to_string());
        }
        if let Some(error) = message.error() {
            self.error = Some(error);
        }

        match message {
            CliMessage::Assistant { message, .. } => {
                for block in message.content {
                    match &block {
                        ContentBlock::Text(text) => on_event(TurnEvent::Text(text.text.clone())),
                        ContentBlock::Thinking(thinking) => {
                            on_event(TurnEvent::Thinking(thinking.thinking.clone()))
                        }
                        ContentBlock::ToolUse(tool) => on_event(TurnEvent::ToolUse {
                            name: tool.name.clone(),
                            detail: tool.input.to_string(),
                        }),
                        ContentBlock::ToolResult(_) | ContentBlock::Other(_) => {}
                    }
                    self.reply.content.push(block);
                }
            }
            CliMessage::Result {
                total_cost_usd,
                usage,
                ..
            } => {
                self.cost += total_cost_usd.unwrap_or(0.0);
                if let Some(usage) = usage {
                    self.reply.usage += usage;
                }
            }
            CliMessage::System { .. } | CliMessage::User { .. } | CliMessage::Other => {}
        }
    }
}

#[async_trait]
impl Transport for CliTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn run_turn(
        &mut self,
        request: TurnRequest<'_>,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> Result<TurnReply> {
        if self.interrupt.is_triggered() {
            return Err(Error::cancelled());
        }
        self.ensure_connected(request.system_prompt).await?;

        let session = self
            .session_id
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());
        self.query(request.input, &session).await?;

        let mut state = TurnState::default();
        let received = self
            .receive_messages(|line| state.absorb(line, &mut *on_event))
            .await;

        if let Some(id) = state.session_id.take() {
            self.session_id = Some(id);
        }
        self.cost += state.cost;
        self.usage += state.reply.usage;

        if let Err(e) = received {
            // the child may still be mid-turn; start clean next time
            self.disconnect().await?;
            return Err(e);
        }
        if let Some(error) = state.error {
            return Err(Error::api(error));
        }
        if state.reply.content.is_empty() {
            return Err(Error::transport("no response from the CLI agent"));
        }
        Ok(state.reply)
    }

    fn total_usage(&self) -> TokenUsage {
        self.usage
    }

    fn estimate_cost(&self) -> Option<f64> {
        Some(self.cost)
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn reset_session(&mut self) {
        self.session_id = None;
        self.stale = self.process.is_some();
    }

    async fn test_connection(&mut self) -> Result<String> {
        test_cli_connection(&self.path).await
    }

    async fn close(&mut self) -> Result<()> {
        self.disconnect().await
    }
}

/// One-shot `--print` run that checks the CLI can reach the model
pub async fn test_cli_connection(path: &Path) -> Result<String> {
    let run = Command::new(path)
        .args([
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--max-turns",
            "1",
            "--",
            CONNECTION_TEST_PROMPT,
        ])
        .env("CLAUDE_CODE_ENTRYPOINT", ENTRYPOINT)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs(60), run)
        .await
        .map_err(|_| Error::timeout())??;

    let mut text = String::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            if line.contains("Error:") {
                return Err(Error::transport(line.trim().to_string()));
            }
            continue;
        };
        let Ok(message) = CliMessage::deserialize(&value) else {
            continue;
        };
        if let Some(error) = message.error() {
            return Err(Error::api(error));
        }
        if let CliMessage::Assistant { message, .. } = message {
            text.extend(message.content.iter().filter_map(ContentBlock::as_text));
        }
    }

    if text.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::transport(if stderr.is_empty() {
            "CLI agent produced no reply".to_string()
        } else {
            stderr
        }));
    }
    Ok(text)
}
