//! Configuration: credentials, agent options and environment helpers

use crate::directive::DirectiveMarkers;
use crate::error::{Error, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Default Messages endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default turn budget per user request
pub const DEFAULT_MAX_TURNS: u32 = 20;

/// How the agent authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    /// Nothing supplied; treated like `System` at connect time
    #[default]
    None,
    /// Use the ambient identity: the local CLI agent if installed, else
    /// stored credentials or environment variables
    System,
    /// Bearer token from an OAuth login
    OAuth,
    /// Plain API key
    ApiKey,
}

/// Resolved credentials handed to the agent at connect time
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub kind: AuthKind,
    pub secret: String,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("kind", &self.kind)
            .field("secret", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Credentials {
    pub fn system() -> Self {
        Self {
            kind: AuthKind::System,
            ..Default::default()
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::ApiKey,
            secret: key.into(),
            base_url: None,
        }
    }

    pub fn oauth(token: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::OAuth,
            secret: token.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// `System` is always configured (lookup happens later); explicit
    /// kinds need a non-empty secret.
    pub fn is_configured(&self) -> bool {
        match self.kind {
            AuthKind::None => false,
            AuthKind::System => true,
            AuthKind::OAuth | AuthKind::ApiKey => !self.secret.is_empty(),
        }
    }

    /// True for the kinds that defer to the ambient identity
    pub fn is_ambient(&self) -> bool {
        matches!(self.kind, AuthKind::None | AuthKind::System)
    }
}

/// Options for configuring an agent
#[derive(Clone)]
pub struct AgentOptions {
    /// System prompt sent with every call (empty = omitted)
    pub system_prompt: String,

    /// Model identifier
    pub model: String,

    /// Endpoint used when credentials do not carry their own
    pub base_url: String,

    /// Maximum model calls per user request
    pub max_turns: u32,

    /// Maximum tokens to generate per call
    pub max_tokens: u32,

    /// Sampling temperature (None uses the server default)
    pub temperature: Option<f32>,

    /// Request extended thinking
    pub enable_thinking: bool,

    /// Token budget for extended thinking
    pub thinking_budget: u32,

    /// Whole-request timeout in seconds
    pub timeout: u64,

    /// TCP connect timeout in seconds
    pub connect_timeout: u64,

    /// Seconds to wait for the next line from the CLI agent
    pub response_timeout: u64,

    /// Try the local CLI agent before the network for ambient credentials
    pub cli_enabled: bool,

    /// Explicit CLI executable, bypassing the search
    pub cli_path: Option<PathBuf>,

    /// Tools the CLI agent may use on its own
    pub allowed_tools: Vec<String>,

    /// CLI permission mode; must not prompt interactively
    pub permission_mode: String,

    /// CLI session to resume on the first call
    pub resume_session: Option<String>,

    /// Script directive markers
    pub markers: DirectiveMarkers,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("system_prompt", &format!("{} chars", self.system_prompt.len()))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_turns", &self.max_turns)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("enable_thinking", &self.enable_thinking)
            .field("thinking_budget", &self.thinking_budget)
            .field("timeout", &self.timeout)
            .field("cli_enabled", &self.cli_enabled)
            .field("cli_path", &self.cli_path)
            .field("permission_mode", &self.permission_mode)
            .field("markers", &self.markers)
            .finish()
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: 16384,
            temperature: None,
            enable_thinking: false,
            thinking_budget: 10_000,
            timeout: 300,
            connect_timeout: 30,
            response_timeout: 30,
            cli_enabled: true,
            cli_path: None,
            allowed_tools: Vec::new(),
            permission_mode: "bypassPermissions".to_string(),
            resume_session: None,
            markers: DirectiveMarkers::default(),
        }
    }
}

impl AgentOptions {
    /// Create a new builder for AgentOptions
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    /// Thinking budget to put on the wire, `None` when thinking is off
    pub fn thinking(&self) -> Option<u32> {
        self.enable_thinking.then_some(self.thinking_budget)
    }
}

/// Builder for AgentOptions
#[derive(Debug, Default)]
pub struct AgentOptionsBuilder {
    options: AgentOptions,
}

impl AgentOptionsBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = prompt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = model.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = url.into();
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.options.max_turns = turns;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.options.max_tokens = tokens;
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.options.temperature = Some(temp);
        self
    }

    pub fn thinking(mut self, budget: u32) -> Self {
        self.options.enable_thinking = true;
        self.options.thinking_budget = budget;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.options.timeout = seconds;
        self
    }

    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.options.connect_timeout = seconds;
        self
    }

    pub fn response_timeout(mut self, seconds: u64) -> Self {
        self.options.response_timeout = seconds;
        self
    }

    pub fn cli_enabled(mut self, enabled: bool) -> Self {
        self.options.cli_enabled = enabled;
        self
    }

    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.cli_path = Some(path.into());
        self
    }

    pub fn allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.options.permission_mode = mode.into();
        self
    }

    pub fn resume_session(mut self, session_id: impl Into<String>) -> Self {
        self.options.resume_session = Some(session_id.into());
        self
    }

    pub fn markers(mut self, open: impl Into<String>, close: impl Into<String>) -> Self {
        self.options.markers = DirectiveMarkers::new(open, close);
        self
    }

    pub fn build(self) -> Result<AgentOptions> {
        let options = self.options;

        if options.model.trim().is_empty() {
            return Err(Error::config("model is required"));
        }
        if options.base_url.trim().is_empty() {
            return Err(Error::config("base_url is required"));
        }
        if options.max_turns == 0 {
            return Err(Error::config("max_turns must be at least 1"));
        }
        if options.max_tokens == 0 {
            return Err(Error::config("max_tokens must be at least 1"));
        }
        if let Some(temp) = options.temperature {
            if !(0.0..=1.0).contains(&temp) {
                return Err(Error::config("temperature must be between 0.0 and 1.0"));
            }
        }
        if options.enable_thinking && options.thinking_budget >= options.max_tokens {
            return Err(Error::config(
                "thinking budget must be smaller than max_tokens",
            ));
        }
        if options.timeout == 0 || options.response_timeout == 0 {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if options.markers.open.is_empty() || options.markers.close.is_empty() {
            return Err(Error::config("directive markers must not be empty"));
        }

        Ok(options)
    }
}

/// Get the base URL from `SCRIPT_AGENT_BASE_URL` or the default endpoint
pub fn get_base_url() -> String {
    env::var("SCRIPT_AGENT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

/// Get the model from `SCRIPT_AGENT_MODEL`, else the fallback, else the default model
///
/// # Examples
///
/// ```rust,no_run
/// use script_agent::get_model;
///
/// let model = get_model(None);
/// let pinned = get_model(Some("claude-opus-4-20250514"));
/// ```
pub fn get_model(fallback: Option<&str>) -> String {
    env::var("SCRIPT_AGENT_MODEL")
        .ok()
        .filter(|m| !m.is_empty())
        .or_else(|| fallback.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Prompt fragments read by [`load_system_prompt`], in order
const PROMPT_FILES: [&str; 3] = ["PROMPT.md", "API_REFERENCE.md", "USAGE.md"];

/// Extra notes appended when running inside the host application
const HOST_NOTES_FILE: &str = "HOST.md";

/// Concatenates the prompt fragments found in `dir`, separated by blank lines.
///
/// Missing files are skipped. `HOST.md` is included only when
/// `include_host_notes` is set.
pub fn load_system_prompt(dir: impl AsRef<Path>, include_host_notes: bool) -> Result<String> {
    let dir = dir.as_ref();
    let host = include_host_notes.then_some(HOST_NOTES_FILE);

    let mut parts = Vec::new();
    for name in PROMPT_FILES.into_iter().chain(host) {
        let path = dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => parts.push(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(parts.join("\n\n"))
}
