//! HTTP transport for the Messages endpoint
//!
//! [`ApiClient`] owns a `reqwest::Client` with the protocol headers baked
//! in, the running token counters and the cost table. Two calls are
//! exposed:
//!
//! - [`ApiClient::send`]: one request, one JSON body (`stream` forced off)
//! - [`ApiClient::send_streaming`]: `stream` forced on; the body is fed
//!   chunk by chunk into a [`StreamingParser`] and each parsed event is
//!   handed to the caller before the assembled response is returned
//!
//! Both race the request against the shared [`Interrupt`], and the
//! streaming read loop re-checks the flag after every chunk, so a cancel is
//! observed within one chunk-delivery interval.
//!
//! Failures are never retried here. A non-2xx status, an `error` payload or
//! an `error` stream event all surface as [`Error::Api`]; a stream that ends
//! without `message_stop` is [`Error::Stream`].

use crate::config::{AgentOptions, AuthKind, Credentials};
use crate::error::{Error, Result};
use crate::identity::CredentialSources;
use crate::interrupt::Interrupt;
use crate::parser::StreamingParser;
use crate::transport::{Transport, TransportKind, TurnEvent, TurnReply, TurnRequest};
use crate::types::{
    ContentBlock, ContentDelta, Message, MessageRequest, ModelResponse, StreamEvent, TokenUsage,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Protocol version sent with every request
pub const API_VERSION: &str = "2023-06-01";

/// Feature flags sent with every request
pub const API_BETA: &str = "prompt-caching-2024-07-31,pdfs-2024-09-25";

/// Extra feature flag required when authenticating with an OAuth token
pub const OAUTH_BETA: &str = "oauth-2025-04-20";

const CONNECTION_TEST_PROMPT: &str = "Say 'Hello!' and nothing else.";

/// Per-million-token prices used for cost estimates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTable {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Cache reads are billed at this fraction of the input price
    pub cache_read_multiplier: f64,
    /// Cache writes are billed at this multiple of the input price
    pub cache_write_multiplier: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_read_multiplier: 0.1,
            cache_write_multiplier: 1.25,
        }
    }
}

impl PriceTable {
    /// Estimated USD cost of `usage`
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let per_token = |tokens: u64, price: f64| tokens as f64 * price / 1_000_000.0;
        per_token(usage.input_tokens, self.input_per_million)
            + per_token(usage.output_tokens, self.output_per_million)
            + per_token(
                usage.cache_read_tokens,
                self.input_per_million * self.cache_read_multiplier,
            )
            + per_token(
                usage.cache_creation_tokens,
                self.input_per_million * self.cache_write_multiplier,
            )
    }
}

/// Running usage total, shared with whatever task reads it
#[derive(Debug, Default)]
struct UsageCounters {
    input: AtomicU64,
    output: AtomicU64,
    cache_read: AtomicU64,
    cache_creation: AtomicU64,
}

impl UsageCounters {
    fn add(&self, usage: &TokenUsage) {
        self.input.fetch_add(usage.input_tokens, Ordering::SeqCst);
        self.output.fetch_add(usage.output_tokens, Ordering::SeqCst);
        self.cache_read
            .fetch_add(usage.cache_read_tokens, Ordering::SeqCst);
        self.cache_creation
            .fetch_add(usage.cache_creation_tokens, Ordering::SeqCst);
    }

    fn snapshot(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input.load(Ordering::SeqCst),
            output_tokens: self.output.load(Ordering::SeqCst),
            cache_read_tokens: self.cache_read.load(Ordering::SeqCst),
            cache_creation_tokens: self.cache_creation.load(Ordering::SeqCst),
        }
    }
}

/// Direct HTTP client for the Messages endpoint
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    auth: AuthKind,
    configured: bool,
    options: AgentOptions,
    usage: Arc<UsageCounters>,
    prices: PriceTable,
    interrupt: Interrupt,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .field("configured", &self.configured)
            .field("model", &self.options.model)
            .field("usage", &self.usage.snapshot())
            .finish()
    }
}

impl ApiClient {
    /// Builds a client. Ambient credentials are resolved from the real
    /// keychain and environment.
    pub fn new(credentials: Credentials, options: AgentOptions, interrupt: Interrupt) -> Result<Self> {
        Self::with_sources(credentials, options, interrupt, &CredentialSources::system())
    }

    /// Builds a client, resolving ambient credentials through `sources`
    pub fn with_sources(
        credentials: Credentials,
        options: AgentOptions,
        interrupt: Interrupt,
        sources: &CredentialSources,
    ) -> Result<Self> {
        let base_url = credentials
            .base_url
            .clone()
            .unwrap_or_else(|| options.base_url.clone());

        let credentials = if credentials.is_ambient() {
            sources.resolve()
        } else {
            credentials
        };
        let configured = credentials.is_configured();
        if !configured {
            debug!("no usable credentials; client left unconfigured");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout))
            .connect_timeout(Duration::from_secs(options.connect_timeout))
            .default_headers(default_headers(&credentials)?)
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            auth: credentials.kind,
            configured,
            options,
            usage: Arc::new(UsageCounters::default()),
            prices: PriceTable::default(),
            interrupt,
        })
    }

    /// Replaces the cost table
    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    /// True when an API key or OAuth token was found
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn auth_kind(&self) -> AuthKind {
        self.auth
    }

    /// Requests cancellation of any in-flight call
    pub fn cancel(&self) {
        self.interrupt.trigger();
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.usage.snapshot()
    }

    pub fn estimate_cost(&self) -> f64 {
        self.prices.cost(&self.usage.snapshot())
    }

    /// Request for `conversation` using the configured model settings
    pub fn build_request(&self, conversation: &[Message], system_prompt: &str) -> MessageRequest {
        MessageRequest::new(
            self.options.model.clone(),
            conversation.to_vec(),
            self.options.max_tokens,
        )
        .system(system_prompt)
        .temperature(self.options.temperature)
        .thinking_budget(self.options.thinking())
    }

    /// Sends a non-streaming request
    pub async fn send(&self, request: &MessageRequest) -> Result<ModelResponse> {
        let mut request = request.clone();
        request.stream = false;

        let response = self.dispatch(&request).await?;
        let body = tokio::select! {
            _ = self.interrupt.cancelled() => return Err(Error::cancelled()),
            body = response.text() => body?,
        };

        let value: Value = serde_json::from_str(&body)?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            return Err(Error::api(describe_error(error)));
        }

        let parsed = ModelResponse::from_value(value)?;
        self.usage.add(&parsed.usage);
        Ok(parsed)
    }

    /// Sends a streaming request, calling `on_event` for every parsed event
    pub async fn send_streaming<F>(&self, request: &MessageRequest, mut on_event: F) -> Result<ModelResponse>
    where
        F: FnMut(&StreamEvent),
    {
        let mut request = request.clone();
        request.stream = true;

        let response = self.dispatch(&request).await?;
        let mut parser = StreamingParser::new();
        let mut body = std::pin::pin!(response.bytes_stream());

        loop {
            let chunk = tokio::select! {
                _ = self.interrupt.cancelled() => return Err(Error::cancelled()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            if self.interrupt.is_triggered() {
                return Err(Error::cancelled());
            }
            for event in parser.feed(&chunk) {
                on_event(&event);
            }
        }
        for event in parser.finish() {
            on_event(&event);
        }

        if parser.malformed_frames() > 0 {
            warn!(
                frames = parser.malformed_frames(),
                "stream contained unparseable frames"
            );
        }
        if let Some(message) = parser.error_message() {
            return Err(Error::api(message.to_string()));
        }

        let response = parser
            .take_response()
            .ok_or_else(|| Error::stream("stream ended before message_stop"))?;
        self.usage.add(&response.usage);
        Ok(response)
    }

    /// Sends a tiny prompt and returns the reply text
    pub async fn test_connection(&self) -> Result<String> {
        let request = MessageRequest::new(
            self.options.model.clone(),
            vec![Message::user(CONNECTION_TEST_PROMPT)],
            100,
        );
        Ok(self.send(&request).await?.text())
    }

    /// Posts `request` and checks the status, observing cancellation
    async fn dispatch(&self, request: &MessageRequest) -> Result<reqwest::Response> {
        if !self.configured {
            return Err(Error::config("no API key or OAuth token configured"));
        }
        if self.interrupt.is_triggered() {
            return Err(Error::cancelled());
        }

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            "sending request"
        );

        let response = tokio::select! {
            _ = self.interrupt.cancelled() => return Err(Error::cancelled()),
            response = self.http.post(&self.endpoint).json(request).send() => response?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%status, "request rejected");
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").map(describe_error))
            .unwrap_or(body);
        Err(Error::api(format!("{status}: {detail}")))
    }
}

fn default_headers(credentials: &Credentials) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

    let secret = |value: String| {
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| Error::config("credential contains invalid header characters"))?;
        value.set_sensitive(true);
        Ok::<_, Error>(value)
    };

    match credentials.kind {
        AuthKind::ApiKey if !credentials.secret.is_empty() => {
            headers.insert("anthropic-beta", HeaderValue::from_static(API_BETA));
            headers.insert("x-api-key", secret(credentials.secret.clone())?);
        }
        AuthKind::OAuth if !credentials.secret.is_empty() => {
            let beta = format!("{API_BETA},{OAUTH_BETA}");
            headers.insert(
                "anthropic-beta",
                HeaderValue::from_str(&beta).map_err(|e| Error::config(e.to_string()))?,
            );
            headers.insert(
                reqwest::header::AUTHORIZATION,
                secret(format!("Bearer {}", credentials.secret))?,
            );
        }
        _ => {
            headers.insert("anthropic-beta", HeaderValue::from_static(API_BETA));
        }
    }

    Ok(headers)
}

/// `type: message` from an error object, or its raw JSON
fn describe_error(error: &Value) -> String {
    let message = error.get("message").and_then(Value::as_str);
    let kind = error.get("type").and_then(Value::as_str);
    match (kind, message) {
        (Some(kind), Some(message)) => format!("{kind}: {message}"),
        (None, Some(message)) => message.to_string(),
        _ => error.to_string(),
    }
}

#[async_trait]
impl Transport for ApiClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn run_turn(
        &mut self,
        request: TurnRequest<'_>,
        on_event: &mut (dyn FnMut(TurnEvent) + Send),
    ) -> Result<TurnReply> {
        let message_request = self.build_request(request.conversation, request.system_prompt);

        let response = self
            .send_streaming(&message_request, |event| match event {
                StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                    ContentDelta::TextDelta { text } if !text.is_empty() => {
                        on_event(TurnEvent::Text(text.clone()))
                    }
                    ContentDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                        on_event(TurnEvent::Thinking(thinking.clone()))
                    }
                    _ => {}
                },
                StreamEvent::ContentBlockStart {
                    content_block: ContentBlock::ToolUse(tool),
                    ..
                } => on_event(TurnEvent::ToolUse {
                    name: tool.name.clone(),
                    detail: String::new(),
                }),
                _ => {}
            })
            .await?;

        Ok(TurnReply {
            content: response.content,
            usage: response.usage,
            stop_reason: response.stop_reason,
        })
    }

    fn total_usage(&self) -> TokenUsage {
        ApiClient::total_usage(self)
    }

    fn estimate_cost(&self) -> Option<f64> {
        Some(ApiClient::estimate_cost(self))
    }

    async fn test_connection(&mut self) -> Result<String> {
        ApiClient::test_connection(self).await
    }
}
