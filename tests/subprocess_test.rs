//! Tests for the CLI transport against fake agents written as shell scripts
//!
//! Each script records its arguments and stdin next to itself, so the tests
//! can check what the transport sent as well as what it parsed.

#![cfg(unix)]

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use script_agent::{
    Agent, AgentOptions, CliTransport, CollectingCallback, Error, Interrupt, ScriptResult,
    Transport, TransportKind, TurnEvent, TurnRequest, test_cli_connection,
};
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Answers every stdin line with init, an assistant message and a result.
/// The first reply asks for a script; later ones do not.
const CONVERSING_AGENT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
printf '%s\n' "$@" > "$dir/args.txt"
echo "fake agent starting" >&2
n=0
while IFS= read -r line; do
  n=$((n+1))
  printf '%s\n' "$line" >> "$dir/stdin.txt"
  if [ "$n" = 1 ]; then text='Checking <run>print(1)</run>'; else text="Done after $n"; fi
  echo 'this line is not json'
  echo '{"type":"system","subtype":"init","session_id":"sess-42"}'
  echo '{"type":"assistant","session_id":"sess-42","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"tool_use","id":"t1","name":"Read","input":{"path":"a"}}]}}'
  echo "{\"type\":\"assistant\",\"session_id\":\"sess-42\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"$text\"}]}}"
  echo '{"type":"result","subtype":"success","is_error":false,"session_id":"sess-42","total_cost_usd":0.5,"num_turns":1,"usage":{"input_tokens":3,"output_tokens":2}}'
done
"#;

/// Reads input and never answers
const SILENT_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  sleep 30
done
"#;

/// Reports a failed run
const FAILING_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"model unavailable"}'
done
"#;

/// Exits as soon as the first message arrives
const VANISHING_AGENT: &str = r#"#!/bin/sh
read -r line
exit 0
"#;

/// Handles the one-shot `--print` connection check
const PRINTING_AGENT: &str = r#"#!/bin/sh
if [ "$1" != "--print" ]; then
  echo "unexpected arguments" >&2
  exit 2
fi
echo '{"type":"system","subtype":"init","session_id":"p"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello from the agent"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.01}'
"#;

fn write_agent(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("fake-cli");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn recorded_lines(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(name))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn options(response_timeout: u64) -> AgentOptions {
    AgentOptions::builder()
        .model("test-model")
        .max_turns(3)
        .response_timeout(response_timeout)
        .build()
        .unwrap()
}

fn request(input: &str) -> TurnRequest<'_> {
    TurnRequest {
        conversation: &[],
        input,
        system_prompt: "be brief",
    }
}

#[tokio::test]
async fn test_turns_share_one_process_and_session() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, CONVERSING_AGENT);

    let stderr = Arc::new(Mutex::new(Vec::new()));
    let sink = stderr.clone();
    let mut transport = CliTransport::new(&path, options(10), Interrupt::new())
        .with_stderr_sink(move |line| sink.lock().push(line.to_string()));
    assert_eq!(transport.kind(), TransportKind::Subprocess);
    assert_eq!(transport.session_id(), None);

    let mut events = Vec::new();
    let reply = transport
        .run_turn(request("first"), &mut |e: TurnEvent| events.push(e))
        .await
        .unwrap();
    assert_eq!(reply.text(), "Checking <run>print(1)</run>");
    assert_eq!(reply.content.len(), 3);
    assert_eq!(transport.session_id(), Some("sess-42"));
    assert_eq!(
        events,
        vec![
            TurnEvent::Thinking("hmm".into()),
            TurnEvent::ToolUse {
                name: "Read".into(),
                detail: r#"{"path":"a"}"#.into()
            },
            TurnEvent::Text("Checking <run>print(1)</run>".into()),
        ]
    );

    let reply = transport
        .run_turn(request("second"), &mut |_: TurnEvent| {})
        .await
        .unwrap();
    assert_eq!(reply.text(), "Done after 2");
    assert!(transport.is_connected());

    assert_eq!(transport.estimate_cost(), Some(1.0));
    assert_eq!(transport.total_usage().total(), 10);

    transport.close().await.unwrap();
    assert!(!transport.is_connected());

    let sent: Vec<Value> = recorded_lines(dir.path(), "stdin.txt")
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["type"], "user");
    assert_eq!(sent[0]["message"]["content"], "first");
    assert_eq!(sent[0]["session_id"], "default");
    assert_eq!(sent[1]["session_id"], "sess-42");
    assert!(sent[1]["parent_tool_use_id"].is_null());

    let args = recorded_lines(dir.path(), "args.txt");
    assert!(args.windows(2).any(|w| w == ["--append-system-prompt", "be brief"]));
    assert!(args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
    assert!(!args.contains(&"--resume".to_string()));

    assert_eq!(*stderr.lock(), vec!["fake agent starting"]);
}

#[tokio::test]
async fn test_changed_prompt_respawns_with_resume() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, CONVERSING_AGENT);
    let mut transport = CliTransport::new(&path, options(10), Interrupt::new());

    transport.run_turn(request("first"), &mut |_: TurnEvent| {}).await.unwrap();

    let changed = TurnRequest {
        system_prompt: "be verbose",
        ..request("second")
    };
    transport.run_turn(changed, &mut |_: TurnEvent| {}).await.unwrap();
    transport.close().await.unwrap();

    let args = recorded_lines(dir.path(), "args.txt");
    assert!(args.windows(2).any(|w| w == ["--resume", "sess-42"]));
    assert!(args.windows(2).any(|w| w == ["--append-system-prompt", "be verbose"]));
}

#[tokio::test]
async fn test_silent_agent_times_out() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, SILENT_AGENT);
    let mut transport = CliTransport::new(&path, options(1), Interrupt::new());

    let err = transport.run_turn(request("hi"), &mut |_: TurnEvent| {}).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_cancel_interrupts_waiting_turn() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, SILENT_AGENT);
    let interrupt = Interrupt::new();
    let mut transport = CliTransport::new(&path, options(30), interrupt.clone());

    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
    });

    let started = std::time::Instant::now();
    let err = transport.run_turn(request("hi"), &mut |_: TurnEvent| {}).await.unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_error_result_is_api_error() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, FAILING_AGENT);
    let mut transport = CliTransport::new(&path, options(10), Interrupt::new());

    let err = transport.run_turn(request("hi"), &mut |_: TurnEvent| {}).await.unwrap_err();
    assert!(matches!(err, Error::Api(ref m) if m == "model unavailable"), "{err:?}");
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_output_is_transport_error() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, VANISHING_AGENT);
    let mut transport = CliTransport::new(&path, options(10), Interrupt::new());

    let err = transport.run_turn(request("hi"), &mut |_: TurnEvent| {}).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err:?}");
}

#[tokio::test]
async fn test_connection_check_uses_print_mode() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, PRINTING_AGENT);

    let reply = test_cli_connection(&path).await.unwrap();
    assert_eq!(reply, "Hello from the agent");
}

#[tokio::test]
async fn test_agent_uses_cli_for_ambient_credentials() {
    let dir = TempDir::new().unwrap();
    let path = write_agent(&dir, CONVERSING_AGENT);

    let options = AgentOptions::builder()
        .model("test-model")
        .max_turns(4)
        .cli_path(&path)
        .build()
        .unwrap();
    let callback = Arc::new(CollectingCallback::new());
    let mut agent = Agent::new(options, callback.clone(), |code: &str| {
        ScriptResult::success(format!("output of {code}"))
    })
    .unwrap();

    agent.connect(None).await.unwrap();
    assert!(agent.is_cli_mode());

    let result = agent.process_message("run something").await;
    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.turns_used, 2);
    assert_eq!(result.response, "Checking \n\nDone after 2");
    assert_eq!(result.cost, Some(1.0));
    assert_eq!(agent.session_id(), Some("sess-42"));
    agent.disconnect().await.unwrap();

    let sent: Vec<Value> = recorded_lines(dir.path(), "stdin.txt")
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[1]["message"]["content"],
        "Script execution results:\n\n```\noutput of print(1)\n```\n\n"
    );
}
