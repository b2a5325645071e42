//! Python Agent - scripts the model asks for are run with python3
//!
//! Reads questions from stdin, one per line. The model answers and, when it
//! needs to compute something, wraps Python in <run></run>; the output is
//! fed back until it gives a final answer. Ctrl-C cancels the current request.
//!
//! Usage:
//!     cargo run --example python_agent
//!     SCRIPT_AGENT_MODEL=claude-opus-4-20250514 cargo run --example python_agent

use anyhow::Context;
use script_agent::prelude::*;
use script_agent::{JsonlHistory, get_model};
use std::io::{BufRead, Write};
use std::process::Command;
use std::time::Instant;

const SYSTEM_PROMPT: &str = "\
You can run Python 3 by writing code between <run> and </run>. \
Only what the script prints is sent back to you. \
Use it for arithmetic, dates and anything else you would otherwise guess.";

/// Prints progress as it happens
struct ConsoleCallback;

impl AgentCallback for ConsoleCallback {
    fn on_turn_start(&self, turn: u32, max_turns: u32) {
        if turn > 1 {
            println!("\n--- turn {turn}/{max_turns} ---");
        }
    }

    fn on_text(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn on_tool_use(&self, name: &str, _detail: &str) {
        println!("\n[tool] {name}");
    }

    fn on_script_code(&self, code: &str) {
        println!("\n[run]\n{code}");
    }

    fn on_script_output(&self, output: &str) {
        println!("[output]\n{output}");
    }

    fn on_error(&self, message: &str) {
        eprintln!("\n[error] {message}");
    }

    fn on_result(&self, turns: u32, cost: Option<f64>) {
        match cost {
            Some(cost) => println!("\n\n({turns} turns, ${cost:.4} so far)"),
            None => println!("\n\n({turns} turns)"),
        }
    }
}

fn run_python(code: &str) -> ScriptResult {
    let started = Instant::now();
    let output = match Command::new("python3").args(["-c", code]).output() {
        Ok(output) => output,
        Err(e) => return ScriptResult::failure(format!("could not start python3: {e}")),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let result = if output.status.success() {
        ScriptResult::success(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        ScriptResult::failure(stderr).with_output(stdout)
    };
    result.with_elapsed(started.elapsed())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "script_agent=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = AgentOptions::builder()
        .system_prompt(SYSTEM_PROMPT)
        .model(get_model(None))
        .max_turns(8)
        .build()?;

    let history_dir = std::env::temp_dir().join("script-agent-history");
    let history = JsonlHistory::new(&history_dir).context("opening history log")?;
    println!("History: {}", history.session_path().display());

    let mut agent = Agent::new(options, ConsoleCallback, run_python)?.with_history(Box::new(history));
    agent
        .connect(None)
        .await
        .context("no CLI agent and no API credentials found")?;
    println!(
        "Connected ({} mode). Ask something, or an empty line to quit.",
        if agent.is_cli_mode() { "CLI" } else { "API" }
    );

    let handle = agent.handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            handle.request_cancel();
        }
    });

    let stdin = std::io::stdin();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }

        let result = agent.process_message(line.trim()).await;
        match result.outcome {
            Outcome::Success => {}
            Outcome::Cancelled => println!("(cancelled)"),
            Outcome::Error(ref error) => eprintln!("request failed: {error}"),
        }
    }

    let usage = agent.total_usage();
    println!(
        "Tokens: {} in, {} out",
        usage.input_tokens, usage.output_tokens
    );
    agent.disconnect().await?;
    Ok(())
}
