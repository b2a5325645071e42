//! The host capability that actually runs extracted scripts
//!
//! The agent only calls [`ScriptExecutor::execute`] synchronously, one
//! directive at a time. Executors may block: on a multi-thread runtime the
//! call runs under [`tokio::task::block_in_place`] so other tasks keep
//! running. A current-thread runtime has no spare worker, so there the call
//! blocks the runtime for its duration. If the host needs scripts to run on a
//! particular thread, the implementation is responsible for getting them there.

use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};

/// Outcome of running one script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub elapsed: Duration,
}

impl ScriptResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Default::default()
        }
    }

    /// Attaches partial output produced before a failure
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Text fed back to the model for this script
    pub fn feedback_text(&self) -> String {
        if self.success {
            return self.output.clone();
        }
        let error = format!("Error: {}", self.error);
        if self.output.is_empty() {
            error
        } else {
            format!("{}\n{}", self.output, error)
        }
    }
}

/// Runs script bodies extracted from model output
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, code: &str) -> ScriptResult;
}

impl<F> ScriptExecutor for F
where
    F: Fn(&str) -> ScriptResult + Send + Sync,
{
    fn execute(&self, code: &str) -> ScriptResult {
        self(code)
    }
}

/// Runs `executor` and fills in `elapsed` if the executor left it at zero
pub(crate) fn timed_execute(executor: &dyn ScriptExecutor, code: &str) -> ScriptResult {
    let started = Instant::now();
    let run = || executor.execute(code);
    let result = match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(run)
        }
        _ => run(),
    };
    if result.elapsed.is_zero() {
        result.with_elapsed(started.elapsed())
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_feedback_text() {
        assert_eq!(ScriptResult::success("2").feedback_text(), "2");
        assert_eq!(
            ScriptResult::failure("NameError: x").feedback_text(),
            "Error: NameError: x"
        );
        assert_eq!(
            ScriptResult::failure("boom")
                .with_output("partial")
                .feedback_text(),
            "partial\nError: boom"
        );
    }

    #[test]
    fn test_closure_executor() {
        let executor = |code: &str| ScriptResult::success(code.to_uppercase());
        let result = timed_execute(&executor, "abc");
        assert!(result.success);
        assert_eq!(result.output, "ABC");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_script_leaves_runtime_responsive() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let seen = ticks.clone();
        let script = tokio::spawn(async move {
            let executor = |_: &str| {
                std::thread::sleep(Duration::from_millis(300));
                ScriptResult::success("done")
            };
            let result = timed_execute(&executor, "sleep");
            (result, seen.load(Ordering::SeqCst))
        });

        let (result, ticks_during) = script.await.unwrap();
        ticker.abort();
        assert_eq!(result.output, "done");
        assert!(result.elapsed >= Duration::from_millis(300));
        assert!(ticks_during > 0, "runtime stalled while the script ran");
    }

    #[test]
    fn test_elapsed_preserved_when_set() {
        let executor =
            |_: &str| ScriptResult::success("").with_elapsed(Duration::from_secs(7));
        assert_eq!(
            timed_execute(&executor, "x").elapsed,
            Duration::from_secs(7)
        );
    }
}
