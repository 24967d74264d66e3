use crate::error::{ProvisionerError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A single step of a [`Chain`]: a forward action and the rollback
/// that undoes it.
#[async_trait]
pub trait Runner<O>: Send {
    /// Stable name, used to key this runner's output in the chain.
    fn name(&self) -> &str;

    /// Do the work. On error the chain fails (after retries) and
    /// rolls back.
    async fn run(&mut self) -> Result<O>;

    /// Undo whatever `run` did.
    async fn rollback(&mut self) -> Result<()>;
}

/// Outputs published by the runners of a chain, keyed by runner name.
///
/// Later runners (and observers of the chain) hold a clone of this
/// handle; writers take the write side only to publish an entry.
pub struct ChainOutputs<O> {
    map: RwLock<HashMap<String, O>>,
}

impl<O: Clone> ChainOutputs<O> {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// The output of a previously executed runner, if any.
    pub fn get(&self, name: &str) -> Option<O> {
        self.map.read().get(name).cloned()
    }

    pub(crate) fn publish(&self, name: &str, output: O) {
        self.map.write().insert(name.to_string(), output);
    }
}

/// An ordered set of runners executed sequentially with retry, and
/// rolled back in reverse order when a step ultimately fails.
///
/// A chain executes at most once. The forward error of the failing
/// step is the chain error; the last rollback error (if any) is kept
/// separately so neither masks the other.
pub struct Chain<O> {
    max_retry_on_error: u32,
    sleep_before_retry: Duration,
    runners: Vec<Box<dyn Runner<O>>>,
    outputs: Arc<ChainOutputs<O>>,
    rollback_error: Option<ProvisionerError>,
    done: bool,
}

impl<O: Clone + Send + Sync> Chain<O> {
    /// `retries` is how many times a runner is retried on error (so
    /// each runner gets `retries + 1` attempts); `retry_sleep` is the
    /// pause between attempts.
    pub fn new(retries: u32, retry_sleep: Duration) -> Self {
        Self {
            max_retry_on_error: retries,
            sleep_before_retry: retry_sleep,
            runners: Vec::new(),
            outputs: Arc::new(ChainOutputs::new()),
            rollback_error: None,
            done: false,
        }
    }

    /// Handle for reading runner outputs; valid to hand to runners
    /// appended later so they can reference their predecessors.
    pub fn outputs(&self) -> Arc<ChainOutputs<O>> {
        Arc::clone(&self.outputs)
    }

    /// Append a runner. Fails once the chain has executed.
    pub fn append(&mut self, runner: Box<dyn Runner<O>>) -> Result<()> {
        if self.done {
            return Err(ProvisionerError::ChainAlreadyExecuted);
        }
        self.runners.push(runner);
        Ok(())
    }

    /// Run the chain exactly once.
    pub async fn execute(&mut self) -> Result<()> {
        if self.done {
            return Err(ProvisionerError::ChainAlreadyExecuted);
        }
        let mut seen = HashSet::new();
        for runner in &self.runners {
            if !seen.insert(runner.name().to_string()) {
                return Err(ProvisionerError::DuplicateRunnerName {
                    name: runner.name().to_string(),
                });
            }
        }
        self.done = true;

        let mut failed_step = None;
        for step in 0..self.runners.len() {
            match self.run_with_retry(step).await {
                Ok(output) => {
                    let name = self.runners[step].name().to_string();
                    self.outputs.publish(&name, output);
                }
                Err(e) => {
                    failed_step = Some((step, e));
                    break;
                }
            }
        }

        let (step, err) = match failed_step {
            None => return Ok(()),
            Some(failure) => failure,
        };

        // Unwind the runners that completed before the failure.
        for completed in (0..step).rev() {
            if let Err(e) = self.rollback_with_retry(completed).await {
                warn!(
                    "rollback of step '{}' failed: {}",
                    self.runners[completed].name(),
                    e
                );
                self.rollback_error = Some(e);
            }
        }

        Err(err)
    }

    /// The last rollback error, when execution failed and unwinding
    /// did not fully succeed either.
    pub fn rollback_error(&self) -> Option<&ProvisionerError> {
        self.rollback_error.as_ref()
    }

    async fn run_with_retry(&mut self, step: usize) -> Result<O> {
        let mut last_err = None;
        for try_number in 0..=self.max_retry_on_error {
            match self.runners[step].run().await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    debug!(
                        "step '{}' failed on try {}: {}",
                        self.runners[step].name(),
                        try_number + 1,
                        e
                    );
                    last_err = Some(e);
                    if try_number < self.max_retry_on_error {
                        tokio::time::sleep(self.sleep_before_retry).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProvisionerError::internal("runner failed without error")))
    }

    async fn rollback_with_retry(&mut self, step: usize) -> Result<()> {
        let mut last_err = None;
        for try_number in 0..=self.max_retry_on_error {
            match self.runners[step].rollback().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if try_number < self.max_retry_on_error {
                        tokio::time::sleep(self.sleep_before_retry).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProvisionerError::internal("rollback failed without error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted runner for exercising the executor: logs every call
    /// and fails `fail_runs` times before succeeding (or always, if
    /// `fail_runs` is large).
    struct ScriptedRunner {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_runs: u32,
        runs: u32,
        fail_rollback: bool,
    }

    impl ScriptedRunner {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                fail_runs: 0,
                runs: 0,
                fail_rollback: false,
            }
        }

        fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>, fail_runs: u32) -> Self {
            Self {
                fail_runs,
                ..Self::new(name, log)
            }
        }
    }

    #[async_trait]
    impl Runner<String> for ScriptedRunner {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&mut self) -> Result<String> {
            self.runs += 1;
            self.log.lock().push(format!("run:{}", self.name));
            if self.runs <= self.fail_runs {
                return Err(ProvisionerError::internal(format!("{} failed", self.name)));
            }
            Ok(format!("{}-output", self.name))
        }

        async fn rollback(&mut self) -> Result<()> {
            self.log.lock().push(format!("rollback:{}", self.name));
            if self.fail_rollback {
                return Err(ProvisionerError::internal(format!(
                    "{} rollback failed",
                    self.name
                )));
            }
            Ok(())
        }
    }

    fn quick_chain() -> Chain<String> {
        Chain::new(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_runs_in_order_and_publishes_outputs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = quick_chain();
        chain.append(Box::new(ScriptedRunner::new("a", &log))).unwrap();
        chain.append(Box::new(ScriptedRunner::new("b", &log))).unwrap();
        let outputs = chain.outputs();

        chain.execute().await.unwrap();

        assert_eq!(*log.lock(), vec!["run:a", "run:b"]);
        assert_eq!(outputs.get("a").as_deref(), Some("a-output"));
        assert_eq!(outputs.get("b").as_deref(), Some("b-output"));
        assert!(chain.rollback_error().is_none());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = quick_chain();
        chain
            .append(Box::new(ScriptedRunner::failing("flaky", &log, 2)))
            .unwrap();

        chain.execute().await.unwrap();

        // three attempts total: two failures, one success
        assert_eq!(log.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_completed_steps_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = quick_chain();
        chain.append(Box::new(ScriptedRunner::new("a", &log))).unwrap();
        chain.append(Box::new(ScriptedRunner::new("b", &log))).unwrap();
        chain
            .append(Box::new(ScriptedRunner::failing("c", &log, u32::MAX)))
            .unwrap();

        let err = chain.execute().await.unwrap_err();
        assert!(err.to_string().contains("c failed"));

        let entries = log.lock().clone();
        // a, b once each; c attempted three times; then rollback of b
        // and a (not of the failed step itself), in reverse order.
        assert_eq!(
            entries,
            vec![
                "run:a",
                "run:b",
                "run:c",
                "run:c",
                "run:c",
                "rollback:b",
                "rollback:a"
            ]
        );
    }

    #[tokio::test]
    async fn test_rollback_error_does_not_mask_forward_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = quick_chain();
        let mut bad_rollback = ScriptedRunner::new("a", &log);
        bad_rollback.fail_rollback = true;
        chain.append(Box::new(bad_rollback)).unwrap();
        chain
            .append(Box::new(ScriptedRunner::failing("b", &log, u32::MAX)))
            .unwrap();

        let err = chain.execute().await.unwrap_err();
        assert!(err.to_string().contains("b failed"));

        let rollback_err = chain.rollback_error().expect("rollback error recorded");
        assert!(rollback_err.to_string().contains("a rollback failed"));
    }

    #[tokio::test]
    async fn test_chain_executes_at_most_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = quick_chain();
        chain.append(Box::new(ScriptedRunner::new("a", &log))).unwrap();
        chain.execute().await.unwrap();

        assert!(matches!(
            chain.execute().await,
            Err(ProvisionerError::ChainAlreadyExecuted)
        ));
        assert!(matches!(
            chain.append(Box::new(ScriptedRunner::new("b", &log))),
            Err(ProvisionerError::ChainAlreadyExecuted)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_runner_names_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = quick_chain();
        chain.append(Box::new(ScriptedRunner::new("a", &log))).unwrap();
        chain.append(Box::new(ScriptedRunner::new("a", &log))).unwrap();

        assert!(matches!(
            chain.execute().await,
            Err(ProvisionerError::DuplicateRunnerName { .. })
        ));
        // nothing ran
        assert!(log.lock().is_empty());
    }
}
