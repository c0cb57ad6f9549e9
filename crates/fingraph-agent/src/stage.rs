use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, warn};

use fingraph_core::error::FingraphError;
use fingraph_core::state::StateRecord;
use fingraph_core::traits::{AgentCapability, ProgressObserver};

/// How a stage run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    /// Recoverable; the message was appended to `errors` and the graph continues.
    Failed(String),
    /// The remaining graph must not run.
    Fatal(String),
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Output of one stage run.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub state: StateRecord,
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

/// Uniform wrapper around an agent capability.
///
/// Validates input, reports progress, and converts every capability failure
/// (including panics) into an entry in `errors`. A stage run never returns an
/// error to its caller.
#[derive(Clone)]
pub struct AgentStage {
    name: String,
    capability: Arc<dyn AgentCapability>,
    tasks: Vec<String>,
}

impl fmt::Debug for AgentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentStage")
            .field("name", &self.name)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl AgentStage {
    pub fn new(capability: Arc<dyn AgentCapability>) -> Self {
        Self {
            name: capability.name().to_string(),
            capability,
            tasks: vec![],
        }
    }

    /// Task descriptions announced in the start notification.
    pub fn with_tasks(mut self, tasks: Vec<String>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Run the capability on `state`.
    ///
    /// Passing no observer suppresses notifications, which fan-out uses to
    /// report a group of runs as a single stage.
    pub async fn run(&self, state: StateRecord, observer: Option<&dyn ProgressObserver>) -> StageRun {
        let start = Instant::now();

        if let Err(e) = state.validate_required() {
            error!(stage = %self.name, error = %e, "Stage input failed validation");
            let mut state = state;
            state.push_fatal(&e);
            if let Some(observer) = observer {
                observer.on_fail(&self.name, &e.to_string());
            }
            return StageRun {
                state,
                outcome: StageOutcome::Fatal(e.to_string()),
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
        }

        if let Some(observer) = observer {
            observer.on_start(&self.name, &self.tasks);
        }

        let input = state.clone();
        let result = AssertUnwindSafe(self.capability.execute(state))
            .catch_unwind()
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let (state, outcome) = match result {
            Ok(Ok(mut output)) => {
                output.touch();
                debug!(stage = %self.name, elapsed_ms, "Stage complete");
                (output, StageOutcome::Succeeded)
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!(stage = %self.name, error = %e, "Stage failed fatally");
                let mut state = input;
                state.push_fatal(&e);
                (state, StageOutcome::Fatal(e.to_string()))
            }
            Ok(Err(e)) => {
                let message = self.error_message(&e);
                warn!(stage = %self.name, error = %e, elapsed_ms, "Stage failed");
                let mut state = input;
                state.push_error(message.clone());
                (state, StageOutcome::Failed(message))
            }
            Err(payload) => {
                let message = format!("{}: panicked: {}", self.name, panic_message(&*payload));
                error!(stage = %self.name, "{}", message);
                let mut state = input;
                state.push_error(message.clone());
                (state, StageOutcome::Failed(message))
            }
        };

        if let Some(observer) = observer {
            match &outcome {
                StageOutcome::Succeeded => observer.on_complete(&self.name),
                StageOutcome::Failed(msg) | StageOutcome::Fatal(msg) => {
                    observer.on_fail(&self.name, msg)
                }
            }
        }

        StageRun {
            state,
            outcome,
            elapsed_ms,
        }
    }

    fn error_message(&self, err: &FingraphError) -> String {
        let message = err.to_string();
        if message.starts_with(&format!("{}:", self.name)) {
            message
        } else {
            format!("{}: {}", self.name, message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
