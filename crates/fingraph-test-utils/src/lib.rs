//! Mocks and fixtures shared by fingraph tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use fingraph_core::error::{FingraphError, Result};
use fingraph_core::reducer::FieldName;
use fingraph_core::state::StateRecord;
use fingraph_core::traits::{AgentCapability, ClassificationRefiner, ProgressObserver};
use fingraph_core::types::{Citation, IntentFlags, Refinement};

/// A fresh, valid state for `query` and `symbols`.
pub fn state(query: &str, symbols: &[&str]) -> StateRecord {
    StateRecord::new("test-session", query)
        .with_symbols(symbols.iter().map(|s| s.to_string()).collect())
}

enum Mode {
    Write,
    Fail(String),
    Fatal(String),
    Panic,
}

/// Configurable agent capability.
///
/// In write mode it adds one entry per symbol to its target field (or a
/// report), cites the source for each symbol, and records token usage.
pub struct MockAgent {
    name: String,
    target: FieldName,
    mode: Mode,
    delay: Option<Duration>,
    tokens: (u64, u64),
    calls: Arc<AtomicUsize>,
}

impl MockAgent {
    pub fn new(name: impl Into<String>, target: FieldName) -> Self {
        Self {
            name: name.into(),
            target,
            mode: Mode::Write,
            delay: None,
            tokens: (0, 0),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn research() -> Self {
        Self::new("ResearchAgent", FieldName::ResearchData).with_tokens(100, 20)
    }

    pub fn analyst() -> Self {
        Self::new("AnalystAgent", FieldName::AnalystData).with_tokens(80, 40)
    }

    pub fn edgar() -> Self {
        Self::new("EdgarAgent", FieldName::EdgarData)
    }

    pub fn comparison() -> Self {
        Self::new("ComparisonAgent", FieldName::ComparisonData).with_tokens(50, 10)
    }

    pub fn trend() -> Self {
        Self::new("TrendAgent", FieldName::TrendAnalysis)
    }

    pub fn reporting() -> Self {
        Self::new("ReportingAgent", FieldName::Report).with_tokens(200, 300)
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.mode = Mode::Fail(message.into());
        self
    }

    pub fn fatal(mut self, message: impl Into<String>) -> Self {
        self.mode = Mode::Fatal(message.into());
        self
    }

    pub fn panicking(mut self) -> Self {
        self.mode = Mode::Panic;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_tokens(mut self, prompt: u64, completion: u64) -> Self {
        self.tokens = (prompt, completion);
        self
    }

    /// Shared counter of `execute` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn into_arc(self) -> Arc<dyn AgentCapability> {
        Arc::new(self)
    }

    fn write(&self, mut state: StateRecord) -> StateRecord {
        let symbols = state.symbols.clone();
        if self.target == FieldName::Report {
            state.report = Some(format!(
                "# {}\n\nCovered: {}",
                state.query,
                symbols.join(", ")
            ));
        } else {
            for symbol in &symbols {
                let entry = json!({"symbol": symbol, "source": self.name});
                let map = match self.target {
                    FieldName::AnalystData => &mut state.analyst_data,
                    FieldName::EdgarData => &mut state.edgar_data,
                    FieldName::ComparisonData => &mut state.comparison_data,
                    FieldName::TrendAnalysis => &mut state.trend_analysis,
                    _ => &mut state.research_data,
                };
                map.insert(symbol.clone(), entry);
                state.add_citation(Citation::new(&self.name, symbol, self.target.as_str()));
            }
        }
        let (prompt, completion) = self.tokens;
        if prompt + completion > 0 {
            state.record_tokens(&self.name, prompt, completion);
        }
        state
    }
}

impl AgentCapability for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, state: StateRecord) -> BoxFuture<'_, Result<StateRecord>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.mode {
                Mode::Write => Ok(self.write(state)),
                Mode::Fail(msg) => Err(FingraphError::stage(&self.name, msg)),
                Mode::Fatal(msg) => Err(FingraphError::Validation(msg.clone())),
                Mode::Panic => panic!("{} exploded", self.name),
            }
        })
    }
}

/// One recorded observer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Start { stage: String, tasks: Vec<String> },
    Complete { stage: String },
    Fail { stage: String, error: String },
}

/// Observer that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stage names in start order.
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Start { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }

    pub fn failed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Fail { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Recorded) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_start(&self, stage: &str, tasks: &[String]) {
        self.push(Recorded::Start {
            stage: stage.to_string(),
            tasks: tasks.to_vec(),
        });
    }

    fn on_complete(&self, stage: &str) {
        self.push(Recorded::Complete {
            stage: stage.to_string(),
        });
    }

    fn on_fail(&self, stage: &str, error: &str) {
        self.push(Recorded::Fail {
            stage: stage.to_string(),
            error: error.to_string(),
        });
    }
}

/// Refiner returning a fixed refinement, or failing.
pub struct StaticRefiner {
    result: Option<Refinement>,
}

impl StaticRefiner {
    pub fn raising(flags: IntentFlags) -> Arc<Self> {
        Arc::new(Self {
            result: Some(Refinement {
                raise_flags: flags,
                ..Default::default()
            }),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { result: None })
    }
}

impl ClassificationRefiner for StaticRefiner {
    fn refine<'a>(
        &'a self,
        _query: &'a str,
        _symbols: &'a [String],
        _rule_flags: &'a IntentFlags,
    ) -> BoxFuture<'a, Result<Refinement>> {
        Box::pin(async move {
            self.result
                .clone()
                .ok_or_else(|| FingraphError::Classification("refiner unavailable".into()))
        })
    }
}
