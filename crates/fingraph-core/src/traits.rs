use futures::future::BoxFuture;

use crate::error::Result;
use crate::state::StateRecord;
use crate::types::{IntentFlags, ParsedQuery, Refinement};

/// An agent: takes a state snapshot and returns an updated one.
///
/// Implementations wrap external collaborators (market-data providers,
/// model-backed summarizers, filing fetchers) and may fail. Best-effort side
/// work such as persistence must not turn into an `Err` here.
pub trait AgentCapability: Send + Sync + 'static {
    /// Stage name used in logs, progress events, error messages, and token usage.
    fn name(&self) -> &str;

    fn execute(&self, state: StateRecord) -> BoxFuture<'_, Result<StateRecord>>;
}

/// Query parser. May be model-backed.
pub trait QueryParsingCapability: Send + Sync + 'static {
    fn parse<'a>(
        &'a self,
        query: &'a str,
        context: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ParsedQuery>>;
}

/// Non-deterministic refinement pass run after the rule-based classifier.
pub trait ClassificationRefiner: Send + Sync + 'static {
    fn refine<'a>(
        &'a self,
        query: &'a str,
        symbols: &'a [String],
        rule_flags: &'a IntentFlags,
    ) -> BoxFuture<'a, Result<Refinement>>;
}

/// Receives stage lifecycle notifications.
///
/// Calls are fire-and-forget: implementations must return quickly, never
/// block, and never panic.
pub trait ProgressObserver: Send + Sync + 'static {
    fn on_start(&self, stage: &str, tasks: &[String]);

    fn on_complete(&self, stage: &str);

    fn on_fail(&self, stage: &str, error: &str);
}
