use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FingraphError, Result};

/// Top-level fingraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Fan research out per symbol when more than one symbol is present.
    #[serde(default = "default_true")]
    pub enable_parallel: bool,
    /// Insert the intent-routing node in front of the optional stages.
    #[serde(default = "default_true")]
    pub enable_conditional: bool,
    /// Run fan-out branches concurrently. `false` runs them in declared order;
    /// results are identical either way.
    #[serde(default = "default_true")]
    pub concurrent_fanout: bool,
    /// Cap on concurrently running branches of a single fan-out.
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
    /// Capacity of the progress event channel.
    #[serde(default = "default_progress_channel_capacity")]
    pub progress_channel_capacity: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            enable_parallel: true,
            enable_conditional: true,
            concurrent_fanout: true,
            max_fanout: default_max_fanout(),
            progress_channel_capacity: default_progress_channel_capacity(),
        }
    }
}

fn default_true() -> bool { true }
fn default_max_fanout() -> usize { 8 }
fn default_progress_channel_capacity() -> usize { 64 }

/// Intent classifier tuning. Extra keywords are appended to the built-in lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Run the refinement pass when a refiner is supplied.
    #[serde(default = "default_true")]
    pub enable_refinement: bool,
    #[serde(default)]
    pub extra_comparison_keywords: Vec<String>,
    #[serde(default)]
    pub extra_trend_keywords: Vec<String>,
    #[serde(default)]
    pub extra_filing_keywords: Vec<String>,
    #[serde(default)]
    pub extra_comprehensive_keywords: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enable_refinement: true,
            extra_comparison_keywords: vec![],
            extra_trend_keywords: vec![],
            extra_filing_keywords: vec![],
            extra_comprehensive_keywords: vec![],
        }
    }
}

/// Rule-based query parser tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Company name (lowercase) to ticker, merged over the built-in aliases.
    #[serde(default)]
    pub company_aliases: BTreeMap<String, String>,
    /// Uppercase words never treated as tickers, added to the built-in list.
    #[serde(default)]
    pub stop_words: Vec<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FingraphError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| FingraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow.max_fanout == 0 {
            return Err(FingraphError::Config("workflow.max_fanout must be at least 1".into()));
        }
        if self.workflow.progress_channel_capacity == 0 {
            return Err(FingraphError::Config(
                "workflow.progress_channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
