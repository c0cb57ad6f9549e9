use std::io::Write;

use fingraph_agent::{IntentClassifier, PipelineBuilder, RuleBasedQueryParser};
use fingraph_core::config::AppConfig;
use fingraph_core::error::FingraphError;
use fingraph_test_utils::MockAgent;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[workflow]
enable_parallel = false
enable_conditional = true
concurrent_fanout = false
max_fanout = 4
progress_channel_capacity = 16

[classifier]
enable_refinement = false
extra_comparison_keywords = ["head to head"]
extra_trend_keywords = ["trajectory"]

[parser]
stop_words = ["IPO"]

[parser.company_aliases]
palantir = "PLTR"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert!(!config.workflow.enable_parallel);
    assert!(config.workflow.enable_conditional);
    assert!(!config.workflow.concurrent_fanout);
    assert_eq!(config.workflow.max_fanout, 4);
    assert_eq!(config.workflow.progress_channel_capacity, 16);
    assert!(!config.classifier.enable_refinement);
    assert_eq!(config.classifier.extra_comparison_keywords, vec!["head to head"]);
    assert_eq!(config.parser.company_aliases["palantir"], "PLTR");

    let parser = RuleBasedQueryParser::new(&config.parser);
    assert_eq!(
        parser.extract_symbols("Analyze palantir stock before the IPO"),
        vec!["PLTR"]
    );

    let classifier = IntentClassifier::new(&config.classifier);
    let c = classifier.classify_rules("PLTR head to head with SNOW", &["PLTR".into(), "SNOW".into()]);
    assert!(c.intent_flags.is_comparison);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FINGRAPH_TEST_MAX_FANOUT", "3");

    let toml_content = r#"
[workflow]
max_fanout = ${FINGRAPH_TEST_MAX_FANOUT}
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.workflow.max_fanout, 3);

    std::env::remove_var("FINGRAPH_TEST_MAX_FANOUT");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"# empty\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert!(config.workflow.enable_parallel);
    assert!(config.workflow.enable_conditional);
    assert!(config.workflow.concurrent_fanout);
    assert_eq!(config.workflow.max_fanout, 8);
    assert_eq!(config.workflow.progress_channel_capacity, 64);
    assert!(config.classifier.enable_refinement);
    assert!(config.parser.stop_words.is_empty());
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/fingraph.toml")).unwrap_err();
    assert!(matches!(err, FingraphError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_are_rejected() {
    let toml_content = r#"
[workflow]
progress_channel_capacity = 0
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(FingraphError::Config(_))
    ));

    let err = AppConfig::from_toml("[workflow]\nmax_fanout = \"lots\"\n").unwrap_err();
    assert!(matches!(err, FingraphError::Config(_)));
}

#[test]
fn test_loaded_config_drives_graph_shape() {
    let config = AppConfig::from_toml("[workflow]\nenable_conditional = false\n").expect("parse");
    let graph = PipelineBuilder::new(config.workflow.clone())
        .research(MockAgent::research().into_arc())
        .trend(MockAgent::trend().into_arc())
        .build()
        .expect("build");
    assert!(!graph.contains("route"));
    assert_eq!(graph.steps().len(), 2);
}
