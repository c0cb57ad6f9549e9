use fingraph_agent::{IntentClassifier, PipelineBuilder, RuleBasedQueryParser, StageKind};
use fingraph_core::config::AppConfig;
use fingraph_core::reducer::{self, REDUCER_TABLE};

use crate::offline::OfflineAgent;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) -> bool {
    let checks = vec![
        check_config(config),
        check_reducers(),
        check_graph(config),
        check_aliases(config),
        check_keywords(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count == 0
}

fn check_config(config: &AppConfig) -> CheckResult {
    match config.validate() {
        Ok(()) => CheckResult {
            label: "Config".into(),
            ok: true,
            detail: format!(
                "parallel={} conditional={} max_fanout={}",
                config.workflow.enable_parallel,
                config.workflow.enable_conditional,
                config.workflow.max_fanout
            ),
        },
        Err(e) => CheckResult {
            label: "Config".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_reducers() -> CheckResult {
    match reducer::validate_table(REDUCER_TABLE) {
        Ok(()) => CheckResult {
            label: "Reducers".into(),
            ok: true,
            detail: format!("{} fields covered", REDUCER_TABLE.len()),
        },
        Err(e) => CheckResult {
            label: "Reducers".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_graph(config: &AppConfig) -> CheckResult {
    let builder = [
        StageKind::Analysis,
        StageKind::Filing,
        StageKind::Comparison,
        StageKind::Trend,
        StageKind::Reporting,
    ]
    .into_iter()
    .fold(
        PipelineBuilder::new(config.workflow.clone())
            .classifier(IntentClassifier::new(&config.classifier))
            .research(OfflineAgent::arc(StageKind::Research)),
        |b, kind| {
            let cap = OfflineAgent::arc(kind);
            match kind {
                StageKind::Analysis => b.analysis(cap),
                StageKind::Filing => b.filing(cap),
                StageKind::Comparison => b.comparison(cap),
                StageKind::Trend => b.trend(cap),
                _ => b.reporting(cap),
            }
        },
    );

    match builder.build() {
        Ok(graph) => CheckResult {
            label: "Graph".into(),
            ok: true,
            detail: format!("{} steps", graph.steps().len()),
        },
        Err(e) => CheckResult {
            label: "Graph".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_aliases(config: &AppConfig) -> CheckResult {
    let bad: Vec<&String> = config
        .parser
        .company_aliases
        .iter()
        .filter(|(_, ticker)| {
            ticker.is_empty() || ticker.len() > 5 || !ticker.chars().all(|c| c.is_ascii_alphabetic())
        })
        .map(|(name, _)| name)
        .collect();

    if bad.is_empty() {
        let parser = RuleBasedQueryParser::new(&config.parser);
        let sample = parser.extract_symbols("Analyze apple stock");
        CheckResult {
            label: "Aliases".into(),
            ok: true,
            detail: format!(
                "{} custom, sample -> {:?}",
                config.parser.company_aliases.len(),
                sample
            ),
        }
    } else {
        CheckResult {
            label: "Aliases".into(),
            ok: false,
            detail: format!("invalid ticker for: {:?}", bad),
        }
    }
}

fn check_keywords(config: &AppConfig) -> CheckResult {
    let c = &config.classifier;
    let blank = [
        &c.extra_comparison_keywords,
        &c.extra_trend_keywords,
        &c.extra_filing_keywords,
        &c.extra_comprehensive_keywords,
    ]
    .iter()
    .flat_map(|list| list.iter())
    .filter(|k| k.trim().is_empty())
    .count();

    CheckResult {
        label: "Keywords".into(),
        ok: blank == 0,
        detail: if blank == 0 {
            "extra keyword lists are clean".into()
        } else {
            format!("{} blank keyword(s)", blank)
        },
    }
}
