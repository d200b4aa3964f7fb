use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use meshprobe::{ExperimentConfig, ExperimentPlan, ProbeError};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct ValidateOutput {
    config: String,
    valid: bool,
    nodes: Vec<NodeOutput>,
    plan: Option<ExperimentPlan>,
    error: Option<String>,
}

#[derive(Serialize)]
struct NodeOutput {
    name: String,
    node_id: u64,
    source: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let (result, code) = match check(&args.config) {
        Ok(config) => (
            ValidateOutput {
                config: args.config.clone(),
                valid: true,
                nodes: config
                    .nodes
                    .iter()
                    .map(|n| NodeOutput {
                        name: n.name.to_string(),
                        node_id: n.node_id,
                        source: n.source.as_ref().map(|s| s.describe()),
                    })
                    .collect(),
                plan: Some(config.plan()),
                error: None,
            },
            exit_codes::SUCCESS,
        ),
        Err(e) => (
            ValidateOutput {
                config: args.config.clone(),
                valid: false,
                nodes: Vec::new(),
                plan: None,
                error: Some(e.to_string()),
            },
            exit_codes::for_error(&e),
        ),
    };

    if args.json {
        match output::to_json(&result, false) {
            Ok(json) => {
                if let Err(e) = output::write_output(&json, None) {
                    eprintln!("Error: {}", e);
                    return exit_codes::EXECUTION_ERROR;
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::EXECUTION_ERROR;
            }
        }
    } else if let Some(ref err) = result.error {
        eprintln!("Error: {}", err);
    } else if let Some(ref plan) = result.plan {
        println!("Config '{}' is valid ({} experiment)\n", args.config, plan.kind);
        println!("  {:<16} {:<12} {:<32}", "Node", "Id", "Source");
        println!("  {}", "-".repeat(60));
        for node in &result.nodes {
            println!(
                "  {:<16} {:<12} {:<32}",
                node.name,
                node.node_id,
                node.source.as_deref().unwrap_or("(addressed only)")
            );
        }
        println!();
        println!(
            "Plan: {} points x {} trials = {} trials, at least {:.1} s of pacing",
            plan.points.len(),
            plan.trials_per_point,
            plan.total_trials,
            plan.min_duration_ms as f64 / 1000.0
        );
        for key in &plan.points {
            println!("  {}", key);
        }
    }

    code
}

fn check(path: &str) -> Result<ExperimentConfig, ProbeError> {
    let path = Path::new(path);
    if !path.is_file() {
        return Err(ProbeError::InvalidConfig(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let config = ExperimentConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}
