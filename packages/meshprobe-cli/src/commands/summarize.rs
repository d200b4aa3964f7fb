use crate::cli::SummarizeArgs;
use crate::exit_codes;
use crate::output;
use meshprobe::{ExperimentReport, PointSummary};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct SummarizeOutput {
    file: String,
    id: String,
    experiment: String,
    cancelled: bool,
    total_trials: usize,
    successful_trials: usize,
    /// Stored summaries match the ones recomputed from the trials
    consistent: bool,
    summaries: Vec<PointSummary>,
}

pub fn execute(args: SummarizeArgs) -> i32 {
    let files = match resolve_reports(&args.reports) {
        Ok(files) => files,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    if files.is_empty() {
        eprintln!("Error: No matching report files found");
        return exit_codes::INPUT_ERROR;
    }

    let loaded: Vec<(String, Result<ExperimentReport, String>)> = files
        .par_iter()
        .map(|file| {
            let report = ExperimentReport::from_json_file(Path::new(file)).map_err(|e| e.to_string());
            (file.clone(), report)
        })
        .collect();

    let mut outputs = Vec::new();
    let mut failed = 0;
    for (file, report) in loaded {
        let mut report = match report {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Error: {}: {}", file, e);
                failed += 1;
                continue;
            }
        };

        let consistent = report.summaries_consistent();
        if !consistent {
            log::warn!("{}: stored summaries differ from the trial records", file);
        }
        report.recompute_summaries();

        if !args.json {
            println!("{}", file);
            print!("{}", output::format_summary_table(&report));
            println!();
        }

        outputs.push(SummarizeOutput {
            file,
            id: report.id.to_string(),
            experiment: report.experiment.clone(),
            cancelled: report.cancelled,
            total_trials: report.total_trials(),
            successful_trials: report.successful_trials(),
            consistent,
            summaries: report.summaries,
        });
    }

    if args.json {
        match output::to_json(&outputs, false) {
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
    }

    if failed == 0 {
        exit_codes::SUCCESS
    } else {
        exit_codes::INPUT_ERROR
    }
}

/// Expand each argument: existing files are taken as is, anything else is a glob pattern
fn resolve_reports(patterns: &[String]) -> Result<Vec<String>, String> {
    let mut files = Vec::new();
    for pattern in patterns {
        if Path::new(pattern).is_file() {
            files.push(pattern.clone());
            continue;
        }
        files.extend(resolve_glob(pattern)?);
    }
    files.dedup();
    Ok(files)
}

fn resolve_glob(pattern: &str) -> Result<Vec<String>, String> {
    let paths = glob::glob(pattern)
        .map_err(|e| format!("Invalid glob pattern '{}': {}", pattern, e))?;

    let mut files: Vec<String> = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => {
                if path.is_file() {
                    if let Some(s) = path.to_str() {
                        files.push(s.to_string());
                    }
                }
            }
            Err(e) => {
                eprintln!("Warning: glob error: {}", e);
            }
        }
    }
    files.sort();
    Ok(files)
}
