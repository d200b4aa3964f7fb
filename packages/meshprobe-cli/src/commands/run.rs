use crate::cli::RunArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use meshprobe::ExperimentRunner;

pub async fn execute(args: RunArgs) -> i32 {
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let plan = config.plan();
    if !args.quiet {
        eprintln!("Running {} experiment from {}...", plan.kind, args.config);
        for (node, source) in config.connected_nodes() {
            eprintln!("  {} (node {}): {}", node.name, node.node_id, source.describe());
        }
        eprintln!(
            "  Points: {}, trials per point: {}, total: {}",
            plan.points.len(),
            plan.trials_per_point,
            plan.total_trials
        );
    }

    let runner = match ExperimentRunner::new(config) {
        Ok(runner) => runner.record_transcript(args.transcript),
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    let cancel = runner.cancellation_token();
    let quiet = args.quiet;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if !quiet {
                eprintln!("Interrupted, stopping after the current trial...");
            }
            cancel.cancel();
        }
    });

    let report = match runner.run().await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::for_error(&e);
        }
    };

    match output::to_json(&report, args.compact) {
        Ok(json) => {
            if let Err(e) = output::write_output(&json, args.output.as_deref()) {
                eprintln!("Error: {}", e);
                return exit_codes::EXECUTION_ERROR;
            }
        }
        Err(e) => {
            eprintln!("Error serializing report: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    }

    if !args.quiet {
        eprintln!();
        eprint!("{}", output::format_summary_table(&report));
        if let Some(ref path) = args.output {
            eprintln!("\nReport written to {}", path);
        }
    }

    if report.cancelled {
        exit_codes::INTERRUPTED
    } else {
        exit_codes::SUCCESS
    }
}
