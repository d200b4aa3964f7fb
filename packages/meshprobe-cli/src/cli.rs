use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "meshprobe",
    version,
    about = "Mesh node latency, throughput and packet loss experiments",
    long_about = "Drive embedded mesh nodes over serial or TCP consoles, correlate their\n\
                  debug output with the commands sent, and report per-sweep statistics.\n\
                  Experiments are described by a JSON or YAML config file."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv). -vv logs every console line.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the experiment described by a config file
    Run(RunArgs),
    /// Check a config file and print the trial plan
    Validate(ValidateArgs),
    /// Recompute and print summaries of saved reports
    Summarize(SummarizeArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Experiment config (.json, .yaml, .yml)
    #[arg(long, env = "MESHPROBE_CONFIG")]
    pub config: String,

    /// Output file for the JSON report (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress and summary on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,

    /// Include every console line seen during the run in the report
    #[arg(long, default_value_t = false)]
    pub transcript: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Experiment config (.json, .yaml, .yml)
    #[arg(long, env = "MESHPROBE_CONFIG")]
    pub config: String,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct SummarizeArgs {
    /// Report files or glob patterns (e.g. "results/*.json")
    #[arg(required = true, num_args = 1..)]
    pub reports: Vec<String>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "meshprobe",
            "-vv",
            "run",
            "--config",
            "latency.yaml",
            "-o",
            "out.json",
            "--transcript",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.config, "latency.yaml");
                assert_eq!(args.output.as_deref(), Some("out.json"));
                assert!(args.transcript);
                assert!(!args.compact);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_summarize_requires_reports() {
        assert!(Cli::try_parse_from(["meshprobe", "summarize"]).is_err());
        let cli = Cli::try_parse_from(["meshprobe", "summarize", "a.json", "b/*.json"]).unwrap();
        match cli.command {
            Command::Summarize(args) => assert_eq!(args.reports.len(), 2),
            _ => panic!("expected summarize"),
        }
    }
}
