use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Args, Parser, Subcommand};

/// Beban: ramping virtual users against an HTTP application
#[derive(Parser, Debug)]
#[command(name = "beban", author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v debug, -vv trace). `RUST_LOG` takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scenario file and judge it against its thresholds
    Run(RunArgs),

    /// Parse and compile a scenario file without sending any request
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scenario file (YAML)
    pub file: PathBuf,

    /// Replace the file's stages with this many VUs, started immediately
    #[arg(long, requires = "duration", value_parser = clap::value_parser!(u32).range(1..))]
    pub vus: Option<u32>,

    /// How long to hold `--vus`, e.g. `30s` or `1m30s`
    #[arg(long, requires = "vus", value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Also write the summary as JSON to this file
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Override the file's base url
    #[arg(long, env = "BEBAN_BASE_URL")]
    pub base_url: Option<String>,

    /// Override the run seed
    #[arg(long, env = "BEBAN_SEED")]
    pub seed: Option<u64>,

    /// Ignore the file's thresholds; the run always passes unless cancelled
    #[arg(long)]
    pub no_thresholds: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Scenario file (YAML)
    pub file: PathBuf,
}

impl Cli {
    /// Filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, error::ErrorKind};

    use super::*;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "beban",
            "-vv",
            "run",
            "login.yaml",
            "--vus",
            "5",
            "--duration",
            "1m30s",
            "--seed",
            "42",
            "--out",
            "summary.json",
        ])
        .unwrap();

        assert_eq!(cli.log_filter(), "trace");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.file, PathBuf::from("login.yaml"));
        assert_eq!(args.vus, Some(5));
        assert_eq!(args.duration, Some(Duration::from_secs(90)));
        assert_eq!(args.seed, Some(42));
        assert_eq!(args.out, Some(PathBuf::from("summary.json")));
        assert!(!args.no_thresholds);
    }

    #[test]
    fn vus_and_duration_go_together() {
        let err = Cli::try_parse_from(["beban", "run", "a.yaml", "--vus", "5"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

        let err =
            Cli::try_parse_from(["beban", "run", "a.yaml", "--duration", "10s"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn rejects_zero_vus_and_bad_durations() {
        assert!(
            Cli::try_parse_from(["beban", "run", "a.yaml", "--vus", "0", "--duration", "1s"])
                .is_err()
        );
        assert!(
            Cli::try_parse_from(["beban", "run", "a.yaml", "--vus", "1", "--duration", "soon"])
                .is_err()
        );
    }

    #[test]
    fn quiet_wins_the_default_filter() {
        let cli = Cli::try_parse_from(["beban", "-q", "validate", "a.yaml"]).unwrap();
        assert_eq!(cli.log_filter(), "error");
        assert!(Cli::try_parse_from(["beban", "-q", "-v", "validate", "a.yaml"]).is_err());
    }
}
