//! CLI argument definitions and parsing.
//!
//! Defines the command-line interface structure using clap:
//! - `Cli` - Main CLI entry point
//! - `Commands` - Available subcommands

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Backstage functions - run sandboxed JavaScript functions locally.
#[derive(Parser, Debug)]
#[command(name = "backstage")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (json, text, pretty)
    #[arg(long = "format", global = true, default_value = "pretty")]
    pub format: String,

    /// Log line format on stderr
    #[arg(long = "log-format", global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Configuration file (default: <config dir>/backstage/config.toml)
    #[arg(long, global = true, env = "BACKSTAGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Format of log lines written to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a function file once and print its response.
    ///
    /// The file must define `main(request, response)`. Without `--isolated`
    /// the function runs in this process; with it, in a disposable worker.
    ///
    /// # Examples
    ///
    /// ```bash
    /// backstage run hello.js --env NAME=world
    /// backstage run api.js --request req.json --allow path --isolated
    /// ```
    Run(RunArgs),

    /// Check a function file for syntax and load-time errors.
    Check {
        /// Function source file
        file: PathBuf,
    },

    /// Serve one invocation over stdin/stdout.
    ///
    /// Reads one JSON request line, writes one JSON response line and exits
    /// with 0 on success or 1 on failure. Used by `run --isolated`.
    Worker,

    /// Generate shell completions.
    Completions {
        /// Target shell for completion generation
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Arguments of `backstage run`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Function source file
    pub file: PathBuf,

    /// JSON file with `{method, headers, query, body}`
    #[arg(short, long)]
    pub request: Option<PathBuf>,

    /// Environment variables in KEY=VALUE format
    #[arg(short, long = "env", num_args = 1)]
    pub env: Vec<String>,

    /// Host modules the function may require
    #[arg(short, long = "allow", num_args = 1)]
    pub allow: Vec<String>,

    /// Synchronous budget in milliseconds
    #[arg(long)]
    pub sync_timeout: Option<u64>,

    /// Completion deadline in milliseconds
    #[arg(long)]
    pub async_timeout: Option<u64>,

    /// Run in a disposable worker process
    #[arg(long)]
    pub isolated: bool,

    /// Include console output in the printed report
    #[arg(long)]
    pub capture_logs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_run() {
        let cli = Cli::parse_from([
            "backstage",
            "run",
            "fn.js",
            "--env",
            "A=1",
            "--env=B=two",
            "--allow",
            "path",
            "--isolated",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(args.file, PathBuf::from("fn.js"));
        assert_eq!(args.env, vec!["A=1", "B=two"]);
        assert_eq!(args.allow, vec!["path"]);
        assert!(args.isolated);
        assert!(!args.capture_logs);
    }

    #[test]
    fn test_cli_parsing_check() {
        let cli = Cli::parse_from(["backstage", "check", "fn.js"]);
        assert!(matches!(cli.command, Commands::Check { .. }));
    }

    #[test]
    fn test_cli_parsing_worker() {
        let cli = Cli::parse_from(["backstage", "worker"]);
        assert!(matches!(cli.command, Commands::Worker));
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "backstage",
            "--verbose",
            "--log-format",
            "json",
            "--format",
            "json",
            "check",
            "fn.js",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.format, "json");
    }

    #[test]
    fn test_cli_output_format_default() {
        let cli = Cli::parse_from(["backstage", "worker"]);
        assert_eq!(cli.format, "pretty");
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_cli_parsing_completions_zsh() {
        let cli = Cli::parse_from(["backstage", "completions", "zsh"]);
        let Commands::Completions { shell } = cli.command else {
            panic!("Expected Completions command");
        };
        assert_eq!(shell, Shell::Zsh);
    }
}
