//! Shell completion generation command.
//!
//! Generates shell completion scripts for bash, zsh, fish, and `PowerShell`.

use backstage_core::cli::ExitCode;
use clap::Command;
use clap_complete::{Shell, generate};
use std::io::{self, Write};
use tracing::info;

/// Writes the completion script for `shell` to `out`.
///
/// # Examples
///
/// ```
/// use backstage_cli::commands::completions;
/// use clap::Command;
/// use clap_complete::Shell;
///
/// let mut script = Vec::new();
/// completions::generate_completions(Shell::Bash, &mut Command::new("backstage"), &mut script);
/// assert!(!script.is_empty());
/// ```
pub fn generate_completions(shell: Shell, cmd: &mut Command, out: &mut dyn Write) {
    let name = cmd.get_name().to_string();
    generate(shell, cmd, name, out);
}

/// Runs the completions command, printing the script to stdout.
pub fn run(shell: Shell, cmd: &mut Command) -> ExitCode {
    info!("Generating {shell} completions");
    generate_completions(shell, cmd, &mut io::stdout());
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(shell: Shell) -> String {
        let mut out = Vec::new();
        let mut cmd = Command::new("backstage").subcommand(Command::new("run"));
        generate_completions(shell, &mut cmd, &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_generate_completions_bash() {
        assert!(script(Shell::Bash).contains("backstage"));
    }

    #[test]
    fn test_generate_completions_zsh() {
        assert!(script(Shell::Zsh).contains("#compdef backstage"));
    }

    #[test]
    fn test_generate_completions_fish() {
        assert!(script(Shell::Fish).contains("complete -c backstage"));
    }

    #[test]
    fn test_generate_completions_powershell() {
        assert!(!script(Shell::PowerShell).is_empty());
    }
}
