#![warn(clippy::all, clippy::pedantic)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use teambus::{daemon, Config, ConfigCommands};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `teambus` - message bus for a team of cooperating agents.
#[derive(Parser, Debug)]
#[command(name = "teambus")]
#[command(version)]
#[command(about = "Typed message bus for multi-agent teams.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured team on an in-process bus
    #[command(long_about = "\
Run the configured team on an in-process bus.

Registers every [[agents]] entry from config.toml, starts the dispatcher, \
retrier and reaper, and flushes bus statistics to daemon_state.json until \
Ctrl+C.

Examples:
  teambus daemon
  teambus --config-dir ./team daemon
  RUST_LOG=teambus=debug teambus daemon")]
    Daemon,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `teambus`.

Examples:
  source <(teambus completions bash)
  teambus completions zsh > ~/.zfunc/_teambus")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("TEAMBUS_CONFIG_DIR", config_dir);
    }

    // Completions must stay stdout-only: no config load, no logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Daemon => {
            tracing::info!("Starting teambus daemon");
            daemon::run(config).await
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let rendered =
                    toml::to_string_pretty(&config).context("Failed to render config as TOML")?;
                println!("# {}", config.config_path.display());
                print!("{rendered}");
                Ok(())
            }
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
        },
        Commands::Completions { .. } => Ok(()),
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_dir_flag_is_global() {
        let cli = Cli::try_parse_from(["teambus", "config", "show", "--config-dir", "/tmp/team"])
            .expect("config show with --config-dir should parse");
        assert_eq!(cli.config_dir.as_deref(), Some("/tmp/team"));
        assert!(matches!(
            cli.command,
            Commands::Config {
                config_command: ConfigCommands::Show
            }
        ));
    }

    #[test]
    fn daemon_takes_no_positional_arguments() {
        assert!(Cli::try_parse_from(["teambus", "daemon"]).is_ok());
        assert!(Cli::try_parse_from(["teambus", "daemon", "extra"]).is_err());
    }

    #[test]
    fn completions_script_names_the_binary() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output).expect("bash completion");
        let script = String::from_utf8(output).expect("utf-8 script");
        assert!(script.contains("teambus"));
    }
}
