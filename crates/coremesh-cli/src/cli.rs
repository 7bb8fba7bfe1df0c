//! CLI argument definitions for coremesh

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// coremesh - run local proxy cores behind one edge proxy
///
/// Starts every configured core proxy, then the edge proxy, points the
/// system proxy at it, and tears everything down again on exit.
#[derive(Parser, Debug)]
#[command(name = "coremesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Silent mode - suppress status output (logs are unaffected)
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start cores and the edge proxy from the parsed state
    #[command(after_help = "EXAMPLES:
    # Run with the default conf dir (~/.v2n_coremesh)
    coremesh run

    # Use another conf dir
    coremesh run --conf-dir /srv/coremesh

    # Point the edge proxy at a separate geo asset directory
    coremesh run --asset-dir ~/v2rayN/bin

    # Debug logging
    coremesh run -v
")]
    Run(RunArgs),

    /// Print the proxy endpoint the system proxy would point at
    #[command(after_help = "EXAMPLES:
    # Inspect the generated edge configuration
    coremesh detect-endpoint --config ~/.v2n_coremesh/xray.generated.json
")]
    DetectEndpoint(DetectEndpointArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding coremesh.state.json and coremesh.log
    #[arg(long, value_name = "DIR")]
    pub conf_dir: Option<PathBuf>,

    /// Asset directory for the edge proxy (defaults to the conf dir)
    #[arg(long, value_name = "DIR")]
    pub asset_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct DetectEndpointArgs {
    /// Edge proxy configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["coremesh", "run"]);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.conf_dir.is_none());
                assert!(args.asset_dir.is_none());
            }
            Commands::DetectEndpoint(_) => panic!("expected run"),
        }
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_run_with_dirs_and_verbosity() {
        let cli = Cli::parse_from([
            "coremesh",
            "run",
            "--conf-dir",
            "/tmp/conf",
            "--asset-dir",
            "/tmp/assets",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.conf_dir, Some(PathBuf::from("/tmp/conf")));
        assert_eq!(args.asset_dir, Some(PathBuf::from("/tmp/assets")));
    }

    #[test]
    fn test_detect_endpoint_requires_config() {
        assert!(Cli::try_parse_from(["coremesh", "detect-endpoint"]).is_err());
        let cli = Cli::try_parse_from(["coremesh", "detect-endpoint", "-c", "edge.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
