//! CLI argument parsing for scrutinize

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scrutinize")]
#[command(version)]
#[command(about = "Inspect and merge structured test-run timing logs", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output (to stderr)
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print every event of a log as one JSON line
    Dump {
        /// Log file (gzip-compressed JSON lines)
        log: PathBuf,

        /// Only print events with this `type` tag (e.g. test, fixture, mock)
        #[arg(short = 't', long = "type", value_name = "TYPE")]
        kind: Option<String>,
    },

    /// Concatenate segment logs into one, in the order given
    Merge {
        /// Destination log
        #[arg(short = 'o', long = "output", value_name = "DEST")]
        output: PathBuf,

        /// Segment logs to append
        #[arg(required = true, value_name = "SEGMENT")]
        segments: Vec<PathBuf>,
    },

    /// Validate a TOML configuration file
    Check {
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_dump() {
        let cli = Cli::parse_from(["scrutinize", "dump", "out.jsonl.gz"]);
        assert!(!cli.debug);
        match cli.command {
            Command::Dump { log, kind } => {
                assert_eq!(log, PathBuf::from("out.jsonl.gz"));
                assert!(kind.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_dump_type_filter() {
        let cli = Cli::parse_from(["scrutinize", "dump", "-t", "fixture", "out.jsonl.gz"]);
        assert!(matches!(cli.command, Command::Dump { kind: Some(ref k), .. } if k == "fixture"));
    }

    #[test]
    fn test_cli_merge_segments() {
        let cli = Cli::parse_from(["scrutinize", "merge", "-o", "final.gz", "a.gz", "b.gz"]);
        match cli.command {
            Command::Merge { output, segments } => {
                assert_eq!(output, PathBuf::from("final.gz"));
                assert_eq!(segments.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_merge_requires_segments() {
        assert!(Cli::try_parse_from(["scrutinize", "merge", "-o", "final.gz"]).is_err());
    }

    #[test]
    fn test_cli_debug_flag_is_global() {
        let cli = Cli::parse_from(["scrutinize", "check", "conf.toml", "--debug"]);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["scrutinize"]).is_err());
    }
}
