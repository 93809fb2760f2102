//! Command line arguments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "buildsmith", version, about = "Compile job orchestrator")]
pub struct Cli {
    /// Configuration file (.toml, .json or .yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile source files with the target language's toolchain
    Compile(CompileArgs),

    /// Inspect and manage toolchains
    Toolchain {
        #[command(subcommand)]
        action: ToolchainCommand,
    },

    /// Inspect or clear the result cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Query, analyze, export and import compile history
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct CompileArgs {
    /// Target language (c, cpp, rust, go, java, kotlin, python, javascript, typescript)
    #[arg(short, long)]
    pub language: String,

    /// Compiler executable
    #[arg(short = 'c', long)]
    pub compiler: String,

    /// Source files, compiled in the given order
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Project directory; also the working directory
    #[arg(short, long, default_value = ".")]
    pub project: PathBuf,

    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(short = 'I', long = "include")]
    pub include_paths: Vec<PathBuf>,

    #[arg(short = 'L', long = "lib")]
    pub library_paths: Vec<PathBuf>,

    /// Preprocessor define, KEY or KEY=VALUE
    #[arg(short = 'D', long = "define")]
    pub defines: Vec<String>,

    /// none, basic or aggressive
    #[arg(long, default_value = "none")]
    pub opt: String,

    #[arg(short = 'g', long)]
    pub debug: bool,

    #[arg(long)]
    pub werror: bool,

    /// low, normal, high or critical
    #[arg(long, default_value = "normal")]
    pub priority: String,

    /// Extra compiler argument, passed through verbatim
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,

    /// Environment override, KEY=VALUE
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Do not print live compiler output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum ToolchainCommand {
    /// Every language with its detected toolchain
    List,
    Install { language: String },
    Uninstall { language: String },
    /// Installation phase and progress of one language
    Status { language: String },
    /// Installed toolchains behind the latest known version
    Updates,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Stats,
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List {
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Stats {
        /// Days covered by the performance trend
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Recurring errors grouped by message signature
    Errors,
    Export {
        #[arg(long, default_value = "json")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Import {
        file: PathBuf,
        /// Defaults to the file extension
        #[arg(long)]
        format: Option<String>,
    },
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write the default configuration file if missing and print its path
    Init,
    /// Print the effective configuration
    Show,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compile() {
        let cli = Cli::try_parse_from([
            "buildsmith", "compile", "-l", "c", "-c", "clang", "-I", "include", "-D", "DEBUG=1",
            "--arg", "-Wall", "main.c", "util.c",
        ])
        .unwrap();
        match cli.command {
            Command::Compile(args) => {
                assert_eq!(args.language, "c");
                assert_eq!(args.sources, vec![PathBuf::from("main.c"), PathBuf::from("util.c")]);
                assert_eq!(args.defines, vec!["DEBUG=1".to_string()]);
                assert_eq!(args.extra_args, vec!["-Wall".to_string()]);
                assert_eq!(args.priority, "normal");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_compile_requires_sources() {
        assert!(Cli::try_parse_from(["buildsmith", "compile", "-l", "c", "-c", "clang"]).is_err());
    }

    #[test]
    fn test_parse_history_export() {
        let cli =
            Cli::try_parse_from(["buildsmith", "--json", "history", "export", "--format", "yaml"])
                .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Command::History {
                action: HistoryCommand::Export { .. }
            }
        ));
    }
}
