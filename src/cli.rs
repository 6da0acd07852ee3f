use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "qops",
    version,
    about = "Run commands in qubes and reconcile qube state over qrexec"
)]
pub struct Cli {
    /// Path to config file [default: ~/.config/qops/qops.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output on stderr (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// No log output on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a shell command inside a qube, mirroring its exit status
    Exec {
        /// Target qube
        qube: String,

        /// User to run as inside the qube
        #[arg(short, long)]
        user: Option<String>,

        /// Environment variable for the command (KEY=VALUE, repeatable)
        #[arg(short = 'e', long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Forward local stdin to the command
        #[arg(long)]
        stdin: bool,

        /// Fail instead of starting a halted qube
        #[arg(long)]
        no_start: bool,

        /// Command line, passed to the qube's shell
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Copy a local file into a qube
    Put {
        qube: String,
        local: PathBuf,
        /// Absolute path inside the qube
        remote: String,
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Copy a file out of a qube
    Fetch {
        qube: String,
        /// Absolute path inside the qube
        remote: String,
        local: PathBuf,
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Reconcile a qube against a JSON desired-state document
    Apply {
        /// Document path; stdin when omitted
        document: Option<PathBuf>,

        /// Abort the whole reconciliation after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show the steps `apply` would take, changing nothing
    Plan {
        /// Document path; stdin when omitted
        document: Option<PathBuf>,
    },

    /// Print the observed state of a qube as JSON
    State { qube: String },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}
