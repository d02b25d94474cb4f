mod commands;
mod dispatch;
mod runtime_context;
mod session_repl;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use esai_config::BusyPolicySetting;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BusyArg {
    Reject,
    Queue,
}

impl BusyArg {
    fn as_setting(self) -> BusyPolicySetting {
        match self {
            BusyArg::Reject => BusyPolicySetting::Reject,
            BusyArg::Queue => BusyPolicySetting::Queue,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "esai",
    version,
    about = "Run and preview code blocks from assistant replies"
)]
struct Cli {
    /// Config file (defaults to ./esai.json, then the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the fenced code blocks in a reply.
    Blocks { file: Option<PathBuf> },
    /// Run one block, or every runnable block of a reply in order.
    Run {
        file: Option<PathBuf>,
        #[arg(long)]
        block: Option<usize>,
        /// Serve the markup preview after the run.
        #[arg(long)]
        serve: bool,
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Serve a markup block in the isolated preview frame.
    Preview {
        file: Option<PathBuf>,
        #[arg(long)]
        block: Option<usize>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Interactive session over one shared interpreter.
    Session {
        file: Option<PathBuf>,
        #[arg(long, value_enum)]
        busy: Option<BusyArg>,
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show the image backend's readiness.
    Health {
        #[arg(long)]
        backend_url: Option<String>,
        /// Poll until the backend is ready.
        #[arg(long)]
        wait: bool,
    },
    /// Generate an image with the backend.
    Generate {
        prompt: String,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[arg(long)]
        steps: Option<u32>,
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        backend_url: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dispatch::execute(cli)
}
