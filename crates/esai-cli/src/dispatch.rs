use super::{Cli, Commands};
use crate::commands::{
    blocks_command, generate_command, health_command, preview_command, run_command,
};
use crate::runtime_context::{init_logging, resolve_config};
use crate::session_repl::session_command;
use anyhow::Result;
use esai_config::CliOverrides;
use log::debug;

fn overrides_for(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        verbose: cli.verbose.then_some(true),
        ..CliOverrides::default()
    };
    match &cli.command {
        Commands::Blocks { .. } => {}
        Commands::Run { timeout, port, .. } => {
            overrides.run_timeout_secs = *timeout;
            overrides.preview_port = *port;
        }
        Commands::Preview { port, .. } => overrides.preview_port = *port,
        Commands::Session {
            busy,
            timeout,
            port,
            ..
        } => {
            overrides.busy_policy = busy.map(|arg| arg.as_setting());
            overrides.run_timeout_secs = *timeout;
            overrides.preview_port = *port;
        }
        Commands::Health { backend_url, .. } => overrides.backend_url = backend_url.clone(),
        Commands::Generate {
            steps, backend_url, ..
        } => {
            overrides.generate_steps = *steps;
            overrides.backend_url = backend_url.clone();
        }
    }
    overrides
}

pub(crate) fn execute(cli: Cli) -> Result<()> {
    let overrides = overrides_for(&cli);
    let settings = resolve_config(cli.config.clone(), &overrides)?;
    init_logging(settings.verbose);
    debug!("resolved settings: {settings:?}");

    match cli.command {
        Commands::Blocks { file } => blocks_command(file),
        Commands::Run {
            file, block, serve, ..
        } => run_command(&settings, file, block, serve),
        Commands::Preview { file, block, .. } => preview_command(&settings, file, block),
        Commands::Session { file, .. } => session_command(&settings, file),
        Commands::Health { wait, .. } => health_command(&settings, wait),
        Commands::Generate {
            prompt,
            output,
            wait,
            ..
        } => generate_command(&settings, prompt, output, wait),
    }
}
