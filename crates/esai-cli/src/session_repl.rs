use crate::commands::{describe_block, ensure_markup, select_block};
use crate::runtime_context::{
    await_run, build_runner, build_runtime, preview_config, print_result, read_message,
};
use anyhow::{Context, Result, anyhow, bail};
use esai_blocks::{CodeBlock, extract};
use esai_config::Settings;
use esai_core::{RunResult, Runner};
use esai_preview::{PreviewServer, PreviewServerConfig, PreviewSlot};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Help,
    Exit,
    Blocks,
    Run(usize),
    Project,
    Preview(usize),
    ClosePreview,
    CloseTerminal,
    Load(PathBuf),
    Script(String),
}

fn block_number(command: &str, arg: Option<&str>) -> Result<usize> {
    let arg = arg.ok_or_else(|| anyhow!("usage: {command} N"))?;
    arg.parse()
        .map_err(|_| anyhow!("'{arg}' is not a block number"))
}

/// Blank lines parse to `None`. Anything without a leading dot is Python.
pub(crate) fn parse_session_command(line: &str) -> Result<Option<SessionCommand>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if !trimmed.starts_with('.') {
        return Ok(Some(SessionCommand::Script(trimmed.to_string())));
    }

    let mut parts = trimmed.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();
    let parsed = match command {
        ".help" => SessionCommand::Help,
        ".exit" => SessionCommand::Exit,
        ".blocks" => SessionCommand::Blocks,
        ".run" => SessionCommand::Run(block_number(command, arg)?),
        ".project" => SessionCommand::Project,
        ".preview" => SessionCommand::Preview(block_number(command, arg)?),
        ".close-preview" => SessionCommand::ClosePreview,
        ".close-terminal" => SessionCommand::CloseTerminal,
        ".load" => {
            let path = arg.ok_or_else(|| anyhow!("usage: .load FILE"))?;
            SessionCommand::Load(PathBuf::from(path))
        }
        other => bail!("unknown command '{other}' (try .help)"),
    };
    Ok(Some(parsed))
}

fn print_help() {
    println!("Session commands:");
    println!("  .blocks          - list blocks of the loaded message");
    println!("  .run N           - run block N");
    println!("  .project         - run every runnable block in order");
    println!("  .preview N       - preview markup block N");
    println!("  .close-preview   - close the preview");
    println!("  .close-terminal  - discard the last run output");
    println!("  .load FILE       - load a message from FILE");
    println!("  .help            - show this help");
    println!("  .exit            - quit");
    println!("Any other line runs as Python in the shared session.");
}

struct Session {
    runner: Runner<PreviewSlot>,
    runtime: tokio::runtime::Runtime,
    timeout: Option<Duration>,
    preview_config: PreviewServerConfig,
    preview_server: Option<PreviewServer>,
    message: Option<String>,
    blocks: Vec<CodeBlock>,
    terminal: Option<RunResult>,
}

impl Session {
    fn load(&mut self, message: String) {
        self.blocks = extract(&message);
        self.message = Some(message);
        println!("loaded message with {} block(s)", self.blocks.len());
    }

    fn list_blocks(&self) {
        if self.blocks.is_empty() {
            println!("no blocks (use .load FILE)");
        }
        for block in &self.blocks {
            println!("{}", describe_block(block));
        }
    }

    fn run_block(&mut self, block: CodeBlock) -> Result<()> {
        let runner = self.runner.clone();
        let outcome = self.runtime.block_on(await_run(
            async move { runner.run_one(&block).await },
            self.timeout,
        ))?;
        self.show(outcome?)
    }

    fn run_project(&mut self) -> Result<()> {
        let message = self
            .message
            .clone()
            .ok_or_else(|| anyhow!("no message loaded (use .load FILE)"))?;
        let runner = self.runner.clone();
        let outcome = self.runtime.block_on(await_run(
            async move { runner.run_project(&message).await },
            self.timeout,
        ))?;
        self.show(outcome?)
    }

    fn preview(&mut self, order: usize) -> Result<()> {
        let block = select_block(&self.blocks, order)?;
        ensure_markup(block)?;
        self.runner.show_preview(block)?;
        let label = block.label();
        let url = self.ensure_preview_server()?;
        println!("preview of {label} at {url}");
        Ok(())
    }

    fn show(&mut self, result: RunResult) -> Result<()> {
        print_result(&result);
        if let Some(label) = &result.previewed {
            let url = self.ensure_preview_server()?;
            println!("preview of {label} at {url}");
        }
        if let Some(text) = result.error_text.as_deref().filter(|_| result.failed) {
            eprintln!("error: {text}");
        }
        self.terminal = Some(result);
        Ok(())
    }

    fn ensure_preview_server(&mut self) -> Result<String> {
        if let Some(server) = &self.preview_server {
            return Ok(server.url().to_string());
        }
        let server = PreviewServer::start(&self.preview_config, self.runner.preview_sink().clone())?;
        let url = server.url().to_string();
        self.preview_server = Some(server);
        Ok(url)
    }

    fn close_preview(&mut self) {
        self.runner.close_preview();
        println!("preview closed");
    }

    fn close_terminal(&mut self) {
        match self.terminal.take() {
            Some(_) => println!("terminal closed"),
            None => println!("no terminal output to close"),
        }
    }

    fn apply(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Help => print_help(),
            SessionCommand::Exit => {}
            SessionCommand::Blocks => self.list_blocks(),
            SessionCommand::Run(order) => {
                let block = select_block(&self.blocks, order)?.clone();
                self.run_block(block)?;
            }
            SessionCommand::Project => self.run_project()?,
            SessionCommand::Preview(order) => self.preview(order)?,
            SessionCommand::ClosePreview => self.close_preview(),
            SessionCommand::CloseTerminal => self.close_terminal(),
            SessionCommand::Load(path) => {
                let message = read_message(Some(&path))?;
                self.load(message);
            }
            SessionCommand::Script(source) => {
                self.run_block(CodeBlock::new("python", None, source, 0))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn session_command(settings: &Settings, file: Option<PathBuf>) -> Result<()> {
    let mut session = Session {
        runner: build_runner(settings),
        runtime: build_runtime()?,
        timeout: settings.run_timeout_secs.map(Duration::from_secs),
        preview_config: preview_config(settings),
        preview_server: None,
        message: None,
        blocks: Vec::new(),
        terminal: None,
    };

    println!("esai session. Type .help for commands, .exit to quit.");
    if let Some(path) = file {
        let message = read_message(Some(&path))?;
        session.load(message);
    }

    let mut line = String::new();
    loop {
        line.clear();
        print!("esai> ");
        io::stdout().flush().context("failed flushing stdout")?;

        let bytes = io::stdin()
            .read_line(&mut line)
            .context("failed reading session input")?;
        if bytes == 0 {
            break;
        }

        let command = match parse_session_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("error: {err:#}");
                continue;
            }
        };
        if command == SessionCommand::Exit {
            break;
        }
        if let Err(err) = session.apply(command) {
            eprintln!("error: {err:#}");
        }
    }

    if let Some(mut server) = session.preview_server.take() {
        server.stop();
    }
    Ok(())
}
