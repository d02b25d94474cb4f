use crate::runtime_context::{
    await_run, build_runner, build_runtime, preview_config, print_result, read_message,
};
use anyhow::{Context, Result, anyhow, bail};
use esai_backend::{GenerateRequest, HealthStatus, HttpBackend, ImageBackend, wait_until_ready};
use esai_blocks::{BlockKind, CodeBlock, extract};
use esai_config::Settings;
use esai_core::RunResult;
use esai_preview::{PreviewServer, PreviewSink, PreviewSlot};
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn describe_block(block: &CodeBlock) -> String {
    let lines = block.line_count();
    let plural = if lines == 1 { "" } else { "s" };
    format!(
        "#{} {:<6} {} ({lines} line{plural})",
        block.order(),
        block.kind(),
        block.label()
    )
}

pub(crate) fn select_block(blocks: &[CodeBlock], order: usize) -> Result<&CodeBlock> {
    blocks.get(order).ok_or_else(|| {
        anyhow!(
            "no block #{order} (the message has {} block{})",
            blocks.len(),
            if blocks.len() == 1 { "" } else { "s" }
        )
    })
}

pub(crate) fn ensure_markup(block: &CodeBlock) -> Result<()> {
    if block.kind() != BlockKind::Markup {
        bail!(
            "block #{} is {}, only markup can be previewed",
            block.order(),
            block.kind()
        );
    }
    Ok(())
}

pub(crate) fn blocks_command(file: Option<PathBuf>) -> Result<()> {
    let message = read_message(file.as_deref())?;
    let blocks = extract(&message);
    if blocks.is_empty() {
        eprintln!("[esai] no fenced code blocks found");
        return Ok(());
    }
    for block in &blocks {
        println!("{}", describe_block(block));
    }
    Ok(())
}

pub(crate) fn run_command(
    settings: &Settings,
    file: Option<PathBuf>,
    block: Option<usize>,
    serve: bool,
) -> Result<()> {
    let message = read_message(file.as_deref())?;
    let runner = build_runner(settings);
    let timeout = settings.run_timeout_secs.map(Duration::from_secs);
    let runtime = build_runtime()?;

    let outcome = match block {
        Some(order) => {
            let blocks = extract(&message);
            let selected = select_block(&blocks, order)?.clone();
            let task_runner = runner.clone();
            runtime.block_on(await_run(
                async move { task_runner.run_one(&selected).await },
                timeout,
            ))?
        }
        None => {
            let task_runner = runner.clone();
            runtime.block_on(await_run(
                async move { task_runner.run_project(&message).await },
                timeout,
            ))?
        }
    };
    let result = outcome?;

    print_result(&result);
    if let Some(label) = &result.previewed {
        if serve {
            serve_until_enter(settings, runner.preview_sink().clone(), label)?;
        } else {
            eprintln!("[esai] preview ready for {label} (pass --serve to view it)");
        }
    }
    finish(result)
}

fn finish(result: RunResult) -> Result<()> {
    match result.error_text {
        Some(text) if result.failed => Err(anyhow!(text)),
        _ => Ok(()),
    }
}

pub(crate) fn preview_command(
    settings: &Settings,
    file: Option<PathBuf>,
    block: Option<usize>,
) -> Result<()> {
    let message = read_message(file.as_deref())?;
    let blocks = extract(&message);
    let selected = match block {
        Some(order) => select_block(&blocks, order)?,
        None => blocks
            .iter()
            .rev()
            .find(|block| block.kind() == BlockKind::Markup)
            .ok_or_else(|| anyhow!("the message has no markup block to preview"))?,
    };
    ensure_markup(selected)?;

    let slot = PreviewSlot::new();
    slot.show(selected.source(), &selected.label());
    serve_until_enter(settings, slot, &selected.label())
}

fn serve_until_enter(settings: &Settings, slot: PreviewSlot, label: &str) -> Result<()> {
    let mut server = PreviewServer::start(&preview_config(settings), slot)?;
    println!("{}", server.url());
    eprintln!("[esai] previewing {label}; press Enter to stop");

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed reading stdin")?;
    server.stop();
    Ok(())
}

pub(crate) fn health_command(settings: &Settings, wait: bool) -> Result<()> {
    let backend = HttpBackend::new(settings.backend_url.clone());
    if wait {
        wait_for_backend(settings, &backend)?;
        println!("{}", HealthStatus::Ready);
        return Ok(());
    }

    let status = backend
        .health()
        .with_context(|| format!("backend at {} is unreachable", settings.backend_url))?;
    println!("{status}");
    if status == HealthStatus::Error {
        bail!("backend failed to load its model");
    }
    Ok(())
}

fn wait_for_backend(settings: &Settings, backend: &HttpBackend) -> Result<()> {
    eprintln!("[esai] waiting for backend at {}", settings.backend_url);
    wait_until_ready(
        backend,
        Duration::from_secs(settings.health_poll_secs),
        Duration::from_secs(settings.health_timeout_secs),
        |status| match status {
            Ok(status) => eprintln!("[esai] backend status: {status}"),
            Err(err) => eprintln!("[esai] waiting for backend... ({err:#})"),
        },
    )
}

fn image_extension(mime_type: Option<&str>) -> &'static str {
    match mime_type {
        Some("image/jpeg" | "image/jpg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        _ => "png",
    }
}

pub(crate) fn default_image_path(now: SystemTime, mime_type: Option<&str>) -> PathBuf {
    let millis = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    PathBuf::from(format!("esai-gen-{millis}.{}", image_extension(mime_type)))
}

pub(crate) fn generate_command(
    settings: &Settings,
    prompt: String,
    output: Option<PathBuf>,
    wait: bool,
) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("prompt must not be empty");
    }
    let backend = HttpBackend::new(settings.backend_url.clone());
    if wait {
        wait_for_backend(settings, &backend)?;
    }

    eprintln!(
        "[esai] generating with {} step(s) via {}",
        settings.generate_steps, settings.backend_url
    );
    let image = backend.generate(&GenerateRequest {
        prompt,
        steps: settings.generate_steps,
    })?;
    let bytes = image.decode()?;

    let target =
        output.unwrap_or_else(|| default_image_path(SystemTime::now(), image.mime_type()));
    write_output(&target, &bytes)?;
    eprintln!("[esai] wrote {} bytes", bytes.len());
    println!("{}", target.display());
    Ok(())
}

fn write_output(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating output dir {}", parent.display()))?;
    }
    fs::write(target, bytes).with_context(|| format!("failed writing image {}", target.display()))
}
