use anyhow::{Context, Result, bail};
use esai_config::{
    BusyPolicySetting, CliOverrides, EnvConfig, Settings, load_file_config, resolve_settings,
    user_config_dir,
};
use esai_core::{BusyPolicy, ExecutionSession, RunError, RunResult, Runner};
use esai_engine::EngineOptions;
use esai_preview::{PreviewServerConfig, PreviewSlot};
use std::fs;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) fn resolve_config(
    config: Option<PathBuf>,
    cli_overrides: &CliOverrides,
) -> Result<Settings> {
    let cwd = std::env::current_dir().context("failed resolving current directory")?;
    let user_dir = user_config_dir();
    let file_cfg = load_file_config(config.as_deref(), &cwd, user_dir.as_deref())?;
    let env_cfg = EnvConfig::from_current_env();
    Ok(resolve_settings(cli_overrides, &env_cfg, file_cfg.as_ref()))
}

/// `RUST_LOG` wins; otherwise `warn`, or `debug` when verbose.
pub(crate) fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .format_timestamp(None)
    .try_init();
}

pub(crate) fn busy_policy(setting: BusyPolicySetting) -> BusyPolicy {
    match setting {
        BusyPolicySetting::Reject => BusyPolicy::Reject,
        BusyPolicySetting::Queue => BusyPolicy::Queue,
    }
}

pub(crate) fn engine_options(settings: &Settings) -> EngineOptions {
    EngineOptions {
        preload: settings.preload.clone(),
        denied_modules: settings.denied_modules.clone(),
        ..EngineOptions::default()
    }
}

pub(crate) fn build_runner(settings: &Settings) -> Runner<PreviewSlot> {
    let session = ExecutionSession::install_global(engine_options(settings));
    Runner::new(session, PreviewSlot::new()).with_policy(busy_policy(settings.busy_policy))
}

pub(crate) fn preview_config(settings: &Settings) -> PreviewServerConfig {
    PreviewServerConfig {
        host: settings.preview_host.clone(),
        port: settings.preview_port,
        ..PreviewServerConfig::default()
    }
}

/// Only commands that drive the interpreter get a runtime. The blocking
/// backend client must stay outside of it.
pub(crate) fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed building async runtime")
}

/// Runs `task` on its own tokio task so a timeout only stops the wait. The
/// task keeps its permit until it finishes.
pub(crate) async fn await_run<F>(task: F, timeout: Option<Duration>) -> Result<Result<RunResult, RunError>>
where
    F: Future<Output = Result<RunResult, RunError>> + Send + 'static,
{
    let handle = tokio::spawn(task);
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => bail!(
                "run still in progress after {}s; later runs wait for it to finish",
                limit.as_secs()
            ),
        },
        None => handle.await,
    };
    joined.context("run task failed")
}

pub(crate) fn read_message(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display())),
        None => {
            let mut message = String::new();
            io::stdin()
                .read_to_string(&mut message)
                .context("failed reading message from stdin")?;
            Ok(message)
        }
    }
}

pub(crate) fn print_result(result: &RunResult) {
    if !result.transcript.is_empty() {
        print!("{}", result.transcript);
        if !result.transcript.ends_with('\n') {
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{await_run, busy_policy, engine_options};
    use esai_config::{BusyPolicySetting, Settings};
    use esai_core::{BusyPolicy, RunResult};
    use std::time::Duration;

    #[test]
    fn busy_setting_maps_to_policy() {
        assert_eq!(busy_policy(BusyPolicySetting::Reject), BusyPolicy::Reject);
        assert_eq!(busy_policy(BusyPolicySetting::Queue), BusyPolicy::Queue);
    }

    #[test]
    fn engine_options_follow_settings() {
        let settings = Settings {
            preload: vec!["math".to_string()],
            denied_modules: vec!["os".to_string()],
            ..Settings::default()
        };
        let options = engine_options(&settings);
        assert_eq!(options.preload, vec!["math".to_string()]);
        assert_eq!(options.denied_modules, vec!["os".to_string()]);
        assert!(!options.allow_file_access);
    }

    #[tokio::test]
    async fn timeout_stops_waiting_only() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(RunResult::ok("late"))
        };
        let err = await_run(slow, Some(Duration::from_millis(10)))
            .await
            .expect_err("wait should time out");
        assert!(err.to_string().contains("still in progress"));

        let fast = async { Ok(RunResult::ok("done")) };
        let result = await_run(fast, None)
            .await
            .expect("join should work")
            .expect("run should work");
        assert_eq!(result.transcript, "done");
    }
}
