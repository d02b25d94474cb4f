use anyhow::{Context, Result};
use esai_backend::{DEFAULT_BACKEND_URL, DEFAULT_STEPS};
use esai_engine::DEFAULT_DENIED_MODULES;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "esai.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicySetting {
    Reject,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub backend_url: Option<String>,
    pub preview_host: Option<String>,
    pub preview_port: Option<u16>,
    pub busy_policy: Option<BusyPolicySetting>,
    pub run_timeout_secs: Option<u64>,
    pub generate_steps: Option<u32>,
    pub health_poll_secs: Option<u64>,
    pub health_timeout_secs: Option<u64>,
    pub preload: Option<Vec<String>>,
    pub denied_modules: Option<Vec<String>>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvConfig {
    pub backend_url: Option<String>,
    pub preview_host: Option<String>,
    pub preview_port: Option<u16>,
    pub busy_policy: Option<BusyPolicySetting>,
    pub run_timeout_secs: Option<u64>,
    pub generate_steps: Option<u32>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    pub backend_url: Option<String>,
    pub preview_port: Option<u16>,
    pub busy_policy: Option<BusyPolicySetting>,
    pub run_timeout_secs: Option<u64>,
    pub generate_steps: Option<u32>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend_url: String,
    pub preview_host: String,
    pub preview_port: u16,
    pub busy_policy: BusyPolicySetting,
    pub run_timeout_secs: Option<u64>,
    pub generate_steps: u32,
    pub health_poll_secs: u64,
    pub health_timeout_secs: u64,
    pub preload: Vec<String>,
    pub denied_modules: Vec<String>,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            preview_host: "127.0.0.1".to_string(),
            preview_port: 4173,
            busy_policy: BusyPolicySetting::Reject,
            run_timeout_secs: None,
            generate_steps: DEFAULT_STEPS,
            health_poll_secs: 3,
            health_timeout_secs: 300,
            preload: Vec::new(),
            denied_modules: DEFAULT_DENIED_MODULES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            verbose: false,
        }
    }
}

/// `<config dir>/esai/esai.json`, the per-user fallback.
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("esai"))
}

/// Loads `explicit_path`, or else `esai.json` from `cwd`, or else from
/// `user_dir`. A missing implicit file is not an error.
pub fn load_file_config(
    explicit_path: Option<&Path>,
    cwd: &Path,
    user_dir: Option<&Path>,
) -> Result<Option<FileConfig>> {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => {
            let candidates = std::iter::once(cwd).chain(user_dir);
            let found = candidates
                .map(|dir| dir.join(CONFIG_FILE_NAME))
                .find(|candidate| candidate.exists());
            match found {
                Some(candidate) => candidate,
                None => return Ok(None),
            }
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    let parsed: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing config file {}", path.display()))?;
    Ok(Some(parsed))
}

impl EnvConfig {
    pub fn from_current_env() -> Self {
        Self {
            backend_url: env::var("ESAI_BACKEND_URL").ok(),
            preview_host: env::var("ESAI_PREVIEW_HOST").ok(),
            preview_port: env::var("ESAI_PREVIEW_PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            busy_policy: env::var("ESAI_BUSY_POLICY")
                .ok()
                .and_then(|v| parse_busy_policy(&v)),
            run_timeout_secs: env::var("ESAI_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            generate_steps: env::var("ESAI_STEPS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            verbose: env::var("ESAI_VERBOSE").ok().and_then(|v| parse_bool(&v)),
        }
    }
}

pub fn resolve_settings(
    cli: &CliOverrides,
    env_cfg: &EnvConfig,
    file_cfg: Option<&FileConfig>,
) -> Settings {
    let base = Settings::default();

    let backend_url = cli
        .backend_url
        .clone()
        .or_else(|| env_cfg.backend_url.clone())
        .or_else(|| file_cfg.and_then(|c| c.backend_url.clone()))
        .unwrap_or(base.backend_url);

    let preview_host = env_cfg
        .preview_host
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.preview_host.clone()))
        .unwrap_or(base.preview_host);

    let preview_port = cli
        .preview_port
        .or(env_cfg.preview_port)
        .or(file_cfg.and_then(|c| c.preview_port))
        .unwrap_or(base.preview_port);

    let busy_policy = cli
        .busy_policy
        .or(env_cfg.busy_policy)
        .or(file_cfg.and_then(|c| c.busy_policy))
        .unwrap_or(base.busy_policy);

    let run_timeout_secs = cli
        .run_timeout_secs
        .or(env_cfg.run_timeout_secs)
        .or(file_cfg.and_then(|c| c.run_timeout_secs))
        .or(base.run_timeout_secs)
        .filter(|secs| *secs > 0);

    let generate_steps = cli
        .generate_steps
        .or(env_cfg.generate_steps)
        .or(file_cfg.and_then(|c| c.generate_steps))
        .unwrap_or(base.generate_steps);

    let health_poll_secs = file_cfg
        .and_then(|c| c.health_poll_secs)
        .unwrap_or(base.health_poll_secs);

    let health_timeout_secs = file_cfg
        .and_then(|c| c.health_timeout_secs)
        .unwrap_or(base.health_timeout_secs);

    let preload = file_cfg
        .and_then(|c| c.preload.clone())
        .unwrap_or(base.preload);

    let denied_modules = file_cfg
        .and_then(|c| c.denied_modules.clone())
        .unwrap_or(base.denied_modules);

    let verbose = cli
        .verbose
        .or(env_cfg.verbose)
        .or(file_cfg.and_then(|c| c.verbose))
        .unwrap_or(base.verbose);

    Settings {
        backend_url,
        preview_host,
        preview_port,
        busy_policy,
        run_timeout_secs,
        generate_steps,
        health_poll_secs,
        health_timeout_secs,
        preload,
        denied_modules,
        verbose,
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_busy_policy(input: &str) -> Option<BusyPolicySetting> {
    match input.trim().to_ascii_lowercase().as_str() {
        "reject" => Some(BusyPolicySetting::Reject),
        "queue" | "wait" => Some(BusyPolicySetting::Queue),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BusyPolicySetting, CliOverrides, EnvConfig, FileConfig, Settings, load_file_config,
        parse_busy_policy, resolve_settings,
    };
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn valid_config_parses() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(
            dir.path().join("esai.json"),
            r#"{"busy_policy":"queue","preload":["math"],"preview_port":5000}"#,
        )
        .expect("write should work");

        let parsed = load_file_config(None, dir.path(), None)
            .expect("parse should work")
            .expect("file should exist");
        assert_eq!(parsed.busy_policy, Some(BusyPolicySetting::Queue));
        assert_eq!(parsed.preload, Some(vec!["math".to_string()]));
        assert_eq!(parsed.preview_port, Some(5000));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().expect("tempdir should work");
        let parsed = load_file_config(None, dir.path(), None).expect("load should work");
        assert!(parsed.is_none());
    }

    #[test]
    fn user_dir_is_the_fallback() {
        let cwd = tempdir().expect("tempdir should work");
        let user = tempdir().expect("tempdir should work");
        fs::write(user.path().join("esai.json"), r#"{"verbose":true}"#)
            .expect("write should work");

        let parsed = load_file_config(None, cwd.path(), Some(user.path()))
            .expect("parse should work")
            .expect("user file should be found");
        assert_eq!(parsed.verbose, Some(true));

        fs::write(cwd.path().join("esai.json"), r#"{"verbose":false}"#)
            .expect("write should work");
        let parsed = load_file_config(None, cwd.path(), Some(user.path()))
            .expect("parse should work")
            .expect("cwd file should be found");
        assert_eq!(parsed.verbose, Some(false));
    }

    #[test]
    fn explicit_missing_path_fails() {
        let dir = tempdir().expect("tempdir should work");
        let missing = dir.path().join("nope.json");
        let err = load_file_config(Some(&missing), dir.path(), None)
            .expect_err("missing explicit file should fail");
        assert!(format!("{err:#}").contains("failed reading config file"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("esai.json"), r#"{"provider":"ollama"}"#)
            .expect("write should work");

        let err = load_file_config(None, dir.path(), None).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("unknown field"));
    }

    #[test]
    fn precedence_cli_env_file_defaults() {
        let file = FileConfig {
            backend_url: Some("http://file:1".to_string()),
            busy_policy: Some(BusyPolicySetting::Queue),
            generate_steps: Some(8),
            health_poll_secs: Some(1),
            ..FileConfig::default()
        };
        let env_cfg = EnvConfig {
            backend_url: Some("http://env:2".to_string()),
            generate_steps: Some(6),
            ..EnvConfig::default()
        };
        let cli = CliOverrides {
            generate_steps: Some(2),
            ..CliOverrides::default()
        };

        let resolved = resolve_settings(&cli, &env_cfg, Some(&file));
        assert_eq!(resolved.backend_url, "http://env:2");
        assert_eq!(resolved.busy_policy, BusyPolicySetting::Queue);
        assert_eq!(resolved.generate_steps, 2);
        assert_eq!(resolved.health_poll_secs, 1);
        assert_eq!(resolved.health_timeout_secs, 300);
        assert_eq!(resolved.denied_modules, Settings::default().denied_modules);
    }

    #[test]
    fn zero_timeout_means_none() {
        let cli = CliOverrides {
            run_timeout_secs: Some(0),
            ..CliOverrides::default()
        };
        let resolved = resolve_settings(&cli, &EnvConfig::default(), None);
        assert_eq!(resolved.run_timeout_secs, None);
    }

    #[test]
    fn busy_policy_aliases() {
        assert_eq!(parse_busy_policy(" Queue "), Some(BusyPolicySetting::Queue));
        assert_eq!(parse_busy_policy("wait"), Some(BusyPolicySetting::Queue));
        assert_eq!(parse_busy_policy("reject"), Some(BusyPolicySetting::Reject));
        assert_eq!(parse_busy_policy("maybe"), None);
    }
}
