//! Configuration loading: a serde-friendly on-disk format (`dto::ConfFile`)
//! is validated once into a runtime-friendly `Conf`, wrapped in a
//! `ConfHandle` so handlers can cheaply clone a reference to the current
//! snapshot.

use std::env;
use std::net::SocketAddr;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use smol_str::SmolStr;
use tap::Pipe as _;
use tokio::sync::Notify;

/// Env var pointing at the directory holding `adm-broker.json` (and logs).
pub const CONFIG_PATH_ENV: &str = "ADM_CONFIG_PATH";

const DEFAULT_LISTENER: &str = "0.0.0.0:7878";

pub mod dto {
    use serde::{Deserialize, Serialize};

    /// On-disk configuration shape. Every field is optional so a minimal or
    /// empty file still produces a usable (dev-mode) configuration.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub struct ConfFile {
        pub listener: Option<String>,
        /// HMAC secret. Unset together with `agent_token` ⇒ dev mode (fail-open).
        pub auth_secret: Option<String>,
        pub agent_token: Option<String>,
        pub heartbeat_interval_secs: Option<u64>,
        pub client_timeout_secs: Option<u64>,
        pub auth_timeout_secs: Option<u64>,
        pub max_pending_per_workspace: Option<usize>,
        pub completed_max: Option<usize>,
        pub max_dispatch_attempts: Option<u32>,
        pub initial_lease_secs: Option<u64>,
        pub ack_extend_secs: Option<u64>,
        pub progress_reset_secs: Option<u64>,
        pub lease_cap_secs: Option<u64>,
        /// `"quiet" | "normal" | "verbose" | "diagnostic"`, passed to broker-log.
        pub verbosity_profile: Option<String>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self::default()
        }
    }
}

/// Runtime configuration: `dto::ConfFile` with all defaults resolved and
/// values parsed into their working types (durations, socket addr, ...).
#[derive(Debug, Clone)]
pub struct Conf {
    pub listener: SocketAddr,
    pub auth_secret: Option<SmolStr>,
    pub agent_token: Option<SmolStr>,
    pub heartbeat_interval: std::time::Duration,
    pub client_timeout: std::time::Duration,
    pub auth_timeout: std::time::Duration,
    pub max_pending_per_workspace: usize,
    pub completed_max: usize,
    pub max_dispatch_attempts: u32,
    pub initial_lease: std::time::Duration,
    pub ack_extend: std::time::Duration,
    pub progress_reset: std::time::Duration,
    pub lease_cap: std::time::Duration,
    pub verbosity_profile: SmolStr,
    pub data_dir: Utf8PathBuf,
}

impl Conf {
    fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let listener = conf_file
            .listener
            .as_deref()
            .unwrap_or(DEFAULT_LISTENER)
            .parse()
            .context("invalid `listener` address")?;

        Ok(Self {
            listener,
            auth_secret: conf_file.auth_secret.as_deref().map(SmolStr::new),
            agent_token: conf_file.agent_token.as_deref().map(SmolStr::new),
            heartbeat_interval: std::time::Duration::from_secs(conf_file.heartbeat_interval_secs.unwrap_or(30)),
            client_timeout: std::time::Duration::from_secs(conf_file.client_timeout_secs.unwrap_or(90)),
            auth_timeout: std::time::Duration::from_secs(conf_file.auth_timeout_secs.unwrap_or(10)),
            max_pending_per_workspace: conf_file.max_pending_per_workspace.unwrap_or(100),
            completed_max: conf_file.completed_max.unwrap_or(1000),
            max_dispatch_attempts: conf_file.max_dispatch_attempts.unwrap_or(3),
            initial_lease: std::time::Duration::from_secs(conf_file.initial_lease_secs.unwrap_or(60)),
            ack_extend: std::time::Duration::from_secs(conf_file.ack_extend_secs.unwrap_or(270)),
            progress_reset: std::time::Duration::from_secs(conf_file.progress_reset_secs.unwrap_or(120)),
            lease_cap: std::time::Duration::from_secs(conf_file.lease_cap_secs.unwrap_or(1800)),
            verbosity_profile: conf_file.verbosity_profile.as_deref().unwrap_or("normal").into(),
            data_dir: get_data_dir(),
        })
    }

    /// Dev mode (fail-open auth) iff neither secret is configured.
    pub fn is_dev_mode(&self) -> bool {
        self.auth_secret.is_none() && self.agent_token.is_none()
    }
}

/// Source of truth for the current configuration. Cheap to clone; holds an
/// `Arc` to the latest validated snapshot plus a `Notify` so long-lived
/// tasks can react to a reload.
#[derive(Clone)]
pub struct ConfHandle {
    inner: std::sync::Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<std::sync::Arc<Conf>>,
    conf_file: parking_lot::RwLock<std::sync::Arc<dto::ConfFile>>,
    changed: Notify,
}

impl ConfHandle {
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: std::sync::Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(std::sync::Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(std::sync::Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    #[doc(hidden)]
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<dto::ConfFile>(json_config).context("invalid JSON config")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: std::sync::Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(std::sync::Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(std::sync::Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    /// Returns the current configuration snapshot. Do not hold it forever;
    /// it may become outdated after a reload.
    pub fn get_conf(&self) -> std::sync::Arc<Conf> {
        self.inner.conf.read().clone()
    }

    pub fn get_conf_file(&self) -> std::sync::Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }

    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }

    pub fn save_new_conf_file(&self, conf_file: dto::ConfFile) -> anyhow::Result<()> {
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;
        save_config(&conf_file).context("failed to save configuration")?;
        *self.inner.conf.write() = std::sync::Arc::new(conf);
        *self.inner.conf_file.write() = std::sync::Arc::new(conf_file);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

fn save_config(conf_file: &dto::ConfFile) -> anyhow::Result<()> {
    let path = get_conf_file_path();
    let json = serde_json::to_string_pretty(conf_file).context("failed JSON serialization of configuration")?;
    std::fs::write(&path, json).with_context(|| format!("failed to write file at {path}"))?;
    Ok(())
}

fn get_data_dir() -> Utf8PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        Utf8PathBuf::from(path)
    } else if cfg!(target_os = "windows") {
        let program_data = env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_owned());
        Utf8PathBuf::from(program_data).join("adm-broker")
    } else {
        Utf8PathBuf::from("/etc/adm-broker")
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("adm-broker.json")
}

fn load_conf_file(path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match std::fs::File::open(path) {
        Ok(file) => std::io::BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let path = get_conf_file_path();

    match load_conf_file(&path).context("failed to load configuration")? {
        Some(conf_file) => Ok(conf_file),
        None => {
            let defaults = dto::ConfFile::generate_new();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            save_config(&defaults).context("failed to save configuration")?;
            Ok(defaults)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_dev_mode_with_defaults() {
        let handle = ConfHandle::mock("{}").unwrap();
        let conf = handle.get_conf();

        assert!(conf.is_dev_mode());
        assert_eq!(conf.listener.to_string(), DEFAULT_LISTENER);
        assert_eq!(conf.max_pending_per_workspace, 100);
        assert_eq!(conf.completed_max, 1000);
    }

    #[test]
    fn configured_secret_leaves_dev_mode() {
        let handle = ConfHandle::mock(r#"{"auth_secret": "s3cr3t"}"#).unwrap();
        assert!(!handle.get_conf().is_dev_mode());
    }

    #[test]
    fn invalid_listener_is_rejected() {
        let result = ConfHandle::mock(r#"{"listener": "not-an-address"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let result = ConfHandle::mock("{not json");
        assert!(result.is_err());
    }
}
