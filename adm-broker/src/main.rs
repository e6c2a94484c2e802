// Used by the adm-broker library, not by this binary directly.
#[cfg(unix)]
use libc as _;
#[cfg(feature = "openapi")]
use utoipa as _;
use {
    async_trait as _, camino as _, cfg_if as _, futures as _, hex as _, hmac as _, nonempty as _, parking_lot as _,
    rand as _, serde as _, sha2 as _, smol_str as _, subtle as _, tap as _, thiserror as _, time as _, tower as _,
    tower_http as _, typed_builder as _, uuid as _,
};

#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use broker_task::{spawn_task, ShutdownHandle};

use adm_broker::broker::BrokerTask;
use adm_broker::config::ConfHandle;
use adm_broker::store::NullTasksStore;
use adm_broker::AppState;

enum CliAction {
    ShowHelp,
    Run,
    ConfigInitOnly,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    let mut config_path = None;
    let mut remaining_args = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            config_path = Some(args.next().context("missing value for --config-path")?);
        } else {
            remaining_args.push(arg);
        }
    }

    if let Some(path) = config_path {
        // SAFETY: single-threaded at this point, before any other thread is spawned.
        unsafe { std::env::set_var(adm_broker::config::CONFIG_PATH_ENV, &path) };
    }

    let action = match remaining_args.first().map(String::as_str) {
        Some("--config-init-only") => CliAction::ConfigInitOnly,
        None => CliAction::Run,
        Some(_) => CliAction::ShowHelp,
    };

    match action {
        CliAction::ShowHelp => {
            println!(
                r#"HELP:

    Run:
        "{executable}"

    Initialize configuration only (will not override existing configuration):
        "{executable}" --config-init-only

    Options:
        --config-path <CONFIG_PATH>
"#
            );
            Ok(())
        }
        CliAction::ConfigInitOnly => {
            let conf_file = adm_broker::config::load_conf_file_or_generate_new()?;
            let conf_file_json = serde_json::to_string_pretty(&conf_file).context("couldn't represent config file as JSON")?;
            println!("{conf_file_json}");
            Ok(())
        }
        CliAction::Run => run(),
    }
}

fn run() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard = broker_log::init::<BrokerLogConfig>(&conf.data_dir, &conf.verbosity_profile, None)
        .context("failed to initialize logging")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    rt.block_on(async_main(conf_handle))
}

struct BrokerLogConfig;

impl broker_log::StaticLogConfig for BrokerLogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "adm-broker";
}

async fn async_main(conf_handle: ConfHandle) -> anyhow::Result<()> {
    let conf = conf_handle.get_conf();

    if conf.is_dev_mode() {
        warn!("no auth_secret/agent_token configured, running in dev mode (auth is fail-open)");
    }

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let broker_task = BrokerTask::new(conf.clone(), std::sync::Arc::new(NullTasksStore));
    let broker_handle = broker_task.handle();
    let broker_child = spawn_task(broker_task, shutdown_signal.clone());

    let state = AppState { broker: broker_handle, conf: conf.clone() };
    let router = adm_broker::api::make_router(state);

    let listener = tokio::net::TcpListener::bind(conf.listener).await.with_context(|| format!("failed to bind {}", conf.listener))?;
    info!(listener = %conf.listener, "adm-broker listening");

    let server = axum::serve(listener, router.into_make_service());

    tokio::select! {
        result = server => {
            result.context("HTTP server failed")?;
        }
        () = build_signals_fut() => {
            info!("shutdown signal received");
        }
    }

    shutdown_handle.signal();
    shutdown_handle.all_closed().await;
    broker_child.detach();

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate_signal = signal(SignalKind::terminate()).expect("failed to create terminate signal stream");
    let mut quit_signal = signal(SignalKind::quit()).expect("failed to create quit signal stream");
    let mut interrupt_signal = signal(SignalKind::interrupt()).expect("failed to create interrupt signal stream");

    tokio::select! {
        _ = terminate_signal.recv() => {}
        _ = quit_signal.recv() => {}
        _ = interrupt_signal.recv() => {}
    }
}

#[cfg(not(unix))]
async fn build_signals_fut() {
    let _ = tokio::signal::ctrl_c().await;
}
