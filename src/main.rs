use std::path::Path;
use std::sync::Arc;

use llpanel_core::bridge::sse::{LoginEventHook, LoginEventListener};
use llpanel_core::bridge::BridgeApiClient;
use llpanel_core::resource::ResourceMonitor;
use llpanel_core::supervisor::{ProcessSupervisor, BOT_RUNTIME_NAME, BRIDGE_NAME};
use llpanel_core::update::{UpdateChecker, UpdateComponent, UpdateStateService};
use llpanel_core::{botconfig, config, process_monitor, utils};
use tokio_util::sync::CancellationToken;

const RELEASE_BASE_URL: &str = "https://releases.llpanel.dev";

/// Headless integration: login failures are only logged. A GUI front-end
/// supplies its own hook that marshals onto its UI thread.
struct LogLoginHook;

impl LoginEventHook for LogLoginHook {
    fn on_login_failure(&self, message: &str) {
        tracing::error!("[Login] Login failed, re-authentication required: {}", message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("Panel core starting");

    let config_store = config::ConfigStore::load(config::DEFAULT_CONFIG_PATH);
    let cfg = config_store.config().clone();

    let supervisor = Arc::new(ProcessSupervisor::new());
    let monitor = Arc::new(ResourceMonitor::new());
    let api = Arc::new(BridgeApiClient::new());
    let updates = Arc::new(UpdateStateService::new());

    // Log every observed process transition
    let mut status_rx = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = status_rx.recv().await {
            tracing::info!("[Status] {} is now {:?}", event.name, event.status);
        }
    });

    // Resource sampling for the bot-side processes
    monitor.track(BRIDGE_NAME);
    monitor.track(BOT_RUNTIME_NAME);
    monitor.start_monitoring();
    let mut sample_rx = monitor.subscribe();
    tokio::spawn(async move {
        while let Ok(sample) = sample_rx.recv().await {
            tracing::debug!(
                "[Resource] {}: {:.1}% cpu, {:.1} MB",
                sample.name,
                sample.cpu_percent,
                sample.memory_mb
            );
        }
    });

    // Background update check, one cycle at startup
    let updates_task = updates.clone();
    tokio::spawn(async move {
        let checker = UpdateChecker::new(RELEASE_BASE_URL);
        let locals = vec![
            (UpdateComponent::App, env!("CARGO_PKG_VERSION").to_string()),
            (UpdateComponent::Bridge, String::new()),
            (UpdateComponent::Runtime, String::new()),
        ];
        updates_task.run_check(&checker, &locals).await;
        let state = updates_task.current();
        if state.any_update() {
            tracing::info!("[Update] Updates are available");
        } else {
            tracing::info!("[Update] Everything is up to date");
        }
    });

    let session_cancel = CancellationToken::new();
    let mut listener_token: Option<CancellationToken> = None;
    let mut listener_handle: Option<tokio::task::JoinHandle<()>> = None;

    if cfg.bridge_path.is_empty() {
        tracing::warn!("No bridge path configured, supervising nothing");
    } else {
        match supervisor
            .start_bridge(
                Path::new(&cfg.bridge_path),
                Path::new(&cfg.client_path),
                &cfg.auto_login_uin,
                cfg.headless,
            )
            .await
        {
            Ok(port) => {
                api.set_port(port);

                // Login-failure watcher on the bridge event stream
                let listener = Arc::new(LoginEventListener::new(Arc::new(LogLoginHook)));
                listener_token = Some(listener.cancellation_token());
                let listener_task = listener.clone();
                listener_handle =
                    Some(tokio::spawn(async move { listener_task.run(port).await }));

                // Once the identity shows up, make sure its runtime config is
                // safe and fetch build metadata
                let api_task = api.clone();
                let poll_cancel = session_cancel.clone();
                tokio::spawn(async move {
                    if let Some(info) = api_task.fetch_self_info(&poll_cancel).await {
                        tracing::info!("[Bridge] Logged in as {} ({})", info.nick, info.uin);
                        let store = botconfig::BotConfigStore::new("data");
                        let config = store.load(&info.uin);
                        if let Err(e) = config.validate() {
                            tracing::warn!("[Bridge] Bot config for {}: {}", info.uin, e);
                        }
                    }
                    if let Some(device) = api_task.fetch_device_info(&poll_cancel).await {
                        tracing::info!(
                            "[Bridge] Client {} on {}",
                            device.app_version,
                            device.platform
                        );
                    }
                });

                if !cfg.runtime_path.is_empty() {
                    if let Err(e) = supervisor
                        .start_bot_runtime(
                            Path::new(&cfg.runtime_path),
                            Path::new(&cfg.bot_script_path),
                        )
                        .await
                    {
                        tracing::warn!("Bot runtime failed to start: {}", e);
                    }
                }

                if !cfg.startup_command.is_empty() {
                    run_startup_command(&cfg.startup_command).await;
                }
            }
            Err(e) => tracing::warn!("Bridge failed to start: {}", e),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, stopping services");

    session_cancel.cancel();
    api.cancel_all();
    if let Some(token) = listener_token {
        token.cancel();
    }
    if let Some(handle) = listener_handle {
        let _ = handle.await;
    }

    // The client is the bridge's child, not ours; stop it by observed PID
    let client_pid = process_monitor::find_by_name_async("QQ")
        .await
        .first()
        .map(|p| p.pid);
    supervisor.stop_all(client_pid).await;
    monitor.reset_state();

    tracing::info!("Panel core shut down");
    Ok(())
}

async fn run_startup_command(command: &str) {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return;
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(parts);
    utils::apply_creation_flags(&mut cmd);
    match cmd.spawn() {
        Ok(_) => tracing::info!("Startup command launched: {}", command),
        Err(e) => tracing::warn!("Startup command failed: {}", e),
    }
}
