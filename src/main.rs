use std::{
    process,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tether::{
    config::{session::SessionConfig, Config},
    core::supervisor::Supervisor,
    logger::LoggerManager,
    print_error,
};
use tether_mqtt_session::{
    DisconnectKind, DisconnectNotice, Event, EventBus, OptionsPatch, ReconnectContext, SessionManager, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Credentials picked up again before every retry, so a rotated secret does
/// not require a restart.
const USERNAME_ENV: &str = "TETHER_USERNAME";
const PASSWORD_ENV: &str = "TETHER_PASSWORD";

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn credentials_from_env() -> Option<OptionsPatch> {
    let username = std::env::var(USERNAME_ENV).ok()?;
    let password = std::env::var(PASSWORD_ENV).unwrap_or_default();
    Some(OptionsPatch::default().with_credentials(username, password))
}

#[cfg(feature = "tether-mqtt-rumqtt")]
fn build_transport(bus: &EventBus, cfg: &SessionConfig) -> Arc<dyn Transport> {
    info!("Using rumqttc transport");
    Arc::new(
        tether_mqtt_rumqtt::RumqttTransport::new(bus.clone())
            .with_tls(cfg.tls.clone())
            .with_capacity(cfg.request_capacity),
    )
}

#[cfg(not(feature = "tether-mqtt-rumqtt"))]
fn build_transport(_bus: &EventBus, _cfg: &SessionConfig) -> Arc<dyn Transport> {
    error!("tether was built without a transport, enable the `tether-mqtt-rumqtt` feature");
    process::exit(1);
}

fn on_disconnect(notice: &DisconnectNotice) {
    match notice.kind {
        DisconnectKind::ConnectFailure => warn!(
            reason_code = notice.reason_code,
            retry_count = notice.retry_count,
            reason = ?notice.reason,
            "Connect attempt failed"
        ),
        DisconnectKind::AutoDisconnected => warn!(
            reason_code = notice.reason_code,
            reason = ?notice.reason,
            "Connection lost"
        ),
        DisconnectKind::ForceDisconnected => info!(reason_code = notice.reason_code, "Disconnected"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting tether version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.session);

    let bus = EventBus::new();
    let transport = build_transport(&bus, &cfg.session);
    let manager = SessionManager::new(bus, transport);

    let session = manager
        .create_session(
            cfg.session.client_id.clone(),
            cfg.session.host.clone(),
            cfg.session.port,
            cfg.session.ssl,
            cfg.session.options.clone(),
        )
        .unwrap_or_else(|| {
            error!("Failed to create session for {}", cfg.session.endpoint());
            process::exit(1);
        });

    let _on_connect = session.set_on_connect_callback(|event| {
        if let Event::Connected { session_present } = event {
            info!(session_present, "Broker accepted the connection");
        }
    });
    let _on_disconnect = session.set_on_disconnect_interceptor(on_disconnect);
    let _on_reconnect = session.set_on_reconnect_interceptor(|ctx: ReconnectContext| async move {
        debug!(
            client_id = %ctx.client_id,
            retry_count = ctx.retry_count,
            reason_code = ?ctx.reason_code,
            "Preparing reconnect"
        );
        credentials_from_env()
    });

    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new(session.clone(), cfg.session.subscriptions.clone(), cancel.clone());
    let supervisor_task = tokio::spawn(supervisor.run());

    info!(
        client_id = %session.client_id(),
        endpoint = %session.endpoint(),
        topics = cfg.session.subscriptions.len(),
        "Connecting..."
    );
    session.connect(credentials_from_env());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown...");

    cancel.cancel();
    if let Err(e) = supervisor_task.await {
        warn!("Supervisor task failed: {}", e);
    }

    session.disconnect();
    // let the DISCONNECT packet go out
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.shutdown();

    info!("Shutdown complete");
    Ok(())
}
