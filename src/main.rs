use actix_cors::Cors;
use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use std::io::Write;
use stick_core::{
    api::Api,
    config::AppConfig,
    device::{Device, DeviceHandle},
    platform::linux::LinuxPlatform,
};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};

const WIFI_EVENT_QUEUE: usize = 8;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::get();

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let (handle, requests) = DeviceHandle::channel();
    let (wifi_events, events) = mpsc::channel(WIFI_EVENT_QUEUE);

    let mut device = Device::<LinuxPlatform>::new(
        LinuxPlatform::collaborators(config, wifi_events),
        config.paths.config_file.clone(),
        config.http.port,
        &handle,
        requests,
        events,
    );

    // no clients are served while the startup join is pending
    device.start(config.force_access_point).await;

    let (server_handle, server_task) = run_server(handle)?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
            Ok(())
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
            Ok(())
        },
        result = device.run() => result,
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
            Ok(())
        },
    };

    server_handle.stop(true).await;
    info!("shutdown complete");

    result
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!(
        "module version: {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHORT_REV")
    );
}

fn run_server(
    device: DeviceHandle,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let api = Api::new(device);
    let port = AppConfig::get().http.port;

    let server = HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_header()
                    .allow_any_method()
                    .max_age(3600),
            )
            .app_data(Data::new(api.clone()))
            .configure(Api::routes)
    })
    .bind(("0.0.0.0", port))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}
