mod connection;
mod decoder;
mod dto;
mod history;
mod ingest;
mod mqtt_processor;
mod simulator;
mod store;
mod util;
mod web_interface;

use std::{env, process::exit};
use tokio::sync::oneshot::{self, error::RecvError, Receiver};
use tracing::{error, info, warn};
use util::{config::Settings, setup_tracing};

use connection::{ConnectionHandle, ConnectionManager};
use mqtt_processor::MqttTransport;
use store::{SharedStore, TelemetryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    if let (Some(git_describe), Some(git_sha), Some(build_timestamp)) = (
        option_env!("VERGEN_GIT_DESCRIBE"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_BUILD_TIMESTAMP"),
    ) {
        info!(
            "LoRa energy monitor {} ({} {})",
            git_describe, git_sha, build_timestamp
        );
    }

    let args: Vec<String> = env::args().collect();

    let choice = args.get(1).cloned().unwrap_or_else(|| "all".into());

    let settings = Settings::load()?;

    match choice.as_str() {
        "all" => {
            let store = TelemetryStore::shared(settings.history_capacity);
            let connection = start_connection(&settings, store.clone());

            let web_channel = start_webserver(store, connection.clone(), settings);

            // Reads are served while the broker is still being dialled. A
            // failed attempt leaves the status Disconnected until the operator
            // asks for a reconnect.
            connection.connect_in_background();

            tokio::select! {
                res = web_channel => handle_nested_result(res),
                _ = shutdown_signal() => info!("Shutting down"),
            }

            connection.disconnect().await?;
        }
        "mqtt" => {
            let store = TelemetryStore::shared(settings.history_capacity);
            let connection = start_connection(&settings, store.clone());

            // Without the web interface nobody can ask for a retry.
            connection.connect().await?;

            shutdown_signal().await;
            info!("Shutting down");
            if !store.has_received_any() {
                warn!("No uplink was received on {}", settings.mqtt.topic);
            }
            connection.disconnect().await?;
        }
        "simulate" => handle_result(simulator::start_server(settings).await),
        _ => println!("Make a valid choice (all, mqtt, simulate)"),
    }

    Ok(())
}

/// Resolves on Ctrl-C. Without a signal handler the process runs until killed.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for the shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}

fn handle_nested_result(res: Result<anyhow::Result<()>, RecvError>) {
    match res {
        Err(err) => {
            error!("An internal error occurred: {:?}", err);
            exit(2)
        }
        Ok(nested) => handle_result(nested),
    }
}

fn handle_result(res: anyhow::Result<()>) {
    if let Err(err) = res {
        error!("An error occurred: {:?}", err);
        exit(1)
    }
}

fn start_connection(settings: &Settings, store: SharedStore) -> ConnectionHandle {
    let transport = MqttTransport::new(settings.mqtt.clone());
    ConnectionManager::new(transport, settings.mqtt.topic.clone(), store).spawn()
}

fn start_webserver(
    store: SharedStore,
    connection: ConnectionHandle,
    settings: Settings,
) -> Receiver<anyhow::Result<()>> {
    let (sender, receiver) = oneshot::channel::<anyhow::Result<()>>();
    tokio::spawn(async move {
        let _ = sender.send(web_interface::start_server(store, connection, settings).await);
    });
    receiver
}
