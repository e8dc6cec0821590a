use rumqttc::MqttOptions;
use tracing::Level;
use tracing_subscriber::{
    fmt::writer::MakeWriterExt, layer::SubscriberExt, util::SubscriberInitExt,
};

pub mod config;
pub mod connect_failure;

pub use connect_failure::ConnectFailure;

use self::config::MqttSettings;

pub fn setup_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stdout.with_max_level(Level::INFO))
                .compact(),
        )
        .init();
}

pub fn mqtt_options(settings: &MqttSettings, client_id: &str) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(client_id, &settings.host, settings.port);
    mqttoptions.set_keep_alive(settings.keep_alive);

    if let Some((username, password)) = settings.credentials() {
        mqttoptions.set_credentials(username, password);
    }

    mqttoptions
}
