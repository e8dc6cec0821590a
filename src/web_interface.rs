use crate::{
    connection::ConnectionHandle,
    dto::{ConnectionStatus, ReadingSummary, Sample, SummaryParams, TelemetrySnapshot},
    store::SharedStore,
    util::{config::Settings, ConnectFailure},
};
use async_stream::stream;
use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::{convert::Infallible, time::Duration};
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Clone)]
struct WebConfig {
    broker: String,
    topic: String,
    poll_interval: Duration,
    history_capacity: usize,
    summary: SummaryParams,
}

impl WebConfig {
    fn from_settings(settings: &Settings) -> Self {
        WebConfig {
            broker: settings.mqtt.broker(),
            topic: settings.mqtt.topic.clone(),
            poll_interval: settings.poll_interval,
            history_capacity: settings.history_capacity.get(),
            summary: settings.summary,
        }
    }
}

#[derive(Clone, FromRef)]
struct AppState {
    store: SharedStore,
    connection: ConnectionHandle,
    web_config: WebConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotView {
    #[serde(flatten)]
    snapshot: TelemetrySnapshot,
    summary: Option<ReadingSummary>,
}

impl SnapshotView {
    fn new(snapshot: TelemetrySnapshot, params: &SummaryParams) -> Self {
        let summary = snapshot
            .latest
            .as_ref()
            .map(|sample| ReadingSummary::of(sample, params));
        SnapshotView { snapshot, summary }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusView {
    status: ConnectionStatus,
    has_received_any: bool,
    samples: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigView {
    broker: String,
    topic: String,
    poll_interval_secs: u64,
    history_capacity: usize,
}

async fn snapshot(
    store: State<SharedStore>,
    web_config: State<WebConfig>,
) -> Json<SnapshotView> {
    Json(SnapshotView::new(store.snapshot(), &web_config.summary))
}

async fn latest(store: State<SharedStore>) -> Json<Option<Sample>> {
    Json(store.latest())
}

async fn history(store: State<SharedStore>) -> Json<Vec<Sample>> {
    Json(store.history())
}

async fn status(store: State<SharedStore>) -> Json<StatusView> {
    let snapshot = store.snapshot();
    Json(StatusView {
        status: snapshot.status,
        has_received_any: snapshot.has_received_any,
        samples: snapshot.history.len(),
    })
}

async fn config(web_config: State<WebConfig>) -> Json<ConfigView> {
    Json(ConfigView {
        broker: web_config.broker.clone(),
        topic: web_config.topic.clone(),
        poll_interval_secs: web_config.poll_interval.as_secs(),
        history_capacity: web_config.history_capacity,
    })
}

async fn reconnect(
    connection: State<ConnectionHandle>,
) -> axum::response::Result<impl IntoResponse> {
    connection.reconnect().await.map_err(ConnectFailure)?;
    Ok(StatusCode::NO_CONTENT)
}

fn telemetry_stream(
    store: SharedStore,
    web_config: WebConfig,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        loop {
            let view = SnapshotView::new(store.snapshot(), &web_config.summary);

            match serde_json::to_string(&view) {
                Ok(data) => yield Ok(Event::default().event("telemetry").data(data)),
                Err(err) => {
                    error!("Error occurred while serializing telemetry: {}", err);
                    break;
                }
            }

            tokio::time::sleep(web_config.poll_interval).await;
        }
    }
}

async fn sse_handler(
    store: State<SharedStore>,
    web_config: State<WebConfig>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(telemetry_stream(store.0, web_config.0)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("alive"),
    )
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/snapshot", get(snapshot))
        .route("/api/latest", get(latest))
        .route("/api/history", get(history))
        .route("/api/status", get(status))
        .route("/api/config", get(config))
        .route("/api/reconnect", post(reconnect))
        .route("/events", get(sse_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(
    store: SharedStore,
    connection: ConnectionHandle,
    settings: Settings,
) -> anyhow::Result<()> {
    let http_addr = settings.http_addr.clone();
    info!("Starting web server @ {}", http_addr);

    let app = router(AppState {
        store,
        connection,
        web_config: WebConfig::from_settings(&settings),
    });

    let listener = TcpListener::bind(&http_addr).await?;
    info!("Listening on {}", &http_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
