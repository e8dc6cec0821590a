use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;

use crate::connection::ConnectError;

pub struct ConnectFailure(pub ConnectError);

impl IntoResponse for ConnectFailure {
    fn into_response(self) -> Response {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("MQTT connection failed: {}", self.0),
        )
            .into_response()
    }
}
