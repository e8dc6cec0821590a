pub mod connection_status;
pub mod reading_summary;
pub mod sample;
pub mod telemetry_snapshot;

pub use connection_status::ConnectionStatus;
pub use reading_summary::{ReadingSummary, SummaryParams};
pub use sample::{Sample, UNKNOWN};
pub use telemetry_snapshot::TelemetrySnapshot;
