pub mod monitor;

pub use monitor::{HealthReport, HealthStatus, MonitorView};
