use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pack level values read from the header line of a `getpwr` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub voltage_volts: f64,
    /// Positive while charging, negative while discharging.
    pub current_amps: f64,
    pub avg_temperature_celsius: f64,
    /// Raw capacity figure, not scaled.
    pub capacity: i64,
    pub status: String,
    pub voltage_status: String,
    pub current_status: String,
    pub temperature_status: String,
}

/// One cell line of a frame.
///
/// `temperature_celsius` and the two status codes are only present when the
/// parser runs with the extended cell layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// 1-based position among the accepted cell lines.
    pub id: u32,
    pub voltage_volts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_2: Option<String>,
}

/// The two trailing counter lines of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterRecord {
    pub error_code: u64,
    pub cycle_count: u64,
}

/// Everything extracted from a single response block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub summary: Option<SummaryRecord>,
    pub cells: Vec<CellRecord>,
    pub footer: Option<FooterRecord>,
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// An empty snapshot stamped with the given capture time.
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            summary: None,
            cells: Vec::new(),
            footer: None,
            captured_at,
        }
    }

    /// A snapshot is only worth publishing when every group was read.
    pub fn is_complete(&self) -> bool {
        self.summary.is_some() && self.footer.is_some() && !self.cells.is_empty()
    }
}
