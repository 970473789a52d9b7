//! Topic naming, discovery descriptors and state values.
//!
//! Everything here is a pure function of its arguments so that republishing
//! discovery yields byte-identical documents.

use serde::{Deserialize, Serialize};

use crate::constants::topics::{COMPONENT, CONFIG_SUFFIX, STATE_SUFFIX};
use crate::frame_parser::CellLayout;
use crate::records::TelemetrySnapshot;

/// Static description of one published metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub key: String,
    pub name: String,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
}

impl MetricDescriptor {
    fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            unit: None,
            device_class: None,
            state_class: None,
        }
    }

    fn measurement(mut self, unit: &'static str, device_class: &'static str) -> Self {
        self.unit = Some(unit);
        self.device_class = Some(device_class);
        self.state_class = Some("measurement");
        self
    }

    fn counter(mut self) -> Self {
        self.state_class = Some("total_increasing");
        self
    }
}

/// Device metadata attached to every discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

/// The retained document published on a metric's config topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    pub device: DeviceMetadata,
}

/// Builds topics and documents for one device under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
    device_id: String,
}

impl TopicScheme {
    pub fn new(prefix: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// `{prefix}/sensor/{device_id}_{metric}/state`
    pub fn state_topic(&self, metric_key: &str) -> String {
        self.topic(metric_key, STATE_SUFFIX)
    }

    /// `{prefix}/sensor/{device_id}_{metric}/config`
    pub fn config_topic(&self, metric_key: &str) -> String {
        self.topic(metric_key, CONFIG_SUFFIX)
    }

    pub fn unique_id(&self, metric_key: &str) -> String {
        format!("{}_{}", self.device_id, metric_key)
    }

    fn topic(&self, metric_key: &str, suffix: &str) -> String {
        format!(
            "{}/{}/{}_{}/{}",
            self.prefix, COMPONENT, self.device_id, metric_key, suffix
        )
    }

    /// Builds the descriptor document for `metric`.
    pub fn document(&self, metric: &MetricDescriptor, device: &DeviceMetadata) -> DiscoveryDocument {
        DiscoveryDocument {
            name: metric.name.clone(),
            unique_id: self.unique_id(&metric.key),
            state_topic: self.state_topic(&metric.key),
            unit_of_measurement: metric.unit.map(str::to_string),
            device_class: metric.device_class.map(str::to_string),
            state_class: metric.state_class.map(str::to_string),
            device: device.clone(),
        }
    }
}

/// Metric key for one field of one cell, e.g. `cell_3_voltage`.
pub fn cell_metric_key(cell_id: u32, field: &str) -> String {
    format!("cell_{cell_id}_{field}")
}

/// Pack level metrics, known before the first frame arrives.
pub fn pack_metrics() -> Vec<MetricDescriptor> {
    vec![
        MetricDescriptor::new("voltage", "Battery Voltage").measurement("V", "voltage"),
        MetricDescriptor::new("current", "Battery Current").measurement("A", "current"),
        MetricDescriptor::new("temperature_avg", "Average Temperature")
            .measurement("°C", "temperature"),
        MetricDescriptor::new("capacity", "Capacity"),
        MetricDescriptor::new("status", "Status"),
        MetricDescriptor::new("voltage_status", "Voltage Status"),
        MetricDescriptor::new("current_status", "Current Status"),
        MetricDescriptor::new("temperature_status", "Temperature Status"),
        MetricDescriptor::new("error_code", "Error Code"),
        MetricDescriptor::new("cycle_count", "Cycle Count").counter(),
    ]
}

/// Metrics published for a single cell under the given layout.
pub fn cell_metrics(cell_id: u32, layout: CellLayout) -> Vec<MetricDescriptor> {
    let mut metrics = vec![
        MetricDescriptor::new(
            cell_metric_key(cell_id, "voltage"),
            format!("Cell {cell_id} Voltage"),
        )
        .measurement("V", "voltage"),
    ];

    if layout == CellLayout::Extended {
        metrics.push(
            MetricDescriptor::new(
                cell_metric_key(cell_id, "temperature"),
                format!("Cell {cell_id} Temperature"),
            )
            .measurement("°C", "temperature"),
        );
        metrics.push(MetricDescriptor::new(
            cell_metric_key(cell_id, "status_1"),
            format!("Cell {cell_id} Status 1"),
        ));
        metrics.push(MetricDescriptor::new(
            cell_metric_key(cell_id, "status_2"),
            format!("Cell {cell_id} Status 2"),
        ));
    }

    metrics
}

/// Formats an engineering value with at most three decimals.
pub fn format_value(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    // Avoid publishing "-0".
    if rounded == 0.0 {
        return "0".to_string();
    }
    rounded.to_string()
}

/// Flattens a snapshot into `(metric_key, value)` pairs in a stable order.
pub fn snapshot_states(snapshot: &TelemetrySnapshot) -> Vec<(String, String)> {
    let mut states = Vec::new();

    if let Some(summary) = &snapshot.summary {
        states.push(("voltage".to_string(), format_value(summary.voltage_volts)));
        states.push(("current".to_string(), format_value(summary.current_amps)));
        states.push((
            "temperature_avg".to_string(),
            format_value(summary.avg_temperature_celsius),
        ));
        states.push(("capacity".to_string(), summary.capacity.to_string()));
        states.push(("status".to_string(), summary.status.clone()));
        states.push(("voltage_status".to_string(), summary.voltage_status.clone()));
        states.push(("current_status".to_string(), summary.current_status.clone()));
        states.push((
            "temperature_status".to_string(),
            summary.temperature_status.clone(),
        ));
    }

    if let Some(footer) = &snapshot.footer {
        states.push(("error_code".to_string(), footer.error_code.to_string()));
        states.push(("cycle_count".to_string(), footer.cycle_count.to_string()));
    }

    for cell in &snapshot.cells {
        states.push((
            cell_metric_key(cell.id, "voltage"),
            format_value(cell.voltage_volts),
        ));
        if let Some(temperature) = cell.temperature_celsius {
            states.push((
                cell_metric_key(cell.id, "temperature"),
                format_value(temperature),
            ));
        }
        if let Some(status) = &cell.status_1 {
            states.push((cell_metric_key(cell.id, "status_1"), status.clone()));
        }
        if let Some(status) = &cell.status_2 {
            states.push((cell_metric_key(cell.id, "status_2"), status.clone()));
        }
    }

    states
}
