use std::collections::BTreeSet;

use pylon_core::discovery::{
    DeviceMetadata, MetricDescriptor, TopicScheme, cell_metrics, pack_metrics, snapshot_states,
};
use pylon_core::error::BmsError;
use pylon_core::frame_parser::CellLayout;
use pylon_core::records::TelemetrySnapshot;
use tracing::{debug, warn};

use crate::sink::TelemetrySink;

/// Result of publishing one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
}

/// Maps snapshots onto sink topics.
///
/// Pack metrics are announced by `publish_discovery`; cell metrics are
/// announced lazily the first time a cell id shows up, since the cell count
/// is only known once a frame has been parsed.
pub struct TelemetryPublisher<S: TelemetrySink> {
    sink: S,
    scheme: TopicScheme,
    device: DeviceMetadata,
    layout: CellLayout,
    announced_cells: BTreeSet<u32>,
}

impl<S: TelemetrySink> TelemetryPublisher<S> {
    pub fn new(sink: S, scheme: TopicScheme, device: DeviceMetadata, layout: CellLayout) -> Self {
        Self {
            sink,
            scheme,
            device,
            layout,
            announced_cells: BTreeSet::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Publishes a retained discovery document for each metric.
    ///
    /// Documents depend only on the scheme, the device and the metric, so
    /// calling this again republishes identical bytes.
    ///
    /// # Returns
    /// The number of documents the sink rejected. Rejections are logged.
    pub fn publish_discovery(&mut self, metrics: &[MetricDescriptor]) -> usize {
        let mut failed = 0;
        for metric in metrics {
            let topic = self.scheme.config_topic(&metric.key);
            let document = self.scheme.document(metric, &self.device);
            let result = serde_json::to_string(&document)
                .map_err(|e| BmsError::Publish {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })
                .and_then(|payload| self.sink.publish(&topic, &payload, true));

            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "discovery publish failed");
                failed += 1;
            }
        }
        failed
    }

    /// Announces the pack level metrics.
    pub fn publish_pack_discovery(&mut self) -> usize {
        self.publish_discovery(&pack_metrics())
    }

    /// Publishes a single state value. Not retained.
    pub fn publish_state(&mut self, topic: &str, value: &str) -> Result<(), BmsError> {
        self.sink.publish(topic, value, false)
    }

    /// Publishes every value of a complete snapshot.
    ///
    /// Failed publishes are logged and counted, never returned, so one bad
    /// topic cannot abort the rest of the cycle.
    pub fn publish(&mut self, snapshot: &TelemetrySnapshot) -> PublishReport {
        let new_cells: Vec<u32> = snapshot
            .cells
            .iter()
            .map(|cell| cell.id)
            .filter(|id| !self.announced_cells.contains(id))
            .collect();

        let mut report = PublishReport::default();

        for id in new_cells {
            let failures = self.publish_discovery(&cell_metrics(id, self.layout));
            report.failed += failures;
            // Retry the announcement on the next cycle if any of it was lost.
            if failures == 0 {
                self.announced_cells.insert(id);
            }
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            match serde_json::to_string(snapshot) {
                Ok(json) => debug!(snapshot = %json, "publishing snapshot"),
                Err(e) => debug!(error = %e, "snapshot not serializable"),
            }
        }

        for (key, value) in snapshot_states(snapshot) {
            let topic = self.scheme.state_topic(&key);
            match self.publish_state(&topic, &value) {
                Ok(()) => report.published += 1,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "state publish failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Disconnects the sink. Safe to call more than once.
    pub fn disconnect(&mut self) {
        self.sink.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use pylon_core::frame_parser::FrameParser;

    const FRAME: &str = "getpwr\r\n@\r\n51200#10500#25000#1000#Normal#Normal#Normal#Normal\r\n3300#0#OK#OK\r\n3310#0#OK#OK\r\n0\r\n150\r\n$$\r\n";

    fn publisher() -> TelemetryPublisher<RecordingSink> {
        TelemetryPublisher::new(
            RecordingSink::connected(),
            TopicScheme::new("homeassistant", "bms"),
            DeviceMetadata {
                identifiers: vec!["bms".to_string()],
                name: "BMS".to_string(),
                manufacturer: "Pylontech".to_string(),
                model: "US5000".to_string(),
            },
            CellLayout::Extended,
        )
    }

    fn snapshot() -> TelemetrySnapshot {
        FrameParser::new(CellLayout::Extended)
            .parse(FRAME)
            .into_complete()
            .unwrap()
    }

    #[test]
    fn test_discovery_is_retained_and_idempotent() {
        let mut publisher = publisher();
        assert_eq!(publisher.publish_pack_discovery(), 0);
        assert_eq!(publisher.publish_pack_discovery(), 0);

        let log = publisher.sink().log.lock().unwrap();
        let count = pack_metrics().len();
        assert_eq!(log.messages.len(), count * 2);
        assert!(log.messages.iter().all(|m| m.retain));
        assert_eq!(log.messages[..count], log.messages[count..]);

        let voltage = &log.messages[0];
        assert_eq!(voltage.topic, "homeassistant/sensor/bms_voltage/config");
        let document: serde_json::Value = serde_json::from_str(&voltage.payload).unwrap();
        assert_eq!(document["state_topic"], "homeassistant/sensor/bms_voltage/state");
        assert_eq!(document["unit_of_measurement"], "V");
        assert_eq!(document["device"]["manufacturer"], "Pylontech");
    }

    #[test]
    fn test_publish_snapshot_states() {
        let mut publisher = publisher();
        let report = publisher.publish(&snapshot());
        assert_eq!(report.failed, 0);

        let log = publisher.sink().log.lock().unwrap();
        let state = |topic: &str| {
            log.messages
                .iter()
                .find(|m| m.topic == topic)
                .map(|m| m.payload.clone())
        };

        assert_eq!(
            state("homeassistant/sensor/bms_voltage/state").as_deref(),
            Some("51.2")
        );
        assert_eq!(
            state("homeassistant/sensor/bms_current/state").as_deref(),
            Some("10.5")
        );
        assert_eq!(
            state("homeassistant/sensor/bms_cell_2_voltage/state").as_deref(),
            Some("3.31")
        );
        assert_eq!(
            state("homeassistant/sensor/bms_cycle_count/state").as_deref(),
            Some("150")
        );
        assert!(log.messages.iter().filter(|m| !m.retain).all(|m| m.topic.ends_with("/state")));
        assert_eq!(report.published, log.messages.iter().filter(|m| !m.retain).count());
    }

    #[test]
    fn test_cells_announced_once() {
        let mut publisher = publisher();
        publisher.publish(&snapshot());
        publisher.publish(&snapshot());

        let log = publisher.sink().log.lock().unwrap();
        let cell_configs = log
            .messages
            .iter()
            .filter(|m| m.topic.contains("_cell_") && m.topic.ends_with("/config"))
            .count();
        // Two cells, four metrics each in the extended layout.
        assert_eq!(cell_configs, 8);
    }

    #[test]
    fn test_failed_publish_does_not_abort_cycle() {
        let mut publisher = publisher();
        publisher.sink().log.lock().unwrap().fail_matching = Some("bms_current/state".to_string());

        let report = publisher.publish(&snapshot());
        assert_eq!(report.failed, 1);
        assert!(report.published > 10);

        let log = publisher.sink().log.lock().unwrap();
        assert!(log.messages.iter().any(|m| m.topic.ends_with("bms_cycle_count/state")));
    }

    #[test]
    fn test_lost_cell_announcement_is_retried() {
        let mut publisher = publisher();
        publisher.sink().log.lock().unwrap().fail_matching = Some("cell_1_voltage/config".to_string());
        publisher.publish(&snapshot());

        publisher.sink().log.lock().unwrap().fail_matching = None;
        publisher.publish(&snapshot());

        let log = publisher.sink().log.lock().unwrap();
        assert_eq!(
            log.messages
                .iter()
                .filter(|m| m.topic.ends_with("bms_cell_1_voltage/config"))
                .count(),
            1
        );
        assert_eq!(
            log.messages
                .iter()
                .filter(|m| m.topic.ends_with("bms_cell_2_voltage/config"))
                .count(),
            1
        );
    }

    #[test]
    fn test_disconnect_reaches_sink() {
        let mut publisher = publisher();
        publisher.disconnect();
        assert!(publisher.sink().log.lock().unwrap().disconnected);
    }
}
