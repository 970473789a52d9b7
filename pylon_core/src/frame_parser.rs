use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{DelimiterClassifier, LineClassifier};
use crate::coerce::{to_counter, to_i64, to_scaled};
use crate::constants::frame::*;
use crate::error::BmsError;
use crate::records::{CellRecord, FooterRecord, SummaryRecord, TelemetrySnapshot};

/// Which fields the firmware prints per cell line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellLayout {
    /// Voltage followed by at least one other field.
    Basic,
    /// Voltage, temperature and two status codes.
    #[default]
    Extended,
}

impl CellLayout {
    /// Minimum number of fields for a cell line to be accepted.
    pub fn min_fields(self) -> usize {
        match self {
            CellLayout::Basic => BASIC_CELL_MIN_FIELDS,
            CellLayout::Extended => EXTENDED_CELL_MIN_FIELDS,
        }
    }
}

/// Result of parsing one response block.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    pub snapshot: TelemetrySnapshot,
    pub complete: bool,
}

impl ParsedFrame {
    /// Converts an incomplete frame into `BmsError::Incomplete`.
    pub fn into_complete(self) -> Result<TelemetrySnapshot, BmsError> {
        if self.complete {
            Ok(self.snapshot)
        } else {
            Err(BmsError::Incomplete {
                summary: self.snapshot.summary.is_some(),
                cells: self.snapshot.cells.len(),
                footer: self.snapshot.footer.is_some(),
            })
        }
    }
}

/// Turns the text returned by `getpwr` into a `TelemetrySnapshot`.
///
/// The parser never fails. Frames that are too short or garbled come back as
/// incomplete snapshots and the caller decides whether to skip the cycle.
#[derive(Debug, Clone)]
pub struct FrameParser<C = DelimiterClassifier> {
    classifier: C,
    layout: CellLayout,
}

impl FrameParser<DelimiterClassifier> {
    /// Creates a parser for the stock console framing (`#` delimited, `@` block start).
    pub fn new(layout: CellLayout) -> Self {
        Self::with_classifier(DelimiterClassifier::default(), layout)
    }
}

impl<C: LineClassifier> FrameParser<C> {
    /// Creates a parser with a custom line classification strategy.
    ///
    /// # Arguments
    ///
    /// - `classifier` (`C`) - Decides which lines are frame data and how they split into fields.
    /// - `layout` (`CellLayout`) - How many fields a cell line must carry.
    pub fn with_classifier(classifier: C, layout: CellLayout) -> Self {
        Self { classifier, layout }
    }

    pub fn layout(&self) -> CellLayout {
        self.layout
    }

    /// Parses a raw response block, stamping the snapshot with the current time.
    pub fn parse(&self, raw: &str) -> ParsedFrame {
        self.parse_at(raw, Utc::now())
    }

    /// Parses a raw response block.
    ///
    /// The first qualifying line is the header, the last two are the footer and
    /// everything between them is a cell line. Cell lines with too few fields
    /// are dropped, and accepted cells are numbered from 1 in line order.
    ///
    /// # Arguments
    ///
    /// - `raw` (`&str`) - Decoded console output for one command, echo and prompts included.
    /// - `captured_at` (`DateTime<Utc>`) - Capture time recorded in the snapshot.
    ///
    /// # Returns
    ///
    /// - `ParsedFrame` - The snapshot and whether it is complete enough to publish.
    pub fn parse_at(&self, raw: &str, captured_at: DateTime<Utc>) -> ParsedFrame {
        let mut snapshot = TelemetrySnapshot::empty(captured_at);

        let lines: Vec<&str> = self
            .classifier
            .body(raw)
            .lines()
            .map(str::trim)
            .filter(|line| self.classifier.qualifies(line))
            .collect();

        if lines.len() < MIN_QUALIFYING_LINES {
            return ParsedFrame {
                snapshot,
                complete: false,
            };
        }

        let footer_start = lines.len() - FOOTER_LINES;
        let header = lines[0];
        let cell_lines = &lines[1..footer_start];
        let footer_lines = &lines[footer_start..];

        snapshot.summary = self.parse_summary(header);
        snapshot.cells = self.parse_cells(cell_lines);
        snapshot.footer = Some(FooterRecord {
            error_code: to_counter(footer_lines[0]),
            cycle_count: to_counter(footer_lines[1]),
        });

        let complete = snapshot.is_complete();
        ParsedFrame { snapshot, complete }
    }

    fn parse_summary(&self, header: &str) -> Option<SummaryRecord> {
        let fields = self.classifier.fields(header);
        if fields.len() < SUMMARY_MIN_FIELDS {
            return None;
        }

        Some(SummaryRecord {
            voltage_volts: to_scaled(fields[0]),
            current_amps: to_scaled(fields[1]),
            avg_temperature_celsius: to_scaled(fields[2]),
            capacity: to_i64(fields[3]),
            status: fields[4].to_string(),
            voltage_status: fields[5].to_string(),
            current_status: fields[6].to_string(),
            temperature_status: fields[7].to_string(),
        })
    }

    fn parse_cells(&self, lines: &[&str]) -> Vec<CellRecord> {
        let min_fields = self.layout.min_fields();

        lines
            .iter()
            .map(|line| self.classifier.fields(line))
            .filter(|fields| fields.len() >= min_fields)
            .zip(1u32..)
            .map(|(fields, id)| match self.layout {
                CellLayout::Basic => CellRecord {
                    id,
                    voltage_volts: to_scaled(fields[0]),
                    temperature_celsius: None,
                    status_1: None,
                    status_2: None,
                },
                CellLayout::Extended => CellRecord {
                    id,
                    voltage_volts: to_scaled(fields[0]),
                    temperature_celsius: Some(to_scaled(fields[1])),
                    status_1: Some(fields[2].to_string()),
                    status_2: Some(fields[3].to_string()),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "51200#10500#25000#1000#Normal#Normal#Normal#Normal";

    fn frame(lines: &[&str]) -> String {
        let mut out = String::from("getpwr\r\n@\r\n");
        for line in lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str("$$\r\nCommand completed successfully\r\n$$\r\npylon_debug>");
        out
    }

    #[test]
    fn test_parses_complete_frame() {
        let raw = frame(&[HEADER, "3300#0#OK#OK", "3310#0#OK#OK", "0", "150"]);
        let parsed = FrameParser::new(CellLayout::Extended).parse(&raw);
        assert!(parsed.complete);

        let summary = parsed.snapshot.summary.as_ref().unwrap();
        assert_eq!(summary.voltage_volts, 51.2);
        assert_eq!(summary.current_amps, 10.5);
        assert_eq!(summary.avg_temperature_celsius, 25.0);
        assert_eq!(summary.capacity, 1000);
        assert_eq!(summary.status, "Normal");
        assert_eq!(summary.temperature_status, "Normal");

        let cells = &parsed.snapshot.cells;
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].id, 1);
        assert_eq!(cells[1].id, 2);
        assert_eq!(cells[0].voltage_volts, 3.3);
        assert_eq!(cells[1].voltage_volts, 3.31);
        assert_eq!(cells[0].temperature_celsius, Some(0.0));
        assert_eq!(cells[0].status_1.as_deref(), Some("OK"));

        assert_eq!(
            parsed.snapshot.footer,
            Some(FooterRecord {
                error_code: 0,
                cycle_count: 150
            })
        );
    }

    #[test]
    fn test_too_few_lines_is_incomplete() {
        let parser = FrameParser::new(CellLayout::Extended);
        let header_only = frame(&[HEADER, "0"]);
        for raw in ["", "pylon_debug>", "getpwr\r\n1#2\r\n", header_only.as_str()] {
            let parsed = parser.parse(raw);
            assert!(!parsed.complete);
            assert!(parsed.snapshot.summary.is_none());
            assert!(parsed.snapshot.footer.is_none());
        }
    }

    #[test]
    fn test_header_and_footer_without_cells_is_incomplete() {
        let parsed = FrameParser::new(CellLayout::Extended).parse(&frame(&[HEADER, "0", "150"]));
        assert!(!parsed.complete);
        assert!(parsed.snapshot.summary.is_some());
        assert!(parsed.snapshot.footer.is_some());
        assert!(parsed.snapshot.cells.is_empty());
    }

    #[test]
    fn test_short_header_leaves_summary_empty() {
        let parsed =
            FrameParser::new(CellLayout::Extended).parse(&frame(&["51200#10500#25000", "3300#0#OK#OK", "0", "7"]));
        assert!(!parsed.complete);
        assert!(parsed.snapshot.summary.is_none());
        assert_eq!(parsed.snapshot.cells.len(), 1);
    }

    #[test]
    fn test_rejected_cell_lines_do_not_consume_ids() {
        let raw = frame(&[HEADER, "3300#0#OK#OK", "3290#0", "3310#0#OK#OK", "0", "150"]);
        let parsed = FrameParser::new(CellLayout::Extended).parse(&raw);
        let ids: Vec<u32> = parsed.snapshot.cells.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(parsed.snapshot.cells[1].voltage_volts, 3.31);
    }

    #[test]
    fn test_basic_layout_accepts_two_fields() {
        let raw = frame(&[HEADER, "3300#0", "3290#1#OK#OK", "4", "5"]);
        let parsed = FrameParser::new(CellLayout::Basic).parse(&raw);
        assert!(parsed.complete);
        assert_eq!(parsed.snapshot.cells.len(), 2);
        assert_eq!(parsed.snapshot.cells[1].voltage_volts, 3.29);
        assert!(parsed.snapshot.cells[1].temperature_celsius.is_none());
        assert_eq!(
            parsed.snapshot.footer,
            Some(FooterRecord {
                error_code: 4,
                cycle_count: 5
            })
        );
    }

    #[test]
    fn test_garbled_numbers_fall_back_to_defaults() {
        let raw = frame(&["x#y#z#q#A#B#C#D", "v#t#OK#OK", "e#", "?#"]);
        let parsed = FrameParser::new(CellLayout::Extended).parse(&raw);
        assert!(parsed.complete);
        let summary = parsed.snapshot.summary.unwrap();
        assert_eq!(summary.voltage_volts, 0.0);
        assert_eq!(summary.capacity, 0);
        assert_eq!(parsed.snapshot.cells[0].voltage_volts, 0.0);
        assert_eq!(parsed.snapshot.footer.unwrap().cycle_count, 0);
    }

    #[test]
    fn test_into_complete_reports_missing_groups() {
        let parsed = FrameParser::new(CellLayout::Extended).parse(&frame(&[HEADER, "0", "1"]));
        match parsed.into_complete() {
            Err(BmsError::Incomplete {
                summary,
                cells,
                footer,
            }) => {
                assert!(summary);
                assert_eq!(cells, 0);
                assert!(footer);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_custom_classifier() {
        let parser = FrameParser::with_classifier(DelimiterClassifier::new(',', None), CellLayout::Basic);
        let raw = "51200,0,25000,1000,N,N,N,N\n3300,1\n0\n9\n";
        let parsed = parser.parse(raw);
        assert!(parsed.complete);
        assert_eq!(parsed.snapshot.footer.unwrap().cycle_count, 9);
    }
}
