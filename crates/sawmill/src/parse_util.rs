// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lenient parsing of incoming records.
//!
//! The sink stores what it receives even when parts are missing. Every missing
//! value is replaced with a placeholder and noted; the notes end up in the
//! record's `logging_errors` column and in the `INVALID_ARGUMENT` returned to the
//! reporter.

use chrono::{DateTime, NaiveDate, Utc};
use khaleesi_core::error::KhaleesiError;
use khaleesi_core::metadata::from_timestamp;
use khaleesi_core::state::UNKNOWN;

/// Earliest representable instant, stored for missing timestamps.
pub fn min_datetime() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Latest instant stored, used as the end of queries still running.
pub fn max_datetime() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `value`, or `UNKNOWN` when empty. Not noted as a parsing error.
pub fn or_unknown(value: &str) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

/// Collects parsing notes for one record.
#[derive(Debug, Default)]
pub struct Parser {
    errors: Vec<String>,
}

impl Parser {
    /// Start a fresh record.
    pub fn new() -> Self {
        Self::default()
    }

    /// `value`, or `UNKNOWN` with a note when empty.
    pub fn string(&mut self, value: &str, name: &str) -> String {
        if value.is_empty() {
            self.errors.push(format!("{name} is missing"));
            UNKNOWN.to_string()
        } else {
            value.to_string()
        }
    }

    /// The timestamp, or [`min_datetime`] with a note when missing or out of range.
    pub fn timestamp(
        &mut self,
        value: Option<&prost_types::Timestamp>,
        name: &str,
    ) -> DateTime<Utc> {
        match value {
            None => {
                self.errors.push(format!("{name} is missing"));
                min_datetime()
            }
            Some(timestamp) => from_timestamp(timestamp).unwrap_or_else(|| {
                self.errors.push(format!(
                    "{name} is invalid: {}s {}ns",
                    timestamp.seconds, timestamp.nanos
                ));
                min_datetime()
            }),
        }
    }

    /// Record a note that is not about a single field.
    pub fn note(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Whether anything was noted.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// All notes, one per line.
    pub fn joined(&self) -> String {
        self.errors.join("\n")
    }

    /// Append the notes of another parser.
    pub fn extend(&mut self, other: Parser) {
        self.errors.extend(other.errors);
    }

    /// The error returned to the reporter after the record was stored.
    pub fn into_result(self, record: &str) -> khaleesi_core::error::Result<()> {
        if self.is_clean() {
            return Ok(());
        }
        Err(KhaleesiError::invalid_argument(
            "",
            format!("Parsing errors while logging {record}"),
            self.joined(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_values_are_noted() {
        let mut parser = Parser::new();

        assert_eq!(parser.string("value", "a"), "value");
        assert_eq!(parser.string("", "action.details"), UNKNOWN);
        assert_eq!(parser.timestamp(None, "timestamp"), min_datetime());

        assert_eq!(
            parser.joined(),
            "action.details is missing\ntimestamp is missing"
        );
    }

    #[test]
    fn test_out_of_range_timestamp() {
        let mut parser = Parser::new();
        let invalid = prost_types::Timestamp {
            seconds: 0,
            nanos: -1,
        };

        assert_eq!(parser.timestamp(Some(&invalid), "end"), min_datetime());
        assert!(parser.joined().starts_with("end is invalid"));
    }

    #[test]
    fn test_into_result() {
        assert!(Parser::new().into_result("event").is_ok());

        let mut parser = Parser::new();
        parser.string("", "id");
        let error = parser.into_result("event").unwrap_err();

        assert_eq!(error.status, tonic::Code::InvalidArgument);
        assert_eq!(error.private_details, "id is missing");
    }

    #[test]
    fn test_datetime_bounds() {
        assert_eq!(min_datetime().to_rfc3339(), "0001-01-01T00:00:00+00:00");
        assert!(max_datetime() > Utc::now());
        assert_eq!(or_unknown(""), UNKNOWN);
    }
}
