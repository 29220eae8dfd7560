//! Capture configuration
//!
//! [`CaptureConfig`] is the single input of a capture run. It can be built in
//! code, deserialized with serde from any format, or loaded from TOML.
//!
//! ```toml
//! host = "localhost"
//! port = 5432
//! user = "postgres"
//! password = "secret"
//! database = "shop"
//! schema = "public"
//! tables = ["orders"]
//! slot_name = "cap1"
//! stream_old_data = true
//! batch_size = 2
//! ```

use crate::error::{CaptureError, Result};
use crate::retry::RetryConfig;
use crate::types::{parse_lsn, Lsn};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MEMORY_SAFETY_FACTOR: f64 = 0.7;
pub const DEFAULT_ROW_SIZE: u64 = 1024;
pub const DEFAULT_STANDBY_TIMEOUT_SECS: u64 = 10;

/// TLS verification mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerify {
    /// Plain connection
    #[default]
    None,
    /// TLS with certificate and host name verification
    #[serde(alias = "require")]
    Full,
}

impl TlsVerify {
    /// libpq `sslmode` for this mode
    pub fn sslmode(&self) -> &'static str {
        match self {
            TlsVerify::None => "disable",
            TlsVerify::Full => "verify-full",
        }
    }
}

/// Configuration of one capture run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schema: String,
    /// Tables to capture, unqualified
    pub tables: Vec<String>,
    pub slot_name: String,
    pub tls_verify: TlsVerify,
    /// Bulk load existing rows before streaming
    pub stream_old_data: bool,
    /// Emit one batch per change instead of grouping same-table runs
    pub separate_changes: bool,
    /// Fraction of available memory one snapshot page may use, in (0, 1]
    pub snapshot_memory_safety_factor: f64,
    /// Upper bound of rows per snapshot page
    pub batch_size: usize,
    /// Acknowledge WAL that carried nothing for the consumer
    pub auto_ack: bool,
    /// Resume position in `X/X` form
    pub last_lsn: Option<String>,
    /// Row offset at which every table's snapshot starts
    pub snapshot_offset: u64,
    /// Bytes of memory available to the snapshot; detected when unset
    pub available_memory: Option<u64>,
    /// Row size assumed when the table gives no estimate
    pub default_row_size: u64,
    /// Offset for timestamps without a zone, e.g. `+02:00`; UTC when unset
    pub time_zone: Option<String>,
    pub standby_timeout_secs: u64,
    #[serde(skip)]
    pub retry: RetryConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            schema: String::new(),
            tables: Vec::new(),
            slot_name: String::new(),
            tls_verify: TlsVerify::None,
            stream_old_data: false,
            separate_changes: false,
            snapshot_memory_safety_factor: 0.0,
            batch_size: 0,
            auto_ack: false,
            last_lsn: None,
            snapshot_offset: 0,
            available_memory: None,
            default_row_size: DEFAULT_ROW_SIZE,
            time_zone: None,
            standby_timeout_secs: DEFAULT_STANDBY_TIMEOUT_SECS,
            retry: RetryConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check required fields and fill in defaults
    ///
    /// The first missing or invalid field is reported as a
    /// [`CaptureError::Config`]; nothing is connected before this passes.
    pub fn validate_and_default(&mut self) -> Result<()> {
        let required = [
            (self.host.is_empty(), "db_host must be provided"),
            (self.password.is_empty(), "db_password must be provided"),
            (self.user.is_empty(), "db_user must be provided"),
            (self.port == 0, "db_port must be provided"),
            (self.database.is_empty(), "db_name must be provided"),
            (self.schema.is_empty(), "db_schema must be provided"),
            (
                self.slot_name.is_empty(),
                "replication_slot_name must be provided",
            ),
            (self.tables.is_empty(), "db_tables must not be empty"),
        ];
        if let Some((_, message)) = required.iter().find(|(missing, _)| *missing) {
            return Err(CaptureError::config(*message));
        }

        if let Some(table) = self.tables.iter().find(|t| t.trim().is_empty()) {
            return Err(CaptureError::config(format!(
                "table names must not be empty, got {table:?}"
            )));
        }

        if self.batch_size < 1 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.snapshot_memory_safety_factor == 0.0 {
            self.snapshot_memory_safety_factor = DEFAULT_MEMORY_SAFETY_FACTOR;
        }
        if !(self.snapshot_memory_safety_factor > 0.0 && self.snapshot_memory_safety_factor <= 1.0) {
            return Err(CaptureError::config(format!(
                "snapshot_memory_safety_factor must be in (0, 1], got {}",
                self.snapshot_memory_safety_factor
            )));
        }
        if self.default_row_size == 0 {
            self.default_row_size = DEFAULT_ROW_SIZE;
        }
        if self.standby_timeout_secs == 0 {
            self.standby_timeout_secs = DEFAULT_STANDBY_TIMEOUT_SECS;
        }

        self.resume_position()?;
        self.time_zone_offset()?;

        Ok(())
    }

    /// Resume position parsed from `last_lsn`
    pub fn resume_position(&self) -> Result<Option<Lsn>> {
        match self.last_lsn.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => parse_lsn(text)
                .map(|lsn| Some(Lsn(lsn)))
                .map_err(|e| CaptureError::config(format!("last_lsn is invalid: {e}"))),
        }
    }

    /// Zone used for timestamps that carry no offset
    pub fn time_zone_offset(&self) -> Result<FixedOffset> {
        match self.time_zone.as_deref() {
            None => Ok(utc()),
            Some(text) => parse_offset(text).ok_or_else(|| {
                CaptureError::config(format!(
                    "time_zone must be UTC or an offset like +02:00, got {text:?}"
                ))
            }),
        }
    }

    pub fn standby_timeout(&self) -> Duration {
        Duration::from_secs(self.standby_timeout_secs)
    }

    /// Name of the publication scoped to this slot
    pub fn publication_name(&self) -> String {
        format!("pglog_stream_{}", self.slot_name)
    }

    /// Connection string for the replication connection
    pub fn replication_conninfo(&self) -> String {
        format!("{} replication=database", self.regular_conninfo())
    }

    /// Connection string for regular SQL (snapshot) connections
    pub fn regular_conninfo(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode={} application_name=pg_capture",
            conninfo_value(&self.host),
            self.port,
            conninfo_value(&self.user),
            conninfo_value(&self.password),
            conninfo_value(&self.database),
            self.tls_verify.sslmode(),
        )
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Parse `UTC`, `Z`, `+HH`, `+HHMM` or `+HH:MM`
pub(crate) fn parse_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("utc") || text == "Z" {
        return Some(utc());
    }

    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if minutes >= 60 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Quote a libpq keyword value
fn conninfo_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> CaptureConfig {
        CaptureConfig {
            host: "localhost".into(),
            user: "postgres".into(),
            password: "secret".into(),
            database: "shop".into(),
            schema: "public".into(),
            tables: vec!["orders".into()],
            slot_name: "cap1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let mut config = valid();
        config.validate_and_default().unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.snapshot_memory_safety_factor, 0.7);
        assert_eq!(config.tls_verify, TlsVerify::None);
        assert_eq!(config.standby_timeout(), Duration::from_secs(10));
        assert_eq!(config.publication_name(), "pglog_stream_cap1");
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let mut config = valid();
        config.batch_size = 2;
        config.snapshot_memory_safety_factor = 0.5;
        config.validate_and_default().unwrap();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.snapshot_memory_safety_factor, 0.5);
    }

    #[test]
    fn test_missing_fields_are_reported_in_order() {
        let cases: [(fn(&mut CaptureConfig), &str); 8] = [
            (|c| c.host.clear(), "db_host must be provided"),
            (|c| c.password.clear(), "db_password must be provided"),
            (|c| c.user.clear(), "db_user must be provided"),
            (|c| c.port = 0, "db_port must be provided"),
            (|c| c.database.clear(), "db_name must be provided"),
            (|c| c.schema.clear(), "db_schema must be provided"),
            (|c| c.slot_name.clear(), "replication_slot_name must be provided"),
            (|c| c.tables.clear(), "db_tables must not be empty"),
        ];

        for (break_it, expected) in cases {
            let mut config = valid();
            break_it(&mut config);
            match config.validate_and_default() {
                Err(CaptureError::Config(msg)) => assert_eq!(msg, expected),
                other => panic!("expected config error {expected:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_safety_factor_range() {
        for factor in [-0.1, 1.5, f64::NAN] {
            let mut config = valid();
            config.snapshot_memory_safety_factor = factor;
            assert!(config.validate_and_default().is_err(), "factor {factor}");
        }

        let mut config = valid();
        config.snapshot_memory_safety_factor = 1.0;
        assert!(config.validate_and_default().is_ok());
    }

    #[test]
    fn test_resume_position() {
        let mut config = valid();
        assert_eq!(config.resume_position().unwrap(), None);

        config.last_lsn = Some("16/B374D848".into());
        assert_eq!(config.resume_position().unwrap(), Some(Lsn(0x16B374D848)));

        config.last_lsn = Some("garbage".into());
        assert!(config.validate_and_default().is_err());
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -19800);
        assert_eq!(parse_offset("+07").unwrap().local_minus_utc(), 25200);
        assert!(parse_offset("Europe/Paris").is_none());
        assert!(parse_offset("+2:0").is_none());
        assert!(parse_offset("+01:75").is_none());
    }

    #[test]
    fn test_conninfo() {
        let mut config = valid();
        config.password = "it's\\secret".into();
        config.tls_verify = TlsVerify::Full;

        let conninfo = config.replication_conninfo();
        assert!(conninfo.contains("host='localhost'"));
        assert!(conninfo.contains("port=5432"));
        assert!(conninfo.contains(r"password='it\'s\\secret'"));
        assert!(conninfo.contains("sslmode=verify-full"));
        assert!(conninfo.ends_with("replication=database"));

        assert!(!config.regular_conninfo().contains("replication"));
    }

    #[test]
    fn test_from_toml() {
        let config = CaptureConfig::from_toml_str(
            r#"
            host = "db"
            port = 6432
            user = "capture"
            password = "pw"
            database = "shop"
            schema = "public"
            tables = ["orders", "customers"]
            slot_name = "cap1"
            tls_verify = "require"
            stream_old_data = true
            auto_ack = true
            batch_size = 2
            last_lsn = "0/16B3748"
            time_zone = "+01:00"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 6432);
        assert_eq!(config.tables, vec!["orders", "customers"]);
        assert_eq!(config.tls_verify, TlsVerify::Full);
        assert!(config.stream_old_data);
        assert!(config.auto_ack);
        assert!(!config.separate_changes);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.time_zone_offset().unwrap().local_minus_utc(), 3600);
        assert_eq!(config.default_row_size, DEFAULT_ROW_SIZE);
    }

    #[test]
    fn test_from_toml_rejects_unknown_tls_mode() {
        let err = CaptureConfig::from_toml_str(r#"tls_verify = "maybe""#).unwrap_err();
        assert!(matches!(err, CaptureError::Toml(_)));
    }
}
