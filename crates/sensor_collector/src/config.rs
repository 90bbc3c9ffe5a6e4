//! JSON configuration documents.
//!
//! Two files drive the service: the top-level document listing data
//! handlers, and the sensor-schema document each handler points at. Size
//! fields accept suffixed strings ("64K", "4M", "1Mi") or plain byte
//! counts.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use pgcopy::TimestampUnit;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::CollectorError;

/// Byte count parsed from a suffixed size string.
///
/// Decimal suffixes `K`/`M`/`G` are powers of 1000; `Ki`/`Mi`/`Gi` are the
/// power-of-two equivalents. A trailing `B` is accepted ("64KB").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub usize);

impl ByteSize {
    #[inline]
    pub fn bytes(self) -> usize {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let stripped = s.strip_suffix(['B', 'b']).unwrap_or(s);
        let (digits, factor) = if let Some(d) = stripped.strip_suffix("Ki") {
            (d, 1usize << 10)
        } else if let Some(d) = stripped.strip_suffix("Mi") {
            (d, 1 << 20)
        } else if let Some(d) = stripped.strip_suffix("Gi") {
            (d, 1 << 30)
        } else if let Some(d) = stripped.strip_suffix(['K', 'k']) {
            (d, 1_000)
        } else if let Some(d) = stripped.strip_suffix(['M', 'm']) {
            (d, 1_000_000)
        } else if let Some(d) = stripped.strip_suffix(['G', 'g']) {
            (d, 1_000_000_000)
        } else {
            (stripped, 1)
        };
        let n: usize = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid size string {s:?}"))?;
        Ok(Self(n * factor))
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string like \"4M\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v as usize))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Top-level service configuration.
#[derive(Debug, Deserialize)]
pub struct TopConfig {
    pub data_handlers: Vec<HandlerConfig>,
}

/// One data-handler entry.
#[derive(Debug, Deserialize)]
pub struct HandlerConfig {
    pub enabled: bool,
    /// Selects the handler implementation, e.g. "modbus_with_postgres".
    pub name: String,
    pub modbus: Option<ModbusConfig>,
    pub postgres: Option<PostgresConfig>,
    pub pipe: Option<PipeConfig>,
    #[serde(default)]
    pub testing: TestingConfig,
    /// Path to the sensor-schema document, resolved relative to the
    /// top-level config file.
    pub schema_file: Option<PathBuf>,
    /// Unit of incoming timestamp fields, fixed per deployment.
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
}

#[derive(Debug, Deserialize)]
pub struct ModbusConfig {
    /// `host:port` of the sensor gateway.
    pub addr: String,
    pub mem: ByteSize,
    pub scratch_size: ByteSize,
}

#[derive(Debug, Deserialize)]
pub struct PostgresConfig {
    /// libpq-style connection string.
    pub conninfo: String,
    pub mem: ByteSize,
    pub scratch_size: ByteSize,
}

#[derive(Debug, Deserialize)]
pub struct PipeConfig {
    pub buf_count: usize,
    pub buf_size: ByteSize,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestingConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Sensor-schema document: one table per sensor.
#[derive(Debug, Deserialize)]
pub struct SchemaConfig {
    pub sensors: Vec<SensorSchema>,
}

#[derive(Debug, Deserialize)]
pub struct SensorSchema {
    pub name: String,
    /// Wire-protocol unit id this sensor's frames carry. Defaults to the
    /// sensor's position in the list plus one.
    pub unit_id: Option<u16>,
    /// Column name to SQL type, in declaration order.
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl SensorSchema {
    /// Declaration-ordered `(column, sql_type)` pairs.
    pub fn columns(&self) -> Result<Vec<(String, String)>, CollectorError> {
        self.data
            .iter()
            .map(|(name, value)| match value.as_str() {
                Some(sql_type) => Ok((name.clone(), sql_type.to_owned())),
                None => Err(CollectorError::Config(format!(
                    "sensor {}: column {name} type must be a string",
                    self.name
                ))),
            })
            .collect()
    }
}

/// Loads and parses the top-level configuration.
pub fn load_config(path: &Path) -> Result<TopConfig, CollectorError> {
    let text = fs::read_to_string(path)
        .map_err(|e| CollectorError::Config(format!("cannot read {}: {e}", path.display())))?;
    let cfg: TopConfig = serde_json::from_str(&text)
        .map_err(|e| CollectorError::Config(format!("{}: {e}", path.display())))?;
    if cfg.data_handlers.is_empty() {
        return Err(CollectorError::Config(
            "no data handlers in configuration".into(),
        ));
    }
    Ok(cfg)
}

/// Loads a sensor-schema document.
pub fn load_schema(path: &Path) -> Result<SchemaConfig, CollectorError> {
    let text = fs::read_to_string(path)
        .map_err(|e| CollectorError::Config(format!("cannot read {}: {e}", path.display())))?;
    let schema: SchemaConfig = serde_json::from_str(&text)
        .map_err(|e| CollectorError::Config(format!("{}: {e}", path.display())))?;
    if schema.sensors.is_empty() {
        return Err(CollectorError::Config(format!(
            "{}: no sensors declared",
            path.display()
        )));
    }
    Ok(schema)
}
