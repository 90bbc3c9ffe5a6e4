//! Data-handler implementations and their registry.
//!
//! A [`DataHandler`] turns one configuration entry into a thread group.
//! The registry maps the config's `name` string to the implementation;
//! "modbus_with_postgres" is the pairing shipped today. Each handler owns
//! its context outright (pipes, barrier, endpoints) and moves the pieces
//! into its worker closures, so there is no shared untyped state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use sdpipe::group::ThreadGroup;
use sdpipe::{ReadyEvent, SensorPipe, ShutdownFlag};
use tracing::{debug, info};

use crate::config::{HandlerConfig, TopConfig};
use crate::consumer::{Consumer, SensorFeed};
use crate::reader::Reader;
use crate::testsrv::{self, GeneratedSensor, TestServer};
use crate::CollectorError;

/// What a handler hands back to startup: its thread group plus the pipes
/// the signal layer should snapshot on a fatal signal.
pub struct HandlerParts {
    pub group: ThreadGroup,
    pub pipes: Vec<(u16, Arc<SensorPipe>)>,
}

/// One data-handler implementation selectable from configuration.
pub trait DataHandler {
    /// The `name` value that selects this implementation.
    fn name(&self) -> &'static str;

    /// Builds the handler's thread group from its config entry.
    fn build(
        &self,
        cfg: &HandlerConfig,
        group_id: u64,
        base_dir: &Path,
        shutdown: &'static ShutdownFlag,
    ) -> Result<HandlerParts, CollectorError>;
}

/// All known handler implementations.
static REGISTRY: &[&(dyn DataHandler + Sync)] = &[&ModbusWithPostgres];

/// Builds thread groups for every enabled handler in the configuration.
pub fn build_groups(
    cfg: &TopConfig,
    base_dir: &Path,
    shutdown: &'static ShutdownFlag,
) -> Result<(Vec<ThreadGroup>, Vec<(u16, Arc<SensorPipe>)>), CollectorError> {
    let mut groups = Vec::new();
    let mut pipes = Vec::new();

    for (idx, handler_cfg) in cfg.data_handlers.iter().enumerate() {
        if !handler_cfg.enabled {
            info!(handler = %handler_cfg.name, "data handler disabled, skipping");
            continue;
        }
        let handler = REGISTRY
            .iter()
            .find(|h| h.name() == handler_cfg.name)
            .ok_or_else(|| {
                CollectorError::Config(format!("unknown data handler {:?}", handler_cfg.name))
            })?;
        let parts = handler.build(handler_cfg, idx as u64, base_dir, shutdown)?;
        groups.push(parts.group);
        pipes.extend(parts.pipes);
    }

    if groups.is_empty() {
        return Err(CollectorError::Config(
            "no enabled data handlers in configuration".into(),
        ));
    }
    Ok((groups, pipes))
}

/// Wire-protocol reader paired with a binary bulk loader.
pub struct ModbusWithPostgres;

impl DataHandler for ModbusWithPostgres {
    fn name(&self) -> &'static str {
        "modbus_with_postgres"
    }

    fn build(
        &self,
        cfg: &HandlerConfig,
        group_id: u64,
        base_dir: &Path,
        shutdown: &'static ShutdownFlag,
    ) -> Result<HandlerParts, CollectorError> {
        let missing = |what: &str| {
            CollectorError::Config(format!("handler {}: missing {what} section", self.name()))
        };
        let modbus = cfg.modbus.as_ref().ok_or_else(|| missing("modbus"))?;
        let postgres = cfg.postgres.as_ref().ok_or_else(|| missing("postgres"))?;
        let pipe_cfg = cfg.pipe.as_ref().ok_or_else(|| missing("pipe"))?;
        let schema_file = cfg.schema_file.as_ref().ok_or_else(|| missing("schema_file"))?;

        let schema_path = if schema_file.is_absolute() {
            schema_file.clone()
        } else {
            base_dir.join(schema_file)
        };
        let schema = crate::config::load_schema(&schema_path)?;

        let ready = Arc::new(ReadyEvent::new());
        let mut pipes = Vec::new();
        let mut writers = HashMap::new();
        let mut feeds = Vec::new();
        let mut generated = Vec::new();

        for (idx, sensor) in schema.sensors.iter().enumerate() {
            let unit_id = sensor.unit_id.unwrap_or(idx as u16 + 1);
            let columns = sensor.columns()?;

            let pipe = Arc::new(
                SensorPipe::with_ready(
                    pipe_cfg.buf_count,
                    pipe_cfg.buf_size.bytes(),
                    ready.clone(),
                )
                .map_err(|e| CollectorError::Config(format!("pipe: {e}")))?,
            );
            let (writer, pipe_reader) = pipe
                .split()
                .map_err(|e| CollectorError::Config(format!("pipe: {e}")))?;

            if writers.insert(unit_id, writer).is_some() {
                return Err(CollectorError::Config(format!(
                    "duplicate unit id {unit_id} in {}",
                    schema_path.display()
                )));
            }
            generated.push(GeneratedSensor {
                unit_id: u8::try_from(unit_id).map_err(|_| {
                    CollectorError::Config(format!("unit id {unit_id} exceeds the wire protocol"))
                })?,
                packet_size: testsrv::packet_size_for(&columns),
            });
            feeds.push(SensorFeed::new(
                unit_id,
                sensor.name.clone(),
                columns,
                pipe.clone(),
                pipe_reader,
            ));
            pipes.push((unit_id, pipe));
            debug!(unit_id, sensor = %sensor.name, "sensor pipe created");
        }

        // Producer, consumer, and the frame generator when testing: all of
        // them meet at one barrier before entering their main loops.
        let worker_count = if cfg.testing.enabled { 3 } else { 2 };
        let barrier = Arc::new(Barrier::new(worker_count));

        let mut group = ThreadGroup::new(group_id, self.name());

        let consumer = Consumer::new(
            postgres.conninfo.clone(),
            cfg.timestamp_unit,
            postgres.mem.bytes(),
            postgres.scratch_size.bytes(),
            feeds,
            ready,
            shutdown,
            barrier.clone(),
        );
        group.add_worker("postgres-writer", move || consumer.run());

        if cfg.testing.enabled {
            let server = TestServer::new(
                modbus.addr.clone(),
                generated,
                Duration::from_micros(100),
                shutdown,
                barrier.clone(),
            );
            group.add_worker("modbus-testsrv", move || server.run());
        }

        let reader = Reader::new(
            modbus.addr.clone(),
            modbus.mem.bytes(),
            modbus.scratch_size.bytes(),
            writers,
            shutdown,
            barrier,
        );
        group.add_worker("modbus-reader", move || reader.run());

        let cleanup_pipes: Vec<Arc<SensorPipe>> =
            pipes.iter().map(|(_, pipe)| pipe.clone()).collect();
        group.set_cleanup(move || {
            info!(pipes = cleanup_pipes.len(), "releasing sensor pipes");
            drop(cleanup_pipes);
        });

        info!(
            group_id,
            sensors = pipes.len(),
            testing = cfg.testing.enabled,
            "built modbus_with_postgres thread group"
        );
        Ok(HandlerParts { group, pipes })
    }
}
