//! Consumer loop: pipes in, column store out.
//!
//! One consumer thread serves all sensors of a data handler. Startup
//! creates the sensor tables, discovers their packed-row layout, and binds
//! each pipe's packet size; the main loop then blocks on the shared
//! readiness event and drains every pipe buffer it can get without
//! waiting, bulk-loading one buffer per transaction.

use std::sync::{Arc, Barrier};

use pgcopy::{insert_batch, schema, CopyEncoder, TableInfo, TimestampUnit};
use postgres::{Client, NoTls};
use sdpipe::{scratch, Arena, PipeReader, ReadyEvent, SensorPipe, ShutdownFlag, Timeout};
use tracing::{debug, error, info, warn};

use crate::reader::SCRATCH_COUNT;
use crate::{CollectorError, ErrorKind};

/// Consecutive empty waits before the consumer gives up.
const MAX_WAIT_TIMEOUTS: u32 = 5;
/// Consecutive load failures before the consumer gives up.
const MAX_DB_FAILURES: u32 = 5;
const WAIT_TIMEOUT: Timeout = Timeout::ms(100);

/// One sensor's table binding and pipe endpoint.
pub struct SensorFeed {
    pub unit_id: u16,
    pub table: String,
    /// `(column, sql_type)` pairs from the schema document.
    pub columns: Vec<(String, String)>,
    pub pipe: Arc<SensorPipe>,
    pub reader: PipeReader,
    info: Option<TableInfo>,
}

impl SensorFeed {
    pub fn new(
        unit_id: u16,
        table: String,
        columns: Vec<(String, String)>,
        pipe: Arc<SensorPipe>,
        reader: PipeReader,
    ) -> Self {
        Self {
            unit_id,
            table,
            columns,
            pipe,
            reader,
            info: None,
        }
    }
}

pub struct Consumer {
    conninfo: String,
    unit: TimestampUnit,
    mem: usize,
    scratch_size: usize,
    feeds: Vec<SensorFeed>,
    ready: Arc<ReadyEvent>,
    shutdown: &'static ShutdownFlag,
    barrier: Arc<Barrier>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conninfo: String,
        unit: TimestampUnit,
        mem: usize,
        scratch_size: usize,
        feeds: Vec<SensorFeed>,
        ready: Arc<ReadyEvent>,
        shutdown: &'static ShutdownFlag,
        barrier: Arc<Barrier>,
    ) -> Self {
        Self {
            conninfo,
            unit,
            mem,
            scratch_size,
            feeds,
            ready,
            shutdown,
            barrier,
        }
    }

    /// Thread entry point.
    pub fn run(mut self) {
        let mut arena = Arena::new(self.mem + SCRATCH_COUNT * self.scratch_size);
        for _ in 0..SCRATCH_COUNT {
            if let Some(s) = arena.bootstrap(self.scratch_size) {
                scratch::register(s);
            }
        }

        let mut client = match self.setup() {
            Ok(client) => client,
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "consumer setup failed");
                // Producers are parked at the barrier; let them through and
                // take the whole service down, as a handler without its
                // store is a startup failure.
                self.barrier.wait();
                self.shutdown.request();
                return;
            }
        };

        info!("consumer initialized, waiting at barrier");
        self.barrier.wait();
        info!("consumer entering main loop");

        match self.pump(&mut client) {
            Ok(total) => info!(items = total, "consumer stopped"),
            Err(e) => {
                error!(kind = %e.kind(), code = e.kind().code(), error = %e, "consumer failed");
                self.shutdown.request();
            }
        }
    }

    /// Connects, creates tables, discovers layouts, binds pipe schemas.
    fn setup(&mut self) -> Result<Client, CollectorError> {
        let mut client = Client::connect(&self.conninfo, NoTls)
            .map_err(|e| CollectorError::Copy(e.into()))?;
        info!("connected to column store");

        for feed in &mut self.feeds {
            schema::create_sensor_table(&mut client, &feed.table, &feed.columns)?;
            let info = schema::discover(&mut client, &feed.table)?;
            feed.pipe
                .bind_schema(info.row_size)
                .map_err(|e| CollectorError::Config(format!("table {}: {e}", feed.table)))?;
            debug!(
                table = %feed.table,
                unit_id = feed.unit_id,
                packet_size = info.row_size,
                items_per_buffer = feed.pipe.items_per_buffer(),
                "bound sensor schema to pipe"
            );
            feed.info = Some(info);
        }
        Ok(client)
    }

    fn pump(&mut self, client: &mut Client) -> Result<u64, CollectorError> {
        let mut seen = 0u64;
        let mut timeouts = 0u32;
        let mut failures = 0u32;
        let mut total: u64 = 0;

        while !self.shutdown.requested() {
            if !self.ready.wait(&mut seen, WAIT_TIMEOUT) {
                timeouts += 1;
                if timeouts >= MAX_WAIT_TIMEOUTS {
                    return Err(CollectorError::ConsumerStarved(timeouts));
                }
                continue;
            }
            timeouts = 0;

            for feed in &mut self.feeds {
                let info = feed.info.as_ref().expect("schema bound during setup");
                while let Ok(buf) = feed.reader.acquire(Timeout::NoWait) {
                    let items = buf.packet_count();
                    if items == 0 {
                        continue;
                    }

                    let need = CopyEncoder::new(info, self.unit).max_encoded_size(items);
                    let mut scratch = scratch::get(&[]).ok_or_else(|| {
                        CollectorError::ResourceExhausted("no scratch arena on consumer".into())
                    })?;
                    let scratch_cap = scratch.capacity();
                    let out = scratch.push(need).ok_or_else(|| {
                        CollectorError::ResourceExhausted(format!(
                            "encode buffer needs {need} bytes, scratch holds {scratch_cap}"
                        ))
                    })?;

                    match insert_batch(client, info, self.unit, &buf, items, out) {
                        Ok(()) => {
                            failures = 0;
                            total += items as u64;
                            debug!(table = %feed.table, items, total, "buffer loaded");
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(
                                table = %feed.table,
                                failures,
                                error = %e,
                                "bulk load failed, batch dropped"
                            );
                            if failures >= MAX_DB_FAILURES {
                                error!(
                                    kind = %ErrorKind::DbCopyFailed,
                                    "load failures over threshold, stopping consumer"
                                );
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(total)
    }
}
