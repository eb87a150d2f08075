//! The poll engine.
//!
//! A poll cycle walks the configured servers one after the other. For every
//! server the engine
//!
//! 1. asks the [`Recorder`] for a new, empty record,
//! 2. connects to the server,
//! 3. reads, decodes, converts and stores every register in declared order,
//! 4. stamps the record and closes the connection.
//!
//! A failed connection skips step 3 but never step 4. A failed register read
//! is reported and leaves that value empty; the remaining registers are still
//! read. Only persistence failures and misconfigured registers abort a cycle.

use crate::descriptor::ServerDescriptor;
use crate::recorder::Recorder;
use crate::reporter::Reporter;
use crate::storage::{RecordId, Store};
use crate::transport::{Connection, Transport};
use crate::{conversion, protocol, Error, Result};
use chrono::{DateTime, Utc};
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A failure isolated to one server or one register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    /// The server could not be reached, none of its registers was read.
    Connect { server: String },
    /// The server answered a register read with an error.
    Read { server: String, register: String },
    /// The link failed while a register was read.
    ConnectionClosed { server: String, register: String },
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFailure::Connect { server } => write!(f, "error connecting to {server}"),
            PollFailure::Read { server, register } => {
                write!(f, "error reading {server};{register}")
            }
            PollFailure::ConnectionClosed { server, register } => write!(
                f,
                "connection unexpectedly closed while reading {server};{register}"
            ),
        }
    }
}

/// Cooperative stop signal shared between the engine and a signal handler.
///
/// The engine looks at it before each register read and before each server,
/// so a stop request lets the in-flight read finish and the current record
/// be stamped.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    stopping: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Safe to call from any thread.
    pub fn trigger(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until a stop is requested. Returns true if stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            _ = self.notify.notified() => true,
        }
    }
}

/// What happened to one server during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOutcome {
    pub server: String,
    pub record_id: RecordId,
    pub connected: bool,
    /// Register name and stored value, in register order.
    pub values: Vec<(String, Option<f64>)>,
    pub failures: Vec<PollFailure>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ServerOutcome {
    fn new(server: &ServerDescriptor, record_id: RecordId) -> Self {
        Self {
            server: server.name.to_string(),
            record_id,
            connected: false,
            values: server
                .registers
                .iter()
                .map(|register| (register.name.to_string(), None))
                .collect(),
            failures: Vec::new(),
            timestamp: None,
        }
    }

    pub fn value(&self, register: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == register)
            .and_then(|(_, value)| *value)
    }

    fn fail(&mut self, failure: PollFailure, reporter: &dyn Reporter) {
        reporter.notify_error(&failure.to_string());
        self.failures.push(failure);
    }
}

/// The result of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub outcomes: Vec<ServerOutcome>,
    /// A stop request cut the cycle short.
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn outcome(&self, server: &str) -> Option<&ServerOutcome> {
        self.outcomes.iter().find(|outcome| outcome.server == server)
    }

    pub fn value_count(&self) -> usize {
        self.outcomes
            .iter()
            .flat_map(|outcome| &outcome.values)
            .filter(|(_, value)| value.is_some())
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.failures.len()).sum()
    }
}

/// Polls a fixed list of servers and records every cycle.
pub struct PollEngine<T, S> {
    servers: Vec<ServerDescriptor>,
    transport: T,
    recorder: Recorder<S>,
    reporter: Arc<dyn Reporter>,
    shutdown: Shutdown,
}

impl<T: Transport, S: Store> PollEngine<T, S> {
    pub fn new(
        servers: Vec<ServerDescriptor>,
        transport: T,
        recorder: Recorder<S>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            servers,
            transport,
            recorder,
            reporter,
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    pub fn recorder(&self) -> &Recorder<S> {
        &self.recorder
    }

    /// Creates the storage tables. Must run before the first cycle.
    pub async fn prepare(&self) -> Result<()> {
        self.recorder.ensure_schema(&self.servers).await
    }

    /// Runs one cycle over all servers.
    ///
    /// Fails only if persistence is unavailable or a register is
    /// misconfigured; every other failure is reported and recorded as a
    /// missing value.
    pub async fn poll_cycle(&mut self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        for server in &self.servers {
            if self.shutdown.is_triggered() {
                info!("Stop requested, skipping remaining servers");
                break;
            }
            let outcome = poll_server(
                server,
                &self.transport,
                &mut self.recorder,
                self.reporter.as_ref(),
                &self.shutdown,
            )
            .await?;
            summary.outcomes.push(outcome);
        }
        summary.interrupted = self.shutdown.is_triggered();
        info!(
            "Poll cycle done: {} servers, {} values, {} failures{}",
            summary.outcomes.len(),
            summary.value_count(),
            summary.failure_count(),
            if summary.interrupted {
                ", interrupted"
            } else {
                ""
            }
        );
        Ok(summary)
    }

    /// Repeats poll cycles every `poll_interval` until a stop is requested.
    ///
    /// A cycle aborted by unavailable persistence is logged and retried at
    /// the next interval; a misconfigured register ends the loop.
    pub async fn run(&mut self, poll_interval: Duration) -> Result<()> {
        while !self.shutdown.is_triggered() {
            let started = tokio::time::Instant::now();
            match self.poll_cycle().await {
                Ok(_) => {}
                Err(Error::PersistenceUnavailable(err)) => {
                    error!("Poll cycle aborted, persistence unavailable: {err}");
                }
                Err(err) => return Err(err),
            }
            let wait = poll_interval.saturating_sub(started.elapsed());
            debug!("Next poll cycle in {wait:?}");
            if self.shutdown.sleep(wait).await {
                break;
            }
        }
        info!("Poll loop stopped");
        Ok(())
    }
}

/// One server's turn: create the record, connect, read all registers, stamp.
async fn poll_server<T: Transport, S: Store>(
    server: &ServerDescriptor,
    transport: &T,
    recorder: &mut Recorder<S>,
    reporter: &dyn Reporter,
    shutdown: &Shutdown,
) -> Result<ServerOutcome> {
    let record_id = recorder.create_pending(server).await?;
    let mut outcome = ServerOutcome::new(server, record_id);
    debug!(
        "{}: record {record_id} created, connecting to {}:{} (unit {})",
        server.name, server.host, server.port, server.unit_id
    );

    let mut connection = match transport
        .connect(&server.host, server.port, server.unit_id)
        .await
    {
        Ok(connection) => connection,
        Err(err) => {
            warn!(
                "Cannot connect to {} at {}:{}: {err}",
                server.name, server.host, server.port
            );
            outcome.fail(
                PollFailure::Connect {
                    server: server.name.to_string(),
                },
                reporter,
            );
            outcome.timestamp = Some(recorder.finalize_timestamp(server, record_id).await?);
            return Ok(outcome);
        }
    };
    outcome.connected = true;

    let result = poll_registers(
        server,
        &mut connection,
        record_id,
        recorder,
        reporter,
        shutdown,
        &mut outcome,
    )
    .await;
    // Stamp the record even if a register turned out to be misconfigured.
    let finalized = recorder.finalize_timestamp(server, record_id).await;
    connection.close().await;
    result?;
    outcome.timestamp = Some(finalized?);
    debug!("{}: record {record_id} finalized", server.name);
    Ok(outcome)
}

async fn poll_registers<C: Connection, S: Store>(
    server: &ServerDescriptor,
    connection: &mut C,
    record_id: RecordId,
    recorder: &Recorder<S>,
    reporter: &dyn Reporter,
    shutdown: &Shutdown,
    outcome: &mut ServerOutcome,
) -> Result<()> {
    for (index, register) in server.registers.iter().enumerate() {
        if shutdown.is_triggered() {
            info!(
                "Stop requested, not reading the remaining registers of {}",
                server.name
            );
            break;
        }

        let words = match connection
            .read_holding_registers(server.unit_id, register.address, register.word_count())
            .await
        {
            Ok(words) => words,
            Err(err) => {
                let failure = if err.is_connection_error() {
                    PollFailure::ConnectionClosed {
                        server: server.name.to_string(),
                        register: register.name.to_string(),
                    }
                } else {
                    PollFailure::Read {
                        server: server.name.to_string(),
                        register: register.name.to_string(),
                    }
                };
                warn!("{failure}: {err}");
                outcome.fail(failure, reporter);
                continue;
            }
        };

        let raw = protocol::decode(&words, register.wire_type).map_err(|err| {
            error!("{};{} is misconfigured: {err}", server.name, register.name);
            err
        })?;
        let value = conversion::convert(raw.as_f64(), register.conversion.as_ref());
        trace!(
            "{};{}: raw {raw} -> {value} {}",
            server.name,
            register.name,
            register.unit
        );

        recorder
            .patch(server, record_id, &register.name, value)
            .await?;
        reporter.notify_value(&server.name, &register.name, value, &register.unit);
        outcome.values[index].1 = Some(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::Conversion;
    use crate::descriptor::RegisterDescriptor;
    use crate::protocol::{encode, RawValue, WireType};
    use crate::reporter::ConsoleReporter;
    use crate::storage::SqliteStore;
    use crate::transport::TransportError;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    enum Reply {
        Words(Vec<u16>),
        Exception,
        Dropped,
    }

    #[derive(Default, Clone)]
    struct FakeTransport {
        // host -> register replies, `None` refuses the connection
        servers: HashMap<String, Option<HashMap<u16, Reply>>>,
        stop_after: Option<(u16, Shutdown)>,
        reads: Arc<Mutex<Vec<(String, u8, u16, u16)>>>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeTransport {
        fn refusing(mut self, host: &str) -> Self {
            self.servers.insert(host.to_string(), None);
            self
        }

        fn serving(mut self, host: &str, replies: Vec<(u16, Reply)>) -> Self {
            self.servers
                .insert(host.to_string(), Some(replies.into_iter().collect()));
            self
        }

        fn stopping_after(mut self, address: u16, shutdown: &Shutdown) -> Self {
            self.stop_after = Some((address, shutdown.clone()));
            self
        }

        fn reads(&self) -> Vec<(String, u8, u16, u16)> {
            self.reads.lock().unwrap().clone()
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeConnection {
        host: String,
        replies: HashMap<u16, Reply>,
        stop_after: Option<(u16, Shutdown)>,
        reads: Arc<Mutex<Vec<(String, u8, u16, u16)>>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Connection = FakeConnection;

        async fn connect(
            &self,
            host: &str,
            _port: u16,
            _unit_id: u8,
        ) -> std::result::Result<FakeConnection, TransportError> {
            match self.servers.get(host) {
                Some(Some(replies)) => Ok(FakeConnection {
                    host: host.to_string(),
                    replies: replies.clone(),
                    stop_after: self.stop_after.clone(),
                    reads: self.reads.clone(),
                    closed: self.closed.clone(),
                }),
                _ => Err(io::Error::from(io::ErrorKind::ConnectionRefused).into()),
            }
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn read_holding_registers(
            &mut self,
            unit_id: u8,
            address: u16,
            count: u16,
        ) -> std::result::Result<Vec<u16>, TransportError> {
            self.reads
                .lock()
                .unwrap()
                .push((self.host.clone(), unit_id, address, count));
            if let Some((stop_address, shutdown)) = &self.stop_after {
                if *stop_address == address {
                    shutdown.trigger();
                }
            }
            match self.replies.get(&address) {
                Some(Reply::Words(words)) => Ok(words.clone()),
                Some(Reply::Dropped) => {
                    Err(io::Error::from(io::ErrorKind::ConnectionReset).into())
                }
                Some(Reply::Exception) | None => Err(TransportError::Exception(
                    tokio_modbus::ExceptionCode::IllegalDataAddress,
                )),
            }
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Collect {
        values: Mutex<Vec<(String, String, f64, String)>>,
        errors: Mutex<Vec<String>>,
    }

    impl Reporter for Collect {
        fn notify_value(&self, server: &str, register: &str, value: f64, unit: &str) {
            self.values.lock().unwrap().push((
                server.to_string(),
                register.to_string(),
                value,
                unit.to_string(),
            ));
        }

        fn notify_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn float(value: f32) -> Reply {
        Reply::Words(encode(RawValue::Float32(value)).to_vec())
    }

    fn inverter() -> ServerDescriptor {
        ServerDescriptor::new("Inverter", "inverter.local", 502, 1)
            .unwrap()
            .with_register(
                RegisterDescriptor::new("AC_power", 40091, WireType::Float32, "W").unwrap(),
            )
            .with_register(
                RegisterDescriptor::new("Total_AC_current", 40071, WireType::Float32, "A")
                    .unwrap(),
            )
            .with_register(
                RegisterDescriptor::new("Phase_voltage_AN", 40085, WireType::Float32, "V")
                    .unwrap(),
            )
    }

    fn power_meter() -> ServerDescriptor {
        ServerDescriptor::new("Power_meter", "meter.local", 502, 5)
            .unwrap()
            .with_register(
                RegisterDescriptor::new("System_current", 18440, WireType::Uint32, "A")
                    .unwrap()
                    .with_conversion(Conversion::Divide(1000.0)),
            )
            .with_register(
                RegisterDescriptor::new("System_Ph_N_voltage", 18436, WireType::Uint32, "V")
                    .unwrap()
                    .with_conversion(Conversion::Divide(100.0)),
            )
            .with_register(
                RegisterDescriptor::new("System_total_active_power", 18476, WireType::Int32, "W")
                    .unwrap(),
            )
    }

    async fn engine(
        servers: Vec<ServerDescriptor>,
        transport: FakeTransport,
    ) -> (PollEngine<FakeTransport, SqliteStore>, Arc<Collect>) {
        let reporter = Arc::new(Collect::default());
        let recorder = Recorder::new(SqliteStore::in_memory().await.unwrap());
        let engine = PollEngine::new(servers, transport, recorder, reporter.clone());
        engine.prepare().await.unwrap();
        (engine, reporter)
    }

    #[tokio::test]
    async fn protocol_error_is_isolated_to_its_register() {
        let transport = FakeTransport::default().serving(
            "inverter.local",
            vec![
                (40091, float(1500.0)),
                (40071, Reply::Exception),
                (40085, float(230.0)),
            ],
        );
        let (mut engine, reporter) = engine(vec![inverter()], transport.clone()).await;

        let summary = engine.poll_cycle().await.unwrap();
        assert!(!summary.interrupted);
        let outcome = summary.outcome("Inverter").unwrap();
        assert!(outcome.connected);
        assert_eq!(outcome.value("AC_power"), Some(1500.0));
        assert_eq!(outcome.value("Total_AC_current"), None);
        assert_eq!(outcome.value("Phase_voltage_AN"), Some(230.0));

        let records = engine.recorder().store().records(&inverter()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, outcome.record_id);
        assert!(records[0].timestamp.is_some());
        assert_eq!(records[0].timestamp, outcome.timestamp);
        assert_eq!(
            records[0].values,
            vec![
                ("AC_power".to_string(), Some(1500.0)),
                ("Total_AC_current".to_string(), None),
                ("Phase_voltage_AN".to_string(), Some(230.0)),
            ]
        );

        assert_eq!(
            *reporter.errors.lock().unwrap(),
            vec!["error reading Inverter;Total_AC_current".to_string()]
        );
        assert_eq!(reporter.values.lock().unwrap().len(), 2);
        assert_eq!(
            transport
                .reads()
                .iter()
                .map(|(_, unit, address, count)| (*unit, *address, *count))
                .collect::<Vec<_>>(),
            vec![(1, 40091, 2), (1, 40071, 2), (1, 40085, 2)]
        );
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn refused_connection_still_stamps_record() {
        let transport = FakeTransport::default().refusing("meter.local");
        let (mut engine, reporter) = engine(vec![power_meter()], transport.clone()).await;

        let summary = engine.poll_cycle().await.unwrap();
        let outcome = summary.outcome("Power_meter").unwrap();
        assert!(!outcome.connected);
        assert_eq!(
            outcome.failures,
            vec![PollFailure::Connect {
                server: "Power_meter".into()
            }]
        );

        let records = engine
            .recorder()
            .store()
            .records(&power_meter())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp.is_some());
        assert!(records[0].values.iter().all(|(_, value)| value.is_none()));
        assert_eq!(
            *reporter.errors.lock().unwrap(),
            vec!["error connecting to Power_meter".to_string()]
        );
        assert!(transport.reads().is_empty());
        assert_eq!(transport.closed(), 0);
    }

    struct ClosedOutput;

    impl io::Write for ClosedOutput {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn closed_console_does_not_abort_cycle() {
        let transport = FakeTransport::default()
            .refusing("meter.local")
            .serving("inverter.local", vec![(40091, float(1500.0))]);
        let recorder = Recorder::new(SqliteStore::in_memory().await.unwrap());
        let console = Arc::new(ConsoleReporter::with_writer(ClosedOutput));
        let mut engine =
            PollEngine::new(vec![power_meter(), inverter()], transport, recorder, console);
        engine.prepare().await.unwrap();

        let summary = engine.poll_cycle().await.unwrap();
        assert_eq!(summary.outcome("Inverter").unwrap().value("AC_power"), Some(1500.0));
        for server in [power_meter(), inverter()] {
            let records = engine.recorder().store().records(&server).await.unwrap();
            assert_eq!(records.len(), 1);
            assert!(records[0].timestamp.is_some());
        }
    }

    #[tokio::test]
    async fn dropped_link_reports_each_register() {
        let transport = FakeTransport::default().serving(
            "inverter.local",
            vec![
                (40091, Reply::Dropped),
                (40071, Reply::Dropped),
                (40085, float(229.875)),
            ],
        );
        let (mut engine, reporter) = engine(vec![inverter()], transport.clone()).await;

        let summary = engine.poll_cycle().await.unwrap();
        let outcome = summary.outcome("Inverter").unwrap();
        assert_eq!(outcome.value("Phase_voltage_AN"), Some(229.875));
        assert_eq!(summary.failure_count(), 2);
        assert_eq!(
            *reporter.errors.lock().unwrap(),
            vec![
                "connection unexpectedly closed while reading Inverter;AC_power".to_string(),
                "connection unexpectedly closed while reading Inverter;Total_AC_current"
                    .to_string(),
            ]
        );
        assert_eq!(transport.reads().len(), 3);
    }

    #[tokio::test]
    async fn values_are_converted_and_rounded() {
        let transport = FakeTransport::default().serving(
            "meter.local",
            vec![
                (18440, Reply::Words(encode(RawValue::Uint32(4500)).to_vec())),
                (18436, Reply::Words(encode(RawValue::Uint32(23015)).to_vec())),
                (18476, Reply::Words(encode(RawValue::Int32(-500)).to_vec())),
            ],
        );
        let (mut engine, reporter) = engine(vec![power_meter()], transport).await;

        engine.poll_cycle().await.unwrap();
        let records = engine
            .recorder()
            .store()
            .records(&power_meter())
            .await
            .unwrap();
        assert_eq!(records[0].value("System_current"), Some(4.5));
        assert_eq!(records[0].value("System_Ph_N_voltage"), Some(230.15));
        assert_eq!(records[0].value("System_total_active_power"), Some(-500.0));
        assert_eq!(
            reporter.values.lock().unwrap()[0],
            (
                "Power_meter".to_string(),
                "System_current".to_string(),
                4.5,
                "A".to_string()
            )
        );
    }

    #[tokio::test]
    async fn unreachable_server_does_not_affect_others() {
        let transport = FakeTransport::default()
            .refusing("meter.local")
            .serving(
                "inverter.local",
                vec![
                    (40091, float(1500.0)),
                    (40071, float(6.5)),
                    (40085, float(230.0)),
                ],
            );
        let (mut engine, _) = engine(vec![power_meter(), inverter()], transport).await;

        let summary = engine.poll_cycle().await.unwrap();
        assert_eq!(summary.outcomes.len(), 2);
        assert_eq!(summary.value_count(), 3);
        assert_eq!(summary.failure_count(), 1);
        let outcome = summary.outcome("Inverter").unwrap();
        assert_eq!(outcome.value("Total_AC_current"), Some(6.5));
        assert!(summary.outcome("Power_meter").unwrap().timestamp.is_some());
    }

    #[tokio::test]
    async fn consecutive_cycles_append_records() {
        let transport = FakeTransport::default()
            .refusing("meter.local")
            .serving("inverter.local", vec![(40091, float(1500.0))]);
        let (mut engine, _) = engine(vec![inverter(), power_meter()], transport).await;

        let first = engine.poll_cycle().await.unwrap();
        let second = engine.poll_cycle().await.unwrap();

        for server in [inverter(), power_meter()] {
            let records = engine.recorder().store().records(&server).await.unwrap();
            assert_eq!(records.len(), 2);
            assert_ne!(records[0].id, records[1].id);
            assert!(records[0].timestamp.unwrap() <= records[1].timestamp.unwrap());

            let name = server.name.as_str();
            assert_eq!(first.outcome(name).unwrap().record_id, records[0].id);
            assert_eq!(second.outcome(name).unwrap().record_id, records[1].id);
        }
    }

    #[tokio::test]
    async fn misconfigured_register_aborts_cycle_after_stamping() {
        let server = ServerDescriptor::new("Inverter", "inverter.local", 502, 1)
            .unwrap()
            .with_register(
                RegisterDescriptor::new("AC_power", 40091, WireType::Float32, "W")
                    .unwrap()
                    .with_count(4),
            );
        let transport = FakeTransport::default()
            .serving("inverter.local", vec![(40091, Reply::Words(vec![0; 4]))]);
        let (mut engine, _) = engine(vec![server.clone()], transport.clone()).await;

        assert_matches!(
            engine.poll_cycle().await,
            Err(Error::MalformedPayload {
                expected: 2,
                actual: 4
            })
        );
        let records = engine.recorder().store().records(&server).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp.is_some());
        assert_eq!(records[0].value("AC_power"), None);
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn unavailable_persistence_aborts_cycle() {
        let transport = FakeTransport::default().serving("inverter.local", vec![]);
        let (mut engine, _) = engine(vec![inverter()], transport.clone()).await;
        engine.recorder().store().pool().close().await;

        assert_matches!(
            engine.poll_cycle().await,
            Err(Error::PersistenceUnavailable(_))
        );
        assert!(transport.reads().is_empty());
    }

    #[tokio::test]
    async fn stop_request_finishes_current_server() {
        let shutdown = Shutdown::new();
        let transport = FakeTransport::default()
            .serving(
                "inverter.local",
                vec![
                    (40091, float(1500.0)),
                    (40071, float(6.5)),
                    (40085, float(230.0)),
                ],
            )
            .refusing("meter.local")
            .stopping_after(40091, &shutdown);
        let (engine, _) = engine(vec![inverter(), power_meter()], transport.clone()).await;
        let mut engine = engine.with_shutdown(shutdown);

        let summary = engine.poll_cycle().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(transport.reads().len(), 1);
        assert_eq!(transport.closed(), 1);

        let records = engine.recorder().store().records(&inverter()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].timestamp.is_some());
        assert_eq!(records[0].value("AC_power"), Some(1500.0));
        assert_eq!(records[0].value("Total_AC_current"), None);
        assert!(engine
            .recorder()
            .store()
            .records(&power_meter())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn run_loop_ends_on_stop_request() {
        let shutdown = Shutdown::new();
        let transport = FakeTransport::default()
            .serving("inverter.local", vec![(40085, float(230.0))])
            .stopping_after(40085, &shutdown);
        let (engine, _) = engine(vec![inverter()], transport).await;
        let mut engine = engine.with_shutdown(shutdown);

        tokio::time::timeout(Duration::from_secs(5), engine.run(Duration::from_secs(3600)))
            .await
            .expect("run loop did not stop")
            .unwrap();
        let records = engine.recorder().store().records(&inverter()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value("Phase_voltage_AN"), Some(230.0));
    }

    #[tokio::test]
    async fn shutdown_interrupts_sleep() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep(Duration::from_millis(5)).await);

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        assert!(
            tokio::time::timeout(Duration::from_secs(5), shutdown.sleep(Duration::from_secs(3600)))
                .await
                .unwrap()
        );
        assert!(shutdown.sleep(Duration::from_secs(3600)).await);
    }

    #[test]
    fn failure_messages() {
        assert_eq!(
            PollFailure::Connect {
                server: "Power_meter".into()
            }
            .to_string(),
            "error connecting to Power_meter"
        );
        assert_eq!(
            PollFailure::Read {
                server: "Inverter".into(),
                register: "Total_AC_current".into()
            }
            .to_string(),
            "error reading Inverter;Total_AC_current"
        );
    }
}
