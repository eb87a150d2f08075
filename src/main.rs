//! Modbus/TCP telemetry collector CLI
//!
//! Polls the holding registers of the Modbus/TCP servers listed in a YAML
//! configuration file and records one row per server and poll cycle in an
//! SQLite database. Values and failures are printed to the console and,
//! if a broker is configured, published via MQTT.
//!
//! The CLI leverages the `modcol_lib` crate for everything but argument
//! parsing, logging and signal handling.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use modcol_lib::{
    config::Config,
    engine::{PollEngine, Shutdown},
    recorder::Recorder,
    reporter::{ConsoleReporter, Reporters},
    storage::{self, SqliteStore},
    transport::TcpTransport,
};
use std::panic;
use std::sync::Arc;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

/// Loads the configuration and applies the command line overrides.
fn load_config(args: &commandline::CliArgs) -> Result<Config> {
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Cannot load configuration {}", args.config.display()))?;
    if let Some(path) = &args.database {
        config.database.path = path.clone();
    }
    if let Some(timeout) = args.connect_timeout {
        config.modbus.connect_timeout = timeout;
    }
    if let Some(timeout) = args.timeout {
        config.modbus.read_timeout = timeout;
    }
    if args.no_mqtt {
        config.mqtt = None;
    }
    if let commandline::CliCommands::Daemon {
        poll_interval: Some(interval),
    } = &args.command
    {
        config.modbus.poll_interval = *interval;
    }
    config.validate()?;
    Ok(config)
}

fn print_check(config: &Config) {
    println!("Database: {}", config.database.path.display());
    println!(
        "Connect timeout: {}, read timeout: {}, poll interval: {}",
        humantime::format_duration(config.modbus.connect_timeout),
        humantime::format_duration(config.modbus.read_timeout),
        humantime::format_duration(config.modbus.poll_interval)
    );
    if let Some(mqtt) = &config.mqtt {
        println!("MQTT: {} (topic prefix {})", mqtt.url, mqtt.topic_prefix);
    }
    for server in &config.servers {
        println!();
        println!(
            "{} ({}:{}, unit {})",
            server.name, server.host, server.port, server.unit_id
        );
        for register in &server.registers {
            print!(
                "  {}: address {}, {}",
                register.name, register.address, register.wire_type
            );
            if !register.unit.is_empty() {
                print!(" [{}]", register.unit);
            }
            if let Some(conversion) = &register.conversion {
                print!(", {conversion:?}");
            }
            println!();
        }
        println!("  {}", storage::create_table_statement(server));
    }
}

async fn print_last(config: &Config, limit: u32) -> Result<()> {
    let store = SqliteStore::open_read_only(&config.database.path)
        .await
        .with_context(|| format!("Cannot open database {}", config.database.path.display()))?;
    for server in &config.servers {
        let records = store
            .latest_records(server, limit)
            .await
            .with_context(|| format!("Cannot read records of {}", server.name))?;
        println!("{}:", server.name);
        for record in records {
            let timestamp = record
                .timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| String::from("pending"));
            let values = record
                .values
                .iter()
                .map(|(name, value)| match value {
                    Some(value) => format!("{name}={value}"),
                    None => format!("{name}=-"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            println!("  #{} {timestamp}: {values}", record.id);
        }
    }
    Ok(())
}

fn spawn_ctrl_c_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, stopping after the current read");
                shutdown.trigger();
            }
            Err(err) => error!("Cannot listen for Ctrl-C: {err}"),
        }
    });
}

async fn run_poller(config: Config, daemon: Option<std::time::Duration>) -> Result<()> {
    let reporters = Reporters::new().with(ConsoleReporter::new());

    #[cfg(feature = "mqtt")]
    let mut mqtt_reporter = None;
    #[cfg(feature = "mqtt")]
    let reporters = match &config.mqtt {
        Some(mqtt_config) => {
            match modcol_lib::reporter::MqttReporter::connect(mqtt_config).await {
                Ok(mqtt) => {
                    let mqtt = Arc::new(mqtt);
                    mqtt_reporter = Some(mqtt.clone());
                    reporters.with(mqtt)
                }
                Err(err) => {
                    warn!("Continuing without MQTT: {err}");
                    reporters
                }
            }
        }
        None => reporters,
    };
    #[cfg(not(feature = "mqtt"))]
    if config.mqtt.is_some() {
        warn!("MQTT is configured but this build has no MQTT support");
    }

    let store = SqliteStore::open(&config.database.path)
        .await
        .with_context(|| format!("Cannot open database {}", config.database.path.display()))?;
    let transport = TcpTransport::new(config.modbus.connect_timeout, config.modbus.read_timeout);
    let shutdown = Shutdown::new();
    spawn_ctrl_c_handler(shutdown.clone());
    let mut engine = PollEngine::new(
        config.servers,
        transport,
        Recorder::new(store),
        Arc::new(reporters),
    )
    .with_shutdown(shutdown);
    engine
        .prepare()
        .await
        .context("Cannot create database tables")?;

    let result = match daemon {
        Some(poll_interval) => {
            info!(
                "Starting daemon mode: {} servers, interval={}",
                engine.servers().len(),
                humantime::format_duration(poll_interval)
            );
            engine.run(poll_interval).await.context("Poll loop failed")
        }
        None => engine
            .poll_cycle()
            .await
            .map(|summary| {
                info!(
                    "Recorded {} values with {} failures",
                    summary.value_count(),
                    summary.failure_count()
                );
            })
            .context("Poll cycle failed"),
    };

    #[cfg(feature = "mqtt")]
    if let Some(mqtt) = mqtt_reporter {
        if let Err(err) = mqtt.disconnect().await {
            warn!("Cannot disconnect from MQTT broker: {err}");
        }
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "modcol started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let config = load_config(&args)?;

    match &args.command {
        commandline::CliCommands::Check => {
            print_check(&config);
            Ok(())
        }
        commandline::CliCommands::Last { limit } => print_last(&config, *limit).await,
        commandline::CliCommands::Once => run_poller(config, None).await,
        commandline::CliCommands::Daemon { .. } => {
            let poll_interval = config.modbus.poll_interval;
            run_poller(config, Some(poll_interval)).await
        }
    }
}
