use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

fn parse_poll_interval(s: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err(String::from("poll interval must not be zero"));
    }
    Ok(interval)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run a single poll cycle over all configured servers and exit.
    /// Suitable for running from cron or a systemd timer.
    #[clap(verbatim_doc_comment)]
    Once,

    /// Run in daemon mode: repeat poll cycles until interrupted with Ctrl-C.
    Daemon {
        /// Interval between the starts of two poll cycles (e.g., "30s", "5min").
        /// Overrides `modbus.poll_interval` of the configuration file.
        #[arg(value_parser = parse_poll_interval, short, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,
    },

    /// Validate the configuration and print the servers, registers and tables.
    /// Neither the network nor the database is accessed.
    #[clap(verbatim_doc_comment)]
    Check,

    /// Print the newest stored records of every server.
    Last {
        /// Number of records per server.
        #[arg(short, long, default_value_t = 5)]
        limit: u32,
    },
}

const fn about_text() -> &'static str {
    "Modbus/TCP telemetry collector - Poll holding registers and record them in SQLite."
}

#[derive(Parser, Debug)]
#[command(name="modcol", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// The configuration file with the database, MQTT broker and servers.
    #[arg(global = true, short, long, default_value = modcol_lib::config::Config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// SQLite database file, overrides `database.path` of the configuration file.
    #[arg(global = true, long)]
    pub database: Option<PathBuf>,

    /// Timeout for establishing a Modbus TCP connection.
    /// Examples: "3s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub connect_timeout: Option<Duration>,

    /// Modbus I/O timeout for a single register read.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// Do not publish to the MQTT broker even if one is configured.
    #[arg(global = true, long)]
    pub no_mqtt: bool,
}
