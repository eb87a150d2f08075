//! Modbus/TCP transport used by the poll engine.
//!
//! The engine only needs two capabilities: opening a connection to a server
//! and reading holding registers over it. [`Transport`] and [`Connection`]
//! describe those, [`TcpTransport`] implements them with `tokio-modbus`.
//!
//! # Example
//!
//! ```no_run
//! use modcol_lib::transport::{Connection, TcpTransport, Transport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TcpTransport::new(Duration::from_secs(3), Duration::from_secs(1));
//!     let mut connection = transport.connect("192.168.1.100", 502, 1).await?;
//!     let words = connection.read_holding_registers(1, 40091, 2).await?;
//!     println!("Raw words: {:04X?}", words);
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::*;
use std::io;
use std::{fmt, time::Duration};
use tokio_modbus::client::{Client, Context};
use tokio_modbus::prelude::Reader;
use tokio_modbus::slave::SlaveContext;
use tokio_modbus::Slave;

/// A failed transport operation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server is unreachable, the link dropped or an operation timed out.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The server answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    Exception(tokio_modbus::ExceptionCode),

    /// The server answered with an invalid frame.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True for failures of the link itself rather than of a single request.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }

    fn timed_out(what: &str, timeout: Duration) -> Self {
        TransportError::Connection(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out after {timeout:?}"),
        ))
    }
}

/// Opens connections to Modbus servers.
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: Connection;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        unit_id: u8,
    ) -> Result<Self::Connection, TransportError>;
}

/// An open connection to one Modbus server.
#[async_trait]
pub trait Connection: Send {
    /// Reads `count` holding registers starting at `address` from unit `unit_id`.
    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Releases the connection. Failures are only logged.
    async fn close(&mut self);
}

/// [`Transport`] over Modbus/TCP with explicit connect and read timeouts.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    async fn open(&self, host: &str, port: u16, unit_id: u8) -> Result<Context, TransportError> {
        let socket_addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {host}"),
                )
            })?;
        debug!("Connecting to {socket_addr} (unit {unit_id})");
        Ok(tokio_modbus::client::tcp::connect_slave(socket_addr, Slave(unit_id)).await?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        unit_id: u8,
    ) -> Result<TcpConnection, TransportError> {
        let ctx = tokio::time::timeout(self.connect_timeout, self.open(host, port, unit_id))
            .await
            .map_err(|_| TransportError::timed_out("connect", self.connect_timeout))??;
        Ok(TcpConnection {
            ctx,
            read_timeout: self.read_timeout,
        })
    }
}

/// A Modbus/TCP connection opened by [`TcpTransport`].
pub struct TcpConnection {
    ctx: Context,
    read_timeout: Duration,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl TcpConnection {
    /// Helper function to map tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T, TransportError> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(exception)) => Err(TransportError::Exception(exception)),
            Err(tokio_modbus::Error::Transport(err)) => Err(TransportError::Connection(err)),
            Err(err) => Err(TransportError::Protocol(err.to_string())),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.ctx.set_slave(Slave(unit_id));
        let result = tokio::time::timeout(
            self.read_timeout,
            self.ctx.read_holding_registers(address, count),
        )
        .await
        .map_err(|_| TransportError::timed_out("read", self.read_timeout))?;
        let words = Self::map_tokio_result(result)?;
        if words.len() != count as usize {
            return Err(TransportError::Protocol(format!(
                "requested {count} registers, received {}",
                words.len()
            )));
        }
        trace!("Read {address}+{count} from unit {unit_id}: {words:04X?}");
        Ok(words)
    }

    async fn close(&mut self) {
        if let Err(err) = self.ctx.disconnect().await {
            debug!("Error while closing Modbus connection: {err}");
        }
    }
}
