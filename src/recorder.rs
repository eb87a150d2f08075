//! Lifecycle of the persisted poll records.
//!
//! A record is created with all values unset before a server is contacted,
//! patched one register at a time, and finally stamped with the time the
//! server's turn ended. The timestamp therefore means "this cycle was
//! attempted", not "data was read".

use crate::conversion;
use crate::descriptor::ServerDescriptor;
use crate::storage::{RecordId, Store};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::*;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The only writer of persisted poll records.
pub struct Recorder<S> {
    store: S,
    clock: Clock,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<S: Store> Recorder<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Utc::now)
    }

    /// Creates a recorder reading the time from `clock` instead of the system clock.
    pub fn with_clock(
        store: S,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            clock: Box::new(clock),
            last_timestamp: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates or extends the table of every server.
    pub async fn ensure_schema(&self, servers: &[ServerDescriptor]) -> Result<()> {
        for server in servers {
            debug!("Ensuring table for {}", server.name);
            self.store.ensure_schema(server).await?;
        }
        Ok(())
    }

    /// Inserts the record of this cycle for `server` with all values unset.
    pub async fn create_pending(&self, server: &ServerDescriptor) -> Result<RecordId> {
        let id = self.store.insert_pending(&server.name).await?;
        trace!("Created record {}#{id}", server.name);
        Ok(id)
    }

    /// Stores one register value of a record, rounded to the stored precision.
    pub async fn patch(
        &self,
        server: &ServerDescriptor,
        record_id: RecordId,
        register: &str,
        value: f64,
    ) -> Result<()> {
        let register = server.register(register).ok_or_else(|| {
            Error::UnknownTarget(format!("{}: no register named {register}", server.name))
        })?;
        self.store
            .update_column(
                &server.name,
                record_id,
                &register.name,
                conversion::round(value),
            )
            .await
    }

    /// Stamps the record with the current time.
    ///
    /// Timestamps never decrease across calls, even if the system clock steps
    /// back. Calling this twice for one record only rewrites its timestamp.
    pub async fn finalize_timestamp(
        &mut self,
        server: &ServerDescriptor,
        record_id: RecordId,
    ) -> Result<DateTime<Utc>> {
        let now = (self.clock)();
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => {
                warn!("System clock went backwards by {}", last - now);
                last
            }
            _ => now,
        };
        self.store
            .set_timestamp(&server.name, record_id, timestamp)
            .await?;
        self.last_timestamp = Some(timestamp);
        trace!("Finalized record {}#{record_id} at {timestamp}", server.name);
        Ok(timestamp)
    }
}
