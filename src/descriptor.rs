//! Static descriptions of the polled servers and their registers.

use crate::conversion::Conversion;
use crate::protocol::{WireType, DEFAULT_PORT};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;

/// A name that is safe to use unquoted as a SQL table or column name.
///
/// It starts with an ASCII letter or underscore and continues with ASCII
/// letters, digits or underscores. The `sqlite_` prefix is reserved by SQLite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let mut chars = value.chars();
        let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        if !(valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')) {
            Err(Error::Config(format!(
                "'{value}' is not a valid name, use only letters, digits and '_'"
            )))
        } else if value.to_ascii_lowercase().starts_with("sqlite_") {
            Err(Error::Config(format!(
                "'{value}' is not a valid name, the prefix 'sqlite_' is reserved"
            )))
        } else {
            Ok(Self(value))
        }
    }
}

impl TryFrom<&str> for Identifier {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::try_from(value.to_string())
    }
}

impl Deref for Identifier {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One telemetry point of a server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterDescriptor {
    /// Column name of the value, unique within the server.
    pub name: Identifier,
    /// Register offset, used as configured without any +1/-1 adjustment.
    pub address: u16,
    /// Number of registers, defaults to the width of the wire type.
    #[serde(default)]
    count: Option<u16>,
    #[serde(rename = "type")]
    pub wire_type: WireType,
    /// Display unit, e.g. `W`.
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub conversion: Option<Conversion>,
}

impl RegisterDescriptor {
    pub fn new(name: &str, address: u16, wire_type: WireType, unit: &str) -> Result<Self> {
        Ok(Self {
            name: Identifier::try_from(name)?,
            address,
            count: None,
            wire_type,
            unit: unit.to_string(),
            conversion: None,
        })
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = Some(conversion);
        self
    }

    /// Overrides the configured register count, mainly to exercise validation.
    pub fn with_count(mut self, count: u16) -> Self {
        self.count = Some(count);
        self
    }

    /// Number of holding registers read for this point.
    pub fn word_count(&self) -> u16 {
        self.count.unwrap_or_else(|| self.wire_type.word_count())
    }

    fn validate(&self, server: &Identifier) -> Result<()> {
        if self.word_count() != self.wire_type.word_count() {
            return Err(Error::Config(format!(
                "{server};{}: a {} value occupies {} registers, not {}",
                self.name,
                self.wire_type,
                self.wire_type.word_count(),
                self.word_count()
            )));
        }
        if self.address.checked_add(self.word_count() - 1).is_none() {
            return Err(Error::Config(format!(
                "{server};{}: address {} is out of range",
                self.name, self.address
            )));
        }
        Ok(())
    }
}

/// One Modbus/TCP endpoint and the registers polled from it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerDescriptor {
    /// Table name of the server, unique across the configuration.
    pub name: Identifier,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Modbus unit (slave) identifier.
    pub unit_id: u8,
    /// Registers in polling order.
    pub registers: Vec<RegisterDescriptor>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerDescriptor {
    pub fn new(name: &str, host: &str, port: u16, unit_id: u8) -> Result<Self> {
        Ok(Self {
            name: Identifier::try_from(name)?,
            host: host.to_string(),
            port,
            unit_id,
            registers: Vec::new(),
        })
    }

    pub fn with_register(mut self, register: RegisterDescriptor) -> Self {
        self.registers.push(register);
        self
    }

    pub fn register(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|r| r.name.as_str() == name)
    }

    /// Checks the register list of this server.
    pub fn validate(&self) -> Result<()> {
        if self.registers.is_empty() {
            return Err(Error::Config(format!(
                "server {} has no registers",
                self.name
            )));
        }
        let mut names = HashSet::new();
        for register in &self.registers {
            // `id` and `timestamp` are taken by the record itself.
            if ["id", "timestamp"].contains(&register.name.to_ascii_lowercase().as_str()) {
                return Err(Error::Config(format!(
                    "{};{}: register name is reserved",
                    self.name, register.name
                )));
            }
            if !names.insert(register.name.to_ascii_lowercase()) {
                return Err(Error::Config(format!(
                    "{};{}: duplicate register name",
                    self.name, register.name
                )));
            }
            register.validate(&self.name)?;
        }
        Ok(())
    }
}

/// Validates a complete server list: each server individually plus unique server names.
pub fn validate_servers(servers: &[ServerDescriptor]) -> Result<()> {
    let mut names = HashSet::new();
    for server in servers {
        // SQLite table names are case insensitive.
        if !names.insert(server.name.to_ascii_lowercase()) {
            return Err(Error::Config(format!(
                "duplicate server name {}",
                server.name
            )));
        }
        server.validate()?;
    }
    Ok(())
}
