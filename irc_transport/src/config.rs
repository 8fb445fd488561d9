//! Typed key/value configuration with defaults.

use crate::error::ConfigError;

use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

/// A typed configuration key, with the value it takes when nothing has been
/// set for it.
pub struct ConfigEntry<T>
{
    name: &'static str,
    default: fn() -> Option<T>,
}

impl<T> ConfigEntry<T>
{
    pub fn name(&self) -> &'static str
    {
        self.name
    }

    pub fn default_value(&self) -> Option<T>
    {
        (self.default)()
    }
}

fn none<T>() -> Option<T> { None }

pub const CLIENT_NAME: ConfigEntry<String> = ConfigEntry { name: "client_name", default: || Some("irc-transport".to_string()) };
pub const SERVER_ADDRESS: ConfigEntry<String> = ConfigEntry { name: "server_address", default: || Some("localhost:6667".to_string()) };
pub const BIND_ADDRESS: ConfigEntry<SocketAddr> = ConfigEntry { name: "bind_address", default: none };
pub const MESSAGE_DELAY_MS: ConfigEntry<u64> = ConfigEntry { name: "message_delay_ms", default: || Some(1200) };
pub const RECONNECT_DELAY_MS: ConfigEntry<u64> = ConfigEntry { name: "reconnect_delay_ms", default: || Some(5_000) };
pub const IDLE_TIMEOUT_MS: ConfigEntry<u64> = ConfigEntry { name: "idle_timeout_ms", default: || Some(250_000) };
pub const TLS: ConfigEntry<bool> = ConfigEntry { name: "tls", default: || Some(false) };
pub const TLS_TRUST_ROOTS: ConfigEntry<PathBuf> = ConfigEntry { name: "tls_trust_roots", default: none };
pub const TLS_KEY_CERT_CHAIN: ConfigEntry<PathBuf> = ConfigEntry { name: "tls_key_cert_chain", default: none };
pub const TLS_KEY: ConfigEntry<PathBuf> = ConfigEntry { name: "tls_key", default: none };
pub const TLS_KEY_PASSWORD: ConfigEntry<String> = ConfigEntry { name: "tls_key_password", default: none };
pub const DCC_BIND_ADDRESS: ConfigEntry<IpAddr> = ConfigEntry { name: "dcc_bind_address", default: none };

/// Stores a client's configuration.
///
/// Values are held as JSON so that a whole configuration can be loaded from
/// a file, and are converted to the entry's type on access. An entry that
/// was never set yields its default, while an entry explicitly set to null
/// yields `None`.
#[derive(Debug,Default)]
pub struct Config
{
    values: RwLock<HashMap<String, Value>>,
}

impl Config
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Load a configuration from a JSON object, keyed by entry name.
    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError>
    {
        match serde_json::from_reader(reader)?
        {
            Value::Object(map) => Ok(Self { values: RwLock::new(map.into_iter().collect()) }),
            _ => Err(ConfigError::NotAnObject)
        }
    }

    pub fn load(filename: impl AsRef<Path>) -> Result<Self, ConfigError>
    {
        let file = File::open(filename)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn get<T: DeserializeOwned>(&self, entry: &ConfigEntry<T>) -> Option<T>
    {
        let values = self.values.read();
        match values.get(entry.name)
        {
            None => entry.default_value(),
            Some(Value::Null) => None,
            Some(value) => match serde_json::from_value(value.clone())
            {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Config entry {} has the wrong type: {}", entry.name, e);
                    None
                }
            }
        }
    }

    /// Look up an entry that must always have a value, falling back to the
    /// default if it was set to null or to a value of the wrong type.
    pub fn get_or_default<T: DeserializeOwned>(&self, entry: &ConfigEntry<T>) -> Option<T>
    {
        self.get(entry).or_else(|| entry.default_value())
    }

    /// Set an entry. `None` stores an explicit null, which is distinct from
    /// the entry never having been set.
    pub fn set<T: Serialize>(&self, entry: &ConfigEntry<T>, value: Option<T>) -> Result<(), ConfigError>
    {
        let value = match value {
            Some(v) => serde_json::to_value(v)?,
            None => Value::Null,
        };
        self.values.write().insert(entry.name.to_string(), value);
        Ok(())
    }

    /// Forget any value set for an entry, so that it reverts to its default.
    pub fn unset<T>(&self, entry: &ConfigEntry<T>)
    {
        self.values.write().remove(entry.name);
    }

    pub fn is_set<T>(&self, entry: &ConfigEntry<T>) -> bool
    {
        self.values.read().contains_key(entry.name)
    }

    pub(crate) fn duration(&self, entry: &ConfigEntry<u64>) -> Duration
    {
        Duration::from_millis(self.get_or_default(entry).unwrap_or(0))
    }
}
