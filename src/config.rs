//! Configuration management for the session manager daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the radio driver parameters and display-name overrides.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   device::{ConnectOptions, Delimiter},
   error::{Result, SessionError},
};

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Adapter name (e.g. `hci0`); the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_delimiter")]
   pub delimiter: String,

   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   #[serde(default = "default_discovery_window")]
   pub discovery_window_sec: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_load_bonded")]
   pub load_bonded_on_startup: bool,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,
}

/// Display-name override for a device.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

fn default_delimiter() -> String {
   "\r".to_string()
}

const fn default_rfcomm_channel() -> u8 {
   1
}

const fn default_discovery_window() -> u64 {
   12
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_load_bonded() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         delimiter: default_delimiter(),
         rfcomm_channel: default_rfcomm_channel(),
         discovery_window_sec: default_discovery_window(),
         connect_timeout_sec: default_connect_timeout(),
         load_bonded_on_startup: default_load_bonded(),
         known_devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTCLASSIC_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(SessionError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btclassicd").join("config.toml"))
   }

   /// Default connect/accept options derived from the configured delimiter.
   pub fn connect_options(&self) -> Result<ConnectOptions> {
      Ok(ConnectOptions::new(Delimiter::new(self.delimiter.as_bytes())?))
   }

   pub const fn discovery_window(&self) -> Duration {
      Duration::from_secs(self.discovery_window_sec)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   /// Returns the configured display name for the given address, if any.
   pub fn known_name(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }
}
