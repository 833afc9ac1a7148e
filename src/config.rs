//! Configuration management for the session service.
//!
//! This module handles loading and saving configuration from disk,
//! including the adapter to drive, timing parameters and the capability
//! grants standing in for a permission prompt.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{Result, SessionError},
   session::permission::{Capability, PermissionGrant},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default = "default_discoverable_timeout")]
   pub discoverable_timeout_sec: u64,

   #[serde(default = "default_pulse_interval")]
   pub pulse_interval_ms: u64,

   #[serde(default = "default_health_check_interval")]
   pub health_check_interval_sec: u64,

   /// Registers a pairing agent that only accepts while pairing is active.
   #[serde(default)]
   pub pairing_agent: bool,

   /// Capabilities whose denial ends the session.
   #[serde(default = "default_hard_capabilities")]
   pub hard_capabilities: Vec<Capability>,

   #[serde(default = "default_permissions")]
   pub permissions: PermissionGrant,
}

const fn default_discoverable_timeout() -> u64 {
   120
}

const fn default_pulse_interval() -> u64 {
   1500
}

const fn default_health_check_interval() -> u64 {
   5
}

const fn default_permissions() -> PermissionGrant {
   PermissionGrant::ALL
}

fn default_hard_capabilities() -> Vec<Capability> {
   vec![Capability::Advertise, Capability::Connect]
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         discoverable_timeout_sec: default_discoverable_timeout(),
         pulse_interval_ms: default_pulse_interval(),
         health_check_interval_sec: default_health_check_interval(),
         pairing_agent: false,
         hard_capabilities: default_hard_capabilities(),
         permissions: default_permissions(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   fn load_from(config_path: PathBuf) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(&config_path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTSESSION_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(SessionError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btsessiond").join("config.toml"))
   }

   pub fn discoverable_timeout(&self) -> Duration {
      Duration::from_secs(self.discoverable_timeout_sec)
   }

   pub fn pulse_interval(&self) -> Duration {
      Duration::from_millis(self.pulse_interval_ms.max(1))
   }

   pub fn health_check_interval(&self) -> Duration {
      Duration::from_secs(self.health_check_interval_sec.max(1))
   }
}
