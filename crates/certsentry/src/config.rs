//! Environment-driven agent configuration.
//!
//! All settings come from `CERTSENTRY_*` environment variables. Mandatory
//! variables (remote address, key/cert names and API keys, the push AES key)
//! fail startup when missing; everything else falls back to a default and
//! logs the substitution at debug level.

use std::collections::HashSet;
use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{NaiveTime, Weekday};
use thiserror::Error;
use tracing::{debug, warn};

use crate::schedule::MaintenanceWindow;

// Defaults for optional variables
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 5055;
const DEFAULT_STORAGE_DIR: &str = "/opt/certsentry/certs";
const DEFAULT_KEY_MODE: u32 = 0o600;
const DEFAULT_CERT_MODE: u32 = 0o644;
const DEFAULT_PFX_FILENAME: &str = "key_certchain.pfx";
const DEFAULT_LEGACY_PFX_FILENAME: &str = "key_certchain.legacy.pfx";

fn default_window_start() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default()
}

fn default_window_end() -> NaiveTime {
    NaiveTime::from_hms_opt(5, 0, 0).unwrap_or_default()
}

/// Configuration loading errors, all fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{0} is invalid: {1}")]
    Invalid(&'static str, String),
}

/// An enabled PKCS12 output file
#[derive(Debug, Clone)]
pub struct PfxFileConfig {
    /// Filename within the storage directory
    pub filename: String,
    /// Password protecting the PKCS12 contents (may be empty)
    pub password: String,
}

/// Complete agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTPS listener binds to
    pub bind_address: String,
    /// Port the HTTPS listener binds to
    pub bind_port: u16,
    /// Base URL of the remote issuing service (must be https)
    pub server_address: String,
    /// Name of the private key on the remote service
    pub key_name: String,
    /// API key authorizing private key downloads
    pub key_api_key: String,
    /// Name of the certificate on the remote service
    pub cert_name: String,
    /// API key authorizing certificate downloads
    pub cert_api_key: String,
    /// AES-256 key shared with the remote service for pushes
    pub aes_key: [u8; 32],
    /// Permitted window for disk writes and container actions
    pub window: MaintenanceWindow,
    /// Containers to restart (or stop) after a file write
    pub containers: Vec<String>,
    /// Stop containers instead of restarting them
    pub stop_only: bool,
    /// Directory all certificate files are written to
    pub storage_dir: PathBuf,
    /// Unix mode for key-bearing files
    pub key_mode: u32,
    /// Unix mode for cert-only files
    pub cert_mode: u32,
    /// Modern PKCS12 output, when enabled
    pub pfx: Option<PfxFileConfig>,
    /// Legacy PKCS12 output, when enabled
    pub legacy_pfx: Option<PfxFileConfig>,
}

impl Config {
    /// Load the configuration from `CERTSENTRY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a mandatory variable is missing or
    /// unparseable. Invalid optional variables fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Mandatory

        let aes_key_b64 = require("CERTSENTRY_AES_KEY_B64")?;
        let aes_key_bytes = URL_SAFE_NO_PAD
            .decode(aes_key_b64.as_bytes())
            .map_err(|e| ConfigError::Invalid("CERTSENTRY_AES_KEY_B64", e.to_string()))?;
        let aes_key: [u8; 32] = aes_key_bytes.try_into().map_err(|v: Vec<u8>| {
            ConfigError::Invalid(
                "CERTSENTRY_AES_KEY_B64",
                format!("AES key must be 32 bytes, got {}", v.len()),
            )
        })?;

        let server_address = require("CERTSENTRY_SERVER_ADDRESS")?;
        if !server_address.starts_with("https://") {
            return Err(ConfigError::Invalid(
                "CERTSENTRY_SERVER_ADDRESS",
                "must start with https://".to_string(),
            ));
        }

        let key_name = require("CERTSENTRY_KEY_NAME")?;
        let key_api_key = require("CERTSENTRY_KEY_APIKEY")?;
        let cert_name = require("CERTSENTRY_CERT_NAME")?;
        let cert_api_key = require("CERTSENTRY_CERT_APIKEY")?;

        // Optional

        let start = match optional("CERTSENTRY_FILE_UPDATE_TIME_START").map(|v| parse_time(&v)) {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                debug!(error = %e, "CERTSENTRY_FILE_UPDATE_TIME_START invalid, using 03:00");
                default_window_start()
            }
            None => default_window_start(),
        };

        let end = match optional("CERTSENTRY_FILE_UPDATE_TIME_END").map(|v| parse_time(&v)) {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                debug!(error = %e, "CERTSENTRY_FILE_UPDATE_TIME_END invalid, using 05:00");
                default_window_end()
            }
            None => default_window_end(),
        };

        let days = match optional("CERTSENTRY_FILE_UPDATE_DAYS_OF_WEEK").map(|v| parse_weekdays(&v))
        {
            Some(Ok(days)) => days,
            Some(Err(e)) => {
                debug!(error = %e, "CERTSENTRY_FILE_UPDATE_DAYS_OF_WEEK invalid, allowing any day");
                MaintenanceWindow::all_days()
            }
            None => MaintenanceWindow::all_days(),
        };

        let window = MaintenanceWindow::new(start, end, days);

        let mut containers = Vec::new();
        for i in 0.. {
            let name = std::env::var(format!("CERTSENTRY_RESTART_CONTAINER{i}"))
                .ok()
                .filter(|v| !v.is_empty());
            match name {
                Some(name) => containers.push(name),
                None => break,
            }
        }

        let stop_only = match optional("CERTSENTRY_RESTART_STOP_ONLY").as_deref() {
            Some("true") => true,
            Some("false") | None => false,
            Some(other) => {
                debug!(value = other, "CERTSENTRY_RESTART_STOP_ONLY invalid, using false");
                false
            }
        };
        if stop_only {
            warn!("containers will only be stopped, not restarted, on cert file updates");
        }

        let bind_address =
            optional("CERTSENTRY_BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let bind_port = match optional("CERTSENTRY_BIND_PORT").map(|v| v.parse::<u16>()) {
            Some(Ok(p)) if p >= 1 => p,
            Some(_) => {
                debug!(default = DEFAULT_BIND_PORT, "CERTSENTRY_BIND_PORT invalid, using default");
                DEFAULT_BIND_PORT
            }
            None => DEFAULT_BIND_PORT,
        };

        let storage_dir = PathBuf::from(
            optional("CERTSENTRY_CERT_STORAGE").unwrap_or_else(|| DEFAULT_STORAGE_DIR.to_string()),
        );

        let key_mode = match optional("CERTSENTRY_KEY_PERM").map(|v| parse_mode(&v)) {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(error = %e, "CERTSENTRY_KEY_PERM invalid, using 0600");
                DEFAULT_KEY_MODE
            }
            None => DEFAULT_KEY_MODE,
        };

        let cert_mode = match optional("CERTSENTRY_CERT_PERM").map(|v| parse_mode(&v)) {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(error = %e, "CERTSENTRY_CERT_PERM invalid, using 0644");
                DEFAULT_CERT_MODE
            }
            None => DEFAULT_CERT_MODE,
        };

        let pfx = if flag("CERTSENTRY_PFX_CREATE") {
            Some(PfxFileConfig {
                filename: optional("CERTSENTRY_PFX_FILENAME")
                    .unwrap_or_else(|| DEFAULT_PFX_FILENAME.to_string()),
                password: std::env::var("CERTSENTRY_PFX_PASSWORD").unwrap_or_default(),
            })
        } else {
            None
        };

        let legacy_pfx = if flag("CERTSENTRY_PFX_LEGACY_CREATE") {
            Some(PfxFileConfig {
                filename: optional("CERTSENTRY_PFX_LEGACY_FILENAME")
                    .unwrap_or_else(|| DEFAULT_LEGACY_PFX_FILENAME.to_string()),
                password: std::env::var("CERTSENTRY_PFX_LEGACY_PASSWORD").unwrap_or_default(),
            })
        } else {
            None
        };

        Ok(Self {
            bind_address,
            bind_port,
            server_address,
            key_name,
            key_api_key,
            cert_name,
            cert_api_key,
            aes_key,
            window,
            containers,
            stop_only,
            storage_dir,
            key_mode,
            cert_mode,
            pfx,
            legacy_pfx,
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn flag(name: &'static str) -> bool {
    matches!(optional(name).as_deref(), Some("true"))
}

/// Parse a `HH:MM` 24-hour time string.
pub fn parse_time(value: &str) -> Result<NaiveTime, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(
            "time",
            format!("'{value}' is not a 24-hour HH:MM time (e.g. 18:05)"),
        )
    };

    let (hour, minute) = value.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Parse a space-separated list of weekday names ("mon tue" or "monday tuesday").
pub fn parse_weekdays(value: &str) -> Result<HashSet<Weekday>, ConfigError> {
    let mut days = HashSet::new();
    for word in value.split_whitespace() {
        let day = match word.to_ascii_lowercase().as_str() {
            "sunday" | "sun" => Weekday::Sun,
            "monday" | "mon" => Weekday::Mon,
            "tuesday" | "tue" => Weekday::Tue,
            "wednesday" | "wed" => Weekday::Wed,
            "thursday" | "thu" => Weekday::Thu,
            "friday" | "fri" => Weekday::Fri,
            "saturday" | "sat" => Weekday::Sat,
            other => {
                return Err(ConfigError::Invalid(
                    "weekday",
                    format!("'{other}' is not a weekday name"),
                ))
            }
        };
        days.insert(day);
    }
    if days.is_empty() {
        return Err(ConfigError::Invalid("weekday", "no weekdays given".to_string()));
    }
    Ok(days)
}

/// Parse an octal file mode string such as `0600` or `0o600`.
pub fn parse_mode(value: &str) -> Result<u32, ConfigError> {
    let digits = value.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .map_err(|_| ConfigError::Invalid("mode", format!("'{value}' is not an octal file mode")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_valid() {
        let t = parse_time("18:05").unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(18, 5, 0).unwrap());

        let t = parse_time("00:00").unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_time_invalid() {
        assert!(parse_time("25:00").is_err());
        assert!(parse_time("12:60").is_err());
        assert!(parse_time("noon").is_err());
        assert!(parse_time("12").is_err());
    }

    #[test]
    fn test_parse_weekdays() {
        let days = parse_weekdays("mon Wednesday FRI").unwrap();
        assert_eq!(days.len(), 3);
        assert!(days.contains(&Weekday::Mon));
        assert!(days.contains(&Weekday::Wed));
        assert!(days.contains(&Weekday::Fri));
    }

    #[test]
    fn test_parse_weekdays_rejects_unknown() {
        assert!(parse_weekdays("mon noday").is_err());
        assert!(parse_weekdays("").is_err());
    }

    #[test]
    fn test_parse_weekdays_dedupes() {
        let days = parse_weekdays("mon monday MON").unwrap();
        assert_eq!(days.len(), 1);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0600").unwrap(), 0o600);
        assert_eq!(parse_mode("0o644").unwrap(), 0o644);
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert!(parse_mode("rw-").is_err());
    }
}
