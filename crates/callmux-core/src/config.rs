use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PhoneError;

/// Well-known alternate port of the PBX websocket transport.
pub const DEFAULT_SIGNALING_PORT: u16 = 8089;

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct PhoneSettings {
    #[serde(default)]
    pub signaling_host: Option<String>,
    #[serde(default = "default_port")]
    pub signaling_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub allow_multiple_calls: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,
    /// `wss` when true, `ws` otherwise.
    #[serde(default = "default_true")]
    pub secure: bool,
    /// Upper bound on the consultation leg of an assisted transfer.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_SIGNALING_PORT
}

fn default_user_agent() -> String {
    format!("callmux/{}", env!("CARGO_PKG_VERSION"))
}

fn default_websocket_path() -> String {
    "/ws".to_string()
}

fn default_true() -> bool {
    true
}

fn default_transfer_timeout() -> u64 {
    60
}

impl Default for PhoneSettings {
    fn default() -> Self {
        Self {
            signaling_host: None,
            signaling_port: DEFAULT_SIGNALING_PORT,
            username: None,
            secret: None,
            allow_multiple_calls: false,
            display_name: None,
            user_agent: default_user_agent(),
            websocket_path: default_websocket_path(),
            secure: true,
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

impl fmt::Debug for PhoneSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneSettings")
            .field("signaling_host", &self.signaling_host)
            .field("signaling_port", &self.signaling_port)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("allow_multiple_calls", &self.allow_multiple_calls)
            .field("display_name", &self.display_name)
            .field("user_agent", &self.user_agent)
            .field("websocket_path", &self.websocket_path)
            .field("secure", &self.secure)
            .field("transfer_timeout_secs", &self.transfer_timeout_secs)
            .finish()
    }
}

/// Everything the engine needs to connect and register one account.
#[derive(Clone, PartialEq, Eq)]
pub struct UaConfig {
    /// e.g. `wss://pbx.example.com:8089/ws`
    pub socket_url: String,
    /// e.g. `sip:1001@pbx.example.com`
    pub uri: String,
    pub host: String,
    pub extension: String,
    pub password: String,
    pub display_name: Option<String>,
    pub user_agent: String,
}

impl fmt::Debug for UaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UaConfig")
            .field("socket_url", &self.socket_url)
            .field("uri", &self.uri)
            .field("host", &self.host)
            .field("extension", &self.extension)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl PhoneSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PhoneError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PhoneError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| PhoneError::Config(format!("invalid settings in {}: {e}", path.display())))
    }

    /// Set the account parameters. Nothing is changed if one is missing.
    pub fn set_parameters(
        &mut self,
        host: &str,
        port: Option<u16>,
        username: &str,
        secret: &str,
    ) -> Result<(), PhoneError> {
        let host = required("signaling_host", Some(host))?;
        let username = required("username", Some(username))?;
        let secret = required("secret", Some(secret))?;

        self.signaling_host = Some(host.to_string());
        self.signaling_port = port.unwrap_or(DEFAULT_SIGNALING_PORT);
        self.username = Some(username.to_string());
        self.secret = Some(secret.to_string());
        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Check the mandatory parameters and build the engine configuration.
    pub fn validate(&self) -> Result<UaConfig, PhoneError> {
        let host = required("signaling_host", self.signaling_host.as_deref())?;
        let username = required("username", self.username.as_deref())?;
        let secret = required("secret", self.secret.as_deref())?;
        if self.signaling_port == 0 {
            return Err(PhoneError::Config("signaling_port must be non-zero".into()));
        }

        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.websocket_path.starts_with('/') {
            self.websocket_path.clone()
        } else {
            format!("/{}", self.websocket_path)
        };

        Ok(UaConfig {
            socket_url: format!("{scheme}://{host}:{}{path}", self.signaling_port),
            uri: format!("sip:{username}@{host}"),
            host: host.to_string(),
            extension: username.to_string(),
            password: secret.to_string(),
            display_name: self.display_name.clone(),
            user_agent: self.user_agent.clone(),
        })
    }
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, PhoneError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(PhoneError::Config(format!("{name} is required"))),
    }
}
