use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalised reason a session failed before or during setup.
///
/// Engines report free-form causes (`"Busy"`, `"Not Found"`, SIP reason
/// phrases...). Consumers only ever see one of these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCause {
    Busy,
    Cancel,
    Rejected,
    Redirected,
    Unavailable,
    NotFound,
    AddressIncomplete,
    IncompatibleSdp,
    AuthenticationError,
    General,
}

impl FailureCause {
    /// Map an engine cause to the fixed vocabulary.
    ///
    /// Matching ignores case and treats spaces, dashes and underscores alike,
    /// so `"Not Found"`, `"not_found"` and `"NOT-FOUND"` are the same cause.
    /// Anything unrecognised is `General`.
    pub fn from_engine_cause(cause: &str) -> Self {
        let normalized: String = cause
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        match normalized.as_str() {
            "BUSY" => Self::Busy,
            "CANCEL" | "CANCELED" | "CANCELLED" => Self::Cancel,
            "REJECTED" => Self::Rejected,
            "REDIRECTED" => Self::Redirected,
            "UNAVAILABLE" => Self::Unavailable,
            "NOT_FOUND" => Self::NotFound,
            "ADDRESS_INCOMPLETE" => Self::AddressIncomplete,
            "INCOMPATIBLE_SDP" => Self::IncompatibleSdp,
            "AUTHENTICATION_ERROR" => Self::AuthenticationError,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "BUSY",
            Self::Cancel => "CANCEL",
            Self::Rejected => "REJECTED",
            Self::Redirected => "REDIRECTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::NotFound => "NOT_FOUND",
            Self::AddressIncomplete => "ADDRESS_INCOMPLETE",
            Self::IncompatibleSdp => "INCOMPATIBLE_SDP",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::General => "GENERAL",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
