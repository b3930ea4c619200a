//! SIP URI helpers for dial targets and caller identities.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::PhoneError;

static SIP_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i:sips?):(?P<user>[^@\s;?]+)(?:@(?P<host>[^\s;?]+))?(?:[;?]\S*)?$")
        .expect("static regex")
});

static BARE_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@:;<>]+(?:@[^\s@;<>]+)?$").expect("static regex"));

/// User portion of a SIP URI (`sip:1001@pbx` -> `1001`).
///
/// Returns the input unchanged when it is not a SIP URI.
pub fn user_part(uri: &str) -> &str {
    SIP_URI
        .captures(uri.trim())
        .and_then(|c| c.name("user"))
        .map_or(uri, |m| m.as_str())
}

/// Turn a dial target into a full SIP URI.
///
/// `1001` becomes `sip:1001@<host>`, `1001@other` becomes `sip:1001@other`,
/// and `sip:`/`sips:` URIs pass through.
pub fn normalize_target(target: &str, host: &str) -> Result<String, PhoneError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(PhoneError::InvalidTarget("no number to call".into()));
    }

    if SIP_URI.is_match(target) {
        return Ok(target.to_string());
    }
    if !BARE_TARGET.is_match(target) {
        return Err(PhoneError::InvalidTarget(target.to_string()));
    }
    if target.contains('@') {
        Ok(format!("sip:{target}"))
    } else {
        Ok(format!("sip:{target}@{host}"))
    }
}
