//! Local participant identity: display name validation, device label, session summary.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::Millis;

/// Display name length bounds, counted in characters after trimming.
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 20;

/// Characters a display name may not contain.
pub const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Who this participant is. Built once at login and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: String,
    pub device_label: String,
    /// Address this participant accepts connections on.
    pub address: SocketAddr,
    pub platform_tag: String,
    pub session_start: Millis,
}

impl Identity {
    /// Validate the display name and build the identity. A blank device label falls
    /// back to `default_label`.
    pub fn login(
        display_name: &str,
        device_label: &str,
        default_label: &str,
        address: SocketAddr,
        platform_tag: &str,
        session_start: Millis,
    ) -> Result<Self, ValidationError> {
        let display_name = validate_display_name(display_name)?;
        let device_label = match device_label.trim() {
            "" => default_label.trim().to_string(),
            label => label.to_string(),
        };
        Ok(Self {
            display_name,
            device_label,
            address,
            platform_tag: platform_tag.to_string(),
            session_start,
        })
    }

    /// Summary record for the end of this session.
    pub fn summary(&self, end_time: Millis) -> SessionSummary {
        SessionSummary {
            user: self.display_name.clone(),
            device: self.device_label.clone(),
            address: self.address,
            start_time: self.session_start,
            end_time,
            duration_ms: end_time.saturating_sub(self.session_start),
        }
    }
}

/// Check a display name and return it trimmed.
pub fn validate_display_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::NameRequired);
    }
    let len = name.chars().count();
    if len < MIN_NAME_LEN {
        return Err(ValidationError::NameTooShort { min: MIN_NAME_LEN });
    }
    if len > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong { max: MAX_NAME_LEN });
    }
    if name.contains(FORBIDDEN_NAME_CHARS) {
        return Err(ValidationError::NameInvalidCharacters);
    }
    Ok(name.to_string())
}

/// Device label used when the user leaves it blank: the hostname, unless it is
/// empty or `localhost`, otherwise a name for the platform.
pub fn default_device_label(hostname: &str, platform: &str) -> String {
    let hostname = hostname.trim();
    if !hostname.is_empty() && hostname != "localhost" {
        return hostname.to_string();
    }
    match platform.to_ascii_lowercase().as_str() {
        "linux" => "Linux PC",
        "macos" | "darwin" => "MacBook",
        "windows" | "win32" => "Windows PC",
        _ => "My Device",
    }
    .to_string()
}

/// Emitted at logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub user: String,
    pub device: String,
    pub address: SocketAddr,
    pub start_time: Millis,
    pub end_time: Millis,
    pub duration_ms: Millis,
}
