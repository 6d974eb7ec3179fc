use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub remote_control: RemoteControlConfig,
    #[serde(default)]
    pub organizations: Vec<OrganizationEntry>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// JWT secret (random per process if absent)
    pub jwt_secret: Option<String>,
    /// Shared secret casters and agents present on connect (open if absent)
    pub device_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteControlConfig {
    /// Maximum concurrent viewed sessions per organization
    #[serde(default = "default_session_limit")]
    pub session_limit: u32,
    /// Show a notification on the device when a session starts
    #[serde(default = "default_true")]
    pub notify_user: bool,
    /// Require an on-device prompt even for unattended sessions
    #[serde(default)]
    pub enforce_attended_access: bool,
    #[serde(default = "default_true")]
    pub use_webrtc: bool,
    /// Lifetime of issued one-time passwords in seconds
    #[serde(default = "default_otp_ttl")]
    pub otp_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub user_name: String,
    pub display_name: Option<String>,
    pub organization_id: String,
    /// Organization admins can reach every device in their organization
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub organization_id: String,
    /// User ids granted access besides organization admins
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            jwt_secret: None,
            device_token: None,
        }
    }
}

impl Default for RemoteControlConfig {
    fn default() -> Self {
        Self {
            session_limit: default_session_limit(),
            notify_user: true,
            enforce_attended_access: false,
            use_webrtc: true,
            otp_ttl_secs: default_otp_ttl(),
        }
    }
}

impl BrokerConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.jwt_secret.is_none() {
            issues.push(
                "WARNING: server.jwt_secret is not set. A random secret is generated on start, \
                 so tokens issued elsewhere will not validate."
                    .to_string(),
            );
        }

        if self.server.device_token.is_none() {
            issues.push(
                "WARNING: server.device_token is not set. Any client can register as a caster or agent."
                    .to_string(),
            );
        }

        if self.remote_control.session_limit == 0 {
            issues.push(
                "ERROR: remote_control.session_limit must be >= 1, otherwise no authenticated \
                 user can ever open a session."
                    .to_string(),
            );
        }

        if !(10..=3600).contains(&self.remote_control.otp_ttl_secs) {
            issues.push(format!(
                "ERROR: remote_control.otp_ttl_secs must be between 10 and 3600, got {}.",
                self.remote_control.otp_ttl_secs
            ));
        }

        let mut org_ids = HashSet::new();
        for org in &self.organizations {
            if !org_ids.insert(org.id.as_str()) {
                issues.push(format!("ERROR: duplicate organization id '{}'.", org.id));
            }
        }

        let mut user_ids = HashSet::new();
        for user in &self.users {
            if !user_ids.insert(user.id.as_str()) {
                issues.push(format!("ERROR: duplicate user id '{}'.", user.id));
            }
            if !org_ids.contains(user.organization_id.as_str()) {
                issues.push(format!(
                    "ERROR: user '{}' references unknown organization '{}'.",
                    user.id, user.organization_id
                ));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                issues.push(format!("ERROR: duplicate device id '{}'.", device.id));
            }
            if !org_ids.contains(device.organization_id.as_str()) {
                issues.push(format!(
                    "ERROR: device '{}' references unknown organization '{}'.",
                    device.id, device.organization_id
                ));
            }
            for user in &device.allowed_users {
                if !user_ids.contains(user.as_str()) {
                    issues.push(format!(
                        "WARNING: device '{}' grants access to unknown user '{}'. \
                         This entry will never match.",
                        device.id, user
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_session_limit() -> u32 {
    3
}
fn default_otp_ttl() -> u64 {
    60
}
