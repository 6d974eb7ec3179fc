use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use castgate_protocol::{BrokerConfig, DeviceEntry, UserEntry};
use rand::Rng;
use rand::distributions::Alphanumeric;

const OTP_LEN: usize = 24;

/// What the broker needs to know about an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_name: String,
    pub display_name: Option<String>,
    pub organization_id: String,
}

impl UserRecord {
    /// Name shown to the person at the device.
    pub fn display_or_user_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.user_name)
    }
}

/// User, device and organization lookups plus OTP validation.
#[async_trait]
pub trait AccessProvider: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Option<UserRecord>;
    async fn user_has_device_access(&self, device_id: &str, user_id: &str) -> bool;
    async fn validate_otp(&self, otp: &str, device_id: &str) -> bool;
    async fn organization_name(&self, organization_id: &str) -> Option<String>;
}

/// Short-lived one-time passwords bound to a device.
pub struct OtpStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl OtpStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new OTP for a device, pruning expired ones.
    pub fn issue(&self, device_id: &str) -> String {
        let otp: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(OTP_LEN)
            .map(char::from)
            .collect();
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(otp.clone(), (device_id.to_string(), now + self.ttl));
        otp
    }

    /// True when `otp` was issued for `device_id` and has not expired.
    /// OTPs stay valid until expiry: a viewer page presents the same value
    /// more than once while it sets up.
    pub fn matches(&self, otp: &str, device_id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(otp)
            .is_some_and(|(device, expires)| device == device_id && *expires > Instant::now())
    }
}

/// Access provider backed by the `[[organizations]]`, `[[users]]` and
/// `[[devices]]` tables of the config file.
pub struct StaticAccessProvider {
    organizations: HashMap<String, String>,
    users: HashMap<String, UserEntry>,
    devices: HashMap<String, DeviceEntry>,
    otps: OtpStore,
}

impl StaticAccessProvider {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            organizations: config
                .organizations
                .iter()
                .map(|o| (o.id.clone(), o.name.clone()))
                .collect(),
            users: config
                .users
                .iter()
                .map(|u| (u.id.clone(), u.clone()))
                .collect(),
            devices: config
                .devices
                .iter()
                .map(|d| (d.id.clone(), d.clone()))
                .collect(),
            otps: OtpStore::new(Duration::from_secs(config.remote_control.otp_ttl_secs)),
        }
    }

    pub fn otps(&self) -> &OtpStore {
        &self.otps
    }

    pub fn device_name(&self, device_id: &str) -> Option<&str> {
        self.devices.get(device_id).map(|d| d.name.as_str())
    }

    pub fn device_organization(&self, device_id: &str) -> Option<&str> {
        self.devices.get(device_id).map(|d| d.organization_id.as_str())
    }

    fn has_access(&self, device_id: &str, user_id: &str) -> bool {
        let (Some(device), Some(user)) = (self.devices.get(device_id), self.users.get(user_id))
        else {
            return false;
        };
        device.organization_id == user.organization_id
            && (user.is_admin || device.allowed_users.iter().any(|u| u == user_id))
    }
}

#[async_trait]
impl AccessProvider for StaticAccessProvider {
    async fn get_user(&self, user_id: &str) -> Option<UserRecord> {
        self.users.get(user_id).map(|u| UserRecord {
            user_name: u.user_name.clone(),
            display_name: u.display_name.clone(),
            organization_id: u.organization_id.clone(),
        })
    }

    async fn user_has_device_access(&self, device_id: &str, user_id: &str) -> bool {
        self.has_access(device_id, user_id)
    }

    async fn validate_otp(&self, otp: &str, device_id: &str) -> bool {
        self.otps.matches(otp, device_id)
    }

    async fn organization_name(&self, organization_id: &str) -> Option<String> {
        self.organizations.get(organization_id).cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two organizations, an admin, a granted user and an ungranted user.
    pub(crate) fn test_config() -> BrokerConfig {
        toml::from_str(
            r#"
            [[organizations]]
            id = "org-a"
            name = "Acme"

            [[organizations]]
            id = "org-b"
            name = "Globex"

            [[users]]
            id = "admin"
            user_name = "root@acme"
            organization_id = "org-a"
            is_admin = true

            [[users]]
            id = "granted"
            user_name = "ada@acme"
            display_name = "Ada"
            organization_id = "org-a"

            [[users]]
            id = "ungranted"
            user_name = "bob@acme"
            organization_id = "org-a"

            [[users]]
            id = "outsider"
            user_name = "eve@globex"
            organization_id = "org-b"
            is_admin = true

            [[users]]
            id = "globex-user"
            user_name = "gus@globex"
            organization_id = "org-b"

            [[devices]]
            id = "dev-a"
            name = "FRONT-DESK"
            organization_id = "org-a"
            allowed_users = ["granted"]

            [[devices]]
            id = "dev-b"
            name = "WAREHOUSE"
            organization_id = "org-b"
            allowed_users = ["globex-user"]
            "#,
        )
        .expect("test config")
    }

    #[tokio::test]
    async fn device_access_rules() {
        let provider = StaticAccessProvider::from_config(&test_config());
        assert!(provider.user_has_device_access("dev-a", "admin").await);
        assert!(provider.user_has_device_access("dev-a", "granted").await);
        assert!(!provider.user_has_device_access("dev-a", "ungranted").await);
        // Admin of another organization
        assert!(!provider.user_has_device_access("dev-a", "outsider").await);
        assert!(!provider.user_has_device_access("missing", "admin").await);
        assert!(!provider.user_has_device_access("dev-a", "missing").await);
    }

    #[tokio::test]
    async fn user_lookup_and_display_name() {
        let provider = StaticAccessProvider::from_config(&test_config());
        let ada = provider.get_user("granted").await.unwrap();
        assert_eq!(ada.display_or_user_name(), "Ada");
        assert_eq!(ada.organization_id, "org-a");
        let bob = provider.get_user("ungranted").await.unwrap();
        assert_eq!(bob.display_or_user_name(), "bob@acme");
        assert!(provider.get_user("nobody").await.is_none());
        assert_eq!(
            provider.organization_name("org-b").await.as_deref(),
            Some("Globex")
        );
        assert_eq!(provider.device_name("dev-a"), Some("FRONT-DESK"));
        assert_eq!(provider.device_organization("dev-b"), Some("org-b"));
    }

    #[tokio::test]
    async fn otp_is_bound_to_device() {
        let provider = StaticAccessProvider::from_config(&test_config());
        let otp = provider.otps().issue("dev-a");
        assert_eq!(otp.len(), OTP_LEN);
        assert!(provider.validate_otp(&otp, "dev-a").await);
        assert!(provider.validate_otp(&otp, "dev-a").await, "not consumed");
        assert!(!provider.validate_otp(&otp, "dev-b").await);
        assert!(!provider.validate_otp("wrong", "dev-a").await);
    }

    #[test]
    fn otp_expires() {
        let store = OtpStore::new(Duration::from_millis(0));
        let otp = store.issue("dev-a");
        assert!(!store.matches(&otp, "dev-a"));
    }

    #[test]
    fn issue_prunes_expired() {
        let store = OtpStore::new(Duration::from_millis(0));
        store.issue("dev-a");
        store.issue("dev-a");
        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
