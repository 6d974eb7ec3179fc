use std::sync::Arc;

use crate::access::AccessProvider;

/// Outcome of an unattended access check. Deliberately carries no reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied,
}

/// Decides whether an unattended session may start.
///
/// Allowed when a non-empty OTP validates for the device, or when the
/// requester is authenticated and holds a grant on the device.
pub struct AuthorizationGate {
    access: Arc<dyn AccessProvider>,
}

impl AuthorizationGate {
    pub fn new(access: Arc<dyn AccessProvider>) -> Self {
        Self { access }
    }

    pub async fn authorize(
        &self,
        otp: Option<&str>,
        device_id: &str,
        user_id: Option<&str>,
    ) -> Authorization {
        if let Some(otp) = otp.filter(|o| !o.trim().is_empty())
            && self.access.validate_otp(otp, device_id).await
        {
            return Authorization::Allowed;
        }

        if let Some(user_id) = user_id
            && self.access.user_has_device_access(device_id, user_id).await
        {
            return Authorization::Allowed;
        }

        Authorization::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessProvider;
    use crate::access::tests::test_config;

    fn gate() -> (AuthorizationGate, Arc<StaticAccessProvider>) {
        let provider = Arc::new(StaticAccessProvider::from_config(&test_config()));
        (AuthorizationGate::new(provider.clone()), provider)
    }

    #[tokio::test]
    async fn correct_otp_without_identity_is_allowed() {
        let (gate, provider) = gate();
        let otp = provider.otps().issue("dev-a");
        assert_eq!(
            gate.authorize(Some(&otp), "dev-a", None).await,
            Authorization::Allowed
        );
    }

    #[tokio::test]
    async fn wrong_otp_without_identity_is_denied() {
        let (gate, provider) = gate();
        provider.otps().issue("dev-a");
        assert_eq!(
            gate.authorize(Some("not-the-otp"), "dev-a", None).await,
            Authorization::Denied
        );
    }

    #[tokio::test]
    async fn otp_for_another_device_is_denied() {
        let (gate, provider) = gate();
        let otp = provider.otps().issue("dev-b");
        assert_eq!(
            gate.authorize(Some(&otp), "dev-a", None).await,
            Authorization::Denied
        );
    }

    #[tokio::test]
    async fn ungranted_identity_without_otp_is_denied() {
        let (gate, _) = gate();
        assert_eq!(
            gate.authorize(None, "dev-a", Some("ungranted")).await,
            Authorization::Denied
        );
    }

    #[tokio::test]
    async fn granted_identity_with_empty_otp_is_allowed() {
        let (gate, _) = gate();
        assert_eq!(
            gate.authorize(Some(""), "dev-a", Some("granted")).await,
            Authorization::Allowed
        );
    }

    #[tokio::test]
    async fn wrong_otp_falls_back_to_grant() {
        let (gate, _) = gate();
        assert_eq!(
            gate.authorize(Some("bogus"), "dev-a", Some("admin")).await,
            Authorization::Allowed
        );
    }

    #[tokio::test]
    async fn anonymous_without_otp_is_denied() {
        let (gate, _) = gate();
        assert_eq!(
            gate.authorize(None, "dev-a", None).await,
            Authorization::Denied
        );
    }
}
