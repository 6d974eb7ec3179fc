use uuid::Uuid;

use crate::directory::SessionDirectory;

/// Per-organization ceiling on sessions that currently have a viewer.
///
/// The count is taken from a snapshot of the directory, so two requests
/// racing for the last slot can both be admitted. The ceiling is advisory.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimiter {
    ceiling: usize,
}

impl ConcurrencyLimiter {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Sessions of `organization_id` with at least one viewer, not counting
    /// `excluding` (the session being requested).
    pub fn active_sessions(
        &self,
        directory: &SessionDirectory,
        organization_id: &str,
        excluding: Uuid,
    ) -> usize {
        directory
            .handles()
            .iter()
            .filter(|h| {
                h.read(|s| {
                    s.caster_id != excluding
                        && s.organization_id.as_deref() == Some(organization_id)
                        && !s.viewers.is_empty()
                })
            })
            .count()
    }

    pub fn admit(
        &self,
        directory: &SessionDirectory,
        organization_id: &str,
        excluding: Uuid,
    ) -> bool {
        self.active_sessions(directory, organization_id, excluding) < self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use castgate_protocol::SessionInfo;

    use super::*;

    fn active(dir: &SessionDirectory, org: &str) -> Uuid {
        let mut info = SessionInfo::new(Uuid::new_v4(), "dev", dir.generate_attended_code());
        info.organization_id = Some(org.to_string());
        info.viewers.insert(Uuid::new_v4());
        let id = info.caster_id;
        dir.insert(info);
        id
    }

    #[test]
    fn admits_below_ceiling() {
        let dir = SessionDirectory::new();
        let limiter = ConcurrencyLimiter::new(2);
        active(&dir, "org-a");
        assert!(limiter.admit(&dir, "org-a", Uuid::new_v4()));
        active(&dir, "org-a");
        assert!(!limiter.admit(&dir, "org-a", Uuid::new_v4()));
    }

    #[test]
    fn requested_target_is_not_counted() {
        let dir = SessionDirectory::new();
        let limiter = ConcurrencyLimiter::new(1);
        let target = active(&dir, "org-a");
        assert!(limiter.admit(&dir, "org-a", target));
    }

    #[test]
    fn sessions_without_viewers_are_not_counted() {
        let dir = SessionDirectory::new();
        let limiter = ConcurrencyLimiter::new(1);
        let mut idle = SessionInfo::new(Uuid::new_v4(), "dev", "000001");
        idle.organization_id = Some("org-a".to_string());
        dir.insert(idle);
        assert_eq!(limiter.active_sessions(&dir, "org-a", Uuid::nil()), 0);
        assert!(limiter.admit(&dir, "org-a", Uuid::nil()));
    }

    #[test]
    fn other_organizations_are_unaffected() {
        let dir = SessionDirectory::new();
        let limiter = ConcurrencyLimiter::new(1);
        active(&dir, "org-a");
        assert!(!limiter.admit(&dir, "org-a", Uuid::nil()));
        assert!(limiter.admit(&dir, "org-b", Uuid::nil()));
    }

    #[test]
    fn racing_admissions_can_both_pass() {
        let dir = SessionDirectory::new();
        let limiter = ConcurrencyLimiter::new(1);
        // Both checks run before either session gains a viewer
        let first = limiter.admit(&dir, "org-a", Uuid::new_v4());
        let second = limiter.admit(&dir, "org-a", Uuid::new_v4());
        assert!(first && second, "the ceiling is advisory under races");
        active(&dir, "org-a");
        active(&dir, "org-a");
        assert_eq!(limiter.active_sessions(&dir, "org-a", Uuid::nil()), 2);
    }
}
