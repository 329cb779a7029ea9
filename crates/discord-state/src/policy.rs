use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Expiry applied to each kind of cache document.
///
/// The same policy is used by read-through writes and by gateway-driven writes, so a
/// document's lifetime does not depend on which path wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub guild: Duration,
    pub member: Duration,
    /// Lifetime of the negative entry written for a member the API reported absent.
    pub member_absent: Duration,
    /// The per-guild role list.
    pub roles: Duration,
    /// Individual role documents.
    pub role: Duration,
    pub user: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            guild: HOUR,
            member: DAY,
            member_absent: DAY,
            roles: HOUR,
            role: HOUR,
            user: DAY,
        }
    }
}
