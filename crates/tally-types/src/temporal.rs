use chrono::{DateTime, Utc};

/// Wall-clock instant used for row creation and expiry.
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time.
pub fn now() -> Timestamp {
    Utc::now()
}

/// `true` once `expires_at` is set and no longer in the future.
pub fn is_expired(expires_at: Option<Timestamp>, now: Timestamp) -> bool {
    expires_at.is_some_and(|at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_boundaries() {
        let t = now();
        assert!(!is_expired(None, t));
        assert!(!is_expired(Some(t + Duration::hours(2)), t));
        assert!(is_expired(Some(t), t));
        assert!(is_expired(Some(t - Duration::hours(1)), t));
    }
}
