//! # Presence Classification
//!
//! Labels a contact as live, stale or offline from the positions its account
//! document carries. The current position is preferred over the last-known
//! one; a last-known position alone is never live regardless of its age.
//!
//! Accounts with neither position are `Offline` and have no effective
//! position. They are excluded from distance computation entirely: the map's
//! placeholder location is a display concern and never reaches this module.

use serde::{Deserialize, Serialize};

use crate::store::AccountRecord;
use crate::{ContactRef, Position};

/// Display name used when an account carries neither a name nor a usable email.
pub const FALLBACK_DISPLAY_NAME: &str = "Family Member";

/// Presence of a tracked contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum Presence {
    /// Current position reported within the live window
    Live,
    /// A position exists but is outside the live window, or only the last-known one exists
    Stale,
    /// No position data at all
    Offline,
}

/// Result of classifying a contact's positions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Classification {
    pub presence: Presence,
    pub is_live: bool,
    /// Position used for distance computation, `None` when offline
    pub effective_position: Option<Position>,
    /// Age of the effective position in milliseconds
    pub age_ms: Option<i64>,
}

impl Classification {
    fn offline() -> Self {
        Self {
            presence: Presence::Offline,
            is_live: false,
            effective_position: None,
            age_ms: None,
        }
    }
}

/// Classify a contact from its current and last-known positions.
///
/// A current position is live when `now_ms - captured_at <= live_window_ms`.
/// Positions timestamped in the future (device clock skew) count as age 0.
///
/// # Example
///
/// ```rust
/// use proximity_guard::{classify, Position, Presence};
///
/// let now = 1_700_000_000_000;
/// let fresh = Position::new(19.0760, 72.8777, now - 30_000);
/// let c = classify(Some(&fresh), None, now, 120_000);
/// assert_eq!(c.presence, Presence::Live);
/// ```
pub fn classify(
    current: Option<&Position>,
    last_known: Option<&Position>,
    now_ms: i64,
    live_window_ms: i64,
) -> Classification {
    let current = current.filter(|p| p.point.is_valid());
    let last_known = last_known.filter(|p| p.point.is_valid());

    if let Some(position) = current {
        let age = (now_ms - position.captured_at).max(0);
        let is_live = age <= live_window_ms;
        return Classification {
            presence: if is_live { Presence::Live } else { Presence::Stale },
            is_live,
            effective_position: Some(*position),
            age_ms: Some(age),
        };
    }

    match last_known {
        Some(position) => Classification {
            presence: Presence::Stale,
            is_live: false,
            effective_position: Some(*position),
            age_ms: Some((now_ms - position.captured_at).max(0)),
        },
        None => Classification::offline(),
    }
}

/// An account being observed through a relationship edge.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: Option<String>,
    /// Relationship label the owner gave this contact
    pub relationship: Option<String>,
    pub last_known_position: Option<Position>,
    pub is_live: bool,
    pub presence: Presence,
}

impl TrackedEntity {
    /// Build a tracked entity from an account document and classify it.
    pub fn from_record(
        record: &AccountRecord,
        relationship: Option<String>,
        now_ms: i64,
        live_window_ms: i64,
    ) -> Self {
        let classification = classify(
            record.location.as_ref(),
            record.last_location.as_ref(),
            now_ms,
            live_window_ms,
        );

        Self {
            id: record.id.clone(),
            display_name: display_name(record.name.as_deref(), &record.email),
            email: record.email.clone(),
            role: record.role.clone(),
            relationship,
            last_known_position: classification.effective_position,
            is_live: classification.is_live,
            presence: classification.presence,
        }
    }

    /// Identity used by the alert and notification layers.
    pub fn contact_ref(&self) -> ContactRef {
        ContactRef::new(self.id.clone(), self.display_name.clone(), self.email.clone())
    }
}

/// Resolve a display name: the account name, then the email local part,
/// then [`FALLBACK_DISPLAY_NAME`].
pub fn display_name(name: Option<&str>, email: &str) -> String {
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match email.split('@').next().map(str::trim) {
        Some(local) if !local.is_empty() => local.to_string(),
        _ => FALLBACK_DISPLAY_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;
    const WINDOW: i64 = 120_000;

    #[test]
    fn test_recent_position_is_live() {
        let p = Position::new(19.0760, 72.8777, NOW - 30_000);
        let c = classify(Some(&p), None, NOW, WINDOW);
        assert!(c.is_live);
        assert_eq!(c.presence, Presence::Live);
        assert_eq!(c.age_ms, Some(30_000));
    }

    #[test]
    fn test_three_minute_old_position_is_not_live() {
        let p = Position::new(19.0760, 72.8777, NOW - 180_000);
        let c = classify(Some(&p), None, NOW, WINDOW);
        assert!(!c.is_live);
        assert_eq!(c.presence, Presence::Stale);
        assert_eq!(c.effective_position, Some(p));
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let p = Position::new(19.0760, 72.8777, NOW - WINDOW);
        assert!(classify(Some(&p), None, NOW, WINDOW).is_live);
    }

    #[test]
    fn test_current_preferred_over_last_known() {
        let current = Position::new(19.0760, 72.8777, NOW - 10_000);
        let last = Position::new(18.0, 72.0, NOW - 5_000);
        let c = classify(Some(&current), Some(&last), NOW, WINDOW);
        assert_eq!(c.effective_position, Some(current));
    }

    #[test]
    fn test_last_known_only_is_never_live() {
        let last = Position::new(19.0760, 72.8777, NOW - 1_000);
        let c = classify(None, Some(&last), NOW, WINDOW);
        assert!(!c.is_live);
        assert_eq!(c.presence, Presence::Stale);
        assert_eq!(c.effective_position, Some(last));
    }

    #[test]
    fn test_no_position_is_offline() {
        let c = classify(None, None, NOW, WINDOW);
        assert_eq!(c.presence, Presence::Offline);
        assert!(c.effective_position.is_none());
        assert!(c.age_ms.is_none());
    }

    #[test]
    fn test_invalid_current_falls_back_to_last_known() {
        let bad = Position::new(f64::NAN, 72.0, NOW);
        let last = Position::new(19.0, 72.0, NOW - 1_000);
        let c = classify(Some(&bad), Some(&last), NOW, WINDOW);
        assert_eq!(c.effective_position, Some(last));
        assert!(!c.is_live);
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let p = Position::new(19.0, 72.0, NOW + 60_000);
        let c = classify(Some(&p), None, NOW, WINDOW);
        assert!(c.is_live);
        assert_eq!(c.age_ms, Some(0));
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(display_name(Some("Asha"), "asha@example.com"), "Asha");
        assert_eq!(display_name(Some("  "), "ravi@example.com"), "ravi");
        assert_eq!(display_name(None, "ravi@example.com"), "ravi");
        assert_eq!(display_name(None, ""), FALLBACK_DISPLAY_NAME);
        assert_eq!(display_name(None, "@example.com"), FALLBACK_DISPLAY_NAME);
    }
}
