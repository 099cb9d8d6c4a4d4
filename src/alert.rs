//! # Proximity Alerts
//!
//! One [`AlertRecord`] per (owner, contact) pair, in `Normal` or `Alerting`
//! state. Events fire only on a threshold crossing; a refresh that stays on
//! the same side of the threshold updates the stored distance and is silent.
//! This is what keeps continuous position updates from producing a stream of
//! notifications.
//!
//! ## Bootstrap check
//!
//! A contact who is already far away the first time their distance becomes
//! known fires `EnteredAlert { already_far: true }`. The first evaluation pass
//! of a tracker is its bootstrap pass; closing it sets
//! [`SessionContext::initial_check_done`]. A tracker rebuilt with a session
//! whose flag is already set (app relaunch, same session) puts far contacts
//! into `Alerting` silently during its bootstrap pass, so the user is not
//! re-alerted for contacts they were already told about.

use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{ContactRef, ProximityConfig};

/// Alert state of one (owner, contact) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    Normal,
    Alerting,
}

/// Per-contact alert bookkeeping. Session-only, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub contact_id: String,
    pub state: AlertState,
    pub threshold_km: f64,
    pub last_observed_distance_km: Option<f64>,
    /// When the current `Alerting` period started
    pub entered_at: Option<i64>,
}

/// A threshold crossing, or a route being tracked toward a contact.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    EnteredAlert {
        contact: ContactRef,
        distance_km: f64,
        at: i64,
        /// The contact was already far when their distance first became known
        already_far: bool,
    },
    ExitedAlert {
        contact: ContactRef,
        distance_km: f64,
        at: i64,
    },
    /// The owner started navigating toward `contact`.
    TrackingStarted { contact: ContactRef, at: i64 },
}

impl AlertEvent {
    pub fn contact(&self) -> &ContactRef {
        match self {
            AlertEvent::EnteredAlert { contact, .. }
            | AlertEvent::ExitedAlert { contact, .. }
            | AlertEvent::TrackingStarted { contact, .. } => contact,
        }
    }

    pub fn at(&self) -> i64 {
        match self {
            AlertEvent::EnteredAlert { at, .. }
            | AlertEvent::ExitedAlert { at, .. }
            | AlertEvent::TrackingStarted { at, .. } => *at,
        }
    }

    pub fn distance_km(&self) -> Option<f64> {
        match self {
            AlertEvent::EnteredAlert { distance_km, .. }
            | AlertEvent::ExitedAlert { distance_km, .. } => Some(*distance_km),
            AlertEvent::TrackingStarted { .. } => None,
        }
    }
}

/// Per-session state the shell persists for the lifetime of a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    /// Set once the bootstrap pass has run in this session
    pub initial_check_done: bool,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            initial_check_done: false,
        }
    }

    /// Start a fresh session (logout).
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Alert state machine for every contact of one owner.
#[derive(Debug)]
pub struct AlertTracker {
    owner_id: String,
    threshold_km: f64,
    session: SessionContext,
    records: HashMap<String, AlertRecord>,
    bootstrap_open: bool,
    silent_bootstrap: bool,
}

impl AlertTracker {
    pub fn new(owner_id: impl Into<String>, config: &ProximityConfig, session: SessionContext) -> Self {
        let silent_bootstrap = session.initial_check_done;
        Self {
            owner_id: owner_id.into(),
            threshold_km: config.threshold_km,
            session,
            records: HashMap::new(),
            bootstrap_open: true,
            silent_bootstrap,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn threshold_km(&self) -> f64 {
        self.threshold_km
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Whether the bootstrap pass has not run yet.
    pub fn bootstrap_pending(&self) -> bool {
        self.bootstrap_open
    }

    /// Feed a new distance sample for `contact`.
    ///
    /// Non-finite or negative distances are ignored and leave the record untouched.
    pub fn evaluate(&mut self, contact: &ContactRef, distance_km: f64, now_ms: i64) -> Option<AlertEvent> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            debug!(
                "[AlertTracker] Skipping invalid distance {} for {}",
                distance_km, contact.id
            );
            return None;
        }

        let threshold_km = self.threshold_km;
        let is_new = !self.records.contains_key(&contact.id);
        let record = self
            .records
            .entry(contact.id.clone())
            .or_insert_with(|| AlertRecord {
                contact_id: contact.id.clone(),
                state: AlertState::Normal,
                threshold_km,
                last_observed_distance_km: None,
                entered_at: None,
            });
        record.last_observed_distance_km = Some(distance_km);

        let far = distance_km >= threshold_km;
        match (record.state, far) {
            (AlertState::Normal, true) => {
                record.state = AlertState::Alerting;
                record.entered_at = Some(now_ms);

                if is_new && self.bootstrap_open && self.silent_bootstrap {
                    debug!(
                        "[AlertTracker] {} already alerted this session, entering silently",
                        contact.id
                    );
                    return None;
                }

                info!(
                    "[AlertTracker] {} is {:.2} km from {} (threshold {:.2} km)",
                    contact.display_name, distance_km, self.owner_id, threshold_km
                );
                Some(AlertEvent::EnteredAlert {
                    contact: contact.clone(),
                    distance_km,
                    at: now_ms,
                    already_far: is_new,
                })
            }
            (AlertState::Alerting, false) => {
                record.state = AlertState::Normal;
                record.entered_at = None;
                info!(
                    "[AlertTracker] {} is back within range of {} ({:.2} km)",
                    contact.display_name, self.owner_id, distance_km
                );
                Some(AlertEvent::ExitedAlert {
                    contact: contact.clone(),
                    distance_km,
                    at: now_ms,
                })
            }
            _ => None,
        }
    }

    /// Evaluate a batch of samples and close the bootstrap pass.
    pub fn evaluate_pass(&mut self, samples: &[(ContactRef, f64)], now_ms: i64) -> Vec<AlertEvent> {
        let events: Vec<AlertEvent> = samples
            .iter()
            .filter_map(|(contact, distance_km)| self.evaluate(contact, *distance_km, now_ms))
            .collect();

        if self.bootstrap_open {
            self.bootstrap_open = false;
            self.session.initial_check_done = true;
            debug!(
                "[AlertTracker] Bootstrap pass done for session {} ({} samples)",
                self.session.session_id,
                samples.len()
            );
        }

        events
    }

    /// Drop the record for a contact whose edge was removed.
    pub fn forget(&mut self, contact_id: &str) -> Option<AlertRecord> {
        self.records.remove(contact_id)
    }

    pub fn record(&self, contact_id: &str) -> Option<&AlertRecord> {
        self.records.get(contact_id)
    }

    /// Ids of contacts currently in `Alerting` state.
    pub fn alerting(&self) -> Vec<&str> {
        self.records
            .values()
            .filter(|r| r.state == AlertState::Alerting)
            .map(|r| r.contact_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asha() -> ContactRef {
        ContactRef::new("user-2", "Asha", "asha@example.com")
    }

    fn tracker() -> AlertTracker {
        AlertTracker::new("owner", &ProximityConfig::default(), SessionContext::new())
    }

    #[test]
    fn test_hysteresis_two_events() {
        let mut tracker = tracker();
        let contact = asha();

        let events: Vec<Option<AlertEvent>> = [0.3, 0.6, 0.65, 0.2]
            .iter()
            .enumerate()
            .map(|(i, d)| tracker.evaluate(&contact, *d, i as i64))
            .collect();

        assert!(events[0].is_none());
        assert!(matches!(
            events[1],
            Some(AlertEvent::EnteredAlert { already_far: false, at: 1, .. })
        ));
        assert!(events[2].is_none());
        assert!(matches!(events[3], Some(AlertEvent::ExitedAlert { at: 3, .. })));
        assert_eq!(events.iter().flatten().count(), 2);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut tracker = tracker();
        tracker.evaluate(&asha(), 0.1, 0);
        assert!(tracker.evaluate(&asha(), 0.5, 1).is_some());
        assert_eq!(tracker.record("user-2").unwrap().state, AlertState::Alerting);
    }

    #[test]
    fn test_same_state_refresh_updates_distance() {
        let mut tracker = tracker();
        tracker.evaluate(&asha(), 0.1, 0);
        tracker.evaluate(&asha(), 0.7, 1);
        assert!(tracker.evaluate(&asha(), 0.9, 2).is_none());

        let record = tracker.record("user-2").unwrap();
        assert_eq!(record.last_observed_distance_km, Some(0.9));
        assert_eq!(record.entered_at, Some(1));
    }

    #[test]
    fn test_exit_clears_entered_at() {
        let mut tracker = tracker();
        tracker.evaluate(&asha(), 0.1, 0);
        tracker.evaluate(&asha(), 0.7, 1);
        tracker.evaluate(&asha(), 0.2, 2);
        assert!(tracker.record("user-2").unwrap().entered_at.is_none());
    }

    #[test]
    fn test_bootstrap_fires_already_far() {
        let mut tracker = tracker();
        let near = ContactRef::new("user-3", "Ravi", "ravi@example.com");
        let events = tracker.evaluate_pass(&[(asha(), 2.0), (near, 0.1)], 100);

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AlertEvent::EnteredAlert { already_far: true, contact, .. } if contact.id == "user-2"
        ));
        assert!(tracker.session().initial_check_done);
        assert!(!tracker.bootstrap_pending());

        // Subsequent refreshes stay silent
        assert!(tracker.evaluate_pass(&[(asha(), 2.5)], 200).is_empty());
    }

    #[test]
    fn test_relaunch_does_not_refire_bootstrap() {
        let mut first = tracker();
        first.evaluate_pass(&[(asha(), 2.0)], 100);
        let session = first.session().clone();

        let mut relaunched = AlertTracker::new("owner", &ProximityConfig::default(), session);
        assert!(relaunched.evaluate_pass(&[(asha(), 2.0)], 300).is_empty());
        assert_eq!(relaunched.record("user-2").unwrap().state, AlertState::Alerting);

        // Coming back still fires the exit
        let exit = relaunched.evaluate(&asha(), 0.1, 400);
        assert!(matches!(exit, Some(AlertEvent::ExitedAlert { .. })));
    }

    #[test]
    fn test_invalid_distances_are_skipped() {
        let mut tracker = tracker();
        tracker.evaluate(&asha(), 0.1, 0);
        assert!(tracker.evaluate(&asha(), f64::NAN, 1).is_none());
        assert!(tracker.evaluate(&asha(), -1.0, 2).is_none());
        assert!(tracker.evaluate(&asha(), f64::INFINITY, 3).is_none());
        assert_eq!(tracker.record("user-2").unwrap().last_observed_distance_km, Some(0.1));

        let mut fresh = self::tracker();
        assert!(fresh.evaluate(&asha(), f64::NAN, 0).is_none());
        assert!(fresh.record("user-2").is_none());
    }

    #[test]
    fn test_forget_drops_record() {
        let mut tracker = tracker();
        tracker.evaluate(&asha(), 0.1, 0);
        tracker.evaluate(&asha(), 0.8, 1);
        assert_eq!(tracker.alerting(), vec!["user-2"]);

        let record = tracker.forget("user-2").unwrap();
        assert_eq!(record.state, AlertState::Alerting);
        assert!(tracker.record("user-2").is_none());
        assert!(tracker.alerting().is_empty());
    }

    #[test]
    fn test_custom_threshold() {
        let config = ProximityConfig {
            threshold_km: 2.0,
            ..ProximityConfig::default()
        };
        let mut tracker = AlertTracker::new("owner", &config, SessionContext::new());
        tracker.evaluate(&asha(), 0.1, 0);
        assert!(tracker.evaluate(&asha(), 1.5, 1).is_none());
        assert!(tracker.evaluate(&asha(), 2.1, 2).is_some());
    }

    #[test]
    fn test_session_context_serde_and_reset() {
        let mut session = SessionContext::new();
        session.initial_check_done = true;

        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("initialCheckDone"));
        let restored: SessionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, session);

        let old_id = session.session_id.clone();
        session.reset();
        assert!(!session.initial_check_done);
        assert_ne!(session.session_id, old_id);
    }
}
