//! # Notification Dispatch
//!
//! Turns alert events into notification messages. The message log in the
//! document store is the authoritative record: both sides of an edge get
//! their message in one atomic batch, and only then is a push requested.
//! Push failures (permission revoked, channel unavailable) are logged and
//! swallowed.
//!
//! The dispatcher does no deduplication. One transition produces one
//! dispatch; the alert tracker guarantees at most one transition per
//! threshold crossing.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::alert::AlertEvent;
use crate::error::{ProximityError, Result};
use crate::store::{DocumentStore, WriteBatch, WriteOp};
use crate::ContactRef;

// ============================================================================
// Messages
// ============================================================================

/// Where a message surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Written to the log and mirrored as a push notification
    Push,
    /// Written to the log only
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    ProximityAlert,
    BackInRange,
    TrackingStarted,
    FamilySummary,
}

/// An entry in an account's notification log. Only `is_read` ever changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub id: String,
    pub recipient_id: String,
    pub channel: Channel,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub payload: HashMap<String, String>,
    pub created_at: i64,
    #[serde(default)]
    pub is_read: bool,
}

impl NotificationMessage {
    fn new(
        recipient_id: &str,
        channel: Channel,
        kind: NotificationKind,
        title: String,
        body: String,
        payload: HashMap<String, String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient_id: recipient_id.to_string(),
            channel,
            kind,
            title,
            body,
            payload,
            created_at,
            is_read: false,
        }
    }
}

// ============================================================================
// Push Channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPriority {
    Default,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
    pub priority: PushPriority,
}

/// Device push notification channel.
pub trait PushChannel: Send + Sync {
    /// Schedule a notification, returning the platform's local id.
    fn schedule(&self, request: PushRequest) -> Result<String>;
}

/// Push channel used when notification permission was denied: every request
/// is rejected, so messages only reach the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyPush;

impl PushChannel for LogOnlyPush {
    fn schedule(&self, request: PushRequest) -> Result<String> {
        debug!("[LogOnlyPush] Dropping push '{}'", request.title);
        Err(ProximityError::PermissionDenied(
            "push notifications are disabled".to_string(),
        ))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// What a dispatch wrote and delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub owner_message: NotificationMessage,
    /// `None` when the counterpart account no longer exists
    pub counterpart_message: Option<NotificationMessage>,
    /// Local push id, `None` when the push was rejected
    pub push_id: Option<String>,
}

/// Writes notification logs and requests push delivery.
pub struct NotificationDispatcher {
    store: Arc<dyn DocumentStore>,
    push: Arc<dyn PushChannel>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, push: Arc<dyn PushChannel>) -> Self {
        Self { store, push }
    }

    /// Dispatch an alert event on behalf of `owner`.
    ///
    /// Fails only when the log write fails; the caller retries later.
    pub fn dispatch(&self, owner: &ContactRef, event: &AlertEvent, now_ms: i64) -> Result<DispatchOutcome> {
        let contact = event.contact();
        let (kind, title, owner_body, counterpart_body, priority) = render(owner, event);

        let mut payload = HashMap::new();
        payload.insert("contactId".to_string(), contact.id.clone());
        payload.insert("contactName".to_string(), contact.display_name.clone());
        payload.insert("at".to_string(), event.at().to_string());
        if let Some(distance_km) = event.distance_km() {
            payload.insert("distanceKm".to_string(), format!("{:.2}", distance_km));
        }
        if let AlertEvent::EnteredAlert { already_far, .. } = event {
            payload.insert("alreadyFar".to_string(), already_far.to_string());
        }

        let owner_message = NotificationMessage::new(
            &owner.id,
            Channel::Push,
            kind,
            title.clone(),
            owner_body.clone(),
            payload.clone(),
            now_ms,
        );

        let counterpart_message = match self.store.get(&contact.id)? {
            Some(_) => {
                let mut counterpart_payload = payload.clone();
                counterpart_payload.insert("contactId".to_string(), owner.id.clone());
                counterpart_payload.insert("contactName".to_string(), owner.display_name.clone());
                Some(NotificationMessage::new(
                    &contact.id,
                    Channel::Log,
                    kind,
                    title.clone(),
                    counterpart_body,
                    counterpart_payload,
                    now_ms,
                ))
            }
            None => {
                debug!(
                    "[NotificationDispatcher] Counterpart {} not found, writing owner log only",
                    contact.id
                );
                None
            }
        };

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::AppendNotification {
            account_id: owner.id.clone(),
            message: owner_message.clone(),
        });
        if let Some(message) = &counterpart_message {
            batch.push(WriteOp::AppendNotification {
                account_id: contact.id.clone(),
                message: message.clone(),
            });
        }
        self.store.commit(batch)?;

        let push_id = self.push_after_log(PushRequest {
            title,
            body: owner_body,
            data: payload,
            priority,
        });

        info!(
            "[NotificationDispatcher] {:?} for {} -> {} (push: {})",
            kind,
            owner.id,
            contact.id,
            push_id.is_some()
        );

        Ok(DispatchOutcome {
            owner_message,
            counterpart_message,
            push_id,
        })
    }

    /// One summary message to the owner for every far-away contact.
    ///
    /// Returns `Ok(None)` when there is nothing to report.
    pub fn dispatch_consolidated(
        &self,
        owner: &ContactRef,
        far_contacts: &[(ContactRef, f64)],
        now_ms: i64,
    ) -> Result<Option<DispatchOutcome>> {
        if far_contacts.is_empty() {
            return Ok(None);
        }

        let names: Vec<&str> = far_contacts
            .iter()
            .map(|(c, _)| c.display_name.as_str())
            .collect();
        let max_distance = far_contacts
            .iter()
            .map(|(_, d)| *d)
            .fold(0.0_f64, f64::max);

        let title = "Family Alert".to_string();
        let body = if far_contacts.len() == 1 {
            format!("{} is {:.2} km away from you!", names[0], max_distance)
        } else {
            format!(
                "{} family members are far away: {}. Check the map for details.",
                far_contacts.len(),
                names.join(", ")
            )
        };

        let mut payload = HashMap::new();
        payload.insert("contactNames".to_string(), names.join(", "));
        payload.insert("count".to_string(), far_contacts.len().to_string());
        payload.insert("maxDistanceKm".to_string(), format!("{:.2}", max_distance));

        let message = NotificationMessage::new(
            &owner.id,
            Channel::Push,
            NotificationKind::FamilySummary,
            title.clone(),
            body.clone(),
            payload.clone(),
            now_ms,
        );

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::AppendNotification {
            account_id: owner.id.clone(),
            message: message.clone(),
        });
        self.store.commit(batch)?;

        let push_id = self.push_after_log(PushRequest {
            title,
            body,
            data: payload,
            priority: PushPriority::High,
        });

        info!(
            "[NotificationDispatcher] Consolidated alert for {} far contacts of {}",
            far_contacts.len(),
            owner.id
        );

        Ok(Some(DispatchOutcome {
            owner_message: message,
            counterpart_message: None,
            push_id,
        }))
    }

    fn push_after_log(&self, request: PushRequest) -> Option<String> {
        match self.push.schedule(request) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("[NotificationDispatcher] Push failed, log entry kept: {}", e);
                None
            }
        }
    }

    /// Mark one message as read.
    pub fn mark_read(&self, account_id: &str, message_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::MarkRead {
            account_id: account_id.to_string(),
            message_id: Some(message_id.to_string()),
        });
        self.store.commit(batch)
    }

    /// Mark every message in the account's log as read.
    pub fn mark_all_read(&self, account_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::MarkRead {
            account_id: account_id.to_string(),
            message_id: None,
        });
        self.store.commit(batch)
    }

    /// Unread messages, newest first.
    pub fn unread(&self, account_id: &str) -> Result<Vec<NotificationMessage>> {
        let record = self
            .store
            .get(account_id)?
            .ok_or_else(|| ProximityError::not_found(format!("account {}", account_id)))?;

        Ok(record
            .notifications
            .into_iter()
            .rev()
            .filter(|m| !m.is_read)
            .collect())
    }
}

/// Kind, title, owner body, counterpart body and push priority for an event.
fn render(owner: &ContactRef, event: &AlertEvent) -> (NotificationKind, String, String, String, PushPriority) {
    match event {
        AlertEvent::EnteredAlert {
            contact,
            distance_km,
            already_far,
            ..
        } => {
            let (title, owner_body) = if *already_far {
                (
                    "Family Member Already Far Away",
                    format!("{} is already {:.2} km away", contact.display_name, distance_km),
                )
            } else {
                (
                    "Family Member Far Away",
                    format!("{} is {:.2} km away", contact.display_name, distance_km),
                )
            };
            (
                NotificationKind::ProximityAlert,
                title.to_string(),
                owner_body,
                format!("You are {:.2} km away from {}", distance_km, owner.display_name),
                PushPriority::High,
            )
        }
        AlertEvent::ExitedAlert { contact, .. } => (
            NotificationKind::BackInRange,
            "Family Member Nearby".to_string(),
            format!("{} is back within range", contact.display_name),
            format!("You are back within range of {}", owner.display_name),
            PushPriority::Default,
        ),
        AlertEvent::TrackingStarted { contact, .. } => (
            NotificationKind::TrackingStarted,
            "Route Tracking".to_string(),
            format!("{} is tracking to {}", owner.display_name, contact.display_name),
            format!("{} is tracking to you", owner.display_name),
            PushPriority::Default,
        ),
    }
}
