//! # Document Store
//!
//! Per-account records (location, linked contacts, notification log) and the
//! store seam the rest of the crate writes through.
//!
//! Raw documents are validated into [`AccountRecord`] at the boundary;
//! malformed shapes are rejected as [`ProximityError::Decode`] instead of
//! leaking loosely-typed data inward. Writes are grouped in a [`WriteBatch`]
//! that commits atomically: either every operation applies or none does.
//! Subscribers receive the full record after every committed write, never a
//! diff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ProximityError, Result};
use crate::notify::NotificationMessage;
use crate::{GeoPoint, Position};

/// Default cap on an account's notification log.
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;

/// Normalize an email for comparisons and set membership.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ============================================================================
// Account Record
// ============================================================================

/// A validated account document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccountRecord {
    pub id: String,
    pub name: Option<String>,
    /// Normalized email
    pub email: String,
    pub role: Option<String>,
    /// Current position
    pub location: Option<Position>,
    /// Last position ever reported
    pub last_location: Option<Position>,
    /// Emails of linked contacts, in link order, without duplicates
    pub linked_contacts: Vec<String>,
    /// Relationship label per linked contact email
    pub relationships: HashMap<String, String>,
    /// Notification log, oldest first
    pub notifications: Vec<NotificationMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountDocument {
    #[serde(default)]
    name: Option<String>,
    email: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    location: Option<LocationDocument>,
    #[serde(default)]
    last_location: Option<LocationDocument>,
    #[serde(default, alias = "familyMembers")]
    linked_contacts: Vec<String>,
    #[serde(default)]
    relationships: HashMap<String, String>,
    // Decoded entry by entry
    #[serde(default)]
    notifications: Vec<serde_json::Value>,
}

/// Decode a notification log, dropping entries that do not match the
/// message shape (older clients wrote `familyMemberId/message/timestamp`).
fn decode_notifications(id: &str, entries: Vec<serde_json::Value>) -> Vec<NotificationMessage> {
    let total = entries.len();
    let messages: Vec<NotificationMessage> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect();
    if messages.len() < total {
        warn!(
            "[AccountRecord] Account {}: dropped {} undecodable notification entries",
            id,
            total - messages.len()
        );
    }
    messages
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationDocument {
    coords: CoordsDocument,
    #[serde(alias = "capturedAt")]
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CoordsDocument {
    latitude: f64,
    longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
}

impl LocationDocument {
    fn into_position(self, field: &str) -> Result<Position> {
        let point = GeoPoint::new(self.coords.latitude, self.coords.longitude);
        if !point.is_valid() {
            return Err(ProximityError::decode(format!(
                "{} has out-of-range coordinates ({}, {})",
                field, point.latitude, point.longitude
            )));
        }
        Ok(Position {
            point,
            accuracy: self.coords.accuracy,
            captured_at: self.timestamp,
        })
    }

    fn from_position(position: &Position) -> Self {
        Self {
            coords: CoordsDocument {
                latitude: position.point.latitude,
                longitude: position.point.longitude,
                accuracy: position.accuracy,
            },
            timestamp: position.captured_at,
        }
    }
}

impl AccountRecord {
    /// Create an empty record with the given identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: &str) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            email: normalize_email(email),
            ..Self::default()
        }
    }

    /// Validate a raw JSON document into a record.
    ///
    /// # Example
    ///
    /// ```rust
    /// use proximity_guard::AccountRecord;
    ///
    /// let doc = serde_json::json!({
    ///     "name": "Asha",
    ///     "email": "Asha@Example.com",
    ///     "familyMembers": ["ravi@example.com"],
    ///     "location": {"coords": {"latitude": 19.076, "longitude": 72.8777}, "timestamp": 0}
    /// });
    /// let record = AccountRecord::from_document("user-1", &doc).unwrap();
    /// assert_eq!(record.email, "asha@example.com");
    /// assert_eq!(record.linked_contacts, vec!["ravi@example.com"]);
    /// ```
    pub fn from_document(id: &str, document: &serde_json::Value) -> Result<Self> {
        let doc: AccountDocument = serde_json::from_value(document.clone())
            .map_err(|e| ProximityError::decode(format!("account {}: {}", id, e)))?;

        let email = normalize_email(&doc.email);
        if email.is_empty() {
            return Err(ProximityError::decode(format!("account {} has an empty email", id)));
        }

        let location = doc
            .location
            .map(|l| l.into_position("location"))
            .transpose()?;
        let last_location = doc
            .last_location
            .map(|l| l.into_position("lastLocation"))
            .transpose()?;

        let mut linked_contacts: Vec<String> = Vec::with_capacity(doc.linked_contacts.len());
        for contact in doc.linked_contacts.iter().map(|e| normalize_email(e)) {
            if !contact.is_empty() && !linked_contacts.contains(&contact) {
                linked_contacts.push(contact);
            }
        }

        let relationships = doc
            .relationships
            .into_iter()
            .map(|(email, label)| (normalize_email(&email), label))
            .collect();

        Ok(Self {
            id: id.to_string(),
            name: doc.name,
            email,
            role: doc.role,
            location,
            last_location,
            linked_contacts,
            relationships,
            notifications: decode_notifications(id, doc.notifications),
        })
    }

    /// Serialize the record back to its document shape.
    pub fn to_document(&self) -> Result<serde_json::Value> {
        let doc = AccountDocument {
            name: self.name.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
            location: self.location.as_ref().map(LocationDocument::from_position),
            last_location: self.last_location.as_ref().map(LocationDocument::from_position),
            linked_contacts: self.linked_contacts.clone(),
            relationships: self.relationships.clone(),
            notifications: self
                .notifications
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Whether this account links to `email`.
    pub fn is_linked(&self, email: &str) -> bool {
        let email = normalize_email(email);
        self.linked_contacts.iter().any(|c| *c == email)
    }

    /// Relationship label stored for a linked contact.
    pub fn relationship_for(&self, email: &str) -> Option<&str> {
        self.relationships
            .get(&normalize_email(email))
            .map(String::as_str)
    }

    fn apply(&mut self, op: &WriteOp, max_log_entries: usize) {
        match op {
            WriteOp::LinkContact { email, relationship, .. } => {
                let email = normalize_email(email);
                if let Some(label) = relationship {
                    self.relationships.insert(email.clone(), label.clone());
                }
                if !self.linked_contacts.contains(&email) {
                    self.linked_contacts.push(email);
                }
            }
            WriteOp::UnlinkContact { email, .. } => {
                let email = normalize_email(email);
                self.linked_contacts.retain(|c| *c != email);
                self.relationships.remove(&email);
            }
            WriteOp::AppendNotification { message, .. } => {
                self.notifications.push(message.clone());
                if self.notifications.len() > max_log_entries {
                    let excess = self.notifications.len() - max_log_entries;
                    self.notifications.drain(..excess);
                }
            }
            WriteOp::MarkRead { message_id, .. } => {
                for message in self.notifications.iter_mut() {
                    if message_id.as_deref().map_or(true, |id| message.id == id) {
                        message.is_read = true;
                    }
                }
            }
            WriteOp::SetLocation { position, .. } => {
                self.location = Some(*position);
                self.last_location = Some(*position);
            }
        }
    }
}

// ============================================================================
// Write Batches
// ============================================================================

/// A single document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Add `email` to the account's linked contacts (no-op if present) and
    /// record its relationship label when given.
    LinkContact {
        account_id: String,
        email: String,
        relationship: Option<String>,
    },
    /// Remove `email` from the account's linked contacts (no-op if absent).
    UnlinkContact { account_id: String, email: String },
    /// Append a message to the account's notification log.
    AppendNotification {
        account_id: String,
        message: NotificationMessage,
    },
    /// Mark one message (or all, when `message_id` is `None`) as read.
    MarkRead {
        account_id: String,
        message_id: Option<String>,
    },
    /// Replace the current and last-known position.
    SetLocation { account_id: String, position: Position },
}

impl WriteOp {
    /// Account the operation writes to.
    pub fn account_id(&self) -> &str {
        match self {
            WriteOp::LinkContact { account_id, .. }
            | WriteOp::UnlinkContact { account_id, .. }
            | WriteOp::AppendNotification { account_id, .. }
            | WriteOp::MarkRead { account_id, .. }
            | WriteOp::SetLocation { account_id, .. } => account_id,
        }
    }
}

/// Operations committed together: all apply, or none do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct accounts touched by the batch, in first-touch order.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for op in &self.ops {
            if !ids.iter().any(|id| id == op.account_id()) {
                ids.push(op.account_id().to_string());
            }
        }
        ids
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Persistent per-account documents with realtime snapshots.
pub trait DocumentStore: Send + Sync {
    /// Fetch an account by id.
    fn get(&self, account_id: &str) -> Result<Option<AccountRecord>>;

    /// Fetch an account by email.
    fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>>;

    /// Apply every operation in the batch atomically.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Receive the full record now and after every committed write to it.
    fn subscribe(&self, account_id: &str) -> Result<Receiver<AccountRecord>>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct StoreState {
    accounts: HashMap<String, AccountRecord>,
    subscribers: HashMap<String, Vec<Sender<AccountRecord>>>,
}

/// In-process [`DocumentStore`], used by the demos, tests and offline shells.
///
/// `set_offline(true)` makes every call fail with a network error, which is
/// how the retry paths are exercised.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    max_log_entries: usize,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_MAX_LOG_ENTRIES)
    }

    /// Create a store whose notification logs keep at most `max_log_entries`.
    pub fn with_log_capacity(max_log_entries: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            max_log_entries: max_log_entries.max(1),
            offline: AtomicBool::new(false),
        }
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: AccountRecord) -> Result<()> {
        let mut state = self.lock()?;
        let id = record.id.clone();
        state.accounts.insert(id.clone(), record);
        Self::notify_subscribers(&mut state, &id);
        Ok(())
    }

    /// Validate and insert a raw JSON document.
    pub fn insert_document(&self, id: &str, document: &serde_json::Value) -> Result<()> {
        self.insert(AccountRecord::from_document(id, document)?)
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ProximityError::network("document store unreachable"))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| ProximityError::internal("document store lock poisoned"))
    }

    fn notify_subscribers(state: &mut StoreState, account_id: &str) {
        let Some(record) = state.accounts.get(account_id).cloned() else {
            return;
        };
        if let Some(senders) = state.subscribers.get_mut(account_id) {
            senders.retain(|tx| tx.send(record.clone()).is_ok());
        }
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, account_id: &str) -> Result<Option<AccountRecord>> {
        self.check_online()?;
        Ok(self.lock()?.accounts.get(account_id).cloned())
    }

    fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>> {
        self.check_online()?;
        let email = normalize_email(email);
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|r| r.email == email)
            .cloned())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.check_online()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.lock()?;
        let touched = batch.account_ids();

        // Stage on copies so a missing account rejects the whole batch
        let mut staged: HashMap<String, AccountRecord> = HashMap::with_capacity(touched.len());
        for id in &touched {
            match state.accounts.get(id) {
                Some(record) => {
                    staged.insert(id.clone(), record.clone());
                }
                None => {
                    warn!("[MemoryStore] Rejecting batch: account {} does not exist", id);
                    return Err(ProximityError::not_found(format!("account {}", id)));
                }
            }
        }

        for op in batch.ops() {
            if let Some(record) = staged.get_mut(op.account_id()) {
                record.apply(op, self.max_log_entries);
            }
        }

        state.accounts.extend(staged);
        for id in &touched {
            Self::notify_subscribers(&mut state, id);
        }

        debug!(
            "[MemoryStore] Committed {} ops across {} accounts",
            batch.len(),
            touched.len()
        );
        Ok(())
    }

    fn subscribe(&self, account_id: &str) -> Result<Receiver<AccountRecord>> {
        self.check_online()?;
        let mut state = self.lock()?;
        let record = state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| ProximityError::not_found(format!("account {}", account_id)))?;

        let (tx, rx) = channel();
        // The first snapshot is the current document
        let _ = tx.send(record);
        state
            .subscribers
            .entry(account_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Channel, NotificationKind};
    use serde_json::json;

    fn message(id: &str, recipient: &str) -> NotificationMessage {
        NotificationMessage {
            id: id.to_string(),
            recipient_id: recipient.to_string(),
            channel: Channel::Log,
            kind: NotificationKind::ProximityAlert,
            title: "t".to_string(),
            body: "b".to_string(),
            payload: HashMap::new(),
            created_at: 0,
            is_read: false,
        }
    }

    fn store_with_pair() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert(AccountRecord::new("a", "Asha", "asha@example.com")).unwrap();
        store.insert(AccountRecord::new("b", "Ravi", "ravi@example.com")).unwrap();
        store
    }

    #[test]
    fn test_from_document_full_shape() {
        let doc = json!({
            "name": "Asha",
            "email": " Asha@Example.com ",
            "role": "user",
            "location": {"coords": {"latitude": 19.076, "longitude": 72.8777, "accuracy": 5.0}, "timestamp": 1000},
            "lastLocation": {"coords": {"latitude": 19.0, "longitude": 72.8}, "timestamp": 500},
            "linkedContacts": ["ravi@example.com", "RAVI@example.com", "meera@example.com"],
            "relationships": {"Ravi@example.com": "Brother"}
        });
        let record = AccountRecord::from_document("a", &doc).unwrap();
        assert_eq!(record.email, "asha@example.com");
        assert_eq!(record.linked_contacts, vec!["ravi@example.com", "meera@example.com"]);
        assert_eq!(record.relationship_for("ravi@example.com"), Some("Brother"));
        let location = record.location.unwrap();
        assert_eq!(location.accuracy, Some(5.0));
        assert_eq!(location.captured_at, 1000);
        assert_eq!(record.last_location.unwrap().captured_at, 500);
    }

    #[test]
    fn test_from_document_accepts_family_members_alias_and_nulls() {
        let doc = json!({
            "email": "ravi@example.com",
            "familyMembers": ["asha@example.com"],
            "location": null,
            "lastLocation": null
        });
        let record = AccountRecord::from_document("b", &doc).unwrap();
        assert!(record.is_linked("asha@example.com"));
        assert!(record.location.is_none());
        assert!(record.name.is_none());
    }

    #[test]
    fn test_from_document_rejects_malformed() {
        let missing_email = json!({"name": "x"});
        assert!(matches!(
            AccountRecord::from_document("x", &missing_email),
            Err(ProximityError::Decode(_))
        ));

        let bad_coords = json!({
            "email": "x@example.com",
            "location": {"coords": {"latitude": 120.0, "longitude": 0.0}, "timestamp": 0}
        });
        assert!(matches!(
            AccountRecord::from_document("x", &bad_coords),
            Err(ProximityError::Decode(_))
        ));

        let wrong_type = json!({"email": "x@example.com", "linkedContacts": "nope"});
        assert!(matches!(
            AccountRecord::from_document("x", &wrong_type),
            Err(ProximityError::Decode(_))
        ));
    }

    #[test]
    fn test_from_document_drops_legacy_notification_entries() {
        let doc = json!({
            "email": "asha@example.com",
            "familyMembers": ["ravi@example.com"],
            "location": {"coords": {"latitude": 19.076, "longitude": 72.8777}, "timestamp": 5},
            "notifications": [
                {"familyMemberId": "b", "message": "Ravi is 0.8 km away", "timestamp": 1},
                serde_json::to_value(message("m1", "a")).unwrap()
            ]
        });
        let record = AccountRecord::from_document("a", &doc).unwrap();
        assert_eq!(record.linked_contacts, vec!["ravi@example.com"]);
        assert!(record.location.is_some());
        assert_eq!(record.notifications.len(), 1);
        assert_eq!(record.notifications[0].id, "m1");
    }

    #[test]
    fn test_document_round_trip() {
        let mut record = AccountRecord::new("a", "Asha", "asha@example.com");
        record.location = Some(Position::new(19.0, 72.0, 42));
        record.linked_contacts.push("ravi@example.com".to_string());
        let doc = record.to_document().unwrap();
        assert_eq!(AccountRecord::from_document("a", &doc).unwrap(), record);
    }

    #[test]
    fn test_commit_applies_all_ops() {
        let store = store_with_pair();
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::LinkContact {
                account_id: "a".into(),
                email: "ravi@example.com".into(),
                relationship: Some("Brother".into()),
            })
            .push(WriteOp::LinkContact {
                account_id: "b".into(),
                email: "asha@example.com".into(),
                relationship: Some("Sister".into()),
            });
        store.commit(batch).unwrap();

        assert!(store.get("a").unwrap().unwrap().is_linked("ravi@example.com"));
        assert!(store.get("b").unwrap().unwrap().is_linked("asha@example.com"));
    }

    #[test]
    fn test_rejected_batch_leaves_records_unchanged() {
        let store = store_with_pair();
        let before = store.get("a").unwrap();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::LinkContact {
                account_id: "a".into(),
                email: "ghost@example.com".into(),
                relationship: None,
            })
            .push(WriteOp::LinkContact {
                account_id: "ghost".into(),
                email: "asha@example.com".into(),
                relationship: None,
            });

        assert!(matches!(store.commit(batch), Err(ProximityError::NotFound(_))));
        assert_eq!(store.get("a").unwrap(), before);
    }

    #[test]
    fn test_offline_store_fails_with_network_error() {
        let store = store_with_pair();
        store.set_offline(true);
        let err = store.get("a").unwrap_err();
        assert!(err.is_recoverable());
        store.set_offline(false);
        assert!(store.get("a").unwrap().is_some());
    }

    #[test]
    fn test_notification_log_keeps_newest() {
        let store = MemoryStore::with_log_capacity(3);
        store.insert(AccountRecord::new("a", "Asha", "asha@example.com")).unwrap();
        for i in 0..5 {
            let mut batch = WriteBatch::new();
            batch.push(WriteOp::AppendNotification {
                account_id: "a".into(),
                message: message(&format!("m{}", i), "a"),
            });
            store.commit(batch).unwrap();
        }
        let ids: Vec<String> = store
            .get("a")
            .unwrap()
            .unwrap()
            .notifications
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_mark_read_single_and_all() {
        let store = store_with_pair();
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::AppendNotification { account_id: "a".into(), message: message("m1", "a") })
            .push(WriteOp::AppendNotification { account_id: "a".into(), message: message("m2", "a") })
            .push(WriteOp::MarkRead { account_id: "a".into(), message_id: Some("m1".into()) });
        store.commit(batch).unwrap();

        let record = store.get("a").unwrap().unwrap();
        assert!(record.notifications[0].is_read);
        assert!(!record.notifications[1].is_read);

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::MarkRead { account_id: "a".into(), message_id: None });
        store.commit(batch).unwrap();
        assert!(store.get("a").unwrap().unwrap().notifications.iter().all(|m| m.is_read));
    }

    #[test]
    fn test_subscribe_delivers_full_snapshots() {
        let store = store_with_pair();
        let rx = store.subscribe("a").unwrap();

        let initial = rx.try_recv().unwrap();
        assert!(initial.location.is_none());

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::SetLocation {
            account_id: "a".into(),
            position: Position::new(19.0, 72.0, 10),
        });
        store.commit(batch).unwrap();

        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.location, Some(Position::new(19.0, 72.0, 10)));
        assert_eq!(snapshot.last_location, snapshot.location);
        assert_eq!(snapshot.name.as_deref(), Some("Asha"));
    }

    #[test]
    fn test_subscribe_unknown_account() {
        let store = MemoryStore::new();
        assert!(matches!(store.subscribe("nobody"), Err(ProximityError::NotFound(_))));
    }

    #[test]
    fn test_find_by_email_is_case_insensitive() {
        let store = store_with_pair();
        let found = store.find_by_email("RAVI@example.com").unwrap().unwrap();
        assert_eq!(found.id, "b");
        assert!(store.find_by_email("nobody@example.com").unwrap().is_none());
    }
}
