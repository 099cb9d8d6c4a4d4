//! # Relationship Graph
//!
//! Linked-contact edges between accounts. An edge is stored on both sides
//! (owner → contact email and contact → owner email) and both directions are
//! written in a single atomic batch, so a failed write never leaves a
//! one-directional edge behind.
//!
//! Documents written by older clients may still hold one-directional edges;
//! [`RelationshipGraph::check_symmetry`] reports them and
//! [`RelationshipGraph::reconcile`] repairs them.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{ProximityError, Result};
use crate::presence::{TrackedEntity, FALLBACK_DISPLAY_NAME};
use crate::store::{normalize_email, AccountRecord, DocumentStore, WriteBatch, WriteOp};
use crate::{ContactRef, ProximityConfig};

/// Label stored on the contact's side of an edge, given the owner's label.
///
/// ```rust
/// use proximity_guard::graph::reverse_relationship;
///
/// assert_eq!(reverse_relationship("Father"), "Son/Daughter");
/// assert_eq!(reverse_relationship("Wife"), "Husband");
/// assert_eq!(reverse_relationship("Mentor"), "Family Member");
/// ```
pub fn reverse_relationship(relationship: &str) -> &'static str {
    match relationship.trim() {
        "Father" | "Mother" => "Son/Daughter",
        "Son" | "Daughter" => "Father/Mother",
        "Brother" | "Sister" => "Brother/Sister",
        "Husband" => "Wife",
        "Wife" => "Husband",
        "Uncle" | "Aunt" => "Nephew/Niece",
        "Nephew" | "Niece" => "Uncle/Aunt",
        "Grandfather" | "Grandmother" => "Grandson/Granddaughter",
        "Grandson" | "Granddaughter" => "Grandfather/Grandmother",
        "Cousin" => "Cousin",
        "Friend" => "Friend",
        "Colleague" => "Colleague",
        "Neighbor" => "Neighbor",
        _ => FALLBACK_DISPLAY_NAME,
    }
}

/// Manages bidirectional linked-contact edges.
pub struct RelationshipGraph {
    store: Arc<dyn DocumentStore>,
    live_window_ms: i64,
}

impl RelationshipGraph {
    pub fn new(store: Arc<dyn DocumentStore>, config: &ProximityConfig) -> Self {
        Self {
            store,
            live_window_ms: config.live_window_ms(),
        }
    }

    fn owner(&self, owner_id: &str) -> Result<AccountRecord> {
        self.store
            .get(owner_id)?
            .ok_or_else(|| ProximityError::not_found(format!("account {}", owner_id)))
    }

    fn resolve_contact(&self, contact: &ContactRef) -> Result<AccountRecord> {
        let found = if contact.id.is_empty() {
            self.store.find_by_email(&contact.email)?
        } else {
            self.store.get(&contact.id)?
        };
        found.ok_or_else(|| ProximityError::not_found(format!("contact {}", contact.email)))
    }

    /// Link `contact` to the owner, and the owner back to `contact`.
    ///
    /// The reverse direction is only written when the contact does not
    /// already link to the owner; its label is [`reverse_relationship`].
    pub fn add_edge(&self, owner_id: &str, contact: &ContactRef, relationship: &str) -> Result<()> {
        let owner = self.owner(owner_id)?;
        let contact_email = normalize_email(&contact.email);

        if contact.id == owner.id || contact_email == owner.email {
            return Err(ProximityError::InvalidInput(
                "an account cannot link to itself".to_string(),
            ));
        }
        if owner.is_linked(&contact_email) {
            return Err(ProximityError::AlreadyLinked { email: contact_email });
        }

        let contact_record = self.resolve_contact(contact)?;
        // The resolved record is authoritative for the email stored on the edge
        let contact_email = contact_record.email.clone();

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::LinkContact {
            account_id: owner.id.clone(),
            email: contact_email.clone(),
            relationship: Some(relationship.to_string()),
        });
        if !contact_record.is_linked(&owner.email) {
            batch.push(WriteOp::LinkContact {
                account_id: contact_record.id.clone(),
                email: owner.email.clone(),
                relationship: Some(reverse_relationship(relationship).to_string()),
            });
        }

        self.store.commit(batch)?;
        info!(
            "[RelationshipGraph] Linked {} <-> {} ({})",
            owner.email, contact_email, relationship
        );
        Ok(())
    }

    /// Remove the edge in both directions. Returns the contact's account id.
    ///
    /// A side that is already unlinked is left as is.
    pub fn remove_edge(&self, owner_id: &str, contact_email: &str) -> Result<String> {
        let owner = self.owner(owner_id)?;
        let contact = self
            .store
            .find_by_email(contact_email)?
            .ok_or_else(|| ProximityError::not_found(format!("contact {}", contact_email)))?;

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::UnlinkContact {
                account_id: owner.id.clone(),
                email: contact.email.clone(),
            })
            .push(WriteOp::UnlinkContact {
                account_id: contact.id.clone(),
                email: owner.email.clone(),
            });

        self.store.commit(batch)?;
        info!("[RelationshipGraph] Unlinked {} <-> {}", owner.email, contact.email);
        Ok(contact.id)
    }

    /// Resolve the owner's linked contacts. Emails with no account are dropped.
    pub fn list_edges(&self, owner_id: &str, now_ms: i64) -> Result<Vec<TrackedEntity>> {
        let owner = self.owner(owner_id)?;
        self.resolve_edges(&owner, now_ms)
    }

    /// Resolve the linked contacts of an already-fetched owner record.
    pub fn resolve_edges(&self, owner: &AccountRecord, now_ms: i64) -> Result<Vec<TrackedEntity>> {
        let mut entities = Vec::with_capacity(owner.linked_contacts.len());

        for email in &owner.linked_contacts {
            match self.store.find_by_email(email)? {
                Some(record) => entities.push(TrackedEntity::from_record(
                    &record,
                    owner.relationship_for(email).map(str::to_string),
                    now_ms,
                    self.live_window_ms,
                )),
                None => debug!("[RelationshipGraph] Dropping unresolved contact {}", email),
            }
        }

        Ok(entities)
    }

    /// Contacts the owner links to that do not link back.
    fn one_directional(&self, owner: &AccountRecord) -> Result<Vec<AccountRecord>> {
        let mut missing = Vec::new();
        for email in &owner.linked_contacts {
            if let Some(contact) = self.store.find_by_email(email)? {
                if !contact.is_linked(&owner.email) {
                    missing.push(contact);
                }
            }
        }
        Ok(missing)
    }

    /// Fail with [`ProximityError::InconsistentState`] listing every contact
    /// the owner links to without a reverse edge.
    pub fn check_symmetry(&self, owner_id: &str) -> Result<()> {
        let owner = self.owner(owner_id)?;
        let missing = self.one_directional(&owner)?;
        if missing.is_empty() {
            return Ok(());
        }

        let emails: Vec<&str> = missing.iter().map(|c| c.email.as_str()).collect();
        warn!(
            "[RelationshipGraph] {} has one-directional edges: {}",
            owner.email,
            emails.join(", ")
        );
        Err(ProximityError::InconsistentState(format!(
            "{} links to {} without a reverse edge",
            owner.email,
            emails.join(", ")
        )))
    }

    /// Write the missing reverse edges for the owner. Returns how many were repaired.
    pub fn reconcile(&self, owner_id: &str) -> Result<usize> {
        let owner = self.owner(owner_id)?;
        let missing = self.one_directional(&owner)?;
        if missing.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for contact in &missing {
            let label = owner
                .relationship_for(&contact.email)
                .map(reverse_relationship)
                .unwrap_or(FALLBACK_DISPLAY_NAME);
            batch.push(WriteOp::LinkContact {
                account_id: contact.id.clone(),
                email: owner.email.clone(),
                relationship: Some(label.to_string()),
            });
        }

        self.store.commit(batch)?;
        info!(
            "[RelationshipGraph] Repaired {} reverse edges for {}",
            missing.len(),
            owner.email
        );
        Ok(missing.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{Position, Presence};

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (Arc<MemoryStore>, RelationshipGraph) {
        let store = Arc::new(MemoryStore::new());
        store.insert(AccountRecord::new("a", "Asha", "asha@example.com")).unwrap();
        store.insert(AccountRecord::new("b", "Ravi", "ravi@example.com")).unwrap();
        store.insert(AccountRecord::new("c", "Meera", "meera@example.com")).unwrap();
        let graph = RelationshipGraph::new(store.clone(), &ProximityConfig::default());
        (store, graph)
    }

    fn ravi() -> ContactRef {
        ContactRef::new("b", "Ravi", "ravi@example.com")
    }

    #[test]
    fn test_add_edge_writes_both_directions() {
        let (store, graph) = setup();
        graph.add_edge("a", &ravi(), "Brother").unwrap();

        let a = store.get("a").unwrap().unwrap();
        let b = store.get("b").unwrap().unwrap();
        assert!(a.is_linked("ravi@example.com"));
        assert!(b.is_linked("asha@example.com"));
        assert_eq!(a.relationship_for("ravi@example.com"), Some("Brother"));
        assert_eq!(b.relationship_for("asha@example.com"), Some("Brother/Sister"));
        assert!(graph.check_symmetry("a").is_ok());
        assert!(graph.check_symmetry("b").is_ok());
    }

    #[test]
    fn test_add_edge_already_linked() {
        let (_, graph) = setup();
        graph.add_edge("a", &ravi(), "Brother").unwrap();
        let err = graph.add_edge("a", &ravi(), "Brother").unwrap_err();
        assert!(matches!(err, ProximityError::AlreadyLinked { .. }));
    }

    #[test]
    fn test_add_edge_keeps_existing_reverse_label() {
        let (store, graph) = setup();
        graph.add_edge("b", &ContactRef::new("a", "Asha", "asha@example.com"), "Sister").unwrap();
        graph.remove_edge("b", "asha@example.com").unwrap();

        // Reverse edge already present: only the owner side is written
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::LinkContact {
            account_id: "b".into(),
            email: "asha@example.com".into(),
            relationship: Some("Friend".into()),
        });
        store.commit(batch).unwrap();

        graph.add_edge("a", &ravi(), "Colleague").unwrap();
        let b = store.get("b").unwrap().unwrap();
        assert_eq!(b.relationship_for("asha@example.com"), Some("Friend"));
    }

    #[test]
    fn test_add_edge_errors() {
        let (_, graph) = setup();
        assert!(matches!(
            graph.add_edge("ghost", &ravi(), "Friend"),
            Err(ProximityError::NotFound(_))
        ));
        assert!(matches!(
            graph.add_edge("a", &ContactRef::new("z", "Zoe", "zoe@example.com"), "Friend"),
            Err(ProximityError::NotFound(_))
        ));
        assert!(matches!(
            graph.add_edge("a", &ContactRef::new("a", "Asha", "asha@example.com"), "Friend"),
            Err(ProximityError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_add_edge_resolves_by_email_when_id_unknown() {
        let (store, graph) = setup();
        graph
            .add_edge("a", &ContactRef::new("", "Meera", "Meera@Example.com"), "Cousin")
            .unwrap();
        assert!(store.get("c").unwrap().unwrap().is_linked("asha@example.com"));
    }

    #[test]
    fn test_remove_edge_is_exact_inverse() {
        let (store, graph) = setup();
        graph.add_edge("a", &ravi(), "Brother").unwrap();
        let contact_id = graph.remove_edge("a", "ravi@example.com").unwrap();
        assert_eq!(contact_id, "b");

        let a = store.get("a").unwrap().unwrap();
        let b = store.get("b").unwrap().unwrap();
        assert!(!a.is_linked("ravi@example.com"));
        assert!(!b.is_linked("asha@example.com"));
        assert!(a.relationship_for("ravi@example.com").is_none());
    }

    #[test]
    fn test_remove_edge_missing_contact() {
        let (_, graph) = setup();
        assert!(matches!(
            graph.remove_edge("a", "zoe@example.com"),
            Err(ProximityError::NotFound(_))
        ));
        // Absent on both sides is a no-op
        assert!(graph.remove_edge("a", "meera@example.com").is_ok());
    }

    #[test]
    fn test_failed_commit_leaves_no_half_edge() {
        let (store, graph) = setup();
        store.set_offline(true);
        assert!(graph.add_edge("a", &ravi(), "Brother").is_err());
        store.set_offline(false);
        assert!(!store.get("a").unwrap().unwrap().is_linked("ravi@example.com"));
        assert!(!store.get("b").unwrap().unwrap().is_linked("asha@example.com"));
    }

    #[test]
    fn test_list_edges_drops_unresolved() {
        let (store, graph) = setup();
        graph.add_edge("a", &ravi(), "Brother").unwrap();

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::LinkContact {
            account_id: "a".into(),
            email: "deleted@example.com".into(),
            relationship: None,
        });
        batch.push(WriteOp::SetLocation {
            account_id: "b".into(),
            position: Position::new(19.0760, 72.8777, NOW - 10_000),
        });
        store.commit(batch).unwrap();

        let edges = graph.list_edges("a", NOW).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].id, "b");
        assert_eq!(edges[0].display_name, "Ravi");
        assert_eq!(edges[0].relationship.as_deref(), Some("Brother"));
        assert_eq!(edges[0].presence, Presence::Live);
    }

    #[test]
    fn test_symmetry_check_and_reconcile() {
        let (store, graph) = setup();
        // Legacy one-directional edges
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::LinkContact {
                account_id: "a".into(),
                email: "ravi@example.com".into(),
                relationship: Some("Father".into()),
            })
            .push(WriteOp::LinkContact {
                account_id: "a".into(),
                email: "meera@example.com".into(),
                relationship: None,
            });
        store.commit(batch).unwrap();

        let err = graph.check_symmetry("a").unwrap_err();
        assert!(matches!(err, ProximityError::InconsistentState(_)));
        assert!(err.to_string().contains("ravi@example.com"));

        assert_eq!(graph.reconcile("a").unwrap(), 2);
        assert!(graph.check_symmetry("a").is_ok());
        let b = store.get("b").unwrap().unwrap();
        assert_eq!(b.relationship_for("asha@example.com"), Some("Son/Daughter"));
        let c = store.get("c").unwrap().unwrap();
        assert_eq!(c.relationship_for("asha@example.com"), Some(FALLBACK_DISPLAY_NAME));

        assert_eq!(graph.reconcile("a").unwrap(), 0);
    }

    #[test]
    fn test_reverse_relationship_table() {
        assert_eq!(reverse_relationship("Mother"), "Son/Daughter");
        assert_eq!(reverse_relationship("Daughter"), "Father/Mother");
        assert_eq!(reverse_relationship("Sister"), "Brother/Sister");
        assert_eq!(reverse_relationship("Husband"), "Wife");
        assert_eq!(reverse_relationship("Aunt"), "Nephew/Niece");
        assert_eq!(reverse_relationship("Niece"), "Uncle/Aunt");
        assert_eq!(reverse_relationship("Grandmother"), "Grandson/Granddaughter");
        assert_eq!(reverse_relationship("Grandson"), "Grandfather/Grandmother");
        assert_eq!(reverse_relationship("Neighbor"), "Neighbor");
        assert_eq!(reverse_relationship(""), "Family Member");
    }
}
