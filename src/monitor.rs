//! # Proximity Monitor
//!
//! The event-driven pipeline for one signed-in owner. Position fixes and
//! document snapshots are queued as [`MonitorEvent`]s and handled one at a
//! time by a single consumer, so alert records need no locking.
//!
//! Each event runs presence classification, then the alert tracker, then
//! notification dispatch for the contacts it affects. Snapshots are full
//! documents; they are diffed against the monitor's own copy, and a contact
//! snapshot whose position did not change is not re-evaluated. Alert events
//! whose log write failed are queued and retried before the next event is
//! handled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::alert::{AlertEvent, AlertState, AlertTracker, SessionContext};
use crate::error::{ProximityError, Result};
use crate::geo_utils::{self, haversine_km, NearbyEntry};
use crate::graph::RelationshipGraph;
use crate::location::{GeolocationProvider, PermissionStatus, WatchHandle, WatchOptions};
use crate::notify::{DispatchOutcome, NotificationDispatcher, PushChannel};
use crate::presence::{classify, display_name, Presence, TrackedEntity};
use crate::store::{AccountRecord, DocumentStore, WriteBatch, WriteOp};
use crate::{ContactRef, GeoPoint, Position, ProximityConfig};

/// Input to the monitor's event loop.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A fix from the owner's device
    OwnPosition(Position),
    /// Full document of the owner or of a linked contact
    Snapshot(AccountRecord),
    /// Periodic wake-up; retries pending dispatches
    Tick,
    /// Stop the event loop
    Shutdown,
}

/// A linked contact as shown in the contact list.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactStatus {
    pub entity: TrackedEntity,
    /// Distance from the owner, `None` when either position is unknown
    pub distance_km: Option<f64>,
    pub alert_state: AlertState,
}

/// Result of a manual analysis of every linked contact.
#[derive(Debug, Clone)]
pub struct FamilyAnalysis {
    pub far_away: Vec<ContactStatus>,
    pub nearby: Vec<ContactStatus>,
    pub offline: Vec<ContactStatus>,
    /// The consolidated notification, when anyone is far away
    pub notification: Option<DispatchOutcome>,
}

pub struct ProximityMonitor {
    owner: ContactRef,
    owner_record: AccountRecord,
    config: ProximityConfig,
    store: Arc<dyn DocumentStore>,
    graph: RelationshipGraph,
    dispatcher: NotificationDispatcher,
    tracker: AlertTracker,
    own_position: Option<Position>,
    /// Latest document of every linked contact, by account id
    contacts: HashMap<String, AccountRecord>,
    pending: VecDeque<AlertEvent>,
    bridge: Option<SnapshotBridge>,
}

/// Live store subscriptions feeding snapshots back into the event queue.
struct SnapshotBridge {
    events: Sender<MonitorEvent>,
    /// Per-account switch; a cleared flag ends that forwarding thread
    active: HashMap<String, Arc<AtomicBool>>,
}

impl ProximityMonitor {
    /// Load the owner and their linked contacts.
    pub fn new(
        owner_id: &str,
        config: ProximityConfig,
        store: Arc<dyn DocumentStore>,
        push: Arc<dyn PushChannel>,
        session: SessionContext,
    ) -> Result<Self> {
        config.validate()?;

        let owner_record = store
            .get(owner_id)?
            .ok_or_else(|| ProximityError::not_found(format!("account {}", owner_id)))?;
        let owner = ContactRef::new(
            owner_record.id.clone(),
            display_name(owner_record.name.as_deref(), &owner_record.email),
            owner_record.email.clone(),
        );

        let mut contacts = HashMap::new();
        for email in &owner_record.linked_contacts {
            match store.find_by_email(email)? {
                Some(record) => {
                    contacts.insert(record.id.clone(), record);
                }
                None => debug!("[ProximityMonitor] Linked contact {} has no account", email),
            }
        }

        info!(
            "[ProximityMonitor] Monitoring {} contacts for {} (session {})",
            contacts.len(),
            owner.email,
            session.session_id
        );

        Ok(Self {
            tracker: AlertTracker::new(owner_id, &config, session),
            graph: RelationshipGraph::new(store.clone(), &config),
            dispatcher: NotificationDispatcher::new(store.clone(), push),
            owner,
            owner_record,
            config,
            store,
            own_position: None,
            contacts,
            pending: VecDeque::new(),
            bridge: None,
        })
    }

    pub fn owner(&self) -> &ContactRef {
        &self.owner
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn session(&self) -> &SessionContext {
        self.tracker.session()
    }

    pub fn own_position(&self) -> Option<Position> {
        self.own_position
    }

    /// Alert events waiting for a successful log write.
    pub fn pending_dispatches(&self) -> usize {
        self.pending.len()
    }

    pub fn alert_state(&self, contact_id: &str) -> Option<AlertState> {
        self.tracker.record(contact_id).map(|r| r.state)
    }

    /// Map center: the owner's position, or the configured default location
    /// when it is unknown. Display only; never used for distances.
    pub fn display_center(&self) -> GeoPoint {
        self.own_position
            .map(|p| p.point)
            .unwrap_or_else(|| self.config.default_location())
    }

    /// Accounts whose snapshots the monitor needs: the owner and every contact.
    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids = vec![self.owner.id.clone()];
        ids.extend(self.contacts.keys().cloned());
        ids
    }

    // ========================================================================
    // Event Handling
    // ========================================================================

    /// Handle one event. Returns the notifications dispatched while handling it.
    pub fn handle(&mut self, event: MonitorEvent, now_ms: i64) -> Vec<DispatchOutcome> {
        let mut outcomes = self.flush_pending(now_ms);

        let events = match event {
            MonitorEvent::OwnPosition(position) => self.on_own_position(position, now_ms),
            MonitorEvent::Snapshot(record) if record.id == self.owner.id => {
                self.on_owner_snapshot(record, now_ms)
            }
            MonitorEvent::Snapshot(record) => self.on_contact_snapshot(record, now_ms),
            MonitorEvent::Tick | MonitorEvent::Shutdown => Vec::new(),
        };

        for event in events {
            if let Some(outcome) = self.dispatch_or_queue(event, now_ms) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Process events until `Shutdown` or until every sender is gone. With
    /// snapshots attached the monitor holds a sender itself, so only
    /// `Shutdown` ends the loop.
    pub fn run(self, events: Receiver<MonitorEvent>) -> Self {
        self.run_with_clock(events, crate::now_ms)
    }

    /// [`run`](Self::run) with an injected clock.
    pub fn run_with_clock<F: FnMut() -> i64>(mut self, events: Receiver<MonitorEvent>, mut clock: F) -> Self {
        while let Ok(event) = events.recv() {
            if matches!(event, MonitorEvent::Shutdown) {
                debug!("[ProximityMonitor] Shutting down");
                break;
            }
            self.handle(event, clock());
        }
        self
    }

    fn on_own_position(&mut self, position: Position, now_ms: i64) -> Vec<AlertEvent> {
        if !position.point.is_valid() {
            warn!("[ProximityMonitor] Ignoring invalid own position {:?}", position.point);
            return Vec::new();
        }
        self.own_position = Some(position);

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::SetLocation {
            account_id: self.owner.id.clone(),
            position,
        });
        // The next fix overwrites it, so a failed write is not retried
        if let Err(e) = self.store.commit(batch) {
            warn!("[ProximityMonitor] Failed to publish own location: {}", e);
        }

        self.evaluate_all(now_ms)
    }

    fn on_owner_snapshot(&mut self, record: AccountRecord, now_ms: i64) -> Vec<AlertEvent> {
        let previous = std::mem::replace(&mut self.owner_record, record);
        self.owner.display_name = display_name(self.owner_record.name.as_deref(), &self.owner_record.email);

        let removed: Vec<String> = previous
            .linked_contacts
            .iter()
            .filter(|email| !self.owner_record.is_linked(email))
            .cloned()
            .collect();
        let added: Vec<String> = self
            .owner_record
            .linked_contacts
            .iter()
            .filter(|email| !previous.is_linked(email))
            .cloned()
            .collect();

        for email in &removed {
            let ids: Vec<String> = self
                .contacts
                .values()
                .filter(|r| r.email == *email)
                .map(|r| r.id.clone())
                .collect();
            for id in ids {
                self.contacts.remove(&id);
                self.tracker.forget(&id);
                self.unbridge(&id);
                info!("[ProximityMonitor] Stopped tracking {}", email);
            }
        }

        let mut added_ids = Vec::new();
        for email in &added {
            match self.store.find_by_email(email) {
                Ok(Some(contact)) => {
                    info!("[ProximityMonitor] Started tracking {}", email);
                    added_ids.push(contact.id.clone());
                    let id = contact.id.clone();
                    self.contacts.insert(id.clone(), contact);
                    if let Err(e) = self.bridge_account(&id) {
                        warn!("[ProximityMonitor] Failed to subscribe to {}: {}", email, e);
                    }
                }
                Ok(None) => debug!("[ProximityMonitor] Linked contact {} has no account", email),
                Err(e) => warn!("[ProximityMonitor] Failed to resolve {}: {}", email, e),
            }
        }

        let mut events = Vec::new();
        for id in added_ids {
            events.extend(self.evaluate_contact(&id, now_ms));
        }
        events
    }

    fn on_contact_snapshot(&mut self, record: AccountRecord, now_ms: i64) -> Vec<AlertEvent> {
        let Some(previous) = self.contacts.get(&record.id) else {
            debug!("[ProximityMonitor] Ignoring snapshot of unlinked account {}", record.id);
            return Vec::new();
        };

        let moved = previous.location != record.location || previous.last_location != record.last_location;
        let id = record.id.clone();
        self.contacts.insert(id.clone(), record);

        if !moved {
            return Vec::new();
        }
        self.evaluate_contact(&id, now_ms)
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Distance sample for a contact, when both positions are known.
    fn sample(&self, record: &AccountRecord, now_ms: i64) -> Option<(ContactRef, f64)> {
        let own = self.own_position?;
        let classification = classify(
            record.location.as_ref(),
            record.last_location.as_ref(),
            now_ms,
            self.config.live_window_ms(),
        );
        let position = classification.effective_position?;
        let contact = ContactRef::new(
            record.id.clone(),
            display_name(record.name.as_deref(), &record.email),
            record.email.clone(),
        );
        Some((contact, haversine_km(&own.point, &position.point)))
    }

    fn evaluate_all(&mut self, now_ms: i64) -> Vec<AlertEvent> {
        if self.own_position.is_none() {
            return Vec::new();
        }

        let mut samples: Vec<(ContactRef, f64)> = self
            .contacts
            .values()
            .filter_map(|record| self.sample(record, now_ms))
            .collect();
        samples.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        self.tracker.evaluate_pass(&samples, now_ms)
    }

    fn evaluate_contact(&mut self, contact_id: &str, now_ms: i64) -> Vec<AlertEvent> {
        if self.tracker.bootstrap_pending() {
            return self.evaluate_all(now_ms);
        }

        let sample = self
            .contacts
            .get(contact_id)
            .and_then(|record| self.sample(record, now_ms));
        match sample {
            Some((contact, distance_km)) => self
                .tracker
                .evaluate(&contact, distance_km, now_ms)
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch_or_queue(&mut self, event: AlertEvent, now_ms: i64) -> Option<DispatchOutcome> {
        match self.dispatcher.dispatch(&self.owner, &event, now_ms) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    "[ProximityMonitor] Dispatch for {} failed, retrying next tick: {}",
                    event.contact().id,
                    e
                );
                if self.pending.len() >= self.config.max_pending_dispatches as usize {
                    if let Some(dropped) = self.pending.pop_front() {
                        warn!(
                            "[ProximityMonitor] Pending queue full, dropping event for {}",
                            dropped.contact().id
                        );
                    }
                }
                self.pending.push_back(event);
                None
            }
        }
    }

    fn flush_pending(&mut self, now_ms: i64) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        while let Some(event) = self.pending.pop_front() {
            match self.dispatcher.dispatch(&self.owner, &event, now_ms) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    debug!("[ProximityMonitor] Retry still failing: {}", e);
                    self.pending.push_front(event);
                    break;
                }
            }
        }
        if !outcomes.is_empty() {
            info!("[ProximityMonitor] Redelivered {} pending notifications", outcomes.len());
        }
        outcomes
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Every linked contact, closest first; contacts without a distance last.
    pub fn contacts(&self, now_ms: i64) -> Vec<ContactStatus> {
        let mut statuses: Vec<ContactStatus> = self
            .contacts
            .values()
            .map(|record| {
                let entity = TrackedEntity::from_record(
                    record,
                    self.owner_record.relationship_for(&record.email).map(str::to_string),
                    now_ms,
                    self.config.live_window_ms(),
                );
                let distance_km = match (self.own_position, entity.last_known_position) {
                    (Some(own), Some(theirs)) => Some(haversine_km(&own.point, &theirs.point)),
                    _ => None,
                };
                ContactStatus {
                    alert_state: self.alert_state(&record.id).unwrap_or(AlertState::Normal),
                    entity,
                    distance_km,
                }
            })
            .collect();

        statuses.sort_by(|a, b| match (a.distance_km, b.distance_km) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.entity.display_name.cmp(&b.entity.display_name),
        });
        statuses
    }

    /// Closest contacts with a known position, up to the configured limit.
    pub fn nearby(&self, now_ms: i64) -> Vec<NearbyEntry> {
        let Some(own) = self.own_position else {
            return Vec::new();
        };
        let candidates: Vec<(String, GeoPoint)> = self
            .contacts
            .values()
            .filter_map(|record| {
                classify(
                    record.location.as_ref(),
                    record.last_location.as_ref(),
                    now_ms,
                    self.config.live_window_ms(),
                )
                .effective_position
                .map(|p| (record.id.clone(), p.point))
            })
            .collect();

        geo_utils::nearest(&own.point, &candidates, self.config.nearby_limit as usize)
    }

    /// Classify every contact and send one consolidated notification for
    /// all far-away contacts. Independent of the alert tracker's state.
    pub fn analyze_far_contacts(&self, now_ms: i64) -> Result<FamilyAnalysis> {
        let mut far_away = Vec::new();
        let mut nearby = Vec::new();
        let mut offline = Vec::new();

        for status in self.contacts(now_ms) {
            match status.distance_km {
                Some(d) if d >= self.config.threshold_km => far_away.push(status),
                Some(_) => nearby.push(status),
                None => offline.push(status),
            }
        }

        let far_contacts: Vec<(ContactRef, f64)> = far_away
            .iter()
            .filter_map(|s| s.distance_km.map(|d| (s.entity.contact_ref(), d)))
            .collect();
        let notification = self
            .dispatcher
            .dispatch_consolidated(&self.owner, &far_contacts, now_ms)?;

        info!(
            "[ProximityMonitor] Analysis: {} far away, {} nearby, {} offline",
            far_away.len(),
            nearby.len(),
            offline.len()
        );

        Ok(FamilyAnalysis {
            far_away,
            nearby,
            offline,
            notification,
        })
    }

    /// Tell a contact the owner started navigating toward them.
    pub fn notify_tracking_started(&self, contact_id: &str, now_ms: i64) -> Result<DispatchOutcome> {
        let record = match self.contacts.get(contact_id) {
            Some(record) => record.clone(),
            None => self
                .store
                .get(contact_id)?
                .ok_or_else(|| ProximityError::not_found(format!("account {}", contact_id)))?,
        };
        let contact = ContactRef::new(
            record.id.clone(),
            display_name(record.name.as_deref(), &record.email),
            record.email.clone(),
        );
        self.dispatcher.dispatch(
            &self.owner,
            &AlertEvent::TrackingStarted { contact, at: now_ms },
            now_ms,
        )
    }

    /// Contacts that have no position at all.
    pub fn offline_contacts(&self, now_ms: i64) -> Vec<ContactStatus> {
        self.contacts(now_ms)
            .into_iter()
            .filter(|s| s.entity.presence == Presence::Offline)
            .collect()
    }

    // ========================================================================
    // Event Sources
    // ========================================================================

    /// Request location permission and feed device fixes into `events`.
    ///
    /// Returns `Ok(None)` when permission is denied; the monitor then keeps
    /// showing the default location and never evaluates distances.
    pub fn start_location_updates(
        provider: &dyn GeolocationProvider,
        events: Sender<MonitorEvent>,
        config: &ProximityConfig,
    ) -> Result<Option<Box<dyn WatchHandle>>> {
        if provider.request_permission() == PermissionStatus::Denied {
            warn!("[ProximityMonitor] Location permission denied, showing default location only");
            return Ok(None);
        }

        match provider.current_position() {
            Ok(position) => {
                let _ = events.send(MonitorEvent::OwnPosition(position));
            }
            Err(e) => warn!("[ProximityMonitor] No initial position: {}", e),
        }

        let handle = provider.watch(
            WatchOptions::from_config(config),
            Box::new(move |position| {
                let _ = events.send(MonitorEvent::OwnPosition(position));
            }),
        )?;
        Ok(Some(handle))
    }

    /// Subscribe to the owner and every linked contact, forwarding their
    /// snapshots into `events`. Contacts linked or unlinked later are
    /// subscribed or released as the owner's snapshots arrive.
    pub fn attach_snapshots(&mut self, events: Sender<MonitorEvent>) -> Result<()> {
        self.detach_snapshots();
        self.bridge = Some(SnapshotBridge {
            events,
            active: HashMap::new(),
        });
        for id in self.subscription_ids() {
            self.bridge_account(&id)?;
        }
        Ok(())
    }

    /// Stop forwarding snapshots. Each thread exits on its next snapshot.
    pub fn detach_snapshots(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            for flag in bridge.active.values() {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Accounts currently forwarded by the snapshot bridge, sorted.
    pub fn bridged_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bridge
            .as_ref()
            .map(|b| b.active.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn bridge_account(&mut self, account_id: &str) -> Result<()> {
        let Some(bridge) = self.bridge.as_mut() else {
            return Ok(());
        };
        if bridge.active.contains_key(account_id) {
            return Ok(());
        }

        let snapshots = self.store.subscribe(account_id)?;
        let events = bridge.events.clone();
        let flag = Arc::new(AtomicBool::new(true));
        bridge.active.insert(account_id.to_string(), flag.clone());

        let id = account_id.to_string();
        std::thread::spawn(move || {
            while let Ok(record) = snapshots.recv() {
                if !flag.load(Ordering::SeqCst) || events.send(MonitorEvent::Snapshot(record)).is_err() {
                    break;
                }
            }
            debug!("[ProximityMonitor] Snapshot bridge for {} closed", id);
        });
        debug!("[ProximityMonitor] Subscribed to {}", account_id);
        Ok(())
    }

    fn unbridge(&mut self, account_id: &str) {
        if let Some(flag) = self.bridge.as_mut().and_then(|b| b.active.remove(account_id)) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Send a `Tick` every `interval` until the receiver is gone.
    pub fn spawn_ticker(events: Sender<MonitorEvent>, interval: Duration) -> JoinHandle<()> {
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            if events.send(MonitorEvent::Tick).is_err() {
                break;
            }
        })
    }
}
