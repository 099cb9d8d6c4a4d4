//! Device geolocation seam.
//!
//! The shell implements [`GeolocationProvider`] over the platform location
//! API. [`ReplayProvider`] replays a recorded track and backs the demos and
//! tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::error::{ProximityError, Result};
use crate::geo_utils::haversine_km;
use crate::{Position, ProximityConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Throttling for watched position updates. An update is delivered only when
/// both limits have been reached since the last delivered one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub min_interval_ms: u64,
    pub min_distance_m: f64,
}

impl WatchOptions {
    pub fn from_config(config: &ProximityConfig) -> Self {
        Self {
            min_interval_ms: u64::from(config.watch_min_interval_ms),
            min_distance_m: config.watch_min_distance_m,
        }
    }

    /// Whether `next` should be delivered after `last`.
    pub fn admits(&self, last: Option<&Position>, next: &Position) -> bool {
        let Some(last) = last else {
            return true;
        };
        let elapsed = next.captured_at.saturating_sub(last.captured_at);
        let moved_m = haversine_km(&last.point, &next.point) * 1000.0;
        elapsed >= self.min_interval_ms as i64 && moved_m >= self.min_distance_m
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_config(&ProximityConfig::default())
    }
}

/// Callback invoked with every delivered position.
pub type PositionCallback = Box<dyn Fn(Position) + Send + 'static>;

/// Active position subscription.
pub trait WatchHandle: Send {
    /// Stop receiving updates.
    fn remove(self: Box<Self>);
}

pub trait GeolocationProvider: Send + Sync {
    fn request_permission(&self) -> PermissionStatus;

    fn current_position(&self) -> Result<Position>;

    fn watch(&self, options: WatchOptions, on_update: PositionCallback) -> Result<Box<dyn WatchHandle>>;
}

// ============================================================================
// Replay Provider
// ============================================================================

struct Watcher {
    id: u64,
    options: WatchOptions,
    callback: PositionCallback,
    last: Option<Position>,
}

type WatcherList = Mutex<Vec<Watcher>>;

/// Replays a fixed track of positions through its watchers.
pub struct ReplayProvider {
    permission: PermissionStatus,
    track: Vec<Position>,
    current: Mutex<Option<Position>>,
    watchers: Arc<WatcherList>,
    next_id: AtomicU64,
}

impl ReplayProvider {
    pub fn new(track: Vec<Position>) -> Self {
        let current = track.first().copied();
        Self {
            permission: PermissionStatus::Granted,
            track,
            current: Mutex::new(current),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// A provider whose permission request is refused.
    pub fn denied() -> Self {
        Self {
            permission: PermissionStatus::Denied,
            ..Self::new(Vec::new())
        }
    }

    /// Deliver one position to every watcher. Returns how many received it.
    pub fn push_position(&self, position: Position) -> usize {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(position);
        }

        let Ok(mut watchers) = self.watchers.lock() else {
            return 0;
        };
        let mut delivered = 0;
        for watcher in watchers.iter_mut() {
            if watcher.options.admits(watcher.last.as_ref(), &position) {
                watcher.last = Some(position);
                (watcher.callback)(position);
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver the whole track in order. Returns the number of deliveries.
    pub fn replay(&self) -> usize {
        self.track.iter().map(|p| self.push_position(*p)).sum()
    }

    pub fn active_watchers(&self) -> usize {
        self.watchers.lock().map(|w| w.len()).unwrap_or(0)
    }
}

struct ReplayWatch {
    id: u64,
    watchers: Weak<WatcherList>,
}

impl WatchHandle for ReplayWatch {
    fn remove(self: Box<Self>) {
        if let Some(watchers) = self.watchers.upgrade() {
            if let Ok(mut watchers) = watchers.lock() {
                watchers.retain(|w| w.id != self.id);
            }
        }
        debug!("[ReplayProvider] Watch {} removed", self.id);
    }
}

impl GeolocationProvider for ReplayProvider {
    fn request_permission(&self) -> PermissionStatus {
        self.permission
    }

    fn current_position(&self) -> Result<Position> {
        if self.permission == PermissionStatus::Denied {
            return Err(ProximityError::PermissionDenied("location".to_string()));
        }
        let current = *self
            .current
            .lock()
            .map_err(|_| ProximityError::internal("replay provider lock poisoned"))?;
        current.ok_or_else(|| ProximityError::not_found("no position fix available"))
    }

    fn watch(&self, options: WatchOptions, on_update: PositionCallback) -> Result<Box<dyn WatchHandle>> {
        if self.permission == PermissionStatus::Denied {
            return Err(ProximityError::PermissionDenied("location".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .lock()
            .map_err(|_| ProximityError::internal("replay provider lock poisoned"))?
            .push(Watcher {
                id,
                options,
                callback: on_update,
                last: None,
            });

        Ok(Box::new(ReplayWatch {
            id,
            watchers: Arc::downgrade(&self.watchers),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn track() -> Vec<Position> {
        vec![
            Position::new(19.0760, 72.8777, 0),
            // 5 s later, too soon
            Position::new(19.0770, 72.8777, 5_000),
            // 25 s later, ~110 m moved
            Position::new(19.0770, 72.8777, 25_000),
            // 50 s later but only ~1 m moved
            Position::new(19.07701, 72.8777, 50_000),
            Position::new(19.0800, 72.8777, 80_000),
        ]
    }

    #[test]
    fn test_watch_options_defaults() {
        let options = WatchOptions::default();
        assert_eq!(options.min_interval_ms, 20_000);
        assert_eq!(options.min_distance_m, 10.0);
    }

    #[test]
    fn test_replay_applies_throttling() {
        let provider = ReplayProvider::new(track());
        let (tx, rx) = channel();
        let _handle = provider
            .watch(WatchOptions::default(), Box::new(move |p| {
                let _ = tx.send(p);
            }))
            .unwrap();

        assert_eq!(provider.replay(), 3);
        let times: Vec<i64> = rx.try_iter().map(|p| p.captured_at).collect();
        assert_eq!(times, vec![0, 25_000, 80_000]);
    }

    #[test]
    fn test_remove_stops_updates() {
        let provider = ReplayProvider::new(track());
        let handle = provider.watch(WatchOptions::default(), Box::new(|_| {})).unwrap();
        assert_eq!(provider.active_watchers(), 1);
        handle.remove();
        assert_eq!(provider.active_watchers(), 0);
        assert_eq!(provider.replay(), 0);
    }

    #[test]
    fn test_denied_provider() {
        let provider = ReplayProvider::denied();
        assert_eq!(provider.request_permission(), PermissionStatus::Denied);
        assert!(provider.current_position().unwrap_err().is_permission_error());
        assert!(provider.watch(WatchOptions::default(), Box::new(|_| {})).is_err());
    }

    #[test]
    fn test_current_position_tracks_pushes() {
        let provider = ReplayProvider::new(Vec::new());
        assert!(provider.current_position().is_err());
        provider.push_position(Position::new(1.0, 2.0, 3));
        assert_eq!(provider.current_position().unwrap().captured_at, 3);
    }
}
