//! Typed event stream for demultiplexed relay messages
//!
//! The network client turns each inbound message into one `NetworkEvent` and
//! hands it to an `EventBus`. Consumers (remote player proxies, HUD, game
//! loop) subscribe per `EventKind`. Each client owns its bus explicitly, so
//! independent instances never share listeners.

use relay_shared::StateSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// The socket opened
    Connected,
    /// The socket closed, failed to open, or could not be constructed
    Disconnected,
    RoomJoined {
        player_id: String,
        room_id: String,
        color_index: usize,
    },
    PlayerJoined {
        player_id: String,
        color_index: usize,
        player_name: Option<String>,
    },
    PlayerLeft {
        player_id: String,
    },
    PlayerIdentityChanged {
        player_id: String,
        player_name: String,
        avatar_url: Option<String>,
    },
    /// Latest states of every other player in the room
    StateBatch(BTreeMap<String, StateSnapshot>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    RoomJoined,
    PlayerJoined,
    PlayerLeft,
    PlayerIdentityChanged,
    StateBatch,
}

impl NetworkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::Connected => EventKind::Connected,
            NetworkEvent::Disconnected => EventKind::Disconnected,
            NetworkEvent::RoomJoined { .. } => EventKind::RoomJoined,
            NetworkEvent::PlayerJoined { .. } => EventKind::PlayerJoined,
            NetworkEvent::PlayerLeft { .. } => EventKind::PlayerLeft,
            NetworkEvent::PlayerIdentityChanged { .. } => EventKind::PlayerIdentityChanged,
            NetworkEvent::StateBatch(_) => EventKind::StateBatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Observer registry keyed by event kind
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(ListenerId, Listener)>>> {
        // Listeners never run under this lock, so poisoning is harmless.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes one listener. Returns false if it was not subscribed to `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        before != list.len()
    }

    /// Calls every listener for the event's kind in subscription order.
    ///
    /// Listeners run outside the lock, so they may subscribe or unsubscribe
    /// from inside a callback.
    pub fn emit(&self, event: &NetworkEvent) {
        let targets: Vec<Listener> = self
            .listeners()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, listener)| Arc::clone(listener)).collect())
            .unwrap_or_default();

        for listener in targets {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners().get(&kind).map_or(0, Vec::len)
    }

    /// Drops every subscription.
    pub fn reset(&self) {
        self.listeners().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<NetworkEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_emit_reaches_subscribers_of_kind() {
        let bus = EventBus::new();
        let left = recorder(&bus, EventKind::PlayerLeft);
        let joined = recorder(&bus, EventKind::PlayerJoined);

        bus.emit(&NetworkEvent::PlayerLeft {
            player_id: "9".to_string(),
        });

        assert_eq!(left.lock().unwrap().len(), 1);
        assert!(joined.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            bus.on(EventKind::Connected, move |_| order.lock().unwrap().push(tag));
        }

        bus.emit(&NetworkEvent::Connected);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(&NetworkEvent::Disconnected);
        assert_eq!(bus.listener_count(EventKind::Disconnected), 0);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let bus = EventBus::new();
        let kept = recorder(&bus, EventKind::Connected);
        let removed = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&removed);
        let id = bus.on(EventKind::Connected, move |_| *counter.lock().unwrap() += 1);

        assert!(bus.off(EventKind::Connected, id));
        assert!(!bus.off(EventKind::Connected, id));
        assert!(!bus.off(EventKind::PlayerLeft, id));
        bus.emit(&NetworkEvent::Connected);

        assert_eq!(*removed.lock().unwrap(), 0);
        assert_eq!(kept.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let bus = EventBus::new();
        let seen = recorder(&bus, EventKind::Connected);
        recorder(&bus, EventKind::StateBatch);

        bus.reset();
        bus.emit(&NetworkEvent::Connected);

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count(EventKind::Connected), 0);
        assert_eq!(bus.listener_count(EventKind::StateBatch), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let bus_ref = Arc::clone(&bus);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            bus.on(EventKind::Connected, move |_| {
                *calls.lock().unwrap() += 1;
                if let Some(id) = *slot.lock().unwrap() {
                    bus_ref.off(EventKind::Connected, id);
                }
            })
        };
        *slot.lock().unwrap() = Some(id);

        bus.emit(&NetworkEvent::Connected);
        bus.emit(&NetworkEvent::Connected);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_independent_buses_do_not_share_listeners() {
        let first = EventBus::new();
        let second = EventBus::new();
        let seen = recorder(&first, EventKind::Connected);

        second.emit(&NetworkEvent::Connected);
        assert!(seen.lock().unwrap().is_empty());
    }
}
