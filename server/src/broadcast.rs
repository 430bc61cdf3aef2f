//! Fixed-rate fan-out of member states
//!
//! The scheduler is the only writer of `stateUpdate` traffic. It runs on its
//! own timer, independent of how often clients upload, so outbound volume
//! per room stays at one message per member per tick no matter how many
//! clients send or how fast.

use crate::registry::{RoomRegistry, SharedRegistry};
use log::{debug, error};
use relay_shared::{encode, period_for_rate, ServerMessage};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

/// Builds and delivers one `stateUpdate` per room
///
/// Rooms where no member has sent a state yet are skipped. Each room's
/// message is serialised once and the frame is cloned to every member whose
/// connection is still open. Returns the number of rooms that produced a
/// message.
pub fn broadcast_states(registry: &RoomRegistry) -> usize {
    let mut rooms_sent = 0;

    for (room_id, room) in registry.rooms() {
        let states = room.snapshot_states();
        if states.is_empty() {
            continue;
        }

        let text = match encode(&ServerMessage::StateUpdate { states }) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode state update for room {}: {}", room_id, e);
                continue;
            }
        };

        let frame = Message::text(text);
        for member in room.members().filter(|member| member.connection.is_open()) {
            member.connection.send(frame.clone());
        }
        rooms_sent += 1;
    }

    rooms_sent
}

pub struct BroadcastScheduler {
    registry: SharedRegistry,
    period: Duration,
    tick: u64,
}

impl BroadcastScheduler {
    pub fn new(registry: SharedRegistry, rate_hz: u32) -> Self {
        Self {
            registry,
            period: period_for_rate(rate_hz),
            tick: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs one broadcast under the registry's read lock, so every room is
    /// seen at a single point in time.
    pub async fn tick(&mut self) -> usize {
        let registry = self.registry.read().await;
        let rooms_sent = broadcast_states(&registry);
        self.tick += 1;

        if self.tick % 100 == 0 {
            debug!(
                "Broadcast tick {}: {} rooms, {} members, {} updates sent",
                self.tick,
                registry.room_count(),
                registry.member_count(),
                rooms_sent
            );
        }
        rooms_sent
    }

    pub async fn run(mut self) {
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            self.tick().await;
        }
    }
}
