use clap::Parser;
use log::info;
use relay_client::{EventBus, EventKind, NetworkClient, NetworkEvent};
use relay_shared::{palette_color, Facing, Identity, StateSnapshot, NETWORK_SEND_RATE_HZ};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless player that walks back and forth in a relay room", long_about = None)]
struct Args {
    /// Relay URL to connect to
    #[arg(short, long, env = "RELAY_URL", default_value = "ws://127.0.0.1:3001")]
    server: String,

    /// Room to join
    #[arg(short, long, default_value = relay_shared::DEFAULT_ROOM)]
    room: String,

    /// Display name announced on connect
    #[arg(short, long)]
    name: Option<String>,

    /// Avatar URL announced with the name
    #[arg(long)]
    avatar_url: Option<String>,

    /// State uploads per second
    #[arg(long, default_value_t = NETWORK_SEND_RATE_HZ)]
    send_rate: u32,

    /// Seconds to stay connected (0 runs until Ctrl+C)
    #[arg(short, long, default_value_t = 0)]
    duration: u64,
}

const GROUND_Y: f64 = 380.0;
const WALK_SPEED: f64 = 160.0;
const WALK_MIN_X: f64 = 50.0;
const WALK_MAX_X: f64 = 750.0;
const FRAME_TIME: Duration = Duration::from_millis(16);

/// Synthetic player pacing between two walls
struct Walker {
    x: f64,
    facing: Facing,
}

impl Walker {
    fn new() -> Self {
        Self {
            x: WALK_MIN_X,
            facing: Facing::Right,
        }
    }

    fn step(&mut self, dt: f64) -> StateSnapshot {
        let direction = match self.facing {
            Facing::Right => 1.0,
            Facing::Left => -1.0,
        };
        self.x += direction * WALK_SPEED * dt;

        if self.x >= WALK_MAX_X {
            self.x = WALK_MAX_X;
            self.facing = Facing::Left;
        } else if self.x <= WALK_MIN_X {
            self.x = WALK_MIN_X;
            self.facing = Facing::Right;
        }

        let vx = match self.facing {
            Facing::Right => WALK_SPEED,
            Facing::Left => -WALK_SPEED,
        };
        StateSnapshot::new(self.x, GROUND_Y, vx, 0.0, self.facing)
    }
}

fn log_events(events: &EventBus) {
    events.on(EventKind::Connected, |_| info!("Connected"));
    events.on(EventKind::Disconnected, |_| info!("Disconnected"));
    events.on(EventKind::RoomJoined, |event| {
        if let NetworkEvent::RoomJoined {
            player_id,
            room_id,
            color_index,
        } = event
        {
            info!(
                "Joined room {} as player {} (colour #{:06x})",
                room_id,
                player_id,
                palette_color(*color_index)
            );
        }
    });
    events.on(EventKind::PlayerJoined, |event| {
        if let NetworkEvent::PlayerJoined {
            player_id,
            player_name,
            ..
        } = event
        {
            info!(
                "Player {} joined ({})",
                player_id,
                player_name.as_deref().unwrap_or("unnamed")
            );
        }
    });
    events.on(EventKind::PlayerLeft, |event| {
        if let NetworkEvent::PlayerLeft { player_id } = event {
            info!("Player {} left", player_id);
        }
    });
    events.on(EventKind::PlayerIdentityChanged, |event| {
        if let NetworkEvent::PlayerIdentityChanged {
            player_id,
            player_name,
            ..
        } = event
        {
            info!("Player {} is now {}", player_id, player_name);
        }
    });
    events.on(EventKind::StateBatch, |event| {
        if let NetworkEvent::StateBatch(states) = event {
            log::debug!("State batch with {} remote players", states.len());
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let events = Arc::new(EventBus::new());
    log_events(&events);

    let mut client =
        NetworkClient::new(&args.server, Arc::clone(&events)).with_send_rate(args.send_rate);
    let identity = args
        .name
        .map(|name| Identity::new(name, args.avatar_url.filter(|url| !url.is_empty())));
    client.connect(&args.room, identity);

    let deadline =
        (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut walker = Walker::new();
    let mut frames = interval(FRAME_TIME);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_frame = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            now = frames.tick() => {
                let dt = now.duration_since(last_frame).as_secs_f64();
                last_frame = now;
                client.update_local_state(walker.step(dt));

                if deadline.is_some_and(|deadline| now >= deadline) {
                    info!("Run time elapsed");
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, leaving room");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
