//! Player input handling
//!
//! There is no device polling: the held keys come from the command line and stay held.
//! Input is sent at most once per `input_send_interval_ms`.

use bevy::prelude::*;
use lightyear::prelude::*;
use shared::controller::{Key, KeyState};
use shared::KeyParseError;
use shared::protocol::{EnterVehicle, Empty, Message, VehicleInputMessage, WireFrame};
use shared::vehicle::{VehicleType, INTERACTION_RADIUS};
use shared::NetConfig;
use thiserror::Error;

use crate::sync::{LocalPlayer, LocalPrediction, NetEntities, NetEntity};
use crate::systems::connection::{send_message, GameClient, Session};

/// Seconds between two enter attempts / two shots
const RETRY_INTERVAL: f32 = 1.0;

#[derive(Debug, Error, PartialEq)]
pub enum ArgError {
    #[error(transparent)]
    Key(#[from] KeyParseError),
    #[error("{flag} needs a value")]
    MissingValue { flag: &'static str },
    #[error("bad value for --yaw: '{0}'")]
    Yaw(String),
    #[error(transparent)]
    Vehicle(#[from] shared::SpawnError),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
}

/// Command line: `client [--yaw RAD] [--spawn TYPE] [--enter] [--fire] [KEY...]`
#[derive(Resource, Debug, Clone, Default, PartialEq)]
pub struct ClientArgs {
    pub keys: Vec<Key>,
    /// Facing sent with `player_input`
    pub yaw: f32,
    /// Ask for a vehicle with `/spawnvehicle` after joining
    pub spawn_vehicle: Option<VehicleType>,
    /// Climb into the nearest vehicle
    pub enter: bool,
    /// Fire the seat weapon while seated
    pub fire: bool,
}

impl ClientArgs {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ArgError> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--yaw" => {
                    let value = args.next().ok_or(ArgError::MissingValue { flag: "--yaw" })?;
                    parsed.yaw = value.parse().map_err(|_| ArgError::Yaw(value))?;
                }
                "--spawn" => {
                    let value = args.next().ok_or(ArgError::MissingValue { flag: "--spawn" })?;
                    parsed.spawn_vehicle = Some(value.parse()?);
                }
                "--enter" => parsed.enter = true,
                "--fire" => parsed.fire = true,
                flag if flag.starts_with("--") => return Err(ArgError::UnknownOption(arg)),
                key => parsed.keys.push(key.parse::<Key>()?),
            }
        }
        Ok(parsed)
    }

    pub fn key_state(&self) -> KeyState {
        let mut keys = KeyState::default();
        for &key in &self.keys {
            keys.press(key);
        }
        keys
    }
}

/// Send gate for the input throttle.
#[derive(Resource, Debug, Default)]
pub struct InputThrottle {
    elapsed_ms: f64,
    sent_once: bool,
}

impl InputThrottle {
    /// True when a send is due. The first call always sends.
    pub fn ready(&mut self, dt_ms: f64, interval_ms: f64) -> bool {
        self.elapsed_ms += dt_ms.max(0.0);
        if self.sent_once && self.elapsed_ms < interval_ms {
            return false;
        }
        self.sent_once = true;
        self.elapsed_ms = 0.0;
        true
    }
}

/// Timers for one-shot style actions driven by held flags.
#[derive(Resource, Debug, Default)]
pub struct ActionTimers {
    enter: f32,
    fire: f32,
}

/// Feed held keys to local prediction every frame; send them to the server on the throttle.
pub fn send_input_to_server(
    keys: Res<KeyState>,
    args: Res<ClientArgs>,
    net: Res<NetConfig>,
    session: Res<Session>,
    time: Res<Time>,
    entities: Res<NetEntities>,
    vehicles: Query<&NetEntity>,
    mut prediction: ResMut<LocalPrediction>,
    mut throttle: ResMut<InputThrottle>,
    mut client: Query<&mut MessageSender<WireFrame>, (With<GameClient>, With<Connected>)>,
) {
    let player_input = keys.player_input(args.yaw);
    prediction.set_input(player_input);

    if !throttle.ready(f64::from(time.delta_secs()) * 1000.0, net.input_send_interval_ms) {
        return;
    }
    let Ok(mut sender) = client.single_mut() else {
        return;
    };

    let message = match &session.seat {
        Some((vehicle_id, _)) if session.is_driving() => {
            let kind = entities
                .get(vehicle_id)
                .and_then(|e| vehicles.get(e).ok())
                .and_then(|n| n.vehicle_type)
                .unwrap_or(VehicleType::Jeep);
            Message::VehicleInput(VehicleInputMessage {
                vehicle_id: vehicle_id.clone(),
                input: keys.vehicle_input(kind),
            })
        }
        // Passengers have nothing to steer.
        Some(_) => return,
        None if session.player_entity.is_some() => Message::PlayerInput(player_input),
        None => return,
    };
    send_message(&mut sender, &session, message, time.elapsed_secs_f64() * 1000.0);
}

/// Requests due this frame. `me` is our character position; the enter request needs it,
/// firing does not.
fn due_requests<'a>(
    args: &ClientArgs,
    seated: bool,
    timers: &mut ActionTimers,
    me: Option<Vec3>,
    vehicles: impl IntoIterator<Item = (&'a NetEntity, Vec3)>,
) -> Vec<Message> {
    let mut requests = Vec::new();

    if let Some(me) = me.filter(|_| args.enter && !seated && timers.enter <= 0.0) {
        let nearest = vehicles
            .into_iter()
            .filter(|(n, _)| n.vehicle_type.is_some())
            .map(|(n, at)| (n, at.distance(me)))
            .filter(|(_, d)| *d <= INTERACTION_RADIUS * 2.0)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((vehicle, distance)) = nearest {
            info!("Entering {} ({:.1} m away)", vehicle.id, distance);
            requests.push(Message::EnterVehicle(EnterVehicle {
                vehicle_id: vehicle.id.clone(),
                seat_index: None,
            }));
            timers.enter = RETRY_INTERVAL;
        }
    }

    if args.fire && seated && timers.fire <= 0.0 {
        requests.push(Message::FireWeapon(Empty {}));
        timers.fire = RETRY_INTERVAL;
    }
    requests
}

/// `--enter`: ask for a seat in the nearest vehicle; `--fire`: shoot while seated.
pub fn handle_actions(
    args: Res<ClientArgs>,
    session: Res<Session>,
    time: Res<Time>,
    mut timers: ResMut<ActionTimers>,
    local: Query<&Transform, With<LocalPlayer>>,
    vehicles: Query<(&NetEntity, &Transform), Without<LocalPlayer>>,
    mut client: Query<&mut MessageSender<WireFrame>, (With<GameClient>, With<Connected>)>,
) {
    let dt = time.delta_secs();
    timers.enter -= dt;
    timers.fire -= dt;
    let Ok(mut sender) = client.single_mut() else {
        return;
    };
    let now_ms = time.elapsed_secs_f64() * 1000.0;

    let me = local.single().ok().map(|t| t.translation);
    let requests = due_requests(
        &args,
        session.seat.is_some(),
        &mut timers,
        me,
        vehicles.iter().map(|(n, t)| (n, t.translation)),
    );
    for request in requests {
        send_message(&mut sender, &session, request, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::EntityKind;

    fn args(list: &[&str]) -> Result<ClientArgs, ArgError> {
        ClientArgs::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_keys_and_flags() {
        let parsed = args(&["w", "shift", "--yaw", "1.5", "--spawn", "heli", "--enter"]).unwrap();
        assert_eq!(parsed.keys, vec![Key::W, Key::Shift]);
        assert_eq!(parsed.yaw, 1.5);
        assert_eq!(parsed.spawn_vehicle, Some(VehicleType::Helicopter));
        assert!(parsed.enter);
        assert!(!parsed.fire);

        let keys = parsed.key_state();
        let input = keys.player_input(parsed.yaw);
        assert!(input.forward && input.running);
        assert!(!input.jump);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(args(&["x"]), Err(ArgError::Key(_))));
        assert_eq!(args(&["--yaw"]), Err(ArgError::MissingValue { flag: "--yaw" }));
        assert!(matches!(args(&["--yaw", "left"]), Err(ArgError::Yaw(_))));
        assert!(matches!(args(&["--spawn", "boat"]), Err(ArgError::Vehicle(_))));
        assert!(matches!(args(&["--turbo"]), Err(ArgError::UnknownOption(_))));
    }

    fn jeep(id: &str) -> NetEntity {
        NetEntity {
            id: id.to_string(),
            kind: EntityKind::Vehicle,
            vehicle_type: Some(VehicleType::Jeep),
        }
    }

    #[test]
    fn fires_without_a_local_character() {
        let args = args(&["--enter", "--fire"]).unwrap();
        let mut timers = ActionTimers::default();
        let near = jeep("v1");
        let requests = due_requests(&args, true, &mut timers, None, [(&near, Vec3::ZERO)]);
        assert_eq!(requests, vec![Message::FireWeapon(Empty {})]);

        // Retry interval holds the next shot back.
        assert!(due_requests(&args, true, &mut timers, None, Vec::new()).is_empty());
    }

    #[test]
    fn enters_nearest_vehicle_in_reach() {
        let args = args(&["--enter"]).unwrap();
        let mut timers = ActionTimers::default();
        let (near, far) = (jeep("near"), jeep("far"));
        let vehicles = [(&far, Vec3::new(4.0, 0.0, 0.0)), (&near, Vec3::new(1.0, 0.0, 0.0))];

        assert!(due_requests(&args, false, &mut timers, None, vehicles).is_empty());
        let requests = due_requests(&args, false, &mut timers, Some(Vec3::ZERO), vehicles);
        assert_eq!(
            requests,
            vec![Message::EnterVehicle(EnterVehicle {
                vehicle_id: "near".to_string(),
                seat_index: None,
            })]
        );
    }

    #[test]
    fn throttle_spaces_sends() {
        let mut throttle = InputThrottle::default();
        assert!(throttle.ready(0.0, 50.0));
        let mut sent = 0;
        // One second of 60 Hz frames.
        for _ in 0..60 {
            if throttle.ready(1000.0 / 60.0, 50.0) {
                sent += 1;
            }
        }
        assert!((15..=20).contains(&sent), "{sent} sends");
    }
}
