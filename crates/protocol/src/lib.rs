//! Codec for the simulator's ASCII datagram format.
//!
//! Every message is a run of `(key value value ...)` groups. Telemetry
//! frames carry the sensor set, action frames the actuator set, and a few
//! reserved `***...***` payloads signal session lifecycle changes.

use std::collections::HashMap;

use model::{CarControl, CarState, FOCUS_BEAMS, OPPONENT_SENSORS, TRACK_BEAMS, WHEELS};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed telemetry: {0}")]
    MalformedTelemetry(String),
}

/// Classification of one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake acknowledgment.
    Identified,
    /// Simulator is going away; tear the session down.
    Shutdown,
    /// Race restarted; current episode is over.
    Restart,
    /// Anything else is a sensor frame.
    Telemetry,
}

pub fn classify(msg: &str) -> ServerMessage {
    if msg.contains("***identified***") {
        ServerMessage::Identified
    } else if msg.contains("***shutdown***") {
        ServerMessage::Shutdown
    } else if msg.contains("***restart***") {
        ServerMessage::Restart
    } else {
        ServerMessage::Telemetry
    }
}

/// The 19-beam range-finder layout: -90..+90 degrees, finer near the
/// centerline.
pub fn default_rangefinder_angles() -> [f32; TRACK_BEAMS] {
    let mut angles = [0.0f32; TRACK_BEAMS];
    for i in 0..5 {
        angles[i] = -90.0 + i as f32 * 15.0;
        angles[18 - i] = 90.0 - i as f32 * 15.0;
    }
    for i in 5..9 {
        angles[i] = -20.0 + (i - 5) as f32 * 5.0;
        angles[18 - i] = 20.0 - (i - 5) as f32 * 5.0;
    }
    angles
}

/// Handshake datagram: client identity followed by the beam configuration.
pub fn encode_handshake(client_id: &str, angles: &[f32; TRACK_BEAMS]) -> String {
    let mut msg = String::with_capacity(128);
    msg.push_str(client_id);
    msg.push_str("(init");
    for a in angles {
        msg.push(' ');
        msg.push_str(&format!("{a}"));
    }
    msg.push(')');
    msg
}

/// Action datagram. Key order and float precision are fixed so the output
/// is deterministic for a given control.
pub fn encode_action(c: &CarControl) -> String {
    format!(
        "(accel {:.6})(brake {:.6})(gear {})(steer {:.6})(clutch {:.6})(focus {})(meta {})",
        c.accel, c.brake, c.gear, c.steer, c.clutch, c.focus, c.meta
    )
}

fn push_group(out: &mut String, key: &str, values: &[f32]) {
    out.push('(');
    out.push_str(key);
    for v in values {
        out.push(' ');
        out.push_str(&format!("{v}"));
    }
    out.push(')');
}

/// Telemetry emitter, the codec's inverse of [`decode_telemetry`]. Floats
/// use the shortest round-trip representation so decode reproduces the
/// state exactly. Used by tests and simulator stand-ins.
pub fn encode_telemetry(s: &CarState) -> String {
    let mut out = String::with_capacity(512);
    push_group(&mut out, "angle", &[s.angle]);
    push_group(&mut out, "curLapTime", &[s.cur_lap_time]);
    push_group(&mut out, "damage", &[s.damage]);
    push_group(&mut out, "distFromStart", &[s.dist_from_start]);
    push_group(&mut out, "distRaced", &[s.dist_raced]);
    push_group(&mut out, "focus", &s.focus);
    push_group(&mut out, "fuel", &[s.fuel]);
    out.push_str(&format!("(gear {})", s.gear));
    push_group(&mut out, "lastLapTime", &[s.last_lap_time]);
    push_group(&mut out, "opponents", &s.opponents);
    out.push_str(&format!("(racePos {})", s.race_pos));
    push_group(&mut out, "rpm", &[s.rpm]);
    push_group(&mut out, "speedX", &[s.speed_x]);
    push_group(&mut out, "speedY", &[s.speed_y]);
    push_group(&mut out, "speedZ", &[s.speed_z]);
    push_group(&mut out, "track", &s.track);
    push_group(&mut out, "trackPos", &[s.track_pos]);
    push_group(&mut out, "wheelSpinVel", &s.wheel_spin_vel);
    push_group(&mut out, "z", &[s.z]);
    out
}

/// Split a datagram into its key/values groups. Keys can appear in any
/// order; unknown keys are kept and simply never read.
fn fields(msg: &str) -> Result<HashMap<&str, Vec<&str>>, ProtocolError> {
    let mut map = HashMap::new();
    let mut rest = msg;
    while let Some(open) = rest.find('(') {
        let Some(close_rel) = rest[open..].find(')') else {
            return Err(ProtocolError::MalformedTelemetry(format!(
                "unterminated group in {msg:?}"
            )));
        };
        let group = &rest[open + 1..open + close_rel];
        let mut items = group.split_whitespace();
        let Some(key) = items.next() else {
            return Err(ProtocolError::MalformedTelemetry("empty group".into()));
        };
        let values: Vec<&str> = items.collect();
        if values.is_empty() {
            return Err(ProtocolError::MalformedTelemetry(format!(
                "group {key:?} has no value"
            )));
        }
        map.insert(key, values);
        rest = &rest[open + close_rel + 1..];
    }
    Ok(map)
}

fn scalar(map: &HashMap<&str, Vec<&str>>, key: &str) -> Result<f32, ProtocolError> {
    let values = map
        .get(key)
        .ok_or_else(|| ProtocolError::MalformedTelemetry(format!("missing key {key:?}")))?;
    values[0]
        .parse::<f32>()
        .map_err(|_| ProtocolError::MalformedTelemetry(format!("bad value for {key:?}")))
}

fn scalar_or(map: &HashMap<&str, Vec<&str>>, key: &str, default: f32) -> f32 {
    map.get(key)
        .and_then(|v| v[0].parse::<f32>().ok())
        .unwrap_or(default)
}

fn array(
    map: &HashMap<&str, Vec<&str>>,
    key: &str,
    len: usize,
) -> Result<Vec<f32>, ProtocolError> {
    let values = map
        .get(key)
        .ok_or_else(|| ProtocolError::MalformedTelemetry(format!("missing key {key:?}")))?;
    if values.len() != len {
        return Err(ProtocolError::MalformedTelemetry(format!(
            "key {key:?} expects {len} values, got {}",
            values.len()
        )));
    }
    values
        .iter()
        .map(|v| {
            v.parse::<f32>()
                .map_err(|_| ProtocolError::MalformedTelemetry(format!("bad value for {key:?}")))
        })
        .collect()
}

pub fn decode_telemetry(msg: &str) -> Result<CarState, ProtocolError> {
    let map = fields(msg)?;
    let focus = match map.get("focus") {
        Some(_) => array(&map, "focus", FOCUS_BEAMS)?,
        None => vec![-1.0; FOCUS_BEAMS],
    };
    Ok(CarState {
        angle: scalar(&map, "angle")?,
        speed_x: scalar(&map, "speedX")?,
        speed_y: scalar(&map, "speedY")?,
        speed_z: scalar(&map, "speedZ")?,
        track_pos: scalar(&map, "trackPos")?,
        rpm: scalar(&map, "rpm")?,
        gear: scalar(&map, "gear")? as i8,
        fuel: scalar(&map, "fuel")?,
        damage: scalar(&map, "damage")?,
        cur_lap_time: scalar_or(&map, "curLapTime", 0.0),
        last_lap_time: scalar_or(&map, "lastLapTime", 0.0),
        dist_from_start: scalar_or(&map, "distFromStart", 0.0),
        dist_raced: scalar_or(&map, "distRaced", 0.0),
        race_pos: scalar_or(&map, "racePos", 0.0) as i32,
        z: scalar_or(&map, "z", 0.0),
        track: array(&map, "track", TRACK_BEAMS)?,
        opponents: array(&map, "opponents", OPPONENT_SENSORS)?,
        wheel_spin_vel: array(&map, "wheelSpinVel", WHEELS)?,
        focus,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> CarState {
        CarState {
            angle: 0.0031,
            speed_x: 80.25,
            speed_y: -0.5,
            speed_z: 0.01,
            track_pos: -0.12,
            rpm: 6234.7,
            gear: 3,
            fuel: 93.2,
            damage: 0.0,
            cur_lap_time: 42.375,
            last_lap_time: 91.5,
            dist_from_start: 1250.0,
            dist_raced: 4030.5,
            race_pos: 4,
            z: 0.34,
            ..CarState::default()
        }
    }

    #[test]
    fn telemetry_round_trips_exactly() {
        let state = sample_state();
        let decoded = decode_telemetry(&encode_telemetry(&state)).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn decode_tolerates_key_order_and_unknown_keys() {
        let state = sample_state();
        let mut msg = String::from("(newSensor 1 2 3)");
        msg.push_str(&encode_telemetry(&state));
        assert_eq!(decode_telemetry(&msg).unwrap(), state);
    }

    #[test]
    fn missing_required_key_is_malformed() {
        let msg = encode_telemetry(&sample_state()).replace("(rpm 6234.7)", "");
        let err = decode_telemetry(&msg).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedTelemetry(_)));
    }

    #[test]
    fn array_count_mismatch_is_malformed() {
        let mut state = sample_state();
        state.track.pop();
        let err = decode_telemetry(&encode_telemetry(&state)).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedTelemetry(_)));
    }

    #[test]
    fn unterminated_group_is_malformed() {
        assert!(decode_telemetry("(angle 0.1").is_err());
    }

    #[test]
    fn missing_focus_defaults() {
        let mut msg = encode_telemetry(&sample_state());
        msg = msg.replace("(focus -1 -1 -1 -1 -1)", "");
        let decoded = decode_telemetry(&msg).unwrap();
        assert_eq!(decoded.focus, vec![-1.0; FOCUS_BEAMS]);
    }

    #[test]
    fn action_encoding_is_deterministic() {
        let c = CarControl {
            accel: 0.5,
            brake: 0.0,
            gear: 2,
            steer: -0.25,
            clutch: 0.0,
            focus: 0,
            meta: 0,
        };
        let msg = encode_action(&c);
        assert_eq!(
            msg,
            "(accel 0.500000)(brake 0.000000)(gear 2)(steer -0.250000)(clutch 0.000000)(focus 0)(meta 0)"
        );
        assert_eq!(msg, encode_action(&c.clone()));
    }

    #[test]
    fn handshake_carries_identity_and_beams() {
        let msg = encode_handshake("SCR", &default_rangefinder_angles());
        assert!(msg.starts_with("SCR(init -90 -75 -60 -45 -30 -20 -15 -10 -5 0"));
        assert!(msg.ends_with("5 10 15 20 30 45 60 75 90)"));
    }

    #[test]
    fn sentinel_payloads_are_classified() {
        assert_eq!(classify("***identified***"), ServerMessage::Identified);
        assert_eq!(classify("***shutdown***"), ServerMessage::Shutdown);
        assert_eq!(classify("***restart***"), ServerMessage::Restart);
        assert_eq!(classify("(angle 0.1)"), ServerMessage::Telemetry);
    }

    #[test]
    fn nan_values_decode_without_error() {
        let msg = encode_telemetry(&sample_state()).replace("(speedX 80.25)", "(speedX NaN)");
        let decoded = decode_telemetry(&msg).unwrap();
        assert!(decoded.speed_x.is_nan());
    }
}
