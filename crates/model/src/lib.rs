//! Shared data model for the pilot client: telemetry, control and log rows.

use serde::{Deserialize, Serialize};

pub const TRACK_BEAMS: usize = 19;
pub const OPPONENT_SENSORS: usize = 36;
pub const WHEELS: usize = 4;
pub const FOCUS_BEAMS: usize = 5;

pub const MIN_GEAR: i8 = -1;
pub const MAX_GEAR: i8 = 6;

/// One decoded telemetry frame from the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarState {
    pub angle: f32,
    pub speed_x: f32,
    pub speed_y: f32,
    pub speed_z: f32,
    pub track_pos: f32,
    pub rpm: f32,
    pub gear: i8,
    pub fuel: f32,
    pub damage: f32,
    pub cur_lap_time: f32,
    pub last_lap_time: f32,
    pub dist_from_start: f32,
    pub dist_raced: f32,
    pub race_pos: i32,
    pub z: f32,
    /// Range-finder distances along the configured beam angles, meters.
    pub track: Vec<f32>,
    /// Distance to the nearest opponent in each 10-degree sector.
    pub opponents: Vec<f32>,
    pub wheel_spin_vel: Vec<f32>,
    pub focus: Vec<f32>,
}

impl Default for CarState {
    fn default() -> Self {
        Self {
            angle: 0.0,
            speed_x: 0.0,
            speed_y: 0.0,
            speed_z: 0.0,
            track_pos: 0.0,
            rpm: 0.0,
            gear: 1,
            fuel: 0.0,
            damage: 0.0,
            cur_lap_time: 0.0,
            last_lap_time: 0.0,
            dist_from_start: 0.0,
            dist_raced: 0.0,
            race_pos: 0,
            z: 0.0,
            track: vec![200.0; TRACK_BEAMS],
            opponents: vec![200.0; OPPONENT_SENSORS],
            wheel_spin_vel: vec![0.0; WHEELS],
            focus: vec![-1.0; FOCUS_BEAMS],
        }
    }
}

impl CarState {
    /// True when every scalar the control rules read is a usable number.
    pub fn is_finite(&self) -> bool {
        [
            self.angle,
            self.speed_x,
            self.speed_y,
            self.speed_z,
            self.track_pos,
            self.rpm,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Actuator values sent back to the simulator each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarControl {
    pub accel: f32,
    pub brake: f32,
    pub gear: i8,
    pub steer: f32,
    pub clutch: f32,
    pub focus: i32,
    /// 1 requests a race restart.
    pub meta: i32,
}

impl Default for CarControl {
    fn default() -> Self {
        Self {
            accel: 0.0,
            brake: 0.0,
            gear: 1,
            steer: 0.0,
            clutch: 0.0,
            focus: 0,
            meta: 0,
        }
    }
}

impl CarControl {
    /// Full brake, wheels straight. Used when telemetry cannot be trusted.
    pub fn safe_stop(gear: i8) -> Self {
        Self {
            accel: 0.0,
            brake: 1.0,
            gear,
            ..Self::default()
        }
    }

    /// Clamp every actuator into the range the simulator accepts.
    pub fn clamp(&mut self) {
        self.steer = self.steer.clamp(-1.0, 1.0);
        self.accel = self.accel.clamp(0.0, 1.0);
        self.brake = self.brake.clamp(0.0, 1.0);
        self.clutch = self.clutch.clamp(0.0, 1.0);
        self.gear = self.gear.clamp(MIN_GEAR, MAX_GEAR);
        // brake wins over throttle, never both
        if self.brake > 0.0 {
            self.accel = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveMode {
    Manual,
    Auto,
}

impl DriveMode {
    pub fn toggled(self) -> Self {
        match self {
            DriveMode::Manual => DriveMode::Auto,
            DriveMode::Auto => DriveMode::Manual,
        }
    }
}

/// Race stage advertised by the simulator launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    WarmUp,
    Qualifying,
    Race,
    Unknown,
}

impl From<u8> for Stage {
    fn from(v: u8) -> Self {
        match v {
            0 => Stage::WarmUp,
            1 => Stage::Qualifying,
            2 => Stage::Race,
            _ => Stage::Unknown,
        }
    }
}

/// One dataset row: flattened state + control for a single tick.
///
/// Field order is the CSV column order; it must stay stable so files from
/// separate sessions can be concatenated for training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "Step")]
    pub step: u64,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "SpeedX")]
    pub speed_x: f32,
    #[serde(rename = "SpeedY")]
    pub speed_y: f32,
    #[serde(rename = "SpeedZ")]
    pub speed_z: f32,
    #[serde(rename = "TrackPos")]
    pub track_pos: f32,
    #[serde(rename = "Angle")]
    pub angle: f32,
    #[serde(rename = "RPM")]
    pub rpm: f32,
    #[serde(rename = "Gear_State")]
    pub gear_state: i8,
    #[serde(rename = "CurLapTime")]
    pub cur_lap_time: f32,
    #[serde(rename = "DistFromStart")]
    pub dist_from_start: f32,
    #[serde(rename = "DistRaced")]
    pub dist_raced: f32,
    #[serde(rename = "Fuel")]
    pub fuel: f32,
    #[serde(rename = "Damage")]
    pub damage: f32,
    #[serde(rename = "RacePos")]
    pub race_pos: i32,
    #[serde(rename = "Accel")]
    pub accel: f32,
    #[serde(rename = "Brake")]
    pub brake: f32,
    #[serde(rename = "Steer")]
    pub steer: f32,
    #[serde(rename = "Gear_Control")]
    pub gear_control: i8,
    #[serde(rename = "Clutch")]
    pub clutch: f32,
    #[serde(rename = "Meta")]
    pub meta: i32,
}

impl LogRecord {
    pub fn new(step: u64, time: String, state: &CarState, control: &CarControl) -> Self {
        Self {
            step,
            time,
            speed_x: state.speed_x,
            speed_y: state.speed_y,
            speed_z: state.speed_z,
            track_pos: state.track_pos,
            angle: state.angle,
            rpm: state.rpm,
            gear_state: state.gear,
            cur_lap_time: state.cur_lap_time,
            dist_from_start: state.dist_from_start,
            dist_raced: state.dist_raced,
            fuel: state.fuel,
            damage: state.damage,
            race_pos: state.race_pos,
            accel: control.accel,
            brake: control.brake,
            steer: control.steer,
            gear_control: control.gear,
            clutch: control.clutch,
            meta: control.meta,
        }
    }
}
