//! Feature engineering and the pluggable predictor capability.

use std::collections::VecDeque;
use std::path::Path;

use model::CarState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FEATURE_DIM: usize = 15;
const WINDOW: usize = 5;

/// Engineered feature vector for one tick, derived from the raw state and
/// a short history of previous ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub speed_magnitude: f32,
    pub speed_x: f32,
    pub speed_y: f32,
    pub speed_z: f32,
    pub dist_from_center: f32,
    pub angle: f32,
    pub angle_change: f32,
    pub rpm: f32,
    pub rpm_change: f32,
    pub track_pos: f32,
    pub speed_angle: f32,
    pub speed_position: f32,
    pub speed_x_ma: f32,
    pub speed_y_ma: f32,
    pub angle_ma: f32,
}

impl Features {
    pub fn as_vec(&self) -> [f32; FEATURE_DIM] {
        [
            self.speed_magnitude,
            self.speed_x,
            self.speed_y,
            self.speed_z,
            self.dist_from_center,
            self.angle,
            self.angle_change,
            self.rpm,
            self.rpm_change,
            self.track_pos,
            self.speed_angle,
            self.speed_position,
            self.speed_x_ma,
            self.speed_y_ma,
            self.angle_ma,
        ]
    }
}

/// Rolling history feeding the moving-average and delta features.
#[derive(Debug, Default)]
pub struct FeatureWindow {
    speed_x: VecDeque<f32>,
    speed_y: VecDeque<f32>,
    angle: VecDeque<f32>,
    angle_change: f32,
    rpm_change: f32,
    prev_rpm: Option<f32>,
}

fn push_capped(q: &mut VecDeque<f32>, v: f32) {
    q.push_back(v);
    if q.len() > WINDOW {
        q.pop_front();
    }
}

fn mean(q: &VecDeque<f32>) -> f32 {
    if q.is_empty() {
        0.0
    } else {
        q.iter().sum::<f32>() / q.len() as f32
    }
}

impl FeatureWindow {
    pub fn push(&mut self, s: &CarState) {
        self.angle_change = self.angle.back().map_or(0.0, |prev| s.angle - prev);
        self.rpm_change = self.prev_rpm.map_or(0.0, |prev| s.rpm - prev);
        self.prev_rpm = Some(s.rpm);
        push_capped(&mut self.speed_x, s.speed_x);
        push_capped(&mut self.speed_y, s.speed_y);
        push_capped(&mut self.angle, s.angle);
    }

    /// Predictions only start once the window holds a full history.
    pub fn is_warm(&self) -> bool {
        self.angle.len() == WINDOW
    }

    pub fn features(&self, s: &CarState) -> Features {
        let speed_magnitude =
            (s.speed_x * s.speed_x + s.speed_y * s.speed_y + s.speed_z * s.speed_z).sqrt();
        Features {
            speed_magnitude,
            speed_x: s.speed_x,
            speed_y: s.speed_y,
            speed_z: s.speed_z,
            dist_from_center: s.track_pos.abs(),
            angle: s.angle,
            angle_change: self.angle_change,
            rpm: s.rpm,
            rpm_change: self.rpm_change,
            track_pos: s.track_pos,
            speed_angle: speed_magnitude * s.angle,
            speed_position: speed_magnitude * s.track_pos,
            speed_x_ma: mean(&self.speed_x),
            speed_y_ma: mean(&self.speed_y),
            angle_ma: mean(&self.angle),
        }
    }
}

/// Raw actuator targets from a trained model, before the safety clamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub steer: f32,
    pub accel: f32,
    pub brake: f32,
}

/// Capability interface for a trained decision function. The engine applies
/// its own bounds, pedal exclusion and gear hysteresis on top of whatever
/// the predictor returns.
pub trait Predictor: Send {
    fn predict(&self, features: &Features) -> Prediction;
}

#[derive(Debug, Error)]
pub enum PredictorLoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("model {0} has {1} weights, expected {}", FEATURE_DIM)]
    BadDimensions(&'static str, usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f32>,
    pub bias: f32,
}

impl LinearModel {
    fn eval(&self, x: &[f32; FEATURE_DIM]) -> f32 {
        self.weights
            .iter()
            .zip(x.iter())
            .map(|(w, v)| w * v)
            .sum::<f32>()
            + self.bias
    }
}

/// Linear per-actuator model loaded from a JSON weights file produced by
/// the offline training pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub steer: LinearModel,
    pub accel: LinearModel,
    pub brake: LinearModel,
}

impl LinearPredictor {
    pub fn from_json_file(path: &Path) -> Result<Self, PredictorLoadError> {
        let raw = std::fs::read_to_string(path)?;
        let p: LinearPredictor = serde_json::from_str(&raw)?;
        for (name, m) in [("steer", &p.steer), ("accel", &p.accel), ("brake", &p.brake)] {
            if m.weights.len() != FEATURE_DIM {
                return Err(PredictorLoadError::BadDimensions(name, m.weights.len()));
            }
        }
        Ok(p)
    }
}

impl Predictor for LinearPredictor {
    fn predict(&self, features: &Features) -> Prediction {
        let x = features.as_vec();
        Prediction {
            steer: self.steer.eval(&x),
            accel: self.accel.eval(&x),
            brake: self.brake.eval(&x),
        }
    }
}
