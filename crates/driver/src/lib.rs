//! Decision engine: telemetry in, one clamped control command out.
//!
//! The rule driver handles steering, throttle shaping and gearbox logic on
//! its own. When a trained [`Predictor`] is configured it takes over the
//! steering and pedal targets, but the gearbox, actuator bounds, pedal
//! exclusion and shift hysteresis are enforced here regardless of what the
//! model outputs.

mod features;

pub use features::{
    FeatureWindow, Features, LinearModel, LinearPredictor, Prediction, Predictor,
    PredictorLoadError, FEATURE_DIM,
};

use model::{CarControl, CarState, MAX_GEAR};
use tracing::debug;

const ANGLE_THRESHOLD: f32 = 0.05;
const TRACK_POS_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Full steering lock in radians; steer commands are expressed as a
    /// fraction of this.
    pub steer_lock: f32,
    /// Weight of lateral displacement in the steering correction.
    pub track_pos_gain: f32,
    pub upshift_rpm: f32,
    pub downshift_rpm: f32,
    /// Minimum ticks between two gear changes.
    pub shift_interval_ticks: u64,
    pub max_speed_kph: f32,
    pub curvature_sensitivity: f32,
    pub min_turn_threshold: f32,
    /// How many range-finder beams to scan for an upcoming corner.
    pub look_ahead_beams: usize,
    /// Beam distance under which the track ahead counts as narrowing.
    pub curve_detection_m: f32,
    pub speed_reduction_floor: f32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            steer_lock: 0.785398,
            track_pos_gain: 0.5,
            upshift_rpm: 6500.0,
            downshift_rpm: 3000.0,
            shift_interval_ticks: 20,
            max_speed_kph: 200.0,
            curvature_sensitivity: 0.6,
            min_turn_threshold: 0.4,
            look_ahead_beams: 12,
            curve_detection_m: 40.0,
            speed_reduction_floor: 0.8,
        }
    }
}

/// Gear-hysteresis memory plus the rolling feature history. Owned by the
/// control loop, mutated only through [`Driver::decide`].
#[derive(Debug)]
pub struct DriveState {
    /// Last commanded gear.
    pub gear: i8,
    pub last_shift_tick: Option<u64>,
    prev_accel: f32,
    window: FeatureWindow,
}

impl Default for DriveState {
    fn default() -> Self {
        Self {
            gear: 1,
            last_shift_tick: None,
            prev_accel: 0.0,
            window: FeatureWindow::default(),
        }
    }
}

impl DriveState {
    fn record_shift(&mut self, gear: i8, tick: u64) {
        debug!(from = self.gear, to = gear, tick, "gear shift");
        self.gear = gear;
        self.last_shift_tick = Some(tick);
    }
}

/// Coarse steering classification used by the threshold rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerDirection {
    Left,
    Straight,
    Right,
}

/// Positive steer turns left (simulator convention). The yaw angle is
/// checked before lateral displacement when the two disagree.
pub fn steer_direction(angle: f32, track_pos: f32) -> SteerDirection {
    if angle > ANGLE_THRESHOLD {
        SteerDirection::Left
    } else if angle < -ANGLE_THRESHOLD {
        SteerDirection::Right
    } else if track_pos < -TRACK_POS_THRESHOLD {
        SteerDirection::Left
    } else if track_pos > TRACK_POS_THRESHOLD {
        SteerDirection::Right
    } else {
        SteerDirection::Straight
    }
}

pub struct Driver {
    cfg: DriverConfig,
    predictor: Option<Box<dyn Predictor>>,
}

impl Driver {
    pub fn new(cfg: DriverConfig) -> Self {
        Self {
            cfg,
            predictor: None,
        }
    }

    pub fn with_predictor(cfg: DriverConfig, predictor: Box<dyn Predictor>) -> Self {
        Self {
            cfg,
            predictor: Some(predictor),
        }
    }

    /// Compute the control command for one tick.
    pub fn decide(&self, s: &CarState, ds: &mut DriveState, tick: u64) -> CarControl {
        if !s.is_finite() {
            debug!("non-finite telemetry, holding safe stop");
            return CarControl::safe_stop(ds.gear);
        }
        ds.window.push(s);

        let (steer, accel, brake) = match &self.predictor {
            // until the history is warm the rules drive the rolling start
            Some(p) if ds.window.is_warm() => {
                let pred = p.predict(&ds.window.features(s));
                (pred.steer, pred.accel, pred.brake)
            }
            _ => self.rule_controls(s, ds),
        };

        let mut ctl = CarControl {
            steer,
            accel,
            brake,
            gear: self.shift(s, ds, tick),
            ..CarControl::default()
        };
        ctl.clamp();
        ds.prev_accel = ctl.accel;
        ctl
    }

    fn rule_controls(&self, s: &CarState, ds: &DriveState) -> (f32, f32, f32) {
        let steer = (s.angle - s.track_pos * self.cfg.track_pos_gain) / self.cfg.steer_lock;

        // rolling backwards in a forward gear, or reverse engaged: brake
        if s.speed_x < 0.0 || ds.gear < 0 {
            return (steer, 0.0, 1.0);
        }

        // the speed reduction below only applies when the threshold
        // classifier says we are actually turning
        let mut turn_sharpness = match steer_direction(s.angle, s.track_pos) {
            SteerDirection::Straight => 0.0,
            SteerDirection::Left | SteerDirection::Right => {
                (steer.abs() + s.track_pos.abs() * 0.3) * self.cfg.curvature_sensitivity
            }
        };

        // scan the beams ahead and lift early for a narrowing track
        let mut curve_factor = 1.0f32;
        if s.track.len() >= self.cfg.look_ahead_beams {
            let min_ahead = s.track[..self.cfg.look_ahead_beams]
                .iter()
                .copied()
                .fold(f32::INFINITY, f32::min);
            if min_ahead < self.cfg.curve_detection_m {
                let f = min_ahead / self.cfg.curve_detection_m;
                curve_factor = f.max(self.cfg.speed_reduction_floor);
                turn_sharpness += (1.0 - f) * 0.3;
            }
        }

        let mut target = if s.speed_x < self.cfg.max_speed_kph {
            curve_factor
        } else {
            0.0
        };
        if turn_sharpness > self.cfg.min_turn_threshold {
            let reduction = turn_sharpness.min(0.6);
            target = (target * (1.0 - reduction)).max(0.4);
        }

        // ramp the throttle instead of stepping it
        let accel = if ds.prev_accel < target {
            (ds.prev_accel + 0.3).min(target)
        } else {
            (ds.prev_accel - 0.2).max(target)
        };
        (steer, accel, 0.0)
    }

    /// Gear state machine: thresholds gated by the shift-interval
    /// hysteresis. Neutral at race start goes straight to first.
    fn shift(&self, s: &CarState, ds: &mut DriveState, tick: u64) -> i8 {
        if ds.gear == 0 {
            ds.gear = 1;
            return ds.gear;
        }
        if ds.gear == -1 {
            if s.speed_x > 0.1 {
                ds.record_shift(1, tick);
            }
            return ds.gear;
        }
        if let Some(last) = ds.last_shift_tick {
            if tick.saturating_sub(last) < self.cfg.shift_interval_ticks {
                return ds.gear;
            }
        }
        if s.rpm > self.cfg.upshift_rpm && ds.gear < MAX_GEAR {
            ds.record_shift(ds.gear + 1, tick);
        } else if s.rpm < self.cfg.downshift_rpm && ds.gear > 1 {
            ds.record_shift(ds.gear - 1, tick);
        }
        ds.gear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cruising(speed_x: f32, angle: f32, track_pos: f32, rpm: f32, gear: i8) -> CarState {
        CarState {
            speed_x,
            angle,
            track_pos,
            rpm,
            gear,
            ..CarState::default()
        }
    }

    fn drive_ticks(
        driver: &Driver,
        state: &CarState,
        ds: &mut DriveState,
        ticks: std::ops::Range<u64>,
    ) -> Vec<CarControl> {
        ticks.map(|t| driver.decide(state, ds, t)).collect()
    }

    #[test]
    fn high_rpm_mid_corner_upshifts_and_accelerates() {
        let driver = Driver::new(DriverConfig::default());
        let mut ds = DriveState::default();
        ds.gear = 3;
        let state = cruising(50.0, 0.10, 0.0, 7000.0, 3);

        let outs = drive_ticks(&driver, &state, &mut ds, 1..6);
        // steer left (positive), upshift to 4 on the first tick, throttle
        // ramps to full, no brake
        assert!(outs[0].steer > 0.0);
        assert_eq!(outs[0].gear, 4);
        assert_eq!(outs.last().unwrap().accel, 1.0);
        assert!(outs.iter().all(|c| c.brake == 0.0));
        // hysteresis holds gear 4 for the rest of the window
        assert!(outs.iter().all(|c| c.gear == 4));
    }

    #[test]
    fn no_upshift_at_or_below_threshold_or_in_top_gear() {
        let driver = Driver::new(DriverConfig::default());

        let mut ds = DriveState::default();
        ds.gear = 3;
        let c = driver.decide(&cruising(50.0, 0.0, 0.0, 6500.0, 3), &mut ds, 1);
        assert_eq!(c.gear, 3);

        let mut ds = DriveState::default();
        ds.gear = MAX_GEAR;
        let c = driver.decide(&cruising(50.0, 0.0, 0.0, 9000.0, 6), &mut ds, 1);
        assert_eq!(c.gear, MAX_GEAR);
    }

    #[test]
    fn consecutive_shifts_respect_the_hysteresis_interval() {
        let cfg = DriverConfig::default();
        let interval = cfg.shift_interval_ticks;
        let driver = Driver::new(cfg);
        let mut ds = DriveState::default();
        let state = cruising(50.0, 0.0, 0.0, 7200.0, 1);

        let mut shift_ticks = Vec::new();
        let mut gear = 1i8;
        for tick in 1..=100 {
            let c = driver.decide(&state, &mut ds, tick);
            if c.gear != gear {
                shift_ticks.push(tick);
                gear = c.gear;
            }
        }
        assert!(shift_ticks.len() >= 2);
        for pair in shift_ticks.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[test]
    fn rolling_backwards_brakes_instead_of_accelerating() {
        let driver = Driver::new(DriverConfig::default());
        let mut ds = DriveState::default();
        ds.gear = 2;
        let c = driver.decide(&cruising(-5.0, 0.0, 0.0, 3500.0, 2), &mut ds, 1);
        assert!(c.brake > 0.0);
        assert_eq!(c.accel, 0.0);
    }

    #[test]
    fn reverse_gear_recovers_to_first_when_moving_forward() {
        let driver = Driver::new(DriverConfig::default());
        let mut ds = DriveState::default();
        ds.gear = -1;
        let c = driver.decide(&cruising(4.0, 0.0, 0.0, 2000.0, -1), &mut ds, 1);
        assert_eq!(c.gear, 1);
    }

    #[test]
    fn non_finite_telemetry_yields_safe_stop() {
        let driver = Driver::new(DriverConfig::default());
        let mut ds = DriveState::default();
        ds.gear = 3;
        let mut state = cruising(50.0, 0.0, 0.0, 5000.0, 3);
        state.angle = f32::NAN;
        let c = driver.decide(&state, &mut ds, 1);
        assert_eq!(c.steer, 0.0);
        assert_eq!(c.accel, 0.0);
        assert_eq!(c.brake, 1.0);
        assert_eq!(c.gear, 3);
    }

    #[test]
    fn pedals_are_never_both_engaged() {
        let driver = Driver::new(DriverConfig::default());
        let mut ds = DriveState::default();
        let mut tick = 0;
        for speed in [-10.0, 0.0, 30.0, 120.0, 250.0] {
            for angle in [-0.4, 0.0, 0.4] {
                tick += 1;
                let c = driver.decide(&cruising(speed, angle, 0.2, 5000.0, 3), &mut ds, tick);
                assert!(!(c.accel > 0.0 && c.brake > 0.0), "speed={speed} angle={angle}");
            }
        }
    }

    #[test]
    fn fresh_drive_state_starts_in_first_gear_with_no_shift_history() {
        let ds = DriveState::default();
        assert_eq!(ds.gear, 1);
        assert!(ds.last_shift_tick.is_none());
    }

    #[test]
    fn rule_steering_agrees_with_the_classification() {
        let driver = Driver::new(DriverConfig::default());
        for (angle, track_pos) in [(0.2, 0.0), (-0.2, 0.0), (0.0, -0.9), (0.0, 0.9)] {
            let mut ds = DriveState::default();
            let c = driver.decide(&cruising(50.0, angle, track_pos, 5000.0, 2), &mut ds, 1);
            match steer_direction(angle, track_pos) {
                SteerDirection::Left => assert!(c.steer > 0.0, "angle={angle} pos={track_pos}"),
                SteerDirection::Right => assert!(c.steer < 0.0, "angle={angle} pos={track_pos}"),
                SteerDirection::Straight => {}
            }
        }
    }

    #[test]
    fn turn_reduction_only_engages_when_actually_turning() {
        let driver = Driver::new(DriverConfig::default());
        let mut ds = DriveState::default();
        ds.gear = 2;
        // off-centre but straight, with the track narrowing ahead: the
        // curve factor sets the target, the corner reduction stays out
        let mut state = cruising(50.0, 0.0, 0.45, 5000.0, 2);
        state.track = vec![10.0; 19];
        let mut last = CarControl::default();
        for tick in 1..=5 {
            last = driver.decide(&state, &mut ds, tick);
        }
        assert!((last.accel - 0.8).abs() < 1e-6);
    }

    #[test]
    fn steering_classification_prefers_angle_over_position() {
        assert_eq!(steer_direction(0.10, 0.0), SteerDirection::Left);
        assert_eq!(steer_direction(-0.10, 0.0), SteerDirection::Right);
        assert_eq!(steer_direction(0.0, -0.9), SteerDirection::Left);
        assert_eq!(steer_direction(0.0, 0.9), SteerDirection::Right);
        assert_eq!(steer_direction(0.0, 0.0), SteerDirection::Straight);
        // disagreement: yaw angle wins
        assert_eq!(steer_direction(0.10, 0.9), SteerDirection::Left);
    }

    struct WildPredictor;
    impl Predictor for WildPredictor {
        fn predict(&self, _f: &Features) -> Prediction {
            Prediction {
                steer: 3.0,
                accel: 2.0,
                brake: 0.5,
            }
        }
    }

    #[test]
    fn predictor_output_is_clamped_and_gear_logic_still_runs() {
        let driver = Driver::with_predictor(DriverConfig::default(), Box::new(WildPredictor));
        let mut ds = DriveState::default();
        ds.gear = 3;
        let state = cruising(50.0, 0.0, 0.0, 7000.0, 3);
        // warm the feature window first
        let mut last = CarControl::default();
        for tick in 1..=6 {
            last = driver.decide(&state, &mut ds, tick);
        }
        assert_eq!(last.steer, 1.0);
        assert_eq!(last.brake, 0.5);
        assert_eq!(last.accel, 0.0); // brake wins
        assert_eq!(last.gear, 4); // upshift fired, hysteresis held it
    }

    #[test]
    fn rules_drive_until_the_feature_window_is_warm() {
        let driver = Driver::with_predictor(DriverConfig::default(), Box::new(WildPredictor));
        let mut ds = DriveState::default();
        let state = cruising(50.0, 0.0, 0.0, 5000.0, 2);
        // four samples: still cold, so the rule throttle ramp is visible
        let c = driver.decide(&state, &mut ds, 1);
        assert!(c.steer < 1.0);
        assert!((c.accel - 0.3).abs() < 1e-6);
    }
}
