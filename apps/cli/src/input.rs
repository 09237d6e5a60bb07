//! Keyboard capture and the input arbiter.
//!
//! A dedicated thread reads raw-mode key events and forwards them over a
//! bounded channel; the control loop drains the channel once per tick
//! without blocking. The arbiter is the sole writer of the drive mode, the
//! logging flag and the manual action state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use model::{CarControl, DriveMode, MAX_GEAR, MIN_GEAR};
use tracing::info;

/// Per-press axis increment, matching the original manual driver.
const AXIS_STEP: f32 = 0.1;
/// Per-tick decay toward neutral for an axis with no key held.
const AXIS_DECAY: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    ModeToggle,
    LogStart,
    LogStop,
    Quit,
    GearUp,
    GearDown,
    Throttle,
    Brake,
    SteerLeft,
    SteerRight,
}

fn map_key(key: KeyEvent) -> Option<InputEvent> {
    let press = key.kind == KeyEventKind::Press;
    let held = matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat);
    match key.code {
        // axes ramp while the key repeats
        KeyCode::Up if held => Some(InputEvent::Throttle),
        KeyCode::Down if held => Some(InputEvent::Brake),
        KeyCode::Left if held => Some(InputEvent::SteerLeft),
        KeyCode::Right if held => Some(InputEvent::SteerRight),
        // toggles fire once per press edge
        KeyCode::Char('m') if press => Some(InputEvent::ModeToggle),
        KeyCode::Char('l') if press => Some(InputEvent::LogStart),
        KeyCode::Char('o') if press => Some(InputEvent::LogStop),
        KeyCode::Char('z') if press => Some(InputEvent::GearUp),
        KeyCode::Char('x') if press => Some(InputEvent::GearDown),
        KeyCode::Esc if press => Some(InputEvent::Quit),
        KeyCode::Char('q') if press => Some(InputEvent::Quit),
        KeyCode::Char('c') if press && key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(InputEvent::Quit)
        }
        _ => None,
    }
}

/// Raw-mode keyboard listener on its own thread. Raw mode is restored when
/// the listener is stopped or dropped.
pub struct InputListener {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputListener {
    pub fn spawn(tx: Sender<InputEvent>) -> Result<Self> {
        enable_raw_mode()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                match event::poll(Duration::from_millis(50)) {
                    Ok(true) => {
                        if let Ok(Event::Key(key)) = event::read() {
                            if let Some(ev) = map_key(key) {
                                // a full queue drops the event rather than
                                // stalling the terminal thread
                                let _ = tx.try_send(ev);
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(_) => break,
                }
            }
        });
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            let _ = disable_raw_mode();
        }
    }
}

impl Drop for InputListener {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Session commands surfaced by one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Commands {
    pub quit: bool,
    pub log_start: bool,
    pub log_stop: bool,
}

#[derive(Default)]
struct Touched {
    steer: bool,
    accel: bool,
    brake: bool,
}

fn toward_zero(v: f32, step: f32) -> f32 {
    if v > step {
        v - step
    } else if v < -step {
        v + step
    } else {
        0.0
    }
}

/// Resolves which control source is authoritative and accumulates the
/// manual action state.
pub struct Arbiter {
    rx: Receiver<InputEvent>,
    mode: DriveMode,
    logging: bool,
    manual: CarControl,
}

impl Arbiter {
    pub fn new(rx: Receiver<InputEvent>, mode: DriveMode) -> Self {
        Self {
            rx,
            mode,
            logging: false,
            manual: CarControl::default(),
        }
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Latest accumulated manual action, already clamped.
    pub fn manual_action(&self) -> CarControl {
        let mut c = self.manual.clone();
        c.clamp();
        c
    }

    /// Drain all pending events without blocking, then decay untouched
    /// axes toward neutral. Called once per control-loop pass, whether or
    /// not that pass produced telemetry.
    pub fn poll(&mut self) -> Commands {
        let mut cmds = Commands::default();
        let mut touched = Touched::default();
        while let Ok(ev) = self.rx.try_recv() {
            match ev {
                InputEvent::ModeToggle => {
                    self.mode = self.mode.toggled();
                    info!(mode = ?self.mode, "drive mode switched");
                }
                InputEvent::LogStart => {
                    if !self.logging {
                        self.logging = true;
                        cmds.log_start = true;
                    }
                }
                InputEvent::LogStop => {
                    if self.logging {
                        self.logging = false;
                        cmds.log_stop = true;
                    }
                }
                InputEvent::Quit => cmds.quit = true,
                InputEvent::GearUp => {
                    self.manual.gear = (self.manual.gear + 1).min(MAX_GEAR);
                }
                InputEvent::GearDown => {
                    self.manual.gear = (self.manual.gear - 1).max(MIN_GEAR);
                }
                InputEvent::Throttle => {
                    self.manual.accel = (self.manual.accel + AXIS_STEP).min(1.0);
                    self.manual.brake = 0.0;
                    touched.accel = true;
                }
                InputEvent::Brake => {
                    self.manual.brake = (self.manual.brake + AXIS_STEP).min(1.0);
                    self.manual.accel = 0.0;
                    touched.brake = true;
                }
                InputEvent::SteerLeft => {
                    self.manual.steer = (self.manual.steer + AXIS_STEP).min(1.0);
                    touched.steer = true;
                }
                InputEvent::SteerRight => {
                    self.manual.steer = (self.manual.steer - AXIS_STEP).max(-1.0);
                    touched.steer = true;
                }
            }
        }
        if !touched.steer {
            self.manual.steer = toward_zero(self.manual.steer, AXIS_DECAY);
        }
        if !touched.accel {
            self.manual.accel = toward_zero(self.manual.accel, AXIS_DECAY);
        }
        if !touched.brake {
            self.manual.brake = toward_zero(self.manual.brake, AXIS_DECAY);
        }
        cmds
    }
}
