//! The tick loop: receive telemetry, arbitrate the control source, send
//! exactly one action per decoded frame, feed the logger.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use driver::{DriveState, Driver, LinearPredictor};
use model::{CarControl, DriveMode, LogRecord, Stage};
use pilot_io::{Promote, SessionLog};
use pilot_protocol::{
    classify, decode_telemetry, default_rangefinder_angles, encode_action, encode_handshake,
    ServerMessage,
};
use pilot_transport::{Session, TransportError};
use tracing::{error, info, warn};

use crate::config::{OnExit, Opts};
use crate::input::{Arbiter, Commands, InputListener};

/// Why a racing episode stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeEnd {
    /// Simulator sent the shutdown sentinel.
    Shutdown,
    /// Simulator restarted the race; the client may re-handshake.
    Restart,
    /// Operator requested quit.
    Quit,
    /// Too many consecutive receive timeouts.
    Stalled,
}

/// Escalates a run of soft receive timeouts into a fatal stall.
pub struct StallTracker {
    consecutive: u32,
    fatal: u32,
}

impl StallTracker {
    pub fn new(fatal: u32) -> Self {
        Self {
            consecutive: 0,
            fatal,
        }
    }

    /// Note one timeout; true once the threshold is reached. A threshold
    /// of zero tolerates no timeouts at all.
    pub fn note_timeout(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.fatal
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

fn build_driver(opts: &Opts) -> Result<Driver> {
    let cfg = opts.driver_config();
    match &opts.predictor {
        Some(path) => {
            let predictor = LinearPredictor::from_json_file(path)
                .with_context(|| format!("load predictor {}", path.display()))?;
            info!(path = %path.display(), "trained predictor loaded");
            Ok(Driver::with_predictor(cfg, Box::new(predictor)))
        }
        None => Ok(Driver::new(cfg)),
    }
}

/// Resolve the promote/discard decision for a log that is still recording
/// at teardown. Runs after raw mode is restored; an unreadable answer
/// means discard.
fn exit_promote(on_exit: OnExit, dataset: &Path) -> Promote {
    match on_exit {
        OnExit::Keep => Promote::Into(dataset.to_owned()),
        OnExit::Discard => Promote::Discard,
        OnExit::Ask => {
            print!("Keep the recorded session? [y/N] ");
            let _ = std::io::stdout().flush();
            let mut answer = String::new();
            match std::io::stdin().read_line(&mut answer) {
                Ok(_) if answer.trim().eq_ignore_ascii_case("y") => {
                    Promote::Into(dataset.to_owned())
                }
                _ => Promote::Discard,
            }
        }
    }
}

struct Race<'a> {
    opts: &'a Opts,
    driver: &'a Driver,
    arbiter: &'a mut Arbiter,
    drive_state: DriveState,
    stalls: StallTracker,
    tick: u64,
    malformed: u64,
    log: Option<SessionLog>,
}

impl<'a> Race<'a> {
    fn new(opts: &'a Opts, driver: &'a Driver, arbiter: &'a mut Arbiter) -> Self {
        Self {
            opts,
            driver,
            arbiter,
            drive_state: DriveState::default(),
            stalls: StallTracker::new(opts.fatal_timeouts),
            tick: 0,
            malformed: 0,
            log: None,
        }
    }

    fn open_log(&mut self) {
        match SessionLog::start(&self.opts.log_dir) {
            Ok(log) => self.log = Some(log),
            Err(e) => warn!(error = %e, "could not start logging session"),
        }
    }

    /// The operator stopped recording deliberately, so the rows are kept.
    fn close_log(&mut self) {
        if let Some(log) = self.log.take() {
            match log.finish(Promote::Into(self.opts.dataset.clone())) {
                Ok(summary) => info!(
                    rows = summary.rows,
                    dropped = summary.dropped,
                    "recording stopped"
                ),
                Err(e) => warn!(error = %e, "failed to promote session rows"),
            }
        }
    }

    /// Drain the operator channel once and act on the session commands.
    /// Runs on every loop pass, including stalled and malformed ones, so
    /// a quit never waits on telemetry.
    fn handle_input(&mut self) -> Commands {
        let cmds = self.arbiter.poll();
        if cmds.log_start && self.log.is_none() {
            self.open_log();
        }
        if cmds.log_stop {
            self.close_log();
        }
        cmds
    }

    async fn run(&mut self, session: &Session) -> Result<EpisodeEnd> {
        loop {
            let msg = match session.recv().await {
                Ok(msg) => {
                    self.stalls.reset();
                    msg
                }
                Err(TransportError::RecvTimeout) => {
                    if self.handle_input().quit {
                        return Ok(EpisodeEnd::Quit);
                    }
                    if self.stalls.note_timeout() {
                        return Ok(EpisodeEnd::Stalled);
                    }
                    if self.stalls.consecutive() % 3 == 0 {
                        warn!(
                            timeouts = self.stalls.consecutive(),
                            "no telemetry from simulator"
                        );
                    }
                    continue;
                }
                Err(e) => return Err(e).context("receive telemetry"),
            };

            match classify(&msg) {
                ServerMessage::Shutdown => return Ok(EpisodeEnd::Shutdown),
                ServerMessage::Restart => return Ok(EpisodeEnd::Restart),
                ServerMessage::Identified => continue, // duplicate ack
                ServerMessage::Telemetry => {}
            }

            let state = match decode_telemetry(&msg) {
                Ok(state) => state,
                Err(e) => {
                    self.malformed += 1;
                    warn!(error = %e, "skipping malformed frame");
                    if self.handle_input().quit {
                        return Ok(EpisodeEnd::Quit);
                    }
                    continue;
                }
            };

            if self.handle_input().quit {
                return Ok(EpisodeEnd::Quit);
            }

            self.tick += 1;
            let control = self.next_control(&state);
            session
                .send(&encode_action(&control))
                .await
                .context("send action")?;

            if let Some(log) = self.log.as_mut() {
                log.append(&LogRecord::new(
                    self.tick,
                    pilot_io::wall_clock(),
                    &state,
                    &control,
                ));
            }
        }
    }

    fn next_control(&mut self, state: &model::CarState) -> CarControl {
        if self.opts.max_steps > 0 && self.tick >= self.opts.max_steps {
            // step budget exhausted: ask the simulator to restart
            return CarControl {
                meta: 1,
                ..CarControl::default()
            };
        }
        match self.arbiter.mode() {
            DriveMode::Manual => self.arbiter.manual_action(),
            DriveMode::Auto => self.driver.decide(state, &mut self.drive_state, self.tick),
        }
    }
}

pub async fn run(opts: Opts) -> Result<()> {
    let driver = build_driver(&opts)?;
    let (tx, rx) = bounded(64);
    let listener = InputListener::spawn(tx).context("start keyboard listener")?;
    let mut arbiter = Arbiter::new(rx, opts.initial_mode());

    let handshake = encode_handshake(&opts.id, &default_rangefinder_angles());
    let transport_cfg = opts.transport_config();
    let mut open_log = None;
    let mut outcome = Ok(());

    for episode in 1..=opts.max_episodes {
        info!(episode, stage = ?Stage::from(opts.stage), host = %opts.host, port = opts.port, "connecting");
        let session = match Session::connect(&transport_cfg, &handshake).await {
            Ok(s) => s,
            Err(TransportError::ConnectTimeout(attempts)) => {
                error!(attempts, "simulator not responding");
                break;
            }
            Err(e) => {
                outcome = Err(e).context("connect");
                break;
            }
        };

        let mut race = Race::new(&opts, &driver, &mut arbiter);
        let end = race.run(&session).await;
        open_log = race.log.take();
        match end {
            Ok(EpisodeEnd::Restart) => {
                info!(episode, "race restarted");
                // rows recorded so far are real data; keep them and start
                // the next episode with a fresh transient file
                if let Some(log) = open_log.take() {
                    match log.finish(Promote::Into(opts.dataset.clone())) {
                        Ok(summary) => info!(rows = summary.rows, "episode rows promoted"),
                        Err(e) => warn!(error = %e, "failed to promote episode rows"),
                    }
                }
            }
            Ok(EpisodeEnd::Shutdown) => {
                info!("race ended");
                break;
            }
            Ok(EpisodeEnd::Quit) => {
                info!("quit requested");
                break;
            }
            Ok(EpisodeEnd::Stalled) => {
                error!(
                    timeouts = opts.fatal_timeouts,
                    "simulator not responding, terminating session"
                );
                break;
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    // restore the terminal before any interactive prompt
    listener.stop();
    if let Some(log) = open_log {
        finish_with_exit_decision(log, &opts);
    }
    outcome
}

fn finish_with_exit_decision(log: SessionLog, opts: &Opts) {
    let decision = exit_promote(opts.on_exit, &opts.dataset);
    match log.finish(decision) {
        Ok(summary) => info!(
            rows = summary.rows,
            dropped = summary.dropped,
            promoted = summary.promoted.is_some(),
            "logging session closed"
        ),
        Err(e) => warn!(error = %e, "failed to close logging session"),
    }
}
