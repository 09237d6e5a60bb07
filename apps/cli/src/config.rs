use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use driver::DriverConfig;
use model::DriveMode;
use pilot_transport::TransportConfig;

#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    about = "Keyboard/AI control client for the SCRC racing simulator"
)]
pub struct Opts {
    /// Simulator host.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Simulator UDP port.
    #[arg(long, default_value_t = 3001)]
    pub port: u16,

    /// Bot identity sent in the handshake.
    #[arg(long, default_value = "SCR")]
    pub id: String,

    /// Control source at startup; `m` toggles at runtime.
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    pub mode: ModeArg,

    /// Race stage: 0 warm-up, 1 qualifying, 2 race, 3 unknown.
    #[arg(long, default_value_t = 3)]
    pub stage: u8,

    #[arg(long, default_value_t = 1)]
    pub max_episodes: u32,

    /// Steps per episode before a restart is requested; 0 = unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_steps: u64,

    /// Directory for transient per-session logs.
    #[arg(long, default_value = "results")]
    pub log_dir: PathBuf,

    /// Permanent dataset that promoted sessions append to.
    #[arg(long, default_value = "dataset/drive_log.csv")]
    pub dataset: PathBuf,

    /// What happens to a still-recording session at teardown.
    #[arg(long, value_enum, default_value_t = OnExit::Ask)]
    pub on_exit: OnExit,

    /// JSON weights file; when set, the trained predictor replaces the
    /// threshold rules.
    #[arg(long)]
    pub predictor: Option<PathBuf>,

    #[arg(long, default_value_t = 500)]
    pub recv_timeout_ms: u64,

    /// Consecutive receive timeouts before the session is declared dead;
    /// 0 gives up on the first timeout.
    #[arg(long, default_value_t = 10)]
    pub fatal_timeouts: u32,

    #[arg(long, default_value_t = 30)]
    pub handshake_attempts: u32,

    /// Minimum ticks between automatic gear changes.
    #[arg(long, default_value_t = 20)]
    pub shift_interval: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Manual,
    Auto,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExit {
    Keep,
    Discard,
    Ask,
}

impl Opts {
    pub fn initial_mode(&self) -> DriveMode {
        match self.mode {
            ModeArg::Manual => DriveMode::Manual,
            ModeArg::Auto => DriveMode::Auto,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            handshake_attempts: self.handshake_attempts,
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            ..TransportConfig::default()
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            shift_interval_ticks: self.shift_interval,
            ..DriverConfig::default()
        }
    }
}
