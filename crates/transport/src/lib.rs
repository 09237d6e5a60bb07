//! UDP session with the simulator: handshake, bounded-wait receive, send.

use std::time::Duration;

use pilot_protocol::{classify, ServerMessage};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no handshake ack after {0} attempts")]
    ConnectTimeout(u32),
    #[error("receive timed out")]
    RecvTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub handshake_attempts: u32,
    /// Wait per handshake attempt before resending the identity datagram.
    pub handshake_spacing: Duration,
    /// Bounded wait for each in-race telemetry frame.
    pub recv_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 3001,
            handshake_attempts: 30,
            handshake_spacing: Duration::from_secs(1),
            recv_timeout: Duration::from_millis(500),
        }
    }
}

/// A live connection to one simulator race slot. The socket is released
/// when the session is dropped, on every exit path.
#[derive(Debug)]
pub struct Session {
    socket: UdpSocket,
    recv_timeout: Duration,
}

impl Session {
    /// Send the handshake datagram with fixed spacing until the simulator
    /// acknowledges, up to the configured attempt count.
    pub async fn connect(cfg: &TransportConfig, handshake: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((cfg.host.as_str(), cfg.port)).await?;
        let mut buf = [0u8; MAX_DATAGRAM];

        for attempt in 1..=cfg.handshake_attempts {
            socket.send(handshake.as_bytes()).await?;
            match timeout(cfg.handshake_spacing, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    let reply = String::from_utf8_lossy(&buf[..len]);
                    if classify(&reply) == ServerMessage::Identified {
                        info!(attempt, "identified by simulator");
                        return Ok(Self {
                            socket,
                            recv_timeout: cfg.recv_timeout,
                        });
                    }
                    debug!(%reply, "ignoring non-ack reply during handshake");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if attempt % 5 == 0 {
                        warn!(attempt, "still waiting for simulator ack");
                    }
                }
            }
        }
        Err(TransportError::ConnectTimeout(cfg.handshake_attempts))
    }

    /// Receive one datagram, waiting at most the configured per-tick
    /// timeout. A timeout is soft; the caller decides when a run of them
    /// becomes fatal.
    pub async fn recv(&self) -> Result<String, TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match timeout(self.recv_timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => Ok(String::from_utf8_lossy(&buf[..len]).into_owned()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::RecvTimeout),
        }
    }

    pub async fn send(&self, msg: &str) -> Result<(), TransportError> {
        self.socket.send(msg.as_bytes()).await?;
        Ok(())
    }
}
