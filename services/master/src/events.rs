//! Dashboard event feed.
//!
//! Events are serialized as JSON objects tagged by `type` and framed as a
//! 4-byte big-endian length followed by the UTF-8 payload.  Delivery is
//! ordered and reliable while the consumer is connected, and lossy
//! otherwise: the hot path hands events to a bounded queue with `try_send`
//! (a full queue drops the event), and while the consumer is away incoming
//! events are discarded rather than queued.  Reconnect attempts run every
//! 10 seconds.

use crate::config::{DashboardConfig, DashboardTransport};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Reconnect interval while the dashboard consumer is unreachable.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    RepeaterConnected {
        repeater_id: u32,
        callsign: String,
        address: String,
        timestamp: String,
    },
    RepeaterDetails {
        repeater_id: u32,
        callsign: String,
        location: String,
        description: String,
        rx_freq: String,
        tx_freq: String,
        color_code: String,
        slots: String,
        software_id: String,
        url: String,
        timestamp: String,
    },
    RepeaterDisconnected {
        repeater_id: u32,
        reason: String,
        timestamp: String,
    },
    StreamStart {
        repeater_id: u32,
        slot: u8,
        stream_id: u32,
        rf_src: u32,
        dst_id: u32,
        call_type: String,
        timestamp: String,
    },
    StreamUpdate {
        repeater_id: u32,
        slot: u8,
        stream_id: u32,
        rf_src: u32,
        dst_id: u32,
        packet_count: u64,
        duration_secs: f64,
    },
    StreamEnd {
        repeater_id: u32,
        slot: u8,
        stream_id: u32,
        rf_src: u32,
        dst_id: u32,
        duration_secs: f64,
        packet_count: u64,
        reason: String,
        hang_time_secs: f64,
        timestamp: String,
    },
    HangTimeExpired {
        repeater_id: u32,
        slot: u8,
        stream_id: u32,
    },
    OutboundConnected {
        name: String,
        remote: String,
        our_id: u32,
        timestamp: String,
    },
    OutboundDisconnected {
        name: String,
        reason: String,
        timestamp: String,
    },
    OutboundError {
        name: String,
        error: String,
        timestamp: String,
    },
}

/// Wall-clock timestamp for event records.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Frame one event: 4-byte big-endian length + JSON bytes.
pub fn frame_event(event: &DashboardEvent) -> Vec<u8> {
    let json = serde_json::to_vec(event).expect("event serialization is infallible");
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&u32::try_from(json.len()).expect("event fits in u32").to_be_bytes());
    out.extend_from_slice(&json);
    out
}

// ---------------------------------------------------------------------------
// Emitter handle
// ---------------------------------------------------------------------------

/// Cheap clonable handle used by the hot path.  `emit` never blocks.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<DashboardEvent>>,
}

impl EventEmitter {
    /// An emitter that discards everything (dashboard not configured).
    pub fn disabled() -> Self {
        EventEmitter { tx: None }
    }

    pub fn emit(&self, event: DashboardEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                debug!("dashboard queue full; event dropped");
            }
        }
    }
}

/// Spawn the writer task for a configured dashboard endpoint.
pub fn spawn(cfg: DashboardConfig) -> (EventEmitter, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(cfg.buffer_size);
    let handle = tokio::spawn(writer_loop(cfg, rx));
    (EventEmitter { tx: Some(tx) }, handle)
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

enum DashStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl DashStream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            DashStream::Unix(s) => s.write_all(buf).await,
            DashStream::Tcp(s) => s.write_all(buf).await,
        }
    }
}

async fn connect(transport: &DashboardTransport) -> std::io::Result<DashStream> {
    match transport {
        DashboardTransport::Unix { socket_path } => {
            Ok(DashStream::Unix(UnixStream::connect(socket_path).await?))
        }
        DashboardTransport::Tcp {
            host_ipv4,
            host_ipv6,
            port,
        } => {
            match TcpStream::connect((host_ipv4.as_str(), *port)).await {
                Ok(s) => Ok(DashStream::Tcp(s)),
                Err(v4_err) => match host_ipv6 {
                    Some(host) => Ok(DashStream::Tcp(
                        TcpStream::connect((host.as_str(), *port)).await?,
                    )),
                    None => Err(v4_err),
                },
            }
        }
    }
}

async fn writer_loop(cfg: DashboardConfig, mut rx: mpsc::Receiver<DashboardEvent>) {
    loop {
        match connect(&cfg.transport).await {
            Ok(mut stream) => {
                info!("dashboard consumer connected");
                while let Some(event) = rx.recv().await {
                    if let Err(e) = stream.write_all(&frame_event(&event)).await {
                        warn!(error = %e, "dashboard write failed; reconnecting");
                        break;
                    }
                }
                if rx.is_closed() && rx.is_empty() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "dashboard connect failed");
            }
        }

        // Disconnected: discard events until the next connect attempt so the
        // queue never serves stale history to a reconnecting consumer.
        let deadline = sleep(RECONNECT_INTERVAL);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                event = rx.recv() => {
                    if event.is_none() {
                        return;
                    }
                }
            }
        }
    }
}
