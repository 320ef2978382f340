use bmc_core::{classify_frame, LogFrame, Normalizer};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub use bmc_core::LogEvent;

/// Close code the server uses when the first frame fails authentication.
pub const CLOSE_CODE_AUTH_FAILURE: u16 = 4000;
/// Close code the server uses when it shuts down for a restart.
pub const CLOSE_CODE_SERVER_RESTART: u16 = 1012;

pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct LogStreamConfig {
    pub endpoint: Url,
    pub token: String,
    /// Event channel depth; values below 1 are treated as 1.
    pub channel_capacity: usize,
    pub backoff_step: Duration,
    pub backoff_max: Duration,
}

impl LogStreamConfig {
    pub fn new(endpoint: Url, token: String) -> Self {
        Self {
            endpoint,
            token,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backoff_step: DEFAULT_BACKOFF_STEP,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailure,
    ServerRestart,
    Other,
}

impl CloseReason {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_CODE_AUTH_FAILURE) => Self::AuthFailure,
            Some(CLOSE_CODE_SERVER_RESTART) => Self::ServerRestart,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailure => "auth_failure",
            Self::ServerRestart => "server_restart",
            Self::Other => "other",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Connected,
    AuthOk,
    AuthFailed,
    History(Vec<LogEvent>),
    Event(LogEvent),
    Closed {
        code: Option<u16>,
        reason: CloseReason,
        retry_in: Duration,
    },
}

/// Reconnect delay policy. The failure counter starts one below zero, so the
/// first close after startup or after a successful auth retries instantly and
/// each further close adds one step up to the cap. Every close counts toward
/// the schedule, including ones the server signals deliberately.
#[derive(Clone, Debug)]
pub struct ReconnectSchedule {
    step: Duration,
    max: Duration,
    failures: i32,
}

impl ReconnectSchedule {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            failures: -1,
        }
    }

    pub fn record_auth_success(&mut self) {
        self.failures = -1;
    }

    /// Registers a close and returns how long to wait before reconnecting.
    pub fn record_close(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let steps = self.failures.max(0) as u32;
        self.step.saturating_mul(steps).min(self.max)
    }

    pub fn failures(&self) -> i32 {
        self.failures
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Closed,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        }
    }
}

fn transition(phase: &mut Phase, next: Phase) {
    debug!(event = "log_stream_phase", from = phase.as_str(), to = next.as_str());
    *phase = next;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unsupported console URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("console URL has no host")]
    MissingHost,
    #[error("could not build log endpoint: {0}")]
    Invalid(String),
}

/// Maps a console URL to the log feed endpoint: `http(s)` flips to `ws(s)`,
/// the API mount path is kept and `/logs` is appended.
pub fn resolve_log_endpoint(console_url: &Url, base_path: &str) -> Result<Url, EndpointError> {
    let scheme = match console_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };
    let host = console_url
        .host_str()
        .ok_or(EndpointError::MissingHost)?;
    let authority = match console_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let root = console_url.path().trim_end_matches('/');
    let mount = base_path.trim_matches('/');
    let mount = if mount.is_empty() {
        String::new()
    } else {
        format!("/{mount}")
    };
    let raw = format!("{scheme}://{authority}{root}{mount}/logs");
    Url::parse(&raw).map_err(|err| EndpointError::Invalid(err.to_string()))
}

/// Handle to a running log stream supervisor. Dropping the handle (or calling
/// `stop`) tears down the socket and cancels any pending reconnect.
pub struct LogStream {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LogStream {
    /// Starts the supervisor task. Events arrive on the returned receiver
    /// until the stream is stopped or the receiver is dropped.
    pub fn spawn(config: LogStreamConfig) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(config, events_tx, shutdown_rx));
        (
            Self {
                shutdown: shutdown_tx,
                task,
            },
            events_rx,
        )
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops the supervisor and waits for it to finish.
    pub async fn stopped(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run(
    config: LogStreamConfig,
    events: mpsc::Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut schedule = ReconnectSchedule::new(config.backoff_step, config.backoff_max);
    let mut normalizer = Normalizer::new();
    let mut phase = Phase::Idle;

    info!(event = "log_stream_start", endpoint = %config.endpoint);

    loop {
        if *shutdown.borrow() {
            break;
        }
        transition(&mut phase, Phase::Connecting);

        let connect = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            connect = connect_async(config.endpoint.clone()) => connect,
        };

        let mut ws = match connect {
            Ok((ws, _response)) => ws,
            Err(err) => {
                warn!(event = "log_stream_connect_error", error = %err);
                transition(&mut phase, Phase::Closed);
                if !handle_disconnect(None, &mut schedule, &events, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        if events.send(StreamEvent::Connected).await.is_err() {
            let _ = ws.close(None).await;
            break;
        }

        transition(&mut phase, Phase::Authenticating);
        if ws.send(Message::Text(config.token.clone())).await.is_err() {
            warn!(event = "log_stream_token_send_error");
            let _ = ws.close(None).await;
            transition(&mut phase, Phase::Closed);
            if !handle_disconnect(None, &mut schedule, &events, &mut shutdown).await {
                break;
            }
            continue;
        }

        let outcome = pump(
            &mut ws,
            &events,
            &mut schedule,
            &mut normalizer,
            &mut phase,
            &mut shutdown,
        )
        .await;
        let _ = ws.close(None).await;
        transition(&mut phase, Phase::Closed);

        match outcome {
            PumpOutcome::Shutdown | PumpOutcome::ReceiverGone => break,
            PumpOutcome::Disconnected { code } => {
                if !handle_disconnect(code, &mut schedule, &events, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    info!(event = "log_stream_stop", endpoint = %config.endpoint);
}

enum PumpOutcome {
    Disconnected { code: Option<u16> },
    Shutdown,
    ReceiverGone,
}

async fn pump(
    ws: &mut WsStream,
    events: &mpsc::Sender<StreamEvent>,
    schedule: &mut ReconnectSchedule,
    normalizer: &mut Normalizer,
    phase: &mut Phase,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpOutcome {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return PumpOutcome::Shutdown;
                }
            }
            frame = ws.next() => {
                let Some(frame) = frame else {
                    return PumpOutcome::Disconnected { code: None };
                };
                match frame {
                    Ok(Message::Text(text)) => {
                        match handle_text(&text, events, schedule, normalizer, phase).await {
                            TextOutcome::Continue => {}
                            TextOutcome::ReceiverGone => return PumpOutcome::ReceiverGone,
                        }
                    }
                    Ok(Message::Close(close)) => {
                        let code = close.map(|frame| u16::from(frame.code));
                        return PumpOutcome::Disconnected { code };
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(event = "log_stream_read_error", error = %err);
                        return PumpOutcome::Disconnected { code: None };
                    }
                }
            }
        }
    }
}

enum TextOutcome {
    Continue,
    ReceiverGone,
}

async fn handle_text(
    text: &str,
    events: &mpsc::Sender<StreamEvent>,
    schedule: &mut ReconnectSchedule,
    normalizer: &mut Normalizer,
    phase: &mut Phase,
) -> TextOutcome {
    let frame = match classify_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(event = "log_stream_bad_frame", error = %err);
            return TextOutcome::Continue;
        }
    };

    let event = match frame {
        LogFrame::AuthResult { success: true } => {
            schedule.record_auth_success();
            transition(phase, Phase::Streaming);
            info!(event = "log_stream_auth_ok");
            StreamEvent::AuthOk
        }
        LogFrame::AuthResult { success: false } => {
            warn!(event = "log_stream_auth_rejected");
            StreamEvent::AuthFailed
        }
        LogFrame::HistoryBatch(batch) => {
            if *phase != Phase::Streaming {
                debug!(event = "log_stream_frame_before_auth");
                return TextOutcome::Continue;
            }
            StreamEvent::History(normalizer.normalize_batch(batch))
        }
        LogFrame::SingleEvent(raw) => {
            if *phase != Phase::Streaming {
                debug!(event = "log_stream_frame_before_auth");
                return TextOutcome::Continue;
            }
            StreamEvent::Event(normalizer.normalize(raw))
        }
    };

    if events.send(event).await.is_err() {
        return TextOutcome::ReceiverGone;
    }
    TextOutcome::Continue
}

/// Emits the close event and waits out the retry delay. Returns false when
/// the supervisor should stop instead of reconnecting.
async fn handle_disconnect(
    code: Option<u16>,
    schedule: &mut ReconnectSchedule,
    events: &mpsc::Sender<StreamEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let reason = CloseReason::from_code(code);
    match reason {
        CloseReason::AuthFailure => {
            warn!(event = "log_stream_close", reason = reason.as_str(), code = ?code);
        }
        CloseReason::ServerRestart => {
            info!(event = "log_stream_close", reason = reason.as_str(), code = ?code);
        }
        CloseReason::Other => {
            debug!(event = "log_stream_close", reason = reason.as_str(), code = ?code);
        }
    }

    let retry_in = schedule.record_close();
    if events
        .send(StreamEvent::Closed {
            code,
            reason,
            retry_in,
        })
        .await
        .is_err()
    {
        return false;
    }
    wait_or_shutdown(retry_in, shutdown).await
}

async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        changed = shutdown.changed() => {
            !(changed.is_err() || *shutdown.borrow())
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_close_after_start_retries_instantly() {
        let mut schedule =
            ReconnectSchedule::new(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(schedule.record_close(), Duration::ZERO);
        assert_eq!(schedule.record_close(), Duration::from_secs(5));
        assert_eq!(schedule.record_close(), Duration::from_secs(10));
    }

    #[test]
    fn delay_caps_at_the_maximum() {
        let mut schedule =
            ReconnectSchedule::new(Duration::from_secs(5), Duration::from_secs(30));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = schedule.record_close();
        }
        assert_eq!(last, Duration::from_secs(30));
        assert_eq!(schedule.failures(), 9);
    }

    #[test]
    fn auth_success_resets_the_failure_counter() {
        let mut schedule =
            ReconnectSchedule::new(Duration::from_secs(5), Duration::from_secs(30));
        for _ in 0..4 {
            schedule.record_close();
        }
        schedule.record_auth_success();
        assert_eq!(schedule.record_close(), Duration::ZERO);
        assert_eq!(schedule.record_close(), Duration::from_secs(5));
    }

    #[test]
    fn close_codes_map_to_reasons() {
        assert_eq!(CloseReason::from_code(Some(4000)), CloseReason::AuthFailure);
        assert_eq!(CloseReason::from_code(Some(1012)), CloseReason::ServerRestart);
        assert_eq!(CloseReason::from_code(Some(1000)), CloseReason::Other);
        assert_eq!(CloseReason::from_code(None), CloseReason::Other);
    }

    #[test]
    fn endpoint_keeps_mount_and_appends_logs() {
        let console = Url::parse("https://console.example.com").expect("url");
        let endpoint = resolve_log_endpoint(&console, "/_matrix/maubot/v1").expect("endpoint");
        assert_eq!(
            endpoint.as_str(),
            "wss://console.example.com/_matrix/maubot/v1/logs"
        );
    }

    #[test]
    fn plain_http_maps_to_plain_ws_with_port() {
        let console = Url::parse("http://localhost:29316").expect("url");
        let endpoint = resolve_log_endpoint(&console, "/_matrix/maubot/v1").expect("endpoint");
        assert_eq!(
            endpoint.as_str(),
            "ws://localhost:29316/_matrix/maubot/v1/logs"
        );
    }

    #[test]
    fn console_path_prefix_survives_resolution() {
        let console = Url::parse("https://example.com/maubot/").expect("url");
        let endpoint = resolve_log_endpoint(&console, "/_matrix/maubot/v1").expect("endpoint");
        assert_eq!(
            endpoint.as_str(),
            "wss://example.com/maubot/_matrix/maubot/v1/logs"
        );
    }

    #[test]
    fn ws_scheme_passes_through_and_file_scheme_is_rejected() {
        let console = Url::parse("ws://example.com").expect("url");
        let endpoint = resolve_log_endpoint(&console, "").expect("endpoint");
        assert_eq!(endpoint.as_str(), "ws://example.com/logs");

        let bad = Url::parse("file:///tmp/x").expect("url");
        assert!(matches!(
            resolve_log_endpoint(&bad, ""),
            Err(EndpointError::UnsupportedScheme(_))
        ));
    }
}
