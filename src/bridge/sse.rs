//! SSE Login-Event Listener.
//!
//! Keeps a long-lived streaming HTTP connection to the bridge's event stream
//! and watches for the asynchronous login-failure notification the messaging
//! client can raise mid-session (e.g. a kicked session). Frames arrive as
//! Server-Sent-Events: `data:` payload lines terminated by a blank line, with
//! no guarantee a frame fits in one read.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Fixed delay before reconnecting after a stream fault.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Streaming,
    Cancelled,
}

/// Event envelope on the bridge stream. Unknown event types are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BridgeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub message: String,
}

impl BridgeEvent {
    pub fn is_login_failure(&self) -> bool {
        self.kind == "login_failed" || (self.kind == "login" && self.sub_type == "failed")
    }
}

/// Callback contract the UI integration layer provides. The listener makes no
/// assumption about which thread the hook runs its work on; marshalling onto a
/// UI thread is the integration layer's job.
pub trait LoginEventHook: Send + Sync {
    fn on_login_failure(&self, message: &str);
}

pub struct LoginEventListener {
    http: reqwest::Client,
    hook: Arc<dyn LoginEventHook>,
    cancel: CancellationToken,
    state: Arc<Mutex<ListenerState>>,
}

impl LoginEventListener {
    pub fn new(hook: Arc<dyn LoginEventHook>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("llpanel-core/0.1")
            // no request timeout: the event stream is expected to stay open
            .build()
            .expect("HTTP client for event stream");
        Self {
            http,
            hook,
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(ListenerState::Disconnected)),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ListenerState::Disconnected)
    }

    /// Handle for stopping the listener. Cancelling is terminal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: ListenerState) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = state;
        }
    }

    /// Run until cancelled. Stream faults reconnect after a fixed backoff; a
    /// detected login failure invokes the hook once and stops the listener.
    pub async fn run(&self, port: u16) {
        let url = format!("http://127.0.0.1:{}/", port);

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ListenerState::Cancelled);
                return;
            }

            self.set_state(ListenerState::Connecting);
            let response = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ListenerState::Cancelled);
                    return;
                }
                r = self.http.get(&url).header("Accept", "text/event-stream").send() => r,
            };

            match response {
                Ok(response) if response.status().is_success() => {
                    self.set_state(ListenerState::Streaming);
                    if self.stream_events(response).await {
                        // login failure dispatched, one-shot stop
                        self.cancel.cancel();
                        self.set_state(ListenerState::Cancelled);
                        return;
                    }
                    // clean close or fault: fall through to reconnect
                    self.set_state(ListenerState::Disconnected);
                }
                Ok(response) => {
                    tracing::debug!("Event stream rejected: {}", response.status());
                }
                Err(e) => {
                    tracing::trace!("Event stream connect failed: {}", e);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ListenerState::Cancelled);
                    return;
                }
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    /// Consume the stream until it ends. Returns true when a login failure was
    /// dispatched. A trailing partial frame at clean close is discarded; that
    /// is normal stream teardown, not an error.
    async fn stream_events(&self, response: reqwest::Response) -> bool {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                c = stream.next() => c,
            };

            let chunk = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    tracing::debug!("Event stream read failed: {}", e);
                    return false;
                }
                None => return false, // clean close
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));

            for frame in drain_frames(&mut buffer) {
                for payload in data_payloads(&frame) {
                    match serde_json::from_str::<BridgeEvent>(payload) {
                        Ok(event) if event.is_login_failure() => {
                            tracing::warn!("Login failure reported by bridge: {}", event.message);
                            self.hook.on_login_failure(&event.message);
                            return true;
                        }
                        Ok(event) => {
                            tracing::trace!("Bridge event: {}", event.kind);
                        }
                        Err(e) => {
                            tracing::debug!("Unparsable event payload: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Split every complete frame (terminated by a blank line) out of `buffer`,
/// leaving any trailing partial frame in place for the next read.
fn drain_frames(buffer: &mut String) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(idx) = buffer.find("\n\n") {
        let frame = buffer[..idx].to_string();
        buffer.drain(..idx + 2);
        if !frame.trim().is_empty() {
            frames.push(frame);
        }
    }
    frames
}

/// Extract the `data:` payload lines of one frame.
fn data_payloads(frame: &str) -> Vec<&str> {
    frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(chunks: &[&str]) -> Vec<BridgeEvent> {
        let mut buffer = String::new();
        let mut events = Vec::new();
        for chunk in chunks {
            buffer.push_str(&chunk.replace("\r\n", "\n"));
            for frame in drain_frames(&mut buffer) {
                for payload in data_payloads(&frame) {
                    if let Ok(ev) = serde_json::from_str::<BridgeEvent>(payload) {
                        events.push(ev);
                    }
                }
            }
        }
        events
    }

    #[test]
    fn frame_split_across_reads_dispatches_exactly_once() {
        let events = parse_all(&["data: {\"typ", "e\":\"x\"}\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "x");
    }

    #[test]
    fn two_frames_in_one_read() {
        let events = parse_all(&[
            "data: {\"type\":\"a\"}\n\ndata: {\"type\":\"b\"}\n\n",
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "a");
        assert_eq!(events[1].kind, "b");
    }

    #[test]
    fn trailing_partial_frame_is_not_dispatched() {
        let events = parse_all(&["data: {\"type\":\"a\"}\n\ndata: {\"type\":\"tru"]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn crlf_delimiters_are_normalized() {
        let events = parse_all(&["data: {\"type\":\"a\"}\r\n\r\n"]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let events = parse_all(&[
            "event: ping\nid: 7\ndata: {\"type\":\"heartbeat\"}\n\n",
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "heartbeat");
    }

    #[test]
    fn login_failure_detection() {
        let direct: BridgeEvent =
            serde_json::from_str(r#"{"type":"login_failed","message":"kicked"}"#).unwrap();
        assert!(direct.is_login_failure());

        let nested: BridgeEvent =
            serde_json::from_str(r#"{"type":"login","sub_type":"failed"}"#).unwrap();
        assert!(nested.is_login_failure());

        let ok: BridgeEvent = serde_json::from_str(r#"{"type":"login"}"#).unwrap();
        assert!(!ok.is_login_failure());
    }

    struct RecordingHook(Mutex<Vec<String>>);
    impl LoginEventHook for RecordingHook {
        fn on_login_failure(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn cancelled_listener_reports_terminal_state() {
        let hook = Arc::new(RecordingHook(Mutex::new(Vec::new())));
        let listener = Arc::new(LoginEventListener::new(hook.clone()));
        let token = listener.cancellation_token();

        let runner = listener.clone();
        let handle = tokio::spawn(async move { runner.run(1).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("listener stops after cancel")
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Cancelled);
        assert!(hook.0.lock().unwrap().is_empty());
    }
}
