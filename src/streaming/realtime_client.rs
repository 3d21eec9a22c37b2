//! Realtime transcription client
//!
//! Owns one logical transcription session: task creation, the live channel,
//! audio framing and queueing, inbound decoding, reconnection and shutdown.
//!
//! # Connection Flow
//!
//! 1. `create_task()` - `POST /sessions`, then open the join address (or
//!    enter degraded mode when none is returned)
//! 2. channel open - send `StartTranscription`, flush queued audio
//! 3. `send_audio()` - frame and send, or queue until the channel is ready
//! 4. `stop()` - `StopTranscription`, grace period, close, `POST .../complete`
//!
//! # Concurrency
//!
//! All session state lives in a single worker task. `RealtimeClient` is a
//! handle that sends it commands, so message handling, audio sends and
//! reconnection never interleave.
//!
//! # Retry Strategy
//!
//! Unexpected closes reconnect to the same join address up to
//! `max_reconnect_attempts` times per session; attempt `n` waits `n` base
//! delays.

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::audio_buffer::{frame_audio, OutboundQueue};
use super::polling::PollCursor;
use super::protocol::{decode, ClientMessage, DecodeError, ProtocolEvent};
use super::transcript_tracker::TranscriptTracker;
use super::StreamingError;
use crate::backend::BackendClient;
use crate::config::ClientConfig;
use crate::events::{emit, event_channel, EventReceiver, EventSender, SessionEvent};
use crate::state_machine::{reduce, Effect, Event, ReconnectPolicy, SessionState, SessionStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = BoxFuture<'static, Result<WsStream, StreamingError>>;

/// Snapshot of one transcription session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Caller-assigned, stable for the session's lifetime
    pub session_id: String,
    /// Assigned once by task creation
    pub backend_session_id: Option<String>,
    pub task_id: Option<String>,
    /// Live channel address; `None` after task creation means degraded mode
    pub join_url: Option<String>,
    pub status: SessionStatus,
    /// Latest non-final hypothesis, cleared on sentence boundaries and stop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interim_text: Option<String>,
}

impl Session {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            backend_session_id: None,
            task_id: None,
            join_url: None,
            status: SessionStatus::Created,
            interim_text: None,
        }
    }

    /// Task exists but there is no live channel to use.
    pub fn is_degraded(&self) -> bool {
        self.backend_session_id.is_some() && self.join_url.is_none()
    }
}

enum Command {
    CreateTask {
        topic: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    SendAudio(Vec<u8>),
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a realtime transcription session.
///
/// Dropping every handle abandons the session without notifying the backend.
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    session: watch::Receiver<Session>,
    connect_timeout: Duration,
}

impl RealtimeClient {
    /// Spawn the session worker. Must be called inside a Tokio runtime.
    ///
    /// Returns the handle and the receiver for this session's events.
    pub fn spawn(
        session_id: impl Into<String>,
        config: ClientConfig,
        backend: BackendClient,
    ) -> (Self, EventReceiver) {
        let session_id = session_id.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = watch::channel(Session::new(session_id.clone()));
        let (events_tx, events_rx) = event_channel();

        let connect_timeout = config.connect_timeout();
        let worker = Worker::new(session_id, config, backend, commands_rx, session_tx, events_tx);
        tokio::spawn(worker.run());

        (
            Self {
                commands: commands_tx,
                session: session_rx,
                connect_timeout,
            },
            events_rx,
        )
    }

    /// Create the backend task and start connecting.
    ///
    /// Returns false when creation failed; the session is then in `error`
    /// and an error event has been emitted.
    pub async fn create_task(&self, topic: Option<&str>) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::CreateTask {
            topic: topic.map(str::to_string),
            reply,
        };
        if self.commands.send(command).is_err() {
            log::warn!("RealtimeClient: create_task on a finished session");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Wait until the session can transcribe.
    ///
    /// True once the live channel reaches `transcribing`, or right away in
    /// degraded mode. False on `error`/`stopped` or after the connect timeout.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.clone();
        let ready = session.wait_for(|s| match s.status {
            SessionStatus::Transcribing | SessionStatus::Error | SessionStatus::Stopped => true,
            SessionStatus::Connected => s.join_url.is_none(),
            _ => false,
        });

        let ready = match timeout(self.connect_timeout, ready).await {
            Ok(Ok(s)) => matches!(
                s.status,
                SessionStatus::Transcribing | SessionStatus::Connected
            ),
            Ok(Err(_)) => false,
            Err(_) => {
                log::warn!(
                    "RealtimeClient: channel not ready after {:?}",
                    self.connect_timeout
                );
                false
            }
        };
        ready
    }

    /// Submit audio. Never blocks and never fails; see the worker for routing.
    pub fn send_audio(&self, buffer: Vec<u8>) {
        if self.commands.send(Command::SendAudio(buffer)).is_err() {
            log::debug!("RealtimeClient: dropping audio for finished session");
        }
    }

    /// Stop the session. Idempotent and infallible.
    ///
    /// Returns once the backend has been told the session is complete; the
    /// channel itself closes after the grace period.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session.borrow().status
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    /// Current interim hypothesis, if one is live.
    pub fn interim_text(&self) -> Option<String> {
        self.session.borrow().interim_text.clone()
    }
}

struct Worker {
    config: ClientConfig,
    policy: ReconnectPolicy,
    backend: BackendClient,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    abandoned: bool,
    session: Session,
    session_tx: watch::Sender<Session>,
    events: EventSender,
    state: SessionState,
    queue: OutboundQueue,
    tracker: TranscriptTracker,
    sink: Option<SplitSink<WsStream, Message>>,
    stream: Option<SplitStream<WsStream>>,
    connecting: Option<ConnectFuture>,
    channel_lost: bool,
    reconnect_at: Option<Instant>,
    close_at: Option<Instant>,
    poll: Option<Interval>,
    cursor: PollCursor,
    shape_error_reported: bool,
    frames_sent: u64,
}

impl Worker {
    fn new(
        session_id: String,
        config: ClientConfig,
        backend: BackendClient,
        commands: mpsc::UnboundedReceiver<Command>,
        session_tx: watch::Sender<Session>,
        events: EventSender,
    ) -> Self {
        let policy = ReconnectPolicy {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
        };

        Self {
            config,
            policy,
            backend,
            commands,
            commands_closed: false,
            abandoned: false,
            tracker: TranscriptTracker::new(session_id.clone()),
            session: Session::new(session_id),
            session_tx,
            events,
            state: SessionState::default(),
            queue: OutboundQueue::new(),
            sink: None,
            stream: None,
            connecting: None,
            channel_lost: false,
            reconnect_at: None,
            close_at: None,
            poll: None,
            cursor: PollCursor::new(),
            shape_error_reported: false,
            frames_sent: 0,
        }
    }

    async fn run(mut self) {
        log::debug!("RealtimeClient: worker started for {}", self.session.session_id);

        loop {
            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.on_handles_dropped(),
                },
                result = finish_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result).await;
                }
                frame = next_frame(&mut self.stream) => self.on_frame(frame).await,
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.begin_connect();
                }
                _ = tick(&mut self.poll) => self.poll_results().await,
                _ = sleep_until_opt(self.close_at) => {
                    self.close_at = None;
                    self.close_socket().await;
                }
            }

            if std::mem::take(&mut self.channel_lost) {
                self.dispatch(Event::ChannelClosed).await;
                if self.state.status == SessionStatus::Stopped {
                    self.close_at = None;
                } else if self.reconnect_at.is_none() {
                    log::warn!(
                        "RealtimeClient: reconnection attempts exhausted for {}",
                        self.session.session_id
                    );
                }
            }

            if self.is_finished() {
                break;
            }
        }

        self.close_socket().await;
        log::debug!(
            "RealtimeClient: worker for {} exiting ({} frames sent)",
            self.session.session_id,
            self.frames_sent
        );
    }

    fn is_finished(&self) -> bool {
        self.abandoned || (self.state.status.is_terminal() && self.close_at.is_none())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateTask { topic, reply } => {
                let created = self.create_task(topic).await;
                let _ = reply.send(created);
            }
            Command::SendAudio(buffer) => self.on_audio(buffer).await,
            Command::Stop { reply } => {
                self.dispatch(Event::Stop).await;
                let _ = reply.send(());
            }
        }
    }

    fn on_handles_dropped(&mut self) {
        self.commands_closed = true;
        if !self.state.status.is_terminal() {
            log::info!(
                "RealtimeClient: session {} discarded without stop",
                self.session.session_id
            );
            self.abandoned = true;
        }
    }

    /// Run one event through the reducer and execute its effects.
    async fn dispatch(&mut self, event: Event) {
        let (next, effects) = reduce(&self.state, event, &self.policy);

        if next.status != self.state.status {
            log::info!(
                "RealtimeClient: {} -> {}",
                self.state.status,
                next.status
            );
        }
        self.state = next;

        for effect in effects {
            self.run_effect(effect).await;
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::EmitStatus => {
                self.publish();
                emit(&self.events, SessionEvent::Status(self.state.status));
            }
            Effect::ReportError(message) => emit(&self.events, SessionEvent::Error(message)),
            Effect::OpenChannel => self.begin_connect(),
            Effect::StartPolling => self.start_polling().await,
            Effect::SendStartCommand => {
                let start = ClientMessage::start_transcription(self.session.task_id.as_deref());
                if let Err(e) = self.send_control(&start).await {
                    log::warn!("RealtimeClient: {}", e);
                    self.lose_channel();
                }
            }
            Effect::FlushQueue => self.flush_queue().await,
            Effect::ScheduleReconnect { attempt, delay } => {
                log::info!(
                    "RealtimeClient: reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    self.policy.max_attempts
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Effect::CloseChannel => {
                self.connecting = None;
                self.reconnect_at = None;
                self.poll = None;
                self.tracker.clear_interim();
                self.publish();

                if self.sink.is_some() {
                    let stop = ClientMessage::stop_transcription(self.session.task_id.as_deref());
                    if let Err(e) = self.send_control(&stop).await {
                        log::warn!("RealtimeClient: stop command not delivered: {}", e);
                    }
                    self.close_at = Some(Instant::now() + self.config.stop_grace());
                }
            }
            Effect::CompleteSession => {
                if let Some(id) = self.session.backend_session_id.clone() {
                    if let Err(e) = self.backend.complete_session(&id).await {
                        log::warn!("RealtimeClient: failed to complete session {}: {}", id, e);
                    }
                }
            }
        }
    }

    fn publish(&mut self) {
        self.session.status = self.state.status;
        self.session.interim_text = self.tracker.interim_text().map(str::to_string);
        self.session_tx.send_replace(self.session.clone());
    }

    async fn create_task(&mut self, topic: Option<String>) -> bool {
        if self.state.status != SessionStatus::Created {
            log::warn!(
                "RealtimeClient: task already requested for {} ({})",
                self.session.session_id,
                self.state.status
            );
            return false;
        }

        self.dispatch(Event::TaskRequested).await;

        let topic = topic.unwrap_or_else(default_topic);
        log::info!("RealtimeClient: creating task for {}...", self.session.session_id);

        match self
            .backend
            .create_session(&self.session.session_id, &topic)
            .await
        {
            Ok(created) => {
                let live = created.join_url().is_some();
                self.session.join_url = created.join_url().map(str::to_string);
                self.session.backend_session_id = Some(created.session_id);
                self.session.task_id = Some(created.task_id);
                self.publish();

                log::info!(
                    "RealtimeClient: task created (session {:?}, task {:?}, live: {})",
                    self.session.backend_session_id,
                    self.session.task_id,
                    live
                );
                if !live {
                    log::warn!("RealtimeClient: no join address, falling back to polling mode");
                }

                self.dispatch(Event::TaskCreated { live }).await;
                true
            }
            Err(e) => {
                log::error!("RealtimeClient: failed to create task: {}", e);
                self.dispatch(Event::TaskFailed {
                    message: format!("Failed to create transcription task: {}", e),
                })
                .await;
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Live channel
    // ------------------------------------------------------------------

    fn begin_connect(&mut self) {
        let Some(url) = self.session.join_url.clone() else {
            log::error!("RealtimeClient: no join address to connect to");
            return;
        };

        log::info!("RealtimeClient: connecting to {}", url);
        self.connecting = Some(Box::pin(open_channel(url, self.config.connect_timeout())));
    }

    async fn on_connect_result(&mut self, result: Result<WsStream, StreamingError>) {
        match result {
            Ok(ws) => {
                log::info!("RealtimeClient: channel open");
                let (sink, stream) = ws.split();
                self.sink = Some(sink);
                self.stream = Some(stream);

                self.dispatch(Event::ChannelOpened).await;
                if self.sink.is_some() {
                    self.dispatch(Event::StartSent).await;
                }
            }
            Err(e) => {
                log::warn!("RealtimeClient: {}", e);
                self.channel_lost = true;
            }
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_text(&text),
            Some(Ok(Message::Close(reason))) => {
                log::info!("RealtimeClient: channel closed by server: {:?}", reason);
                self.lose_channel();
            }
            Some(Ok(_)) => {} // Ignore ping/pong/binary
            Some(Err(e)) => {
                log::warn!("RealtimeClient: {}", StreamingError::ProtocolError(e.to_string()));
                self.lose_channel();
            }
            None => {
                log::info!(
                    "RealtimeClient: {}",
                    StreamingError::Disconnected("stream ended".to_string())
                );
                self.lose_channel();
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        let event = match decode(text) {
            Ok(event) => event,
            Err(DecodeError::Malformed(e)) => {
                log::warn!("RealtimeClient: failed to parse message: {}", e);
                return;
            }
            Err(e) => {
                log::debug!("RealtimeClient: ignoring {}", e);
                return;
            }
        };

        log::debug!("RealtimeClient: received {:?}", event);

        let out = match event {
            ProtocolEvent::TranscriptionStarted => SessionEvent::Started,
            ProtocolEvent::SentenceBegin { .. } => {
                self.tracker.begin_segment();
                SessionEvent::SegmentBegin
            }
            ProtocolEvent::ResultChanged { text, index } => {
                self.tracker.update_interim(&text);
                SessionEvent::Interim { text, index }
            }
            ProtocolEvent::SentenceEnd {
                text,
                begin_time,
                end_time,
                confidence,
            } => SessionEvent::Segment(self.tracker.finalize(&text, begin_time, end_time, confidence)),
            ProtocolEvent::SentenceDiscarded => {
                self.tracker.clear_interim();
                SessionEvent::InterimCleared
            }
            ProtocolEvent::TranscriptionCompleted => SessionEvent::Completed,
            ProtocolEvent::TaskFailed { reason } => {
                log::error!("RealtimeClient: task failed: {}", reason);
                SessionEvent::Error(reason)
            }
        };

        if self.session.interim_text.as_deref() != self.tracker.interim_text() {
            self.publish();
        }
        emit(&self.events, out);
    }

    async fn send_control(&mut self, message: &ClientMessage) -> Result<(), StreamingError> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| StreamingError::SendFailed("channel not open".to_string()))?;
        let json = serde_json::to_string(message)
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

        log::info!("RealtimeClient: sending {}", message.name());
        sink.send(Message::Text(json))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))
    }

    /// Write one buffer as frames. On failure the unsent tail is queued and
    /// the channel is marked lost.
    async fn transmit(&mut self, buffer: Vec<u8>) {
        let Some(sink) = self.sink.as_mut() else {
            self.queue.push(buffer);
            return;
        };

        let mut sent = 0;
        for frame in frame_audio(&buffer, self.config.max_frame_bytes) {
            if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                log::warn!("RealtimeClient: {}", StreamingError::SendFailed(e.to_string()));
                self.queue.push(buffer[sent..].to_vec());
                self.lose_channel();
                return;
            }
            sent += frame.len();
            self.frames_sent += 1;
        }

        if self.frames_sent % 100 == 0 {
            log::debug!("RealtimeClient: sent {} frames", self.frames_sent);
        }
    }

    async fn flush_queue(&mut self) {
        let pending = self.queue.drain_all();
        if pending.is_empty() {
            return;
        }

        log::info!("RealtimeClient: flushing {} queued buffers", pending.len());
        for buffer in pending {
            if self.sink.is_some() {
                self.transmit(buffer).await;
            } else {
                // Channel dropped mid-flush; keep the rest in order
                self.queue.push(buffer);
            }
        }
    }

    fn lose_channel(&mut self) {
        self.sink = None;
        self.stream = None;
        self.channel_lost = true;
    }

    async fn close_socket(&mut self) {
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                log::warn!("RealtimeClient: error closing WebSocket: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Audio routing
    // ------------------------------------------------------------------

    async fn on_audio(&mut self, buffer: Vec<u8>) {
        if buffer.is_empty() {
            return;
        }

        match self.state.status {
            SessionStatus::Stopped | SessionStatus::Error => {
                log::debug!("RealtimeClient: dropping audio after session end");
            }
            SessionStatus::Connected | SessionStatus::Transcribing if self.sink.is_some() => {
                self.transmit(buffer).await;
            }
            _ if self.session.is_degraded() => self.upload(buffer).await,
            _ => {
                self.queue.push(buffer);
                log::debug!(
                    "RealtimeClient: audio queued, queue size: {}",
                    self.queue.len()
                );
            }
        }
    }

    async fn upload(&mut self, buffer: Vec<u8>) {
        let Some(id) = self.session.backend_session_id.as_deref() else {
            return;
        };
        if let Err(e) = self.backend.upload_audio(id, &buffer).await {
            log::warn!("RealtimeClient: failed to send audio via HTTP: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Degraded mode
    // ------------------------------------------------------------------

    async fn start_polling(&mut self) {
        // Audio submitted before the task existed goes over HTTP too
        for buffer in self.queue.drain_all() {
            self.upload(buffer).await;
        }

        log::info!(
            "RealtimeClient: starting polling mode, interval: {:?}",
            self.config.poll_interval()
        );
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(interval);
    }

    async fn poll_results(&mut self) {
        if self.state.status == SessionStatus::Stopped {
            self.poll = None;
            return;
        }
        let Some(id) = self.session.backend_session_id.clone() else {
            return;
        };

        let body = match self.backend.fetch_transcripts(&id).await {
            Ok(body) => body,
            Err(e) => {
                log::warn!("RealtimeClient: polling failed: {}", e);
                return;
            }
        };

        let before = self.cursor.position();
        match self.cursor.advance(&body) {
            Ok(results) => {
                if !results.is_empty() {
                    log::debug!(
                        "RealtimeClient: {} new results (cursor {} -> {})",
                        results.len(),
                        before,
                        self.cursor.position()
                    );
                }
                for result in results {
                    let segment = self.tracker.finalize(
                        &result.text,
                        result.start_ms,
                        result.end_ms,
                        result.confidence,
                    );
                    emit(&self.events, SessionEvent::Segment(segment));
                }
            }
            Err(e) => {
                log::warn!("RealtimeClient: {}", e);
                if !self.shape_error_reported {
                    self.shape_error_reported = true;
                    emit(&self.events, SessionEvent::Error(e.to_string()));
                }
            }
        }
    }
}

fn default_topic() -> String {
    format!(
        "Recording - {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Single connection attempt (retries are driven by the state machine)
async fn open_channel(url: String, connect_timeout: Duration) -> Result<WsStream, StreamingError> {
    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    let (ws_stream, _response) = timeout(
        connect_timeout,
        connect_async_with_config(request, None, true),
    )
    .await
    .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    Ok(ws_stream)
}

async fn finish_connect(pending: &mut Option<ConnectFuture>) -> Result<WsStream, StreamingError> {
    match pending.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    stream: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
