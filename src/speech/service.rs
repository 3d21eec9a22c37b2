//! Provider fallback orchestrator
//!
//! `SpeechService` picks a provider at initialization, starts it, routes
//! audio to it, and forwards its events. When the primary streaming provider
//! fails (task creation, channel connection, or a reported error while
//! running) the service stops it and switches to the next provider.
//!
//! Fallback only moves down the priority list, so a session never returns
//! to the primary provider once it has left it.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::local::{LocalRecognizer, LocalSession, RecognitionEvent, RecognizerError, RecognizerOptions};
use super::{detect_available_providers, select_provider, Provider};
use crate::backend::{BackendClient, BackendError};
use crate::config::{ClientConfig, ServiceConfig, Settings};
use crate::events::{emit, event_channel, EventReceiver, EventSender, SessionEvent};
use crate::state_machine::SessionStatus;
use crate::streaming::{AudioSink, RealtimeClient};

enum Command {
    Initialize { reply: oneshot::Sender<Provider> },
    Start {
        topic: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    SendAudio(Vec<u8>),
    Stop { reply: oneshot::Sender<()> },
}

/// Handle to a speech orchestrator.
pub struct SpeechService {
    commands: mpsc::UnboundedSender<Command>,
    provider: watch::Receiver<Provider>,
}

impl SpeechService {
    /// Spawn the orchestrator. Must be called inside a Tokio runtime.
    ///
    /// `local` is the host's on-device recognizer, if it has one.
    pub fn spawn(
        session_id: impl Into<String>,
        settings: Settings,
        local: Option<Arc<dyn LocalRecognizer>>,
    ) -> Result<(Self, EventReceiver), BackendError> {
        let backend = BackendClient::new(&settings.client)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (provider_tx, provider_rx) = watch::channel(Provider::None);
        let (events_tx, events_rx) = event_channel();

        let orchestrator = Orchestrator {
            session_id: session_id.into(),
            client_config: settings.client,
            service_config: settings.service,
            backend,
            local,
            commands: commands_rx,
            provider: None,
            provider_tx,
            events: events_tx,
            active: Active::Idle,
            running: false,
        };
        tokio::spawn(orchestrator.run());

        Ok((
            Self {
                commands: commands_tx,
                provider: provider_rx,
            },
            events_rx,
        ))
    }

    /// Probe providers and select one. Emits `ProviderChanged`.
    pub async fn initialize(&self) -> Provider {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Initialize { reply }).is_err() {
            return Provider::None;
        }
        rx.await.unwrap_or(Provider::None)
    }

    /// Start transcribing with the selected provider, initializing first if
    /// needed. Returns false when no provider could be started.
    pub async fn start(&self, topic: Option<&str>) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::Start {
            topic: topic.map(str::to_string),
            reply,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Only the primary streaming provider consumes audio; otherwise a no-op.
    pub fn send_audio(&self, buffer: Vec<u8>) {
        let _ = self.commands.send(Command::SendAudio(buffer));
    }

    /// Stop whichever provider is active. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn provider(&self) -> Provider {
        *self.provider.borrow()
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider().display_name()
    }
}

impl AudioSink for SpeechService {
    fn send_audio(&self, buffer: Vec<u8>) {
        SpeechService::send_audio(self, buffer);
    }
}

enum Active {
    Idle,
    Primary {
        client: RealtimeClient,
        events: EventReceiver,
    },
    Local(LocalSession),
}

enum ProviderEvent {
    Primary(Option<SessionEvent>),
    Local(Option<RecognitionEvent>),
}

struct Orchestrator {
    session_id: String,
    client_config: ClientConfig,
    service_config: ServiceConfig,
    backend: BackendClient,
    local: Option<Arc<dyn LocalRecognizer>>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// `None` until initialized
    provider: Option<Provider>,
    provider_tx: watch::Sender<Provider>,
    events: EventSender,
    active: Active,
    /// Between a start and the matching stop
    running: bool,
}

impl Orchestrator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_provider_event(&mut self.active) => self.on_provider_event(event).await,
            }
        }

        if self.running {
            log::info!("SpeechService: handle dropped while running, stopping");
            self.stop().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => {
                let provider = self.initialize().await;
                let _ = reply.send(provider);
            }
            Command::Start { topic, reply } => {
                let started = self.start(topic).await;
                let _ = reply.send(started);
            }
            Command::SendAudio(buffer) => {
                if let Active::Primary { client, .. } = &self.active {
                    if self.running {
                        client.send_audio(buffer);
                    }
                }
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
        }
    }

    async fn initialize(&mut self) -> Provider {
        let available = detect_available_providers(&self.backend, self.local.as_deref()).await;
        let provider = select_provider(self.service_config.preferred_provider, &available);

        log::info!("SpeechService: using provider \"{}\"", provider);
        self.set_provider(provider);
        provider
    }

    fn set_provider(&mut self, provider: Provider) {
        self.provider = Some(provider);
        self.provider_tx.send_replace(provider);
        emit(&self.events, SessionEvent::ProviderChanged(provider));
    }

    async fn start(&mut self, topic: Option<String>) -> bool {
        if self.running {
            log::warn!("SpeechService: start while running, restarting");
            self.stop().await;
        }

        let provider = match self.provider {
            Some(provider) => provider,
            None => self.initialize().await,
        };

        self.running = true;
        match provider {
            Provider::PrimaryStreaming => self.start_primary(topic).await,
            Provider::SecondaryLocal => {
                emit(&self.events, SessionEvent::Status(SessionStatus::Connecting));
                self.start_local().await
            }
            Provider::None => {
                emit(&self.events, SessionEvent::Status(SessionStatus::Connecting));
                emit(&self.events, SessionEvent::Status(SessionStatus::Transcribing));
                true
            }
        }
    }

    async fn start_primary(&mut self, topic: Option<String>) -> bool {
        // A fresh client per start, so segment numbering restarts at 0
        let (client, events) = RealtimeClient::spawn(
            self.session_id.clone(),
            self.client_config.clone(),
            self.backend.clone(),
        );

        let created = client.create_task(topic.as_deref()).await;
        let connected = created && client.connect().await;
        self.active = Active::Primary { client, events };

        if !created {
            log::warn!("SpeechService: failed to create streaming task, falling back");
            return self.fall_back().await;
        }
        if !connected {
            log::warn!("SpeechService: streaming channel did not connect, falling back");
            return self.fall_back().await;
        }
        true
    }

    async fn start_local(&mut self) -> bool {
        let result = match self.local.clone() {
            Some(recognizer) => {
                LocalSession::start(
                    recognizer,
                    RecognizerOptions::from(&self.service_config),
                    &self.session_id,
                    self.events.clone(),
                )
                .await
            }
            None => Err(RecognizerError::Unavailable),
        };

        match result {
            Ok(session) => {
                self.active = Active::Local(session);
                true
            }
            Err(e) => {
                log::error!("SpeechService: {}", e);
                emit(&self.events, SessionEvent::Error(e.to_string()));
                false
            }
        }
    }

    /// Leave the primary provider for good and start the next one.
    async fn fall_back(&mut self) -> bool {
        if let Active::Primary { client, mut events } =
            std::mem::replace(&mut self.active, Active::Idle)
        {
            // Deliver what the failed client already reported
            while let Ok(event) = events.try_recv() {
                emit(&self.events, event);
            }
            client.stop().await;
        }

        let local_available = self.local.as_ref().is_some_and(|r| r.is_available());
        let next = if local_available {
            Provider::SecondaryLocal
        } else {
            Provider::SecondaryLocal.fallback()
        };

        log::info!("SpeechService: falling back to \"{}\"", next);
        self.set_provider(next);

        match next {
            Provider::SecondaryLocal => self.start_local().await,
            _ => {
                emit(
                    &self.events,
                    SessionEvent::Error(RecognizerError::Unavailable.to_string()),
                );
                false
            }
        }
    }

    async fn on_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::Primary(Some(event)) => {
                let failed = matches!(event, SessionEvent::Error(_));
                emit(&self.events, event);

                if failed && self.running && self.provider == Some(Provider::PrimaryStreaming) {
                    log::warn!("SpeechService: streaming provider reported an error, falling back");
                    self.fall_back().await;
                }
            }
            ProviderEvent::Primary(None) => {
                log::debug!("SpeechService: streaming client finished");
                self.active = Active::Idle;
            }
            ProviderEvent::Local(Some(event)) => {
                if let Active::Local(session) = &mut self.active {
                    session.handle(event).await;
                }
            }
            ProviderEvent::Local(None) => self.active = Active::Idle,
        }
    }

    async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        match &mut self.active {
            // The client reports its own status; keep its receiver so events
            // from the grace period still reach the caller
            Active::Primary { client, .. } => client.stop().await,
            Active::Local(session) => {
                session.stop().await;
                self.active = Active::Idle;
                emit(&self.events, SessionEvent::Status(SessionStatus::Stopped));
            }
            Active::Idle => emit(&self.events, SessionEvent::Status(SessionStatus::Stopped)),
        }
    }
}

async fn next_provider_event(active: &mut Active) -> ProviderEvent {
    match active {
        Active::Primary { events, .. } => ProviderEvent::Primary(events.recv().await),
        Active::Local(session) => ProviderEvent::Local(session.next_event().await),
        Active::Idle => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{RecognitionSender, RecognizerOptions};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRecognizer {
        sender: Mutex<Option<RecognitionSender>>,
    }

    #[async_trait]
    impl LocalRecognizer for ScriptedRecognizer {
        fn is_available(&self) -> bool {
            true
        }

        async fn start(
            &self,
            _options: &RecognizerOptions,
            events: RecognitionSender,
        ) -> Result<(), RecognizerError> {
            let _ = events.send(RecognitionEvent::Started);
            *self.sender.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn stop(&self) {
            self.sender.lock().unwrap().take();
        }
    }

    fn unreachable_settings(preferred: Option<Provider>) -> Settings {
        let mut settings = Settings::default();
        settings.client.base_url = "http://127.0.0.1:9".to_string();
        settings.client.health_timeout_ms = 300;
        settings.client.request_timeout_ms = 500;
        settings.service.preferred_provider = preferred;
        settings
    }

    #[tokio::test]
    async fn test_unhealthy_backend_without_local_selects_none() {
        let (service, mut events) =
            SpeechService::spawn("s1", unreachable_settings(Some(Provider::PrimaryStreaming)), None)
                .unwrap();

        assert_eq!(service.initialize().await, Provider::None);
        assert_eq!(service.provider(), Provider::None);
        assert_eq!(service.provider_name(), "Recording only");
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::ProviderChanged(Provider::None))
        );

        assert!(service.start(None).await);
        service.send_audio(vec![0; 3200]);
        service.stop().await;
        service.stop().await;

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Status(SessionStatus::Connecting))
        );
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Status(SessionStatus::Transcribing))
        );
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Status(SessionStatus::Stopped))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_provider_forwards_recognizer_events() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let (service, mut events) = SpeechService::spawn(
            "s1",
            unreachable_settings(Some(Provider::SecondaryLocal)),
            Some(recognizer.clone() as Arc<dyn LocalRecognizer>),
        )
        .unwrap();

        assert_eq!(service.initialize().await, Provider::SecondaryLocal);
        assert!(service.start(None).await);

        let sender = recognizer.sender.lock().unwrap().clone().unwrap();
        sender
            .send(RecognitionEvent::Result {
                transcript: "你好".to_string(),
                confidence: Some(0.8),
                is_final: true,
            })
            .unwrap();

        let mut segment = None;
        while let Some(event) = events.recv().await {
            if let SessionEvent::Segment(s) = event {
                segment = Some(s);
                break;
            }
        }
        let segment = segment.unwrap();
        assert_eq!(segment.text, "你好");
        assert_eq!(segment.id, "seg-s1-0");

        service.stop().await;
        assert!(recognizer.sender.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_without_initialize_selects_provider() {
        let (service, mut events) =
            SpeechService::spawn("s1", unreachable_settings(None), None).unwrap();

        assert!(service.start(Some("topic")).await);
        assert_eq!(service.provider(), Provider::None);
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::ProviderChanged(Provider::None))
        );
    }
}
