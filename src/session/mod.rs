//! Session lifecycle
//!
//! A [`SessionController`] owns everything one interview run needs: the microphone,
//! the negotiated audio channel, playback, volume analyzers, the event channel and the
//! derived view state. It is the only writer of that state. The render layer follows
//! along through [`SessionController::subscribe`].

mod activity;
mod display;
mod model;
mod state;
mod transcript;

pub use activity::{ActivityTracker, AgentActivity};
pub use display::{Display, DisplayState};
pub use model::{
    Asset, AssetKind, AssetManifest, ClipRange, ManifestError, Session, SessionDescriptor, Speaker,
};
pub use state::SessionState;
pub use transcript::{SpeakerLabels, Transcript, TranscriptEntry};

use crate::audio::{AnalyzerSettings, LocalAudio, MediaDevices, PlaybackSink, VolumeAnalyzer};
use crate::channel::{event_channel_url, ChannelEvent, ChannelOptions, EventChannel};
use crate::config::Config;
use crate::error::SessionError;
use crate::rtc::{
    AudioLink, AudioNegotiator, NegotiationPhase, OfferExchange, PeerFactory, TransportEffect,
    TransportState,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Updates buffered for slow render layers
const UPDATE_BUFFER: usize = 256;

/// Controller lifecycle. `Stopped` is terminal until `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Starting,
    Running,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Lifecycle of the controller, not of the server-side session
    pub lifecycle: Lifecycle,
    pub phase: NegotiationPhase,
    pub recording: bool,
}

/// Everything the render layer needs to follow a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Transcript(TranscriptEntry),
    Display(DisplayState),
    Activity(AgentActivity),
    Connection(ConnectionStatus),
    /// The event channel closed unexpectedly; audio keeps running
    ChannelLost { reason: String },
    /// Remote and microphone volume, each in 0.0..=1.0
    Levels { inbound: f32, outbound: f32 },
}

/// Why `run()` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Stopped,
    /// The audio transport failed or disconnected; reconnecting is up to the user
    TransportLost,
}

/// Requests stop from another task, including while `start()` is in flight
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// Device, peer and signaling implementations for a controller
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
    pub signaling: Arc<dyn OfferExchange>,
}

#[derive(Default)]
struct Resources {
    channel: Option<EventChannel>,
    link: Option<AudioLink>,
    microphone: Option<LocalAudio>,
    inbound_level: Option<VolumeAnalyzer>,
    outbound_level: Option<VolumeAnalyzer>,
    playback: Option<PlaybackSink>,
}

enum Step {
    Cancelled,
    Channel(Option<ChannelEvent>),
    Transport(Option<TransportState>),
    Levels,
}

/// Owns one interview session from start to stop.
///
/// Every change of derived state (transcript, display, activity, connection)
/// is published to subscribers as a [`SessionUpdate`].
pub struct SessionController {
    config: Arc<Config>,
    devices: Arc<dyn MediaDevices>,
    negotiator: AudioNegotiator,
    session: Option<Session>,
    state: SessionState,
    lifecycle: Lifecycle,
    recording: bool,
    resources: Resources,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportState>>,
    updates: broadcast::Sender<SessionUpdate>,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(config: Arc<Config>, deps: SessionDeps) -> Self {
        let negotiator = AudioNegotiator::new(
            deps.peers,
            deps.signaling,
            config.rtc.ice_servers.clone(),
            config.ice_gathering_timeout(),
        );
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            config,
            devices: deps.devices,
            negotiator,
            session: None,
            state: SessionState::default(),
            lifecycle: Lifecycle::Idle,
            recording: false,
            resources: Resources::default(),
            transport_rx: None,
            updates,
            cancel: CancellationToken::new(),
        }
    }

    /// Receive every update published from now on.
    ///
    /// A subscriber that falls behind by more than the update buffer skips the
    /// oldest updates and sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Handle that stops the session from another task. Invalidated by `reset`.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.cancel.clone())
    }

    /// Where the controller is between `start` and `stop`
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.negotiator.phase()
    }

    /// The session being run, kept after stop until `reset`
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Transcript so far. Survives `stop` so it can be saved.
    pub fn transcript(&self) -> &Transcript {
        self.state.transcript()
    }

    pub fn display(&self) -> &DisplayState {
        self.state.display()
    }

    pub fn activity(&self) -> AgentActivity {
        self.state.activity()
    }

    /// Snapshot of lifecycle, negotiation phase and whether audio is being recorded
    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            lifecycle: self.lifecycle,
            phase: self.negotiator.phase(),
            recording: self.recording,
        }
    }

    /// Acquire devices, negotiate audio and open the event channel.
    ///
    /// On any failure, including a stop request, everything acquired so far is
    /// released and the controller ends up stopped.
    #[instrument(skip_all, fields(session_id = %session.id))]
    pub async fn start(&mut self, session: Session) -> Result<(), SessionError> {
        if self.lifecycle != Lifecycle::Idle {
            return Err(SessionError::NotIdle(self.lifecycle.as_str()));
        }
        info!(assets = session.assets.len(), "Starting session");
        self.session = Some(session);
        self.set_lifecycle(Lifecycle::Starting);

        match self.acquire().await {
            Ok(()) => {
                self.recording = true;
                self.set_lifecycle(Lifecycle::Running);
                info!("Session running");
                Ok(())
            }
            Err(e) => {
                error!("Session start failed: {}", e);
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) -> Result<(), SessionError> {
        let cancel = self.cancel.clone();
        let (session_id, negotiation_path) = match self.session.as_ref() {
            Some(session) => (session.id.clone(), session.negotiation_path.clone()),
            None => return Err(SessionError::Cancelled),
        };
        let settings = AnalyzerSettings::from_config(&self.config);

        let microphone = cancellable(&cancel, self.devices.open_microphone()).await??;
        self.resources.inbound_level = Some(VolumeAnalyzer::attach(
            "inbound",
            microphone.subscribe(),
            settings,
        ));
        let microphone = self.resources.microphone.insert(microphone);

        let mut link = self
            .negotiator
            .connect(microphone, &negotiation_path, &cancel)
            .await?;
        if let Some(remote) = link.remote_session_id.as_deref() {
            if remote != session_id {
                warn!(remote, "Answer names a different session");
            }
        }
        debug!(track = %link.send_track_id, "Local audio attached");
        self.transport_rx = link.take_transport_events();
        let playback_rx = link.subscribe_remote();
        let outbound_rx = link.subscribe_remote();
        self.resources.link = Some(link);

        let playback = cancellable(&cancel, self.devices.open_speaker(playback_rx)).await??;
        self.resources.playback = Some(playback);
        self.resources.outbound_level =
            Some(VolumeAnalyzer::attach("outbound", outbound_rx, settings));

        let url = event_channel_url(&self.config.server.base_url, &session_id)?;
        let options = ChannelOptions::from_config(&self.config);
        let channel = cancellable(&cancel, EventChannel::open(&url, options)).await??;
        self.resources.channel = Some(channel);
        Ok(())
    }

    /// Dispatch events until stop, transport loss or cancellation. Always ends stopped.
    pub async fn run(&mut self) -> SessionOutcome {
        if self.lifecycle != Lifecycle::Running {
            warn!(lifecycle = self.lifecycle.as_str(), "run() on a session that is not running");
            self.stop().await;
            return SessionOutcome::Stopped;
        }

        let mut levels = interval(self.config.level_interval());
        levels.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                state = next_transport_state(&mut self.transport_rx) => Step::Transport(state),
                event = next_channel_event(&mut self.resources.channel) => Step::Channel(event),
                _ = levels.tick() => Step::Levels,
            };

            match step {
                Step::Cancelled => {
                    info!("Stop requested");
                    break SessionOutcome::Stopped;
                }
                Step::Transport(Some(state)) => {
                    if let Some(outcome) = self.on_transport_state(state) {
                        break outcome;
                    }
                }
                Step::Transport(None) => {
                    debug!("Transport notifications ended");
                    self.transport_rx = None;
                }
                Step::Channel(Some(ChannelEvent::Message(event))) => self.on_server_event(event),
                Step::Channel(Some(ChannelEvent::Closed { reason })) => self.on_channel_lost(reason),
                Step::Channel(None) => self.on_channel_lost("event channel ended".to_string()),
                Step::Levels => self.publish_levels(),
            }
        };

        self.stop().await;
        outcome
    }

    fn on_server_event(&mut self, event: crate::channel::ServerEvent) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        for update in self.state.apply(&session.assets, event) {
            self.publish(update);
        }
    }

    fn on_channel_lost(&mut self, reason: String) {
        warn!("Event channel lost: {}", reason);
        self.resources.channel = None;
        self.publish(SessionUpdate::ChannelLost { reason });
        for update in self.state.clear_live_view() {
            self.publish(update);
        }
    }

    fn on_transport_state(&mut self, state: TransportState) -> Option<SessionOutcome> {
        match self.negotiator.on_transport_state(state) {
            TransportEffect::Unchanged => None,
            TransportEffect::Changed => {
                self.publish_connection();
                None
            }
            TransportEffect::Lost => {
                error!(?state, "Audio transport lost, stopping session");
                self.recording = false;
                self.publish_connection();
                Some(SessionOutcome::TransportLost)
            }
        }
    }

    fn publish_levels(&self) {
        let level = |analyzer: &Option<VolumeAnalyzer>| analyzer.as_ref().map_or(0.0, VolumeAnalyzer::level);
        self.publish(SessionUpdate::Levels {
            inbound: level(&self.resources.inbound_level),
            outbound: level(&self.resources.outbound_level),
        });
    }

    /// Release everything, in order: event channel, audio transport, microphone,
    /// analyzers, playback. Safe to call from any state, any number of times.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        info!("Stopping session");

        if let Some(mut channel) = self.resources.channel.take() {
            channel.close().await;
        }
        if let Some(mut link) = self.resources.link.take() {
            link.close().await;
        }
        self.transport_rx = None;
        self.negotiator.teardown();
        if let Some(mut microphone) = self.resources.microphone.take() {
            microphone.stop();
        }
        for mut analyzer in [
            self.resources.inbound_level.take(),
            self.resources.outbound_level.take(),
        ]
        .into_iter()
        .flatten()
        {
            analyzer.release();
        }
        if let Some(mut playback) = self.resources.playback.take() {
            playback.stop();
        }

        self.recording = false;
        for update in self.state.clear_live_view() {
            self.publish(update);
        }
        if let Some(session) = self.session.as_mut() {
            session.ended_at.get_or_insert_with(Utc::now);
        }
        self.set_lifecycle(Lifecycle::Stopped);
        info!("Session stopped");
    }

    /// Stop, forget the session and its derived state, and arm a fresh stop handle
    /// so `start()` can be called again. Handles taken earlier no longer apply.
    pub async fn reset(&mut self) {
        self.stop().await;
        self.session = None;
        self.state = SessionState::default();
        self.negotiator.reset();
        self.cancel = CancellationToken::new();
        self.set_lifecycle(Lifecycle::Idle);
        debug!("Session reset");
    }

    fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
        self.publish_connection();
    }

    fn publish_connection(&self) {
        self.publish(SessionUpdate::Connection(self.connection_status()));
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

/// Run `fut` unless the token fires first
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        output = fut => Ok(output),
    }
}

async fn next_channel_event(channel: &mut Option<EventChannel>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_transport_state(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportState>>,
) -> Option<TransportState> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fakes::FakeDevices;
    use crate::channel::test_server;
    use crate::config::test_config;
    use crate::error::{MediaAccessError, SignalingError};
    use crate::rtc::fakes::{FakePeers, FakeSignaling, SignalingScript};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    struct Harness {
        controller: SessionController,
        devices: Arc<FakeDevices>,
        peers: Arc<FakePeers>,
    }

    fn harness(base_url: &str, devices: FakeDevices, script: SignalingScript) -> Harness {
        harness_with(base_url, devices, FakePeers::default(), script)
    }

    fn harness_with(
        base_url: &str,
        devices: FakeDevices,
        peers: FakePeers,
        script: SignalingScript,
    ) -> Harness {
        let mut config = test_config();
        config.server.base_url = base_url.to_string();
        let devices = Arc::new(devices);
        let peers = Arc::new(peers);
        let deps = SessionDeps {
            devices: Arc::clone(&devices) as Arc<dyn MediaDevices>,
            peers: Arc::clone(&peers) as Arc<dyn PeerFactory>,
            signaling: Arc::new(FakeSignaling::new(script)),
        };
        Harness {
            controller: SessionController::new(Arc::new(config), deps),
            devices,
            peers,
        }
    }

    fn session() -> Session {
        Session {
            id: "test".to_string(),
            negotiation_path: "/api/webrtc/offer/test".to_string(),
            assets: AssetManifest::new(vec![model::image("img-1")]).unwrap(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Event channel base URL for a test server
    fn http_base(ws_url: &url::Url) -> String {
        format!(
            "http://{}:{}",
            ws_url.host_str().unwrap(),
            ws_url.port().unwrap()
        )
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    /// Stop once `done` sees a matching update; returns everything seen
    fn stop_when(
        controller: &SessionController,
        done: impl Fn(&SessionUpdate) -> bool + Send + 'static,
    ) -> tokio::task::JoinHandle<Vec<SessionUpdate>> {
        let mut updates = controller.subscribe();
        let handle = controller.stop_handle();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(update) = updates.recv().await {
                let finished = done(&update);
                seen.push(update);
                if finished {
                    handle.stop();
                    break;
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_run_dispatches_events_in_order() {
        let (ws_url, _client_rx) = test_server::serve(
            vec![
                text(r#"{"type":"transcript","speaker":"user","text":"Hi","is_final":false}"#),
                text(r#"{"type":"transcript","speaker":"user","text":"Hi Maya","is_final":true}"#),
                text("garbage"),
                text(r#"{"type":"transcript","speaker":"bot","text":"Hello","is_final":false}"#),
                text(r#"{"type":"show_asset","asset_id":"img-1","start_time":5,"end_time":10}"#),
                text(r#"{"type":"transcript","speaker":"bot","text":"Hello there","is_final":true}"#),
            ],
            false,
        )
        .await;
        let mut h = harness(
            &http_base(&ws_url),
            FakeDevices::default(),
            SignalingScript::Answer,
        );

        let watcher = stop_when(&h.controller, |u| {
            matches!(u, SessionUpdate::Transcript(e) if e.text == "Hello there")
        });
        h.controller.start(session()).await.unwrap();
        assert!(h.controller.connection_status().recording);
        assert_eq!(h.controller.phase(), NegotiationPhase::Connected);

        let outcome = h.controller.run().await;
        assert_eq!(outcome, SessionOutcome::Stopped);

        let entries = h.controller.transcript().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "Hi Maya");
        assert_eq!(entries[1].speaker, Speaker::Agent);
        assert_eq!(entries[1].text, "Hello there");

        let seen = watcher.await.unwrap();
        assert!(seen.iter().any(|u| matches!(
            u,
            SessionUpdate::Display(DisplayState::Showing { asset, .. }) if asset.id == "img-1"
        )));

        // Stopping clears the live view and marks the session ended
        assert!(h.controller.display().is_empty());
        assert_eq!(h.controller.activity(), AgentActivity::Idle);
        assert!(h.controller.session().unwrap().ended_at.is_some());
        assert_eq!(*h.devices.speakers_opened.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (ws_url, _client_rx) = test_server::serve(vec![], false).await;
        let mut h = harness(
            &http_base(&ws_url),
            FakeDevices::default(),
            SignalingScript::Answer,
        );
        h.controller.start(session()).await.unwrap();

        h.controller.stop().await;
        h.controller.stop().await;

        assert_eq!(h.controller.lifecycle(), Lifecycle::Stopped);
        assert_eq!(h.controller.phase(), NegotiationPhase::Disconnected);
        assert!(!h.controller.connection_status().recording);
        assert_eq!(h.peers.calls("close"), 1);
        assert!(h.controller.resources.channel.is_none());
        assert!(h.controller.resources.microphone.is_none());
        assert!(h.controller.resources.playback.is_none());

        // A stopped session needs a reset before it can start again
        assert!(matches!(
            h.controller.start(session()).await,
            Err(SessionError::NotIdle("stopped"))
        ));
    }

    #[tokio::test]
    async fn test_stop_releases_in_order() {
        let log: Arc<std::sync::Mutex<Vec<&'static str>>> = Default::default();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let server_log = Arc::clone(&log);
        let ws_url = test_server::serve_until_close(move || {
            server_log.lock().unwrap().push("channel");
            let _ = closed_tx.send(());
        })
        .await;
        let peers = FakePeers {
            log: Arc::clone(&log),
            close_after: std::sync::Mutex::new(Some(closed_rx)),
            ..Default::default()
        };
        let devices = FakeDevices {
            log: Arc::clone(&log),
            ..Default::default()
        };
        let mut h = harness_with(&http_base(&ws_url), devices, peers, SignalingScript::Answer);
        h.controller.start(session()).await.unwrap();
        log.lock().unwrap().clear();

        h.controller.stop().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["channel", "close", "microphone", "playback"]
        );
        assert!(h.controller.resources.inbound_level.is_none());
        assert!(h.controller.resources.outbound_level.is_none());
    }

    #[tokio::test]
    async fn test_reset_allows_a_new_start() {
        let (ws_url, _client_rx) = test_server::serve(vec![], false).await;
        let mut h = harness(
            &http_base(&ws_url),
            FakeDevices::default(),
            SignalingScript::Answer,
        );
        h.controller.stop().await;
        h.controller.reset().await;
        assert_eq!(h.controller.lifecycle(), Lifecycle::Idle);
        assert_eq!(h.controller.phase(), NegotiationPhase::Idle);
        assert!(h.controller.session().is_none());

        h.controller.start(session()).await.unwrap();
        assert_eq!(h.controller.lifecycle(), Lifecycle::Running);
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_media_failure_is_surfaced() {
        let devices = FakeDevices {
            fail_microphone: Some(MediaAccessError::PermissionDenied("denied".to_string())),
            ..Default::default()
        };
        let mut h = harness("http://127.0.0.1:9", devices, SignalingScript::Answer);

        let result = h.controller.start(session()).await;
        assert!(matches!(
            result,
            Err(SessionError::Media(MediaAccessError::PermissionDenied(_)))
        ));
        assert_eq!(h.controller.lifecycle(), Lifecycle::Stopped);
        assert_eq!(h.peers.calls("create"), 0);
    }

    #[tokio::test]
    async fn test_rejected_offer_releases_microphone() {
        let mut h = harness(
            "http://127.0.0.1:9",
            FakeDevices::default(),
            SignalingScript::Reject(500),
        );

        let result = h.controller.start(session()).await;
        assert!(matches!(
            result,
            Err(SessionError::Signaling(SignalingError::Rejected { status: 500, .. }))
        ));
        assert_eq!(h.peers.calls("close"), 1);
        assert!(h.controller.resources.microphone.is_none());
        assert!(h.devices.log.lock().unwrap().contains(&"microphone"));
        assert!(h.controller.resources.inbound_level.is_none());
        assert!(!h.controller.connection_status().recording);
    }

    #[tokio::test]
    async fn test_stop_during_connect_closes_peer() {
        let mut h = harness(
            "http://127.0.0.1:9",
            FakeDevices::default(),
            SignalingScript::Hang,
        );
        let handle = h.controller.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            handle.stop();
        });

        let result = h.controller.start(session()).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(h.peers.calls("close"), 1);
        assert_eq!(h.controller.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_transport_failure_stops_session() {
        let (ws_url, _client_rx) = test_server::serve(vec![], false).await;
        let mut h = harness(
            &http_base(&ws_url),
            FakeDevices::default(),
            SignalingScript::Answer,
        );
        h.controller.start(session()).await.unwrap();
        let mut updates = h.controller.subscribe();

        h.peers.report(TransportState::Failed);
        let outcome = h.controller.run().await;

        assert_eq!(outcome, SessionOutcome::TransportLost);
        assert!(!h.controller.connection_status().recording);
        assert_eq!(h.controller.phase(), NegotiationPhase::Disconnected);

        let mut lost = None;
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::Connection(status) = update {
                lost.get_or_insert(status);
            }
        }
        let lost = lost.unwrap();
        assert_eq!(lost.phase, NegotiationPhase::Idle);
        assert!(!lost.recording);
    }

    #[tokio::test]
    async fn test_channel_loss_keeps_audio_running() {
        let (ws_url, _client_rx) = test_server::serve(
            vec![
                text(r#"{"type":"agent_state","state":"thinking"}"#),
                text(r#"{"type":"show_asset","asset_id":"img-1"}"#),
            ],
            true,
        )
        .await;
        let mut h = harness(
            &http_base(&ws_url),
            FakeDevices::default(),
            SignalingScript::Answer,
        );

        let watcher = stop_when(&h.controller, |u| {
            matches!(u, SessionUpdate::Activity(AgentActivity::Idle))
        });
        h.controller.start(session()).await.unwrap();

        let outcome = h.controller.run().await;
        assert_eq!(outcome, SessionOutcome::Stopped);

        let seen = watcher.await.unwrap();
        let lost_at = seen
            .iter()
            .position(|u| matches!(u, SessionUpdate::ChannelLost { .. }))
            .unwrap();
        assert!(matches!(
            seen[lost_at + 1],
            SessionUpdate::Display(DisplayState::Empty)
        ));
        assert!(matches!(
            seen[lost_at + 2],
            SessionUpdate::Activity(AgentActivity::Idle)
        ));
        // Audio was still up when the channel went away
        assert!(!seen[..lost_at].iter().any(|u| matches!(
            u,
            SessionUpdate::Connection(ConnectionStatus {
                recording: false,
                lifecycle: Lifecycle::Running,
                ..
            })
        )));
        assert_eq!(h.peers.calls("close"), 1);
    }

    #[tokio::test]
    async fn test_levels_are_published() {
        let (ws_url, _client_rx) = test_server::serve(vec![], false).await;
        let mut h = harness(
            &http_base(&ws_url),
            FakeDevices::default(),
            SignalingScript::Answer,
        );
        let watcher = stop_when(&h.controller, |u| matches!(u, SessionUpdate::Levels { .. }));
        h.controller.start(session()).await.unwrap();
        assert!(h.devices.microphone.lock().unwrap().is_some());

        assert_eq!(h.controller.run().await, SessionOutcome::Stopped);
        let seen = watcher.await.unwrap();
        match seen.last() {
            Some(SessionUpdate::Levels { inbound, outbound }) => {
                assert!((0.0..=1.0).contains(inbound));
                assert_eq!(*outbound, 0.0);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }
}
