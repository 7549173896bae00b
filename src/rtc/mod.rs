//! Audio channel negotiation
//!
//! One bidirectional audio stream per session, negotiated with a single
//! offer/answer exchange. ICE candidates are gathered before the offer is sent
//! (non-trickle), bounded by a timeout after which the offer goes out with
//! whatever was gathered.

mod peer;
mod phase;
mod signaling;

pub use peer::WebRtcPeers;
pub use phase::{NegotiationPhase, PhaseMachine, TransportEffect, TransportState};
pub use signaling::{HttpSignaling, SdpAnswer, SdpOffer};

use crate::audio::{AudioFrame, LocalAudio};
use crate::error::{MediaAccessError, SessionError, SignalingError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Remote frames buffered per subscriber
const REMOTE_BUFFER: usize = 64;

/// Channels a peer reports through
pub struct PeerEvents {
    pub transport_tx: mpsc::UnboundedSender<TransportState>,
    /// Decoded remote audio. The first remote audio track is played; later ones are ignored.
    pub remote_audio: broadcast::Sender<AudioFrame>,
}

/// Creates peer connections. Implemented over webrtc-rs by [`WebRtcPeers`].
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(
        &self,
        ice_servers: &[String],
        events: PeerEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError>;
}

/// One peer connection carrying a single send/receive audio stream
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach the local audio as the outbound track; returns the track id
    async fn add_local_audio(
        &self,
        frames: broadcast::Receiver<AudioFrame>,
    ) -> Result<String, SignalingError>;

    /// Create an offer and apply it as the local description, starting ICE gathering
    async fn create_offer(&self) -> Result<(), SignalingError>;

    /// Resolves when ICE gathering is complete
    async fn gathering_complete(&self);

    /// The local description, including candidates gathered so far
    async fn local_description(&self) -> Result<String, SignalingError>;

    /// Apply the remote answer as the remote description
    async fn apply_answer(&self, sdp: &str) -> Result<(), SignalingError>;

    async fn close(&self);
}

/// Sends the offer to the remote endpoint and returns its answer
#[async_trait]
pub trait OfferExchange: Send + Sync {
    async fn exchange(
        &self,
        negotiation_path: &str,
        offer: SdpOffer,
    ) -> Result<SdpAnswer, SignalingError>;
}

/// Why [`AudioNegotiator::connect`] did not produce a link
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("Negotiation cancelled")]
    Cancelled,
}

impl From<NegotiationError> for SessionError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::Media(e) => SessionError::Media(e),
            NegotiationError::Signaling(e) => SessionError::Signaling(e),
            NegotiationError::Cancelled => SessionError::Cancelled,
        }
    }
}

/// An established audio channel
pub struct AudioLink {
    /// Id of the outbound microphone track
    pub send_track_id: String,
    /// Session id echoed by the answer, when the server includes one
    pub remote_session_id: Option<String>,
    remote_audio: broadcast::Sender<AudioFrame>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportState>>,
    peer: Option<Box<dyn PeerTransport>>,
}

impl AudioLink {
    /// Decoded audio from the remote party
    pub fn subscribe_remote(&self) -> broadcast::Receiver<AudioFrame> {
        self.remote_audio.subscribe()
    }

    /// Transport state notifications. Can be taken once.
    pub fn take_transport_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportState>> {
        self.transport_rx.take()
    }

    /// Safe to call more than once
    pub async fn close(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close().await;
            info!("Audio transport closed");
        }
    }
}

/// Drives one offer/answer exchange and tracks the negotiation phase.
///
/// The negotiator owns the phase machine; the peer it creates is handed to the
/// caller inside an [`AudioLink`] once connected.
pub struct AudioNegotiator {
    peers: Arc<dyn PeerFactory>,
    signaling: Arc<dyn OfferExchange>,
    ice_servers: Vec<String>,
    gathering_timeout: Duration,
    phase: PhaseMachine,
}

impl AudioNegotiator {
    pub fn new(
        peers: Arc<dyn PeerFactory>,
        signaling: Arc<dyn OfferExchange>,
        ice_servers: Vec<String>,
        gathering_timeout: Duration,
    ) -> Self {
        Self {
            peers,
            signaling,
            ice_servers,
            gathering_timeout,
            phase: PhaseMachine::default(),
        }
    }

    /// Current negotiation phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase.phase()
    }

    /// Negotiate the audio channel for one session.
    ///
    /// Every failure and cancellation closes the peer before returning.
    #[instrument(skip(self, local, cancel))]
    pub async fn connect(
        &mut self,
        local: &LocalAudio,
        negotiation_path: &str,
        cancel: &CancellationToken,
    ) -> Result<AudioLink, NegotiationError> {
        if !local.is_live() {
            return Err(MediaAccessError::StreamEnded.into());
        }
        if !self.phase.begin() {
            return Err(SignalingError::PeerSetup(format!(
                "cannot negotiate while {}",
                self.phase.phase()
            ))
            .into());
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (remote_audio, _) = broadcast::channel(REMOTE_BUFFER);
        let events = PeerEvents {
            transport_tx,
            remote_audio: remote_audio.clone(),
        };

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            peer = self.peers.create_peer(&self.ice_servers, events) => peer.map_err(NegotiationError::from),
        };
        let peer = match created {
            Ok(peer) => peer,
            Err(e) => {
                self.phase.fail();
                return Err(e);
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            result = offer_answer(
                peer.as_ref(),
                self.signaling.as_ref(),
                local,
                negotiation_path,
                self.gathering_timeout,
            ) => result,
        };

        match outcome {
            Ok((send_track_id, answer)) => {
                self.phase.established();
                info!(track = %send_track_id, "Audio channel negotiated");
                Ok(AudioLink {
                    send_track_id,
                    remote_session_id: answer.session_id,
                    remote_audio,
                    transport_rx: Some(transport_rx),
                    peer: Some(peer),
                })
            }
            Err(e) => {
                warn!("Audio negotiation failed: {}", e);
                peer.close().await;
                self.phase.fail();
                Err(e)
            }
        }
    }

    /// Feed a transport state change into the phase machine.
    ///
    /// # Returns
    ///
    /// [`TransportEffect::Lost`] when the transport goes down after negotiation
    /// began. The caller is expected to stop the session.
    pub fn on_transport_state(&mut self, state: TransportState) -> TransportEffect {
        self.phase.on_transport(state)
    }

    /// Mark the link as torn down after the caller closed it
    pub fn teardown(&mut self) {
        self.phase.teardown();
    }

    /// Back to `Idle` so a new session can negotiate
    pub fn reset(&mut self) {
        self.phase.reset();
    }
}

async fn offer_answer(
    peer: &dyn PeerTransport,
    signaling: &dyn OfferExchange,
    local: &LocalAudio,
    negotiation_path: &str,
    gathering_timeout: Duration,
) -> Result<(String, SdpAnswer), NegotiationError> {
    let track_id = peer.add_local_audio(local.subscribe()).await?;
    peer.create_offer().await?;

    if timeout(gathering_timeout, peer.gathering_complete())
        .await
        .is_err()
    {
        warn!(
            "ICE gathering incomplete after {:?}, sending offer with candidates gathered so far",
            gathering_timeout
        );
    }

    let sdp = peer.local_description().await?;
    let answer = signaling
        .exchange(negotiation_path, SdpOffer::new(sdp))
        .await?;
    if answer.kind != "answer" {
        return Err(SignalingError::InvalidAnswer(format!(
            "expected an answer, got {}",
            answer.kind
        ))
        .into());
    }
    peer.apply_answer(&answer.sdp).await?;
    Ok((track_id, answer))
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    fn local_audio() -> LocalAudio {
        let (tx, _) = broadcast::channel(4);
        LocalAudio::new(tx, None)
    }

    fn negotiator(peers: Arc<FakePeers>, signaling: Arc<FakeSignaling>) -> AudioNegotiator {
        AudioNegotiator::new(
            peers,
            signaling,
            vec!["stun:stun.example.org".to_string()],
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_offer_sent_when_gathering_times_out() {
        let peers = Arc::new(FakePeers::default());
        let signaling = Arc::new(FakeSignaling::new(SignalingScript::Answer));
        let mut negotiator = negotiator(Arc::clone(&peers), Arc::clone(&signaling));

        let link = negotiator
            .connect(&local_audio(), "/api/webrtc/offer/abc", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(link.send_track_id, "local-audio");
        assert_eq!(link.remote_session_id.as_deref(), Some("abc"));
        assert_eq!(
            *signaling.offers.lock().unwrap(),
            vec!["v=0 partial".to_string()]
        );
        assert_eq!(peers.calls("apply_answer"), 1);
        assert_eq!(negotiator.phase(), NegotiationPhase::Connected);
    }

    #[tokio::test]
    async fn test_rejected_offer_closes_peer() {
        let peers = Arc::new(FakePeers::default());
        let signaling = Arc::new(FakeSignaling::new(SignalingScript::Reject(500)));
        let mut negotiator = negotiator(Arc::clone(&peers), signaling);

        let result = negotiator
            .connect(&local_audio(), "/offer", &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(NegotiationError::Signaling(SignalingError::Rejected { status: 500, .. }))
        ));
        assert_eq!(peers.calls("close"), 1);
        assert_eq!(negotiator.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_during_exchange_closes_peer() {
        let peers = Arc::new(FakePeers::default());
        let signaling = Arc::new(FakeSignaling::new(SignalingScript::Hang));
        let mut negotiator = negotiator(Arc::clone(&peers), signaling);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = negotiator.connect(&local_audio(), "/offer", &cancel).await;
        assert!(matches!(result, Err(NegotiationError::Cancelled)));
        assert_eq!(peers.calls("close"), 1);
        assert_eq!(peers.calls("apply_answer"), 0);
    }

    #[tokio::test]
    async fn test_ended_local_audio_is_rejected() {
        let peers = Arc::new(FakePeers::default());
        let signaling = Arc::new(FakeSignaling::new(SignalingScript::Answer));
        let mut negotiator = negotiator(Arc::clone(&peers), signaling);
        let mut local = local_audio();
        local.stop();

        let result = negotiator
            .connect(&local, "/offer", &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(NegotiationError::Media(MediaAccessError::StreamEnded))
        ));
        assert_eq!(peers.calls("create"), 0);
        assert_eq!(negotiator.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn test_peer_setup_failure() {
        let peers = Arc::new(FakePeers {
            fail_create: true,
            ..Default::default()
        });
        let signaling = Arc::new(FakeSignaling::new(SignalingScript::Answer));
        let mut negotiator = negotiator(Arc::clone(&peers), signaling);

        let result = negotiator
            .connect(&local_audio(), "/offer", &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(NegotiationError::Signaling(SignalingError::PeerSetup(_)))
        ));
        assert_eq!(negotiator.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn test_torn_down_negotiator_refuses_to_connect() {
        let peers = Arc::new(FakePeers::default());
        let signaling = Arc::new(FakeSignaling::new(SignalingScript::Answer));
        let mut negotiator = negotiator(Arc::clone(&peers), signaling);
        negotiator.teardown();

        let result = negotiator
            .connect(&local_audio(), "/offer", &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(peers.calls("create"), 0);
    }
}
