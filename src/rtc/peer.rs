//! Peer connection backed by webrtc-rs, carrying G.711 µ-law audio

use super::{PeerEvents, PeerFactory, PeerTransport, TransportState};
use crate::audio::{g711, AudioFrame, RTC_SAMPLE_RATE};
use crate::error::SignalingError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Static RTP payload type for PCMU
const PCMU_PAYLOAD_TYPE: u8 = 0;

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: RTC_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

fn setup_error(e: impl std::fmt::Display) -> SignalingError {
    SignalingError::PeerSetup(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Creates webrtc-rs peer connections with only PCMU registered
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeers;

#[async_trait]
impl PeerFactory for WebRtcPeers {
    async fn create_peer(
        &self,
        ice_servers: &[String],
        events: PeerEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError> {
        let mut media = MediaEngine::default();
        media
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: PCMU_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(setup_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup_error)?);

        let transport_tx = events.transport_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer connection state: {}", state);
            if let Some(mapped) = map_state(state) {
                let _ = transport_tx.send(mapped);
            }
            Box::pin(async {})
        }));

        let remote_audio = events.remote_audio;
        let have_remote = Arc::new(AtomicBool::new(false));
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() != RTPCodecType::Audio {
                    debug!("Ignoring remote {:?} track", track.kind());
                } else if have_remote.swap(true, Ordering::SeqCst) {
                    warn!("Ignoring additional remote audio track");
                } else {
                    info!("Remote audio track started");
                    tokio::spawn(read_remote_audio(track, remote_audio.clone()));
                }
                Box::pin(async {})
            },
        ));

        Ok(Box::new(WebRtcPeer {
            pc,
            gathering: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn add_local_audio(
        &self,
        frames: broadcast::Receiver<AudioFrame>,
    ) -> Result<String, SignalingError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_owned(),
            "interview-client".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(setup_error)?;

        // RTCP has to be read for interceptors to run
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        let id = track.id().to_owned();
        let pump = tokio::spawn(send_local_audio(track, frames));

        let mut tasks = self.tasks.lock().await;
        tasks.push(rtcp);
        tasks.push(pump);
        Ok(id)
    }

    async fn create_offer(&self) -> Result<(), SignalingError> {
        let offer = self.pc.create_offer(None).await.map_err(setup_error)?;
        // Must be requested before the local description starts gathering
        let gathering = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gathering);
        self.pc
            .set_local_description(offer)
            .await
            .map_err(setup_error)
    }

    async fn gathering_complete(&self) {
        let receiver = self.gathering.lock().await.take();
        if let Some(mut receiver) = receiver {
            let _ = receiver.recv().await;
            debug!("ICE gathering complete");
        }
    }

    async fn local_description(&self) -> Result<String, SignalingError> {
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| SignalingError::PeerSetup("no local description".to_string()))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), SignalingError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())
            .map_err(|e| SignalingError::InvalidAnswer(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| SignalingError::InvalidAnswer(e.to_string()))
    }

    async fn close(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }
}

async fn send_local_audio(
    track: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<AudioFrame>,
) {
    loop {
        match frames.recv().await {
            Ok(frame) => {
                let sample = Sample {
                    data: Bytes::from(g711::encode(&frame.samples)),
                    duration: frame.duration(),
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    trace!("Dropped outbound audio sample: {}", e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Outbound audio lagged, {} frames skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Local audio stream ended");
}

async fn read_remote_audio(track: Arc<TrackRemote>, remote_audio: broadcast::Sender<AudioFrame>) {
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        let _ = remote_audio.send(AudioFrame {
            samples: g711::decode(&packet.payload),
            sample_rate: RTC_SAMPLE_RATE,
        });
    }
    debug!("Remote audio track ended");
}
