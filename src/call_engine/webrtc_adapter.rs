//! WebRTC Adapter auf Basis von webrtc-rs
//!
//! Erstellt Peer Connections mit Default-Codecs und Interceptors und
//! übersetzt deren Callbacks in [`PeerEvent`]s.
//!
//! Hinweis: Das Einspeisen von Capture-Samples ist Sache der Anwendung
//! ([`WebRtcLocalMedia::write_sample`]). Ein deaktivierter Track verwirft
//! Samples, ohne dass neu verhandelt wird.

use super::media::{
    LocalMedia, MediaAdapter, MediaError, PeerConnection, PeerConnectionState, PeerEvent,
    PeerEventSender, TrackKind,
};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für Opus (48kHz)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

const STREAM_ID: &str = "encryptalk-call";

// ============================================================================
// LOCAL MEDIA
// ============================================================================

struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl LocalTrack {
    fn new(mime_type: &str, clock_rate: u32, channels: u16, id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.to_string(),
            STREAM_ID.to_string(),
        ));

        Self {
            track,
            enabled: AtomicBool::new(true),
        }
    }
}

/// Lokale Tracks für Mikrofon und optional Kamera
pub struct WebRtcLocalMedia {
    audio: LocalTrack,
    video: Option<LocalTrack>,
    stopped: AtomicBool,
}

impl WebRtcLocalMedia {
    fn new(video_enabled: bool) -> Self {
        Self {
            audio: LocalTrack::new(MIME_TYPE_OPUS, AUDIO_CLOCK_RATE, 1, "audio"),
            video: video_enabled.then(|| LocalTrack::new(MIME_TYPE_VP8, VIDEO_CLOCK_RATE, 0, "video")),
            stopped: AtomicBool::new(false),
        }
    }

    fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => Some(&self.audio),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    fn tracks(&self) -> impl Iterator<Item = Arc<TrackLocalStaticSample>> + '_ {
        std::iter::once(&self.audio)
            .chain(self.video.as_ref())
            .map(|t| Arc::clone(&t.track))
    }

    /// Schreibt ein kodiertes Sample; stumm geschaltete oder gestoppte Tracks verwerfen es
    pub async fn write_sample(&self, kind: TrackKind, sample: &Sample) -> Result<(), MediaError> {
        let Some(local) = self.track(kind) else {
            return Ok(());
        };
        if self.stopped.load(Ordering::SeqCst) || !local.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        local
            .track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::PeerConnection(e.to_string()))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMedia for WebRtcLocalMedia {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn has_track(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some()
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) -> Option<bool> {
        let local = self.track(kind)?;
        local.enabled.store(enabled, Ordering::SeqCst);
        Some(enabled)
    }

    fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.track(kind).map(|t| t.enabled.load(Ordering::SeqCst))
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!("Local media stopped");
        }
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::CreateDescription("offer", e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::CreateDescription("answer", e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = to_rtc(desc).map_err(|e| MediaError::SetLocalDescription(e.to_string()))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| MediaError::SetLocalDescription(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = to_rtc(desc).map_err(|e| MediaError::SetRemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| MediaError::SetRemoteDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| MediaError::AddIceCandidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

/// Welche Geräte das Betriebssystem freigegeben hat
#[derive(Debug, Clone, Copy)]
pub struct CapturePermissions {
    pub microphone: bool,
    pub camera: bool,
}

impl Default for CapturePermissions {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct WebRtcMediaAdapter {
    permissions: CapturePermissions,
}

impl WebRtcMediaAdapter {
    pub fn new(permissions: CapturePermissions) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl MediaAdapter for WebRtcMediaAdapter {
    async fn acquire_local_media(
        &self,
        video_enabled: bool,
    ) -> Result<Arc<dyn LocalMedia>, MediaError> {
        if !self.permissions.microphone {
            return Err(MediaError::Denied("microphone".to_string()));
        }
        if video_enabled && !self.permissions.camera {
            return Err(MediaError::Denied("camera".to_string()));
        }

        tracing::info!("Local media acquired (video: {})", video_enabled);
        Ok(Arc::new(WebRtcLocalMedia::new(video_enabled)))
    }

    async fn create_peer_connection(
        &self,
        media: Arc<dyn LocalMedia>,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let local = media
            .as_any()
            .downcast_ref::<WebRtcLocalMedia>()
            .ok_or_else(|| MediaError::PeerConnection("foreign media stream".to_string()))?;

        // Media Engine mit Default-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::PeerConnection(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::PeerConnection(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::PeerConnection(e.to_string()))?,
        );

        for track in local.tracks() {
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaError::PeerConnection(e.to_string()))?;
        }

        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcPeerConnection { pc }))
    }
}

/// Übersetzt die webrtc-rs Callbacks in PeerEvents
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSender) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };

        if let Some(state) = state {
            let _ = tx.send(PeerEvent::ConnectionState(state));
        }

        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let _ = tx.send(PeerEvent::RemoteTrack {
            track_id: track.id(),
            kind,
        });
        Box::pin(async {})
    }));
}

// ============================================================================
// TESTS
// ============================================================================
