//! Call Engine Module - Anrufsteuerung und WebRTC
//!
//! Dieses Modul verwaltet:
//! - Den Zustandsautomaten einer Anruf-Session
//! - Den Controller, der Medien, Peer Connection und Signaling koordiniert
//! - ICE-Candidate Deduplizierung und Pufferung
//! - Den zentralen Cleanup aller Ressourcen
//! - Den webrtc-rs Media-Adapter

mod cleanup;
mod engine;
mod ice;
mod media;
mod session;
mod webrtc_adapter;

pub use cleanup::ResourceGuard;
pub use engine::{CallEngine, CallEngineError, CallEvent};
pub use ice::RemoteIceQueue;
pub use media::{
    LocalMedia, MediaAdapter, MediaError, PeerConnection, PeerConnectionState, PeerEvent,
    PeerEventSender, TrackKind,
};
pub use session::{CallRole, CallSession, CallState, SessionError, SessionEvent};
pub use webrtc_adapter::{
    CapturePermissions, WebRtcLocalMedia, WebRtcMediaAdapter, WebRtcPeerConnection,
    AUDIO_CLOCK_RATE, VIDEO_CLOCK_RATE,
};
