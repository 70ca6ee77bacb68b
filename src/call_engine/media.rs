//! Media/PeerConnection Adapter Vertrag
//!
//! Der Controller besitzt Stream und Peer Connection exklusiv; Adapter
//! stellen nur Operationen auf den übergebenen Handles bereit.
//! Callbacks der Peer Connection kommen als [`PeerEvent`] über einen Channel.

use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    Denied(String),

    #[error("No capture device available: {0}")]
    Unavailable(String),

    #[error("Peer connection setup failed: {0}")]
    PeerConnection(String),

    #[error("Failed to create {0}: {1}")]
    CreateDescription(&'static str, String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescription(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescription(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidate(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungszustand aus Sicht der Media-Schicht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Zustände, an denen ein stiller Peer-Verlust erkannt wird
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Callbacks der Peer Connection (`onRemoteStream`, `onIceCandidate`, `onConnectionStateChange`)
#[derive(Debug, Clone)]
pub enum PeerEvent {
    RemoteTrack { track_id: String, kind: TrackKind },
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

// ============================================================================
// HANDLES
// ============================================================================

/// Lokaler Media-Stream (Mikrofon, optional Kamera)
pub trait LocalMedia: Send + Sync {
    /// Erlaubt dem Adapter den Zugriff auf seinen konkreten Stream-Typ
    fn as_any(&self) -> &dyn Any;

    fn has_track(&self, kind: TrackKind) -> bool;

    /// Setzt das Enabled-Flag; `None` wenn es keinen Track dieser Art gibt
    fn set_enabled(&self, kind: TrackKind, enabled: bool) -> Option<bool>;

    fn is_enabled(&self, kind: TrackKind) -> Option<bool>;

    /// Stoppt alle Tracks und gibt die Geräte frei
    fn stop(&self);
}

/// Handle auf eine Peer Connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self);
}

/// Einstiegspunkt in die plattformspezifische Media-Schicht
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// Fordert Mikrofon und bei `video_enabled` auch die Kamera an
    async fn acquire_local_media(&self, video_enabled: bool)
        -> Result<Arc<dyn LocalMedia>, MediaError>;

    /// Erstellt eine Peer Connection mit den lokalen Tracks
    async fn create_peer_connection(
        &self,
        media: Arc<dyn LocalMedia>,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}
