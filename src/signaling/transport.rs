//! Signaling Transport Abstraktion
//!
//! Der Controller spricht nur mit diesem Trait. Die Produktiv-Implementierung
//! ist der HTTP-Client ([`super::HttpSignalingClient`]), der Offer/Answer/ICE
//! über die `/calls/*` Endpunkte austauscht und per Polling abholt.

use super::client::SignalingError;
use super::messages::{CallStatusUpdate, CallType, IceCandidate, PendingCall, SignalPayload};
use async_trait::async_trait;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Registriert einen neuen Anruf und gibt die Session-ID zurück
    async fn create_call(
        &self,
        conversation_id: &str,
        call_type: CallType,
    ) -> Result<String, SignalingError>;

    /// Hinterlegt Offer oder Answer für den Peer
    async fn send_signal(&self, call_id: &str, payload: &SignalPayload)
        -> Result<(), SignalingError>;

    /// Holt den aktuellen Status inklusive aller bisher gesammelten Candidates
    async fn poll_status(&self, call_id: &str) -> Result<CallStatusUpdate, SignalingError>;

    /// Hängt einen lokalen ICE Candidate an
    async fn send_ice_candidate(
        &self,
        call_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError>;

    async fn reject(&self, call_id: &str) -> Result<(), SignalingError>;

    async fn end(&self, call_id: &str) -> Result<(), SignalingError>;

    /// Offener Anruf in einer Konversation (falls vorhanden)
    async fn pending_call(
        &self,
        conversation_id: &str,
    ) -> Result<Option<PendingCall>, SignalingError>;
}
