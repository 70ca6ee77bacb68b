//! Signaling Module - Austausch von Offer/Answer/ICE über das Backend
//!
//! Dieses Modul enthält:
//! - Typsichere Wire-Formate der `/calls/*` Endpunkte
//! - Den `SignalingTransport` Trait, gegen den der Controller arbeitet
//! - Den HTTP-Client mit Polling-basierter Zustellung

mod client;
mod messages;
mod transport;

pub use client::{HttpSignalingClient, SignalingError};
pub use messages::{
    CallStatusUpdate, CallType, IceCandidate, IceCandidateRecord, PendingCall, RemoteCallStatus,
    SdpKind, SessionDescription, SignalPayload,
};
pub use transport::SignalingTransport;
