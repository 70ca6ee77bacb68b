//! Message Types für das Call-Signaling-Protokoll
//!
//! Diese Strukturen spiegeln die JSON-Verträge der `/calls/*` Endpunkte
//! des Backends wider. Offer/Answer/ICE werden hier als Summentyp
//! modelliert und an der Transport-Grenze validiert, damit fehlerhafte
//! Payloads nie den Controller erreichen.

use super::client::SignalingError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// CALL TYPE
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    /// Wert für das `call_type` Formularfeld
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    /// Ob lokal eine Kamera angefordert werden muss
    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SIGNAL PAYLOADS
// ============================================================================

/// Richtung einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format (`RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// ICE Candidate mit der ID des Teilnehmers, der ihn erzeugt hat
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub participant_id: String,
    pub candidate: IceCandidate,
}

/// Alle Signaling-Payloads die zwischen den Peers ausgetauscht werden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    #[serde(rename = "candidate")]
    IceCandidate(IceCandidate),
}

impl From<SessionDescription> for SignalPayload {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => SignalPayload::Offer { sdp: desc.sdp },
            SdpKind::Answer => SignalPayload::Answer { sdp: desc.sdp },
        }
    }
}

impl SignalPayload {
    /// Validiert ein Offer/Answer-Blob vom Server
    ///
    /// Akzeptiert `{type, sdp}`, `{sdp}` sowie beides als JSON-String.
    /// Ein abweichendes `type` Feld gilt als fehlerhaft.
    pub fn parse_description(
        value: &Value,
        expected: SdpKind,
    ) -> Result<SessionDescription, SignalingError> {
        let value = unwrap_json_string(value)?;
        let obj = value
            .as_object()
            .ok_or_else(|| invalid(format!("{} is not an object", expected.as_str())))?;

        if let Some(kind) = obj.get("type") {
            if kind.as_str() != Some(expected.as_str()) {
                return Err(invalid(format!(
                    "expected {} but got type {}",
                    expected.as_str(),
                    kind
                )));
            }
        }

        let sdp = obj
            .get("sdp")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid(format!("{} without sdp", expected.as_str())))?;

        Ok(SessionDescription {
            kind: expected,
            sdp: sdp.to_string(),
        })
    }

    /// Validiert einen ICE Candidate vom Server
    ///
    /// Akzeptiert das Candidate-Objekt, ein `{candidate: {...}}` Wrapper
    /// oder den Candidate als JSON-String.
    pub fn parse_candidate(value: &Value) -> Result<IceCandidate, SignalingError> {
        let value = unwrap_json_string(value)?;
        let mut obj = value
            .as_object()
            .ok_or_else(|| invalid("candidate is not an object"))?;

        // Wrapper `{candidate: {candidate: "..."}}`
        if let Some(inner) = obj.get("candidate").and_then(Value::as_object) {
            obj = inner;
        }

        let candidate: IceCandidate = serde_json::from_value(Value::Object(obj.clone()))
            .map_err(|e| invalid(format!("candidate: {}", e)))?;

        if candidate.candidate.trim().is_empty() {
            return Err(invalid("empty candidate"));
        }

        Ok(candidate)
    }
}

fn invalid(msg: impl Into<String>) -> SignalingError {
    SignalingError::InvalidPayload(msg.into())
}

/// Manche Clients schicken Payloads doppelt serialisiert
fn unwrap_json_string(value: &Value) -> Result<Value, SignalingError> {
    match value {
        Value::String(s) => {
            serde_json::from_str(s).map_err(|e| invalid(format!("embedded json: {}", e)))
        }
        other => Ok(other.clone()),
    }
}

// ============================================================================
// CLIENT → SERVER BODIES
// ============================================================================

/// Body für `POST /calls/{id}/ice`
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidateBody<'a> {
    pub candidate: &'a IceCandidate,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Antwort auf `POST /calls/start`
#[derive(Debug, Clone, Deserialize)]
pub struct StartCallResponse {
    #[serde(alias = "id")]
    pub call_id: String,
}

/// Status eines Anrufs aus Sicht des Servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCallStatus {
    Pending,
    Ringing,
    Accepted,
    Active,
    Rejected,
    Ended,
    Unknown(String),
}

impl RemoteCallStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "pending" | "initiated" => RemoteCallStatus::Pending,
            "ringing" => RemoteCallStatus::Ringing,
            "accepted" => RemoteCallStatus::Accepted,
            "active" | "connected" => RemoteCallStatus::Active,
            "rejected" | "declined" => RemoteCallStatus::Rejected,
            "ended" | "missed" => RemoteCallStatus::Ended,
            other => RemoteCallStatus::Unknown(other.to_string()),
        }
    }

    /// Anruf wartet noch auf den Angerufenen
    pub fn is_waiting(&self) -> bool {
        matches!(self, RemoteCallStatus::Pending | RemoteCallStatus::Ringing)
    }
}

/// Rohe Antwort von `GET /calls/{id}/status`
#[derive(Debug, Clone, Deserialize)]
pub struct RawCallStatus {
    pub status: String,
    #[serde(default)]
    pub answer_data: Option<Value>,
    #[serde(default)]
    pub signal_data: Option<Value>,
    #[serde(default)]
    pub ice_candidates: Vec<RawIceRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawIceRecord {
    pub user_id: String,
    pub candidate: Value,
}

/// Validierter Status-Snapshot, so wie ihn der Controller sieht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatusUpdate {
    pub status: RemoteCallStatus,
    pub answer: Option<SessionDescription>,
    pub offer: Option<SessionDescription>,
    pub ice_candidates: Vec<IceCandidateRecord>,
}

impl CallStatusUpdate {
    pub fn new(status: RemoteCallStatus) -> Self {
        Self {
            status,
            answer: None,
            offer: None,
            ice_candidates: Vec::new(),
        }
    }
}

impl From<RawCallStatus> for CallStatusUpdate {
    /// Fehlerhafte Teile werden einzeln verworfen, der Rest bleibt nutzbar
    fn from(raw: RawCallStatus) -> Self {
        let answer = raw.answer_data.as_ref().filter(|v| !v.is_null()).and_then(|v| {
            SignalPayload::parse_description(v, SdpKind::Answer)
                .map_err(|e| tracing::warn!("Dropping malformed answer: {}", e))
                .ok()
        });

        let offer = raw.signal_data.as_ref().filter(|v| !v.is_null()).and_then(|v| {
            SignalPayload::parse_description(v, SdpKind::Offer)
                .map_err(|e| tracing::warn!("Dropping malformed offer: {}", e))
                .ok()
        });

        let ice_candidates = raw
            .ice_candidates
            .into_iter()
            .filter_map(|record| match SignalPayload::parse_candidate(&record.candidate) {
                Ok(candidate) => Some(IceCandidateRecord {
                    participant_id: record.user_id,
                    candidate,
                }),
                Err(e) => {
                    tracing::debug!("Skipping malformed ICE candidate from {}: {}", record.user_id, e);
                    None
                }
            })
            .collect();

        Self {
            status: RemoteCallStatus::parse(&raw.status),
            answer,
            offer,
            ice_candidates,
        }
    }
}

/// Offener Anruf aus `GET /calls/pending/{conversationId}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PendingCall {
    #[serde(alias = "call_id")]
    pub id: String,
    pub conversation_id: String,
    #[serde(alias = "caller_id")]
    pub initiator_id: String,
    pub call_type: CallType,
    #[serde(default = "default_pending_status")]
    pub status: String,
    #[serde(default)]
    pub participants: Vec<String>,
}

fn default_pending_status() -> String {
    "pending".to_string()
}

// ============================================================================
// TESTS
// ============================================================================
