//! Call Session und Zustandsautomat
//!
//! Reine Datenstruktur ohne I/O. Der Controller ist die einzige Stelle,
//! die `apply` aufruft.

use crate::signaling::{CallType, IceCandidateRecord, SessionDescription};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is already in terminal state {0:?}")]
    Terminal(CallState),

    #[error("Remote description already set")]
    DuplicateRemoteSignal,

    #[error("Local description already set")]
    DuplicateLocalSignal,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Medien und Peer Connection werden aufgebaut
    Connecting,
    /// Offer ist raus, wir warten auf den Angerufenen
    Ringing,
    /// Eingehender Anruf wartet auf Annahme
    Incoming,
    /// Anruf aktiv
    Connected,
    Rejected,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Rejected | CallState::Ended | CallState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Ringing => "ringing",
            CallState::Incoming => "incoming",
            CallState::Connected => "connected",
            CallState::Rejected => "rejected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

/// Eingaben für den Zustandsautomaten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StartCall,
    OfferCreated,
    AnswerReceived,
    RemoteRejected,
    RingTimeout,
    MediaDenied,
    CreateFailed,
    Accept,
    AnswerSent,
    Reject,
    RemoteDisconnected,
    PeerConnectionFailed,
    LocalHangup,
}

impl CallState {
    /// Übergangstabelle. `None` heißt: Paar ist nicht definiert, Session bleibt unverändert.
    pub fn next(self, event: SessionEvent) -> Option<CallState> {
        use CallState::*;
        use SessionEvent::*;

        if self.is_terminal() {
            return None;
        }

        match (self, event) {
            (Idle, StartCall) => Some(Connecting),
            (Connecting, OfferCreated) => Some(Ringing),
            (Ringing, AnswerReceived) => Some(Connected),
            (Ringing, RemoteRejected | RingTimeout) => Some(Rejected),
            (Connecting, MediaDenied | CreateFailed) => Some(Failed),
            (Incoming, Accept) => Some(Connecting),
            (Connecting, AnswerSent) => Some(Connected),
            (Incoming, Reject) => Some(Rejected),
            (Connected, RemoteDisconnected | PeerConnectionFailed) => Some(Ended),
            // Verbindung nie erreicht: kein "ended", sondern "failed"
            (Connecting | Ringing, RemoteDisconnected | PeerConnectionFailed) => Some(Failed),
            (Idle, LocalHangup) => None,
            (_, LocalHangup) => Some(Ended),
            _ => None,
        }
    }
}

/// Rolle des lokalen Clients, fest ab Erzeugung der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein einzelner Anrufversuch
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    /// Vom Server vergeben, fehlt bis `create_call` erfolgreich war
    pub id: Option<String>,
    pub conversation_id: String,
    pub initiator_id: String,
    pub peer_ids: Vec<String>,
    pub call_type: CallType,
    pub role: CallRole,
    state: CallState,
    local_signal: Option<SessionDescription>,
    remote_signal: Option<SessionDescription>,
    ice_candidates: Vec<IceCandidateRecord>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Ausgehender Anruf, startet in `connecting`
    pub fn outbound(conversation_id: String, initiator_id: String, call_type: CallType) -> Self {
        let mut session = Self::blank(conversation_id, initiator_id, call_type, CallRole::Caller);
        session.state = CallState::Idle;
        session.apply(SessionEvent::StartCall);
        session
    }

    /// Eingehender Anruf, startet in `incoming`
    pub fn incoming(
        id: String,
        conversation_id: String,
        initiator_id: String,
        call_type: CallType,
    ) -> Self {
        let mut session = Self::blank(
            conversation_id,
            initiator_id.clone(),
            call_type,
            CallRole::Callee,
        );
        session.id = Some(id);
        session.peer_ids.push(initiator_id);
        session.state = CallState::Incoming;
        session
    }

    fn blank(
        conversation_id: String,
        initiator_id: String,
        call_type: CallType,
        role: CallRole,
    ) -> Self {
        Self {
            id: None,
            conversation_id,
            initiator_id,
            peer_ids: Vec::new(),
            call_type,
            role,
            state: CallState::Idle,
            local_signal: None,
            remote_signal: None,
            ice_candidates: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wendet ein Event an und gibt den neuen Zustand zurück, falls er sich geändert hat
    pub fn apply(&mut self, event: SessionEvent) -> Option<CallState> {
        let next = self.state.next(event)?;
        tracing::debug!("Session {:?}: {:?} --{:?}--> {:?}", self.id, self.state, event, next);
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Some(next)
    }

    pub fn assign_id(&mut self, id: String) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.id = Some(id);
        Ok(())
    }

    pub fn local_signal(&self) -> Option<&SessionDescription> {
        self.local_signal.as_ref()
    }

    pub fn remote_signal(&self) -> Option<&SessionDescription> {
        self.remote_signal.as_ref()
    }

    pub fn set_local_signal(&mut self, desc: SessionDescription) -> Result<(), SessionError> {
        self.ensure_active()?;
        if self.local_signal.is_some() {
            return Err(SessionError::DuplicateLocalSignal);
        }
        self.local_signal = Some(desc);
        Ok(())
    }

    /// Genau ein Offer bzw. Answer pro Session; ein zweites ist ein Protokollfehler
    pub fn set_remote_signal(&mut self, desc: SessionDescription) -> Result<(), SessionError> {
        self.ensure_active()?;
        if self.remote_signal.is_some() {
            return Err(SessionError::DuplicateRemoteSignal);
        }
        self.remote_signal = Some(desc);
        Ok(())
    }

    pub fn ice_candidates(&self) -> &[IceCandidateRecord] {
        &self.ice_candidates
    }

    /// Append-only Log aller ausgetauschten Candidates (beide Richtungen)
    ///
    /// Nur der Anrufer lernt Peers daraus; beim Angerufenen steht der Peer
    /// (der Initiator) schon fest.
    pub fn record_ice(&mut self, record: IceCandidateRecord) -> Result<(), SessionError> {
        self.ensure_active()?;
        if self.role == CallRole::Caller
            && !record.participant_id.is_empty()
            && record.participant_id != self.initiator_id
            && !self.peer_ids.contains(&record.participant_id)
        {
            self.peer_ids.push(record.participant_id.clone());
        }
        self.ice_candidates.push(record);
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            Err(SessionError::Terminal(self.state))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
