//! Call Engine - Controller für den Anruf-Lebenszyklus
//!
//! Einzige Stelle, die den Zustand einer [`CallSession`] verändert.
//! Koordiniert lokale Medien, Peer Connection und Signaling:
//! - Ausgehend: Medien → `create_call` → Offer → Polling bis Answer
//! - Eingehend: Medien → Offer abholen → Answer → Polling
//! - Jeder terminale Übergang läuft über denselben Cleanup
//!
//! Hintergrund-Tasks (Polling, Klingel-Timer, Peer-Events) halten nur eine
//! `Weak`-Referenz und eine Generation. Gehört die Generation nicht mehr
//! zur aktuellen Session, beenden sie sich.

use super::cleanup::ResourceGuard;
use super::ice::RemoteIceQueue;
use super::media::{
    LocalMedia, MediaAdapter, MediaError, PeerConnection, PeerConnectionState, PeerEvent,
    TrackKind,
};
use super::session::{CallRole, CallSession, CallState, SessionError, SessionEvent};
use super::webrtc_adapter::WebRtcMediaAdapter;
use crate::config::CallConfig;
use crate::signaling::{
    CallStatusUpdate, CallType, HttpSignalingClient, IceCandidate, IceCandidateRecord,
    PendingCall, RemoteCallStatus, SessionDescription, SignalPayload, SignalingError,
    SignalingTransport,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallEngineError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Call setup failed: {0}")]
    SetupFailed(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call with id {0}")]
    NoIncomingCall(String),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call was ended during setup")]
    Cancelled,
}

impl CallEngineError {
    /// Nur diese Fehler gehören in die UI; alles andere wird geloggt
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            CallEngineError::Media(_)
                | CallEngineError::SetupFailed(_)
                | CallEngineError::AlreadyInCall
        )
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged {
        call_id: Option<String>,
        state: CallState,
    },
    IncomingCall(PendingCall),
    RemoteTrack {
        track_id: String,
        kind: TrackKind,
    },
    MediaToggled {
        kind: TrackKind,
        enabled: bool,
    },
    Error(String),
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Wie viele gemeldete eingehende Anruf-IDs gemerkt werden
const SEEN_INCOMING_LIMIT: usize = 64;

/// Ergebnis beim Warten auf das Offer des Anrufers
enum OfferFetch {
    Ready(CallStatusUpdate, SessionDescription),
    RemoteEnded,
    Cancelled,
    TimedOut,
}

struct Inner {
    session: Option<CallSession>,
    generation: u64,
    resources: ResourceGuard,
    ice: RemoteIceQueue,
    /// Lokale Candidates, die vor der Session-ID entdeckt wurden
    outgoing_ice: Vec<IceCandidate>,
    /// Zuletzt gemeldete eingehende Anrufe, älteste vorne
    seen_incoming: VecDeque<String>,
    watcher: Option<JoinHandle<()>>,
}

struct Shared {
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaAdapter>,
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(watcher) = self.inner.get_mut().watcher.take() {
            watcher.abort();
        }
    }
}

/// Call Session Controller
#[derive(Clone)]
pub struct CallEngine {
    shared: Arc<Shared>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaAdapter>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let ice = RemoteIceQueue::new(config.user_id.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                media,
                inner: Mutex::new(Inner {
                    session: None,
                    generation: 0,
                    resources: ResourceGuard::new(),
                    ice,
                    outgoing_ice: Vec::new(),
                    seen_incoming: VecDeque::new(),
                    watcher: None,
                }),
                event_tx,
            }),
        }
    }

    /// HTTP-Signaling und webrtc-rs Adapter aus der Konfiguration
    pub fn from_config(config: CallConfig) -> Result<Self, SignalingError> {
        let transport = Arc::new(HttpSignalingClient::from_config(&config)?);
        Ok(Self::new(
            config,
            transport,
            Arc::new(WebRtcMediaAdapter::default()),
        ))
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .map(CallSession::state)
            .unwrap_or(CallState::Idle)
    }

    /// Snapshot der aktuellen Session
    pub fn session(&self) -> Option<CallSession> {
        self.shared.inner.lock().session.clone()
    }

    /// Enabled-Flags der lokalen Tracks (video, audio)
    pub fn media_state(&self) -> (Option<bool>, Option<bool>) {
        match self.shared.inner.lock().resources.media() {
            Some(media) => (
                media.is_enabled(TrackKind::Video),
                media.is_enabled(TrackKind::Audio),
            ),
            None => (None, None),
        }
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Startet einen ausgehenden Anruf und gibt die Session-ID zurück
    pub async fn start_call(
        &self,
        conversation_id: &str,
        call_type: CallType,
    ) -> Result<String, CallEngineError> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.session.as_ref().is_some_and(|s| !s.is_terminal()) {
                return Err(CallEngineError::AlreadyInCall);
            }

            let session = CallSession::outbound(
                conversation_id.to_string(),
                self.shared.config.user_id.clone(),
                call_type,
            );
            Self::begin_session(&mut inner, session, &self.shared.config)
        };

        tracing::info!("Starting {} call in conversation {}", call_type, conversation_id);
        self.emit(CallEvent::StateChanged {
            call_id: None,
            state: CallState::Connecting,
        });

        // Medien anfordern
        let media = match self
            .shared
            .media
            .acquire_local_media(call_type.has_video())
            .await
        {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Media acquisition failed: {}", e);
                self.transition(generation, SessionEvent::MediaDenied);
                self.cleanup().await;
                self.emit(CallEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };
        self.install_media(generation, Arc::clone(&media))?;

        // Session beim Server anlegen
        let call_id = match self
            .shared
            .transport
            .create_call(conversation_id, call_type)
            .await
        {
            Ok(id) => id,
            Err(e) => return Err(self.fail_setup(generation, None, e.to_string()).await),
        };

        let assigned = {
            let mut inner = self.shared.inner.lock();
            let inner = &mut *inner;
            match inner.session.as_mut() {
                Some(session) if inner.generation == generation => {
                    session.assign_id(call_id.clone()).is_ok()
                }
                _ => false,
            }
        };
        if !assigned {
            // Während des Requests aufgelegt: Server-Anruf wieder beenden
            self.notify_end(&call_id).await;
            return Err(CallEngineError::Cancelled);
        }

        // Peer Connection + Offer
        let pc = match self.setup_peer_connection(generation, media).await {
            Ok(pc) => pc,
            Err(CallEngineError::Cancelled) => {
                self.notify_end(&call_id).await;
                return Err(CallEngineError::Cancelled);
            }
            Err(e) => return Err(self.fail_setup(generation, Some(&call_id), e.to_string()).await),
        };

        let offer = match pc.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail_setup(generation, Some(&call_id), e.to_string()).await),
        };

        // Local Description muss stehen, bevor das Offer rausgeht
        if let Err(e) = pc.set_local_description(offer.clone()).await {
            return Err(self.fail_setup(generation, Some(&call_id), e.to_string()).await);
        }

        if !self.with_current(generation, |session| {
            session.set_local_signal(offer.clone()).is_ok()
        }) {
            self.notify_end(&call_id).await;
            return Err(CallEngineError::Cancelled);
        }

        if let Err(e) = self
            .shared
            .transport
            .send_signal(&call_id, &SignalPayload::from(offer))
            .await
        {
            return Err(self.fail_setup(generation, Some(&call_id), e.to_string()).await);
        }

        self.flush_outgoing_ice(generation, &call_id).await;

        if self.transition(generation, SessionEvent::OfferCreated) != Some(CallState::Ringing) {
            return Err(CallEngineError::Cancelled);
        }

        self.spawn_poll_loop(generation, call_id.clone());
        self.spawn_ring_timer(generation, call_id.clone());

        tracing::info!("Call {} is ringing", call_id);
        Ok(call_id)
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Fragt den offenen Anruf einer Konversation ab und registriert ihn als eingehend
    pub async fn check_incoming(
        &self,
        conversation_id: &str,
    ) -> Result<Option<CallSession>, CallEngineError> {
        let pending = self.shared.transport.pending_call(conversation_id).await?;

        let call = match pending {
            Some(call)
                if call.initiator_id != self.shared.config.user_id
                    && RemoteCallStatus::parse(&call.status).is_waiting() =>
            {
                call
            }
            _ => {
                self.dismiss_vanished_incoming(conversation_id, None).await;
                return Ok(None);
            }
        };

        self.dismiss_vanished_incoming(conversation_id, Some(&call.id))
            .await;

        let session = {
            let mut inner = self.shared.inner.lock();
            if inner.seen_incoming.contains(&call.id) {
                return Ok(None);
            }
            if inner.session.as_ref().is_some_and(|s| !s.is_terminal()) {
                tracing::debug!("Ignoring incoming call {} while busy", call.id);
                return Ok(None);
            }

            remember_incoming(&mut inner.seen_incoming, &call.id);
            let mut session = CallSession::incoming(
                call.id.clone(),
                call.conversation_id.clone(),
                call.initiator_id.clone(),
                call.call_type,
            );
            for participant in &call.participants {
                if *participant != self.shared.config.user_id
                    && !session.peer_ids.contains(participant)
                {
                    session.peer_ids.push(participant.clone());
                }
            }
            Self::begin_session(&mut inner, session.clone(), &self.shared.config);
            session
        };

        tracing::info!("Incoming {} call {} from {}", call.call_type, call.id, call.initiator_id);
        self.emit(CallEvent::StateChanged {
            call_id: Some(call.id.clone()),
            state: CallState::Incoming,
        });
        self.emit(CallEvent::IncomingCall(call));

        Ok(Some(session))
    }

    /// Anrufer hat aufgegeben, bevor wir angenommen haben
    async fn dismiss_vanished_incoming(&self, conversation_id: &str, still_pending: Option<&str>) {
        let generation = {
            let inner = self.shared.inner.lock();
            match inner.session.as_ref() {
                Some(s)
                    if s.state() == CallState::Incoming
                        && s.conversation_id == conversation_id
                        && s.id.as_deref() != still_pending =>
                {
                    inner.generation
                }
                _ => return,
            }
        };

        tracing::info!("Incoming call in {} is gone, dismissing", conversation_id);
        if self.transition(generation, SessionEvent::LocalHangup).is_some() {
            self.cleanup().await;
        }
    }

    /// Startet periodisches `check_incoming` für eine Konversation
    pub fn watch_incoming(&self, conversation_id: &str) {
        let weak = Arc::downgrade(&self.shared);
        let conversation_id = conversation_id.to_string();
        let interval = self.shared.config.incoming_poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let engine = CallEngine { shared };
                match engine.check_incoming(&conversation_id).await {
                    Ok(_) => {}
                    Err(CallEngineError::Signaling(e)) => log_poll_error(&conversation_id, &e),
                    Err(e) => tracing::warn!("Incoming call check failed: {}", e),
                }
            }
        });

        if let Some(old) = self.shared.inner.lock().watcher.replace(handle) {
            old.abort();
        }
    }

    /// Beendet den Incoming-Watcher. Idempotent.
    pub fn stop_watching(&self) {
        if let Some(watcher) = self.shared.inner.lock().watcher.take() {
            watcher.abort();
        }
    }

    /// Akzeptiert einen eingehenden Anruf
    pub async fn accept_call(&self, call_id: &str) -> Result<(), CallEngineError> {
        let (generation, call_type) = {
            let mut inner = self.shared.inner.lock();
            let generation = inner.generation;
            let session = inner
                .session
                .as_mut()
                .filter(|s| s.state() == CallState::Incoming && s.id.as_deref() == Some(call_id))
                .ok_or_else(|| CallEngineError::NoIncomingCall(call_id.to_string()))?;
            let call_type = session.call_type;
            session.apply(SessionEvent::Accept);
            (generation, call_type)
        };

        tracing::info!("Accepting call {}", call_id);
        self.emit(CallEvent::StateChanged {
            call_id: Some(call_id.to_string()),
            state: CallState::Connecting,
        });

        // Audio-only oder Audio+Video je nach Anruftyp
        let media = match self
            .shared
            .media
            .acquire_local_media(call_type.has_video())
            .await
        {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Media acquisition failed: {}", e);
                if self.transition(generation, SessionEvent::MediaDenied).is_some() {
                    self.cleanup().await;
                    self.notify_reject(call_id).await;
                }
                self.emit(CallEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };
        self.install_media(generation, Arc::clone(&media))?;

        let pc = match self.setup_peer_connection(generation, media).await {
            Ok(pc) => pc,
            Err(CallEngineError::Cancelled) => return Err(CallEngineError::Cancelled),
            Err(e) => return Err(self.fail_setup(generation, Some(call_id), e.to_string()).await),
        };

        let (status, offer) = match self.fetch_offer(generation, call_id).await {
            OfferFetch::Ready(status, offer) => (status, offer),
            OfferFetch::RemoteEnded => {
                tracing::info!("Call {} ended before it could be accepted", call_id);
                if self.transition(generation, SessionEvent::LocalHangup).is_some() {
                    self.cleanup().await;
                }
                return Err(CallEngineError::Cancelled);
            }
            OfferFetch::Cancelled => return Err(CallEngineError::Cancelled),
            OfferFetch::TimedOut => {
                return Err(self
                    .fail_setup(generation, Some(call_id), "no offer received".to_string())
                    .await);
            }
        };

        match self.with_current_result(generation, |session| session.set_remote_signal(offer.clone())) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail_setup(generation, Some(call_id), e.to_string()).await),
            None => return Err(CallEngineError::Cancelled),
        }

        // Remote Description vor dem Answer
        if let Err(e) = pc.set_remote_description(offer).await {
            return Err(self.fail_setup(generation, Some(call_id), e.to_string()).await);
        }
        let flushed = self.remote_description_applied(generation);

        let answer = match pc.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_setup(generation, Some(call_id), e.to_string()).await),
        };
        if let Err(e) = pc.set_local_description(answer.clone()).await {
            return Err(self.fail_setup(generation, Some(call_id), e.to_string()).await);
        }
        if !self.with_current(generation, |session| {
            session.set_local_signal(answer.clone()).is_ok()
        }) {
            return Err(CallEngineError::Cancelled);
        }

        if let Err(e) = self
            .shared
            .transport
            .send_signal(call_id, &SignalPayload::from(answer))
            .await
        {
            return Err(self.fail_setup(generation, Some(call_id), e.to_string()).await);
        }

        if self.transition(generation, SessionEvent::AnswerSent) != Some(CallState::Connected) {
            return Err(CallEngineError::Cancelled);
        }

        // Bereits gesammelte Candidates des Anrufers anwenden, dann pollen
        self.apply_candidates(&pc, flushed).await;
        self.apply_remote_candidates(generation, &status.ice_candidates)
            .await;
        self.flush_outgoing_ice(generation, call_id).await;
        self.spawn_poll_loop(generation, call_id.to_string());

        tracing::info!("Call {} connected", call_id);
        Ok(())
    }

    /// Pollt, bis das Offer des Anrufers auf dem Server liegt
    ///
    /// Der Anruf kann gemeldet werden, bevor der Anrufer sein Offer
    /// hinterlegt hat. Fehlgeschlagene Abfragen werden wiederholt,
    /// höchstens bis zum Klingel-Timeout.
    async fn fetch_offer(&self, generation: u64, call_id: &str) -> OfferFetch {
        let deadline = tokio::time::Instant::now() + self.shared.config.ring_timeout;

        loop {
            if !self.is_current(generation) {
                return OfferFetch::Cancelled;
            }

            match self.shared.transport.poll_status(call_id).await {
                Ok(status) if matches!(status.status, RemoteCallStatus::Ended | RemoteCallStatus::Rejected) => {
                    return OfferFetch::RemoteEnded;
                }
                Ok(status) => match status.offer.clone() {
                    Some(offer) => return OfferFetch::Ready(status, offer),
                    None => tracing::debug!("No offer stored for {} yet", call_id),
                },
                Err(e) => log_poll_error(call_id, &e),
            }

            if tokio::time::Instant::now() >= deadline {
                return OfferFetch::TimedOut;
            }
            tokio::time::sleep(self.shared.config.negotiating_poll_interval).await;
        }
    }

    /// Lehnt einen eingehenden Anruf ab
    pub async fn reject_call(&self, call_id: &str) -> Result<(), CallEngineError> {
        let generation = {
            let inner = self.shared.inner.lock();
            match inner.session.as_ref() {
                Some(s) if s.state() == CallState::Incoming && s.id.as_deref() == Some(call_id) => {
                    inner.generation
                }
                _ => return Err(CallEngineError::NoIncomingCall(call_id.to_string())),
            }
        };

        tracing::info!("Rejecting call {}", call_id);
        self.notify_reject(call_id).await;

        self.transition(generation, SessionEvent::Reject);
        self.cleanup().await;
        Ok(())
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    /// Beendet den aktuellen Anruf
    pub async fn end_call(&self) -> Result<(), CallEngineError> {
        let (generation, call_id) = {
            let inner = self.shared.inner.lock();
            match inner.session.as_ref() {
                Some(s) if !s.is_terminal() => (inner.generation, s.id.clone()),
                _ => return Err(CallEngineError::NoActiveCall),
            }
        };

        tracing::info!("Hanging up call {:?}", call_id);
        self.transition(generation, SessionEvent::LocalHangup);
        self.cleanup().await;

        // Best effort, lokaler Cleanup ist bereits passiert
        if let Some(call_id) = call_id {
            self.notify_end(&call_id).await;
        }
        Ok(())
    }

    /// Schaltet die Kamera um, ohne neu zu verhandeln. `None` ohne aktiven Anruf.
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    /// Schaltet das Mikrofon um. `None` ohne aktiven Anruf.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let enabled = {
            let inner = self.shared.inner.lock();
            if inner.session.as_ref().map_or(true, CallSession::is_terminal) {
                return None;
            }
            let media = inner.resources.media()?;
            let current = media.is_enabled(kind)?;
            media.set_enabled(kind, !current)?
        };

        tracing::info!("{:?} track {}", kind, if enabled { "enabled" } else { "disabled" });
        self.emit(CallEvent::MediaToggled { kind, enabled });
        Some(enabled)
    }

    /// Teardown: laufenden Anruf beenden, Watcher stoppen, alles freigeben
    pub async fn shutdown(&self) {
        self.stop_watching();
        match self.end_call().await {
            Ok(()) | Err(CallEngineError::NoActiveCall) => {}
            Err(e) => tracing::warn!("Error while ending call on shutdown: {}", e),
        }
        self.cleanup().await;
    }

    // ========================================================================
    // STATUS UPDATES
    // ========================================================================

    /// Verarbeitet einen Status-Snapshot der aktuellen Session
    pub async fn apply_status_update(&self, update: CallStatusUpdate) {
        let generation = self.shared.inner.lock().generation;
        self.handle_status_update(generation, update).await;
    }

    async fn handle_status_update(&self, generation: u64, update: CallStatusUpdate) {
        let (state, role, pc) = {
            let inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.session.as_ref() {
                Some(s) if !s.is_terminal() => (s.state(), s.role, inner.resources.peer_connection()),
                _ => return,
            }
        };

        // Terminale Status vom Server
        let remote_end = match update.status {
            RemoteCallStatus::Rejected | RemoteCallStatus::Ended if state == CallState::Ringing => {
                Some(SessionEvent::RemoteRejected)
            }
            RemoteCallStatus::Rejected | RemoteCallStatus::Ended => {
                Some(SessionEvent::RemoteDisconnected)
            }
            _ => None,
        };
        if let Some(event) = remote_end {
            tracing::info!("Remote side finished the call ({:?})", update.status);
            if self.transition(generation, event).is_some() {
                self.cleanup().await;
            }
            return;
        }

        // Answer für den Anrufer
        if role == CallRole::Caller && state == CallState::Ringing {
            if let (Some(answer), Some(pc)) = (update.answer.clone(), pc.as_ref()) {
                self.apply_answer(generation, pc, answer).await;
            }
        }

        self.apply_remote_candidates(generation, &update.ice_candidates)
            .await;
    }

    async fn apply_answer(
        &self,
        generation: u64,
        pc: &Arc<dyn PeerConnection>,
        answer: SessionDescription,
    ) {
        match self.with_current_result(generation, |session| {
            session.set_remote_signal(answer.clone())
        }) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::debug!("Ignoring answer: {}", e);
                return;
            }
            None => return,
        }

        tracing::info!("Answer received, setting remote description");
        if let Err(e) = pc.set_remote_description(answer).await {
            tracing::error!("Failed to apply answer: {}", e);
            if self
                .fail_locally(generation, SessionEvent::PeerConnectionFailed)
                .await
            {
                self.emit(CallEvent::Error(e.to_string()));
            }
            return;
        }

        let flushed = self.remote_description_applied(generation);
        if self.transition(generation, SessionEvent::AnswerReceived).is_some() {
            self.apply_candidates(pc, flushed).await;
        }
    }

    async fn apply_remote_candidates(&self, generation: u64, records: &[IceCandidateRecord]) {
        if records.is_empty() {
            return;
        }

        let (ready, pc) = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            let inner = &mut *inner;
            let Some(session) = inner.session.as_mut().filter(|s| !s.is_terminal()) else {
                return;
            };

            let (ready, fresh) = inner.ice.accept(records);
            for record in fresh {
                let _ = session.record_ice(record);
            }
            (ready, inner.resources.peer_connection())
        };

        if let Some(pc) = pc {
            self.apply_candidates(&pc, ready).await;
        }
    }

    /// Einzelne kaputte oder doppelte Candidates brechen die Verhandlung nicht ab
    async fn apply_candidates(&self, pc: &Arc<dyn PeerConnection>, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::debug!("Ignoring ICE candidate: {}", e);
            }
        }
    }

    fn remote_description_applied(&self, generation: u64) -> Vec<IceCandidate> {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return Vec::new();
        }
        inner.ice.remote_description_applied()
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn handle_peer_event(&self, generation: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_local_candidate(generation, candidate).await;
            }
            PeerEvent::RemoteTrack { track_id, kind } => {
                tracing::info!("Remote {:?} track {}", kind, track_id);
                self.emit(CallEvent::RemoteTrack { track_id, kind });
            }
            PeerEvent::ConnectionState(state) if state.is_lost() => {
                let event = match state {
                    PeerConnectionState::Failed => SessionEvent::PeerConnectionFailed,
                    _ => SessionEvent::RemoteDisconnected,
                };
                if self.fail_locally(generation, event).await {
                    tracing::info!("Peer connection {:?}, call cleaned up", state);
                }
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!("Peer connection state {:?}", state);
            }
        }
    }

    async fn send_local_candidate(&self, generation: u64, candidate: IceCandidate) {
        let call_id = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            let inner = &mut *inner;
            let Some(session) = inner.session.as_mut().filter(|s| !s.is_terminal()) else {
                return;
            };
            let _ = session.record_ice(IceCandidateRecord {
                participant_id: self.shared.config.user_id.clone(),
                candidate: candidate.clone(),
            });
            match session.id.clone() {
                Some(id) => id,
                None => {
                    inner.outgoing_ice.push(candidate);
                    return;
                }
            }
        };

        if let Err(e) = self
            .shared
            .transport
            .send_ice_candidate(&call_id, &candidate)
            .await
        {
            tracing::warn!("Failed to send ICE candidate: {}", e);
        }
    }

    async fn flush_outgoing_ice(&self, generation: u64, call_id: &str) {
        let queued = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            std::mem::take(&mut inner.outgoing_ice)
        };

        if queued.is_empty() {
            return;
        }

        tracing::debug!("Flushing {} queued ICE candidate(s)", queued.len());
        let sends = queued
            .iter()
            .map(|candidate| self.shared.transport.send_ice_candidate(call_id, candidate));
        for result in join_all(sends).await {
            if let Err(e) = result {
                tracing::warn!("Failed to send queued ICE candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn begin_session(inner: &mut Inner, session: CallSession, config: &CallConfig) -> u64 {
        // Vorherige (terminale) Session hat nichts mehr zu halten
        let _ = inner.resources.release();
        inner.generation += 1;
        inner.session = Some(session);
        inner.ice = RemoteIceQueue::new(config.user_id.clone());
        inner.outgoing_ice.clear();
        inner.generation
    }

    /// Aktualisiert den State und sendet Event
    fn transition(&self, generation: u64, event: SessionEvent) -> Option<CallState> {
        let (call_id, state) = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return None;
            }
            let inner = &mut *inner;
            let session = inner.session.as_mut()?;
            let state = session.apply(event)?;
            if state == CallState::Connected {
                inner.resources.cancel_ring_timer();
            }
            (session.id.clone(), state)
        };

        tracing::info!("Call {:?} is now {}", call_id, state.as_str());
        self.emit(CallEvent::StateChanged { call_id, state });
        Some(state)
    }

    /// Der eine Cleanup für alle Exit-Pfade. Idempotent.
    async fn cleanup(&self) {
        let closing = {
            let mut inner = self.shared.inner.lock();
            inner.outgoing_ice.clear();
            inner.resources.release()
        };

        if let Some(closing) = closing {
            let _ = closing.await;
        }
    }

    /// Lokal erkannter Abbruch: Server informieren, dann aufräumen
    ///
    /// Läuft in Poll- oder Event-Task, die der Cleanup abbricht; deshalb
    /// kommt die Benachrichtigung zuerst.
    async fn fail_locally(&self, generation: u64, event: SessionEvent) -> bool {
        if self.transition(generation, event).is_none() {
            return false;
        }
        let call_id = self
            .shared
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.id.clone());
        if let Some(call_id) = call_id {
            self.notify_end(&call_id).await;
        }
        self.cleanup().await;
        true
    }

    /// Setup-Fehler: Session auf `failed`, Ressourcen frei, Server best effort informieren
    async fn fail_setup(
        &self,
        generation: u64,
        call_id: Option<&str>,
        reason: String,
    ) -> CallEngineError {
        if self
            .transition(generation, SessionEvent::CreateFailed)
            .is_none()
        {
            return CallEngineError::Cancelled;
        }

        tracing::error!("Call setup failed: {}", reason);
        self.cleanup().await;
        if let Some(call_id) = call_id {
            self.notify_end(call_id).await;
        }
        self.emit(CallEvent::Error(reason.clone()));
        CallEngineError::SetupFailed(reason)
    }

    fn install_media(
        &self,
        generation: u64,
        media: Arc<dyn LocalMedia>,
    ) -> Result<(), CallEngineError> {
        let mut inner = self.shared.inner.lock();
        let current = inner.generation == generation
            && inner.session.as_ref().is_some_and(|s| !s.is_terminal());
        if current {
            inner.resources.set_media(media);
            Ok(())
        } else {
            drop(inner);
            media.stop();
            Err(CallEngineError::Cancelled)
        }
    }

    async fn setup_peer_connection(
        &self,
        generation: u64,
        media: Arc<dyn LocalMedia>,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = self
            .shared
            .media
            .create_peer_connection(media, &self.shared.config.ice_servers, tx)
            .await?;

        let weak = Arc::downgrade(&self.shared);
        let installed = {
            let mut inner = self.shared.inner.lock();
            let current = inner.generation == generation
                && inner.session.as_ref().is_some_and(|s| !s.is_terminal());
            if current {
                inner.resources.set_peer_connection(Arc::clone(&pc));
                inner.resources.set_event_pump(tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let Some(engine) = upgrade(&weak) else {
                            return;
                        };
                        engine.handle_peer_event(generation, event).await;
                    }
                }));
            }
            current
        };

        if !installed {
            pc.close().await;
            return Err(CallEngineError::Cancelled);
        }
        Ok(pc)
    }

    fn spawn_poll_loop(&self, generation: u64, call_id: String) {
        let weak = Arc::downgrade(&self.shared);
        let negotiating = self.shared.config.negotiating_poll_interval;
        let connected = self.shared.config.connected_poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                let interval = {
                    let Some(engine) = upgrade(&weak) else {
                        return;
                    };
                    let inner = engine.shared.inner.lock();
                    if inner.generation != generation {
                        return;
                    }
                    match inner.session.as_ref().map(CallSession::state) {
                        Some(CallState::Connected) => connected,
                        Some(state) if !state.is_terminal() => negotiating,
                        _ => return,
                    }
                };

                tokio::time::sleep(interval).await;

                let Some(engine) = upgrade(&weak) else {
                    return;
                };
                match engine.shared.transport.poll_status(&call_id).await {
                    Ok(update) => engine.handle_status_update(generation, update).await,
                    Err(e) => log_poll_error(&call_id, &e),
                }
            }
        });

        let mut inner = self.shared.inner.lock();
        if inner.generation == generation {
            inner.resources.set_poll_task(handle);
        } else {
            handle.abort();
        }
    }

    fn spawn_ring_timer(&self, generation: u64, call_id: String) {
        let weak = Arc::downgrade(&self.shared);
        let timeout = self.shared.config.ring_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(engine) = upgrade(&weak) else {
                return;
            };
            if engine.transition(generation, SessionEvent::RingTimeout).is_some() {
                tracing::info!("Call {} not answered within {:?}", call_id, timeout);
                // Vor dem Cleanup, der diesen Task abbricht
                engine.notify_end(&call_id).await;
                engine.cleanup().await;
            }
        });

        let mut inner = self.shared.inner.lock();
        if inner.generation == generation {
            inner.resources.set_ring_timer(handle);
        } else {
            handle.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.shared.inner.lock();
        inner.generation == generation && inner.session.as_ref().is_some_and(|s| !s.is_terminal())
    }

    fn with_current<F>(&self, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut CallSession) -> bool,
    {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return false;
        }
        match inner.session.as_mut() {
            Some(session) if !session.is_terminal() => f(session),
            _ => false,
        }
    }

    fn with_current_result<F, T>(&self, generation: u64, f: F) -> Option<Result<T, SessionError>>
    where
        F: FnOnce(&mut CallSession) -> Result<T, SessionError>,
    {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return None;
        }
        match inner.session.as_mut() {
            Some(session) if !session.is_terminal() => Some(f(session)),
            _ => None,
        }
    }

    async fn notify_end(&self, call_id: &str) {
        if let Err(e) = self.shared.transport.end(call_id).await {
            tracing::warn!("Failed to notify end of call {}: {}", call_id, e);
        }
    }

    async fn notify_reject(&self, call_id: &str) {
        if let Err(e) = self.shared.transport.reject(call_id).await {
            tracing::warn!("Failed to notify rejection of call {}: {}", call_id, e);
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.shared.event_tx.send(event);
    }
}

/// Polling versucht es beim nächsten Tick erneut; nur die Log-Stufe unterscheidet sich
fn log_poll_error(target: &str, error: &SignalingError) {
    if error.is_transient() {
        tracing::warn!("Poll for {} failed, retrying: {}", target, error);
    } else {
        tracing::error!("Poll for {} rejected by server, retrying: {}", target, error);
    }
}

fn remember_incoming(seen: &mut VecDeque<String>, call_id: &str) {
    seen.push_back(call_id.to_string());
    while seen.len() > SEEN_INCOMING_LIMIT {
        seen.pop_front();
    }
}

fn upgrade(weak: &Weak<Shared>) -> Option<CallEngine> {
    weak.upgrade().map(|shared| CallEngine { shared })
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("CallEngine")
            .field("state", &inner.session.as_ref().map(CallSession::state))
            .field("call_id", &inner.session.as_ref().and_then(|s| s.id.clone()))
            .field("resources", &inner.resources)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::call_engine::media::PeerEventSender;
    use super::*;
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    struct FakeTransport {
        log: Mutex<Vec<String>>,
        status: Mutex<CallStatusUpdate>,
        pending: Mutex<Option<PendingCall>>,
        sent_ice: Mutex<Vec<IceCandidate>>,
        fail_create: AtomicBool,
        /// Anzahl der noch fehlschlagenden Status-Abfragen
        fail_polls: AtomicUsize,
        polls: AtomicUsize,
        /// Snapshots, die vor `status` ausgeliefert werden
        status_queue: Mutex<VecDeque<CallStatusUpdate>>,
    }

    impl Default for FakeTransport {
        fn default() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                status: Mutex::new(CallStatusUpdate::new(RemoteCallStatus::Pending)),
                pending: Mutex::new(None),
                sent_ice: Mutex::new(Vec::new()),
                fail_create: AtomicBool::new(false),
                fail_polls: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
                status_queue: Mutex::new(VecDeque::new()),
            }
        }
    }

    impl FakeTransport {
        fn logged(&self, entry: &str) -> bool {
            self.log.lock().iter().any(|e| e == entry)
        }
    }

    #[async_trait]
    impl SignalingTransport for FakeTransport {
        async fn create_call(
            &self,
            conversation_id: &str,
            _call_type: CallType,
        ) -> Result<String, SignalingError> {
            self.log.lock().push(format!("create:{}", conversation_id));
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(SignalingError::ServerError {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok("s1".to_string())
        }

        async fn send_signal(
            &self,
            call_id: &str,
            payload: &SignalPayload,
        ) -> Result<(), SignalingError> {
            let kind = match payload {
                SignalPayload::Offer { .. } => "offer",
                SignalPayload::Answer { .. } => "answer",
                SignalPayload::IceCandidate(_) => "ice",
            };
            self.log.lock().push(format!("{}:{}", kind, call_id));
            Ok(())
        }

        async fn poll_status(&self, _call_id: &str) -> Result<CallStatusUpdate, SignalingError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SignalingError::ServerError {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            if let Some(queued) = self.status_queue.lock().pop_front() {
                return Ok(queued);
            }
            Ok(self.status.lock().clone())
        }

        async fn send_ice_candidate(
            &self,
            _call_id: &str,
            candidate: &IceCandidate,
        ) -> Result<(), SignalingError> {
            self.sent_ice.lock().push(candidate.clone());
            Ok(())
        }

        async fn reject(&self, call_id: &str) -> Result<(), SignalingError> {
            self.log.lock().push(format!("reject:{}", call_id));
            Ok(())
        }

        async fn end(&self, call_id: &str) -> Result<(), SignalingError> {
            self.log.lock().push(format!("end:{}", call_id));
            Err(SignalingError::RequestFailed("offline".into()))
        }

        async fn pending_call(
            &self,
            _conversation_id: &str,
        ) -> Result<Option<PendingCall>, SignalingError> {
            Ok(self.pending.lock().clone())
        }
    }

    struct FakeStream {
        audio: AtomicBool,
        video: Option<AtomicBool>,
        stops: Arc<AtomicUsize>,
    }

    impl LocalMedia for FakeStream {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn has_track(&self, kind: TrackKind) -> bool {
            self.flag(kind).is_some()
        }

        fn set_enabled(&self, kind: TrackKind, enabled: bool) -> Option<bool> {
            self.flag(kind)?.store(enabled, Ordering::SeqCst);
            Some(enabled)
        }

        fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
            Some(self.flag(kind)?.load(Ordering::SeqCst))
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FakeStream {
        fn flag(&self, kind: TrackKind) -> Option<&AtomicBool> {
            match kind {
                TrackKind::Audio => Some(&self.audio),
                TrackKind::Video => self.video.as_ref(),
            }
        }
    }

    #[derive(Default)]
    struct FakePeer {
        remote_sets: AtomicUsize,
        added: Mutex<Vec<IceCandidate>>,
        closes: AtomicUsize,
        fail_remote: AtomicBool,
        bad_candidate: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), MediaError> {
            Ok(())
        }

        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), MediaError> {
            if self.fail_remote.load(Ordering::SeqCst) {
                return Err(MediaError::PeerConnection("malformed sdp".into()));
            }
            self.remote_sets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
            if self.bad_candidate.lock().as_deref() == Some(candidate.candidate.as_str()) {
                return Err(MediaError::PeerConnection("unparsable candidate".into()));
            }
            self.added.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeMedia {
        deny: AtomicBool,
        acquired: AtomicUsize,
        last_video: AtomicBool,
        stops: Arc<AtomicUsize>,
        peer: Arc<FakePeer>,
        events: Mutex<Option<PeerEventSender>>,
    }

    #[async_trait]
    impl MediaAdapter for FakeMedia {
        async fn acquire_local_media(
            &self,
            video_enabled: bool,
        ) -> Result<Arc<dyn LocalMedia>, MediaError> {
            if self.deny.load(Ordering::SeqCst) {
                return Err(MediaError::Denied("microphone".into()));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            self.last_video.store(video_enabled, Ordering::SeqCst);
            Ok(Arc::new(FakeStream {
                audio: AtomicBool::new(true),
                video: video_enabled.then(|| AtomicBool::new(true)),
                stops: Arc::clone(&self.stops),
            }))
        }

        async fn create_peer_connection(
            &self,
            _media: Arc<dyn LocalMedia>,
            _ice_servers: &[crate::config::IceServerConfig],
            events: PeerEventSender,
        ) -> Result<Arc<dyn PeerConnection>, MediaError> {
            *self.events.lock() = Some(events);
            let peer: Arc<dyn PeerConnection> = self.peer.clone();
            Ok(peer)
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn setup() -> (CallEngine, Arc<FakeTransport>, Arc<FakeMedia>) {
        let transport = Arc::new(FakeTransport::default());
        let media = Arc::new(FakeMedia::default());
        let config = CallConfig {
            user_id: "u1".to_string(),
            ..CallConfig::default()
        };
        let engine = CallEngine::new(config, transport.clone(), media.clone());
        (engine, transport, media)
    }

    fn record(participant: &str, candidate: &str) -> IceCandidateRecord {
        IceCandidateRecord {
            participant_id: participant.to_string(),
            candidate: IceCandidate::new(candidate),
        }
    }

    fn accepted_with_answer() -> CallStatusUpdate {
        CallStatusUpdate {
            answer: Some(SessionDescription::answer("v=0 remote")),
            ..CallStatusUpdate::new(RemoteCallStatus::Accepted)
        }
    }

    fn incoming_call() -> PendingCall {
        PendingCall {
            id: "s9".to_string(),
            conversation_id: "c1".to_string(),
            initiator_id: "u2".to_string(),
            call_type: CallType::Video,
            status: "ringing".to_string(),
            participants: vec!["u1".to_string(), "u2".to_string()],
        }
    }

    fn drain_states(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CallEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<CallEvent>, wanted: CallState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(CallEvent::StateChanged { state, .. }) if state == wanted => return,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {}", e),
                }
            }
        })
        .await
        .expect("state was not reached");
    }

    async fn settle(done: impl Fn() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn remote_offer() -> CallStatusUpdate {
        CallStatusUpdate {
            offer: Some(SessionDescription::offer("v=0 remote offer")),
            ..CallStatusUpdate::new(RemoteCallStatus::Ringing)
        }
    }

    async fn connected_callee() -> (CallEngine, Arc<FakeTransport>, Arc<FakeMedia>) {
        let (engine, transport, media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        *transport.status.lock() = CallStatusUpdate {
            offer: Some(SessionDescription::offer("v=0 remote offer")),
            ice_candidates: vec![record("u2", "candidate:early")],
            ..CallStatusUpdate::new(RemoteCallStatus::Ringing)
        };

        engine.check_incoming("c1").await.unwrap();
        engine.accept_call("s9").await.unwrap();
        (engine, transport, media)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_outbound_call_connects_once_answered() {
        let (engine, transport, media) = setup();
        let mut rx = engine.subscribe();

        let call_id = engine.start_call("c1", CallType::Audio).await.unwrap();
        assert_eq!(call_id, "s1");
        assert_eq!(engine.state(), CallState::Ringing);
        assert!(!media.last_video.load(Ordering::SeqCst));
        assert!(transport.logged("create:c1"));
        assert!(transport.logged("offer:s1"));

        // Jeder Poll liefert das Answer erneut
        engine.apply_status_update(accepted_with_answer()).await;
        engine.apply_status_update(accepted_with_answer()).await;

        assert_eq!(engine.state(), CallState::Connected);
        assert_eq!(media.peer.remote_sets.load(Ordering::SeqCst), 1);
        assert_eq!(
            drain_states(&mut rx),
            vec![CallState::Connecting, CallState::Ringing, CallState::Connected]
        );

        let session = engine.session().unwrap();
        assert_eq!(session.id.as_deref(), Some("s1"));
        assert!(session.local_signal().is_some());
        assert!(session.remote_signal().is_some());
    }

    #[tokio::test]
    async fn test_second_call_is_refused_while_active() {
        let (engine, _transport, _media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        let result = engine.start_call("c2", CallType::Video).await;
        assert!(matches!(result, Err(CallEngineError::AlreadyInCall)));
        assert_eq!(engine.session().unwrap().conversation_id, "c1");
    }

    #[tokio::test]
    async fn test_media_denied_fails_before_signaling() {
        let (engine, transport, media) = setup();
        media.deny.store(true, Ordering::SeqCst);

        let err = engine.start_call("c1", CallType::Video).await.unwrap_err();
        assert!(matches!(err, CallEngineError::Media(MediaError::Denied(_))));
        assert!(err.is_user_actionable());
        assert_eq!(engine.state(), CallState::Failed);
        assert!(transport.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_releases_media() {
        let (engine, transport, media) = setup();
        transport.fail_create.store(true, Ordering::SeqCst);

        let err = engine.start_call("c1", CallType::Audio).await.unwrap_err();
        assert!(matches!(err, CallEngineError::SetupFailed(_)));
        assert_eq!(engine.state(), CallState::Failed);
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
        assert_eq!(media.peer.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_rejection_while_ringing() {
        let (engine, _transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        engine
            .apply_status_update(CallStatusUpdate::new(RemoteCallStatus::Rejected))
            .await;

        assert_eq!(engine.state(), CallState::Rejected);
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
        assert_eq!(media.peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_end_while_ringing_counts_as_rejection() {
        let (engine, _transport, _media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        engine
            .apply_status_update(CallStatusUpdate::new(RemoteCallStatus::Ended))
            .await;

        assert_eq!(engine.state(), CallState::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_rejects_unanswered_call() {
        let (engine, transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        tokio::time::sleep(Duration::from_secs(44)).await;
        assert_eq!(engine.state(), CallState::Ringing);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.state(), CallState::Rejected);
        assert!(transport.logged("end:s1"));
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_applies_answer() {
        let (engine, transport, media) = setup();
        let mut rx = engine.subscribe();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        *transport.status.lock() = accepted_with_answer();
        wait_for_state(&mut rx, CallState::Connected).await;

        // Klingel-Timer ist abgebrochen
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.state(), CallState::Connected);
        assert_eq!(media.peer.remote_sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_survives_failed_polls() {
        let (engine, transport, _media) = setup();
        let mut rx = engine.subscribe();
        transport.fail_polls.store(3, Ordering::SeqCst);
        *transport.status.lock() = accepted_with_answer();

        engine.start_call("c1", CallType::Audio).await.unwrap();
        wait_for_state(&mut rx, CallState::Connected).await;

        assert_eq!(transport.fail_polls.load(Ordering::SeqCst), 0);
        assert!(transport.polls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_bad_answer_fails_and_notifies_server() {
        let (engine, transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        media.peer.fail_remote.store(true, Ordering::SeqCst);

        engine.apply_status_update(accepted_with_answer()).await;

        assert_eq!(engine.state(), CallState::Failed);
        assert!(transport.logged("end:s1"));
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
        assert_eq!(media.peer.closes.load(Ordering::SeqCst), 1);
    }

    // ------------------------------------------------------------------------
    // ICE
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_remote_candidate_is_applied_once() {
        let (engine, _transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        engine.apply_status_update(accepted_with_answer()).await;

        let first = CallStatusUpdate {
            ice_candidates: vec![record("u2", "candidate:a")],
            ..CallStatusUpdate::new(RemoteCallStatus::Active)
        };
        let second = CallStatusUpdate {
            ice_candidates: vec![record("u2", "candidate:b"), record("u2", "candidate:a")],
            ..CallStatusUpdate::new(RemoteCallStatus::Active)
        };
        engine.apply_status_update(first.clone()).await;
        engine.apply_status_update(first).await;
        engine.apply_status_update(second).await;

        assert_eq!(
            *media.peer.added.lock(),
            vec![IceCandidate::new("candidate:a"), IceCandidate::new("candidate:b")]
        );
        assert_eq!(engine.session().unwrap().ice_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_own_candidates_are_never_applied() {
        let (engine, _transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        engine.apply_status_update(accepted_with_answer()).await;

        engine
            .apply_status_update(CallStatusUpdate {
                ice_candidates: vec![record("u1", "candidate:mine")],
                ..CallStatusUpdate::new(RemoteCallStatus::Active)
            })
            .await;

        assert!(media.peer.added.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_candidate_does_not_block_the_rest() {
        let (engine, _transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        engine.apply_status_update(accepted_with_answer()).await;
        *media.peer.bad_candidate.lock() = Some("candidate:bad".to_string());

        engine
            .apply_status_update(CallStatusUpdate {
                ice_candidates: vec![record("u2", "candidate:bad"), record("u2", "candidate:good")],
                ..CallStatusUpdate::new(RemoteCallStatus::Active)
            })
            .await;

        assert_eq!(*media.peer.added.lock(), vec![IceCandidate::new("candidate:good")]);
        assert_eq!(engine.state(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_early_candidates_wait_for_answer() {
        let (engine, _transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        engine
            .apply_status_update(CallStatusUpdate {
                ice_candidates: vec![record("u2", "candidate:early")],
                ..CallStatusUpdate::new(RemoteCallStatus::Ringing)
            })
            .await;
        assert!(media.peer.added.lock().is_empty());

        engine
            .apply_status_update(CallStatusUpdate {
                ice_candidates: vec![record("u2", "candidate:early")],
                ..accepted_with_answer()
            })
            .await;
        assert_eq!(*media.peer.added.lock(), vec![IceCandidate::new("candidate:early")]);
    }

    #[tokio::test]
    async fn test_local_candidates_are_sent() {
        let (engine, transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();

        let events = media.events.lock().clone().unwrap();
        events
            .send(PeerEvent::LocalCandidate(IceCandidate::new("candidate:local")))
            .unwrap();

        for _ in 0..100 {
            if !transport.sent_ice.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *transport.sent_ice.lock(),
            vec![IceCandidate::new("candidate:local")]
        );
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reject_incoming_acquires_no_media() {
        let (engine, transport, media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        let mut rx = engine.subscribe();

        let session = engine.check_incoming("c1").await.unwrap().unwrap();
        assert_eq!(session.state(), CallState::Incoming);
        assert_eq!(session.role, CallRole::Callee);
        assert!(matches!(rx.try_recv(), Ok(CallEvent::StateChanged { .. })));
        assert!(matches!(rx.try_recv(), Ok(CallEvent::IncomingCall(_))));

        engine.reject_call("s9").await.unwrap();

        assert!(transport.logged("reject:s9"));
        assert_eq!(engine.state(), CallState::Rejected);
        assert_eq!(media.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(media.stops.load(Ordering::SeqCst), 0);

        // Derselbe Anruf wird nicht erneut gemeldet
        assert!(engine.check_incoming("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_own_pending_call_is_not_incoming() {
        let (engine, transport, _media) = setup();
        *transport.pending.lock() = Some(PendingCall {
            initiator_id: "u1".to_string(),
            ..incoming_call()
        });

        assert!(engine.check_incoming("c1").await.unwrap().is_none());
        assert_eq!(engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_vanished_incoming_call_is_dismissed() {
        let (engine, transport, _media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        engine.check_incoming("c1").await.unwrap();

        *transport.pending.lock() = None;
        assert!(engine.check_incoming("c1").await.unwrap().is_none());
        assert_eq!(engine.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_accept_answers_and_applies_buffered_candidates() {
        let (engine, transport, media) = connected_callee().await;

        assert_eq!(engine.state(), CallState::Connected);
        assert!(media.last_video.load(Ordering::SeqCst));
        assert!(transport.logged("answer:s9"));
        assert_eq!(media.peer.remote_sets.load(Ordering::SeqCst), 1);
        assert_eq!(*media.peer.added.lock(), vec![IceCandidate::new("candidate:early")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_retries_failed_offer_fetch() {
        let (engine, transport, _media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        *transport.status.lock() = remote_offer();
        engine.check_incoming("c1").await.unwrap();

        transport.fail_polls.store(1, Ordering::SeqCst);
        engine.accept_call("s9").await.unwrap();

        assert_eq!(engine.state(), CallState::Connected);
        assert!(transport.logged("answer:s9"));
        assert!(!transport.logged("end:s9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_waits_for_late_offer() {
        let (engine, transport, media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        *transport.status.lock() = remote_offer();
        transport.status_queue.lock().extend([
            CallStatusUpdate::new(RemoteCallStatus::Ringing),
            CallStatusUpdate::new(RemoteCallStatus::Ringing),
        ]);
        engine.check_incoming("c1").await.unwrap();

        engine.accept_call("s9").await.unwrap();

        assert_eq!(engine.state(), CallState::Connected);
        assert!(transport.polls.load(Ordering::SeqCst) >= 3);
        assert_eq!(media.peer.remote_sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_gives_up_without_offer() {
        let (engine, transport, media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        *transport.status.lock() = CallStatusUpdate::new(RemoteCallStatus::Ringing);
        engine.check_incoming("c1").await.unwrap();

        let err = engine.accept_call("s9").await.unwrap_err();

        assert!(matches!(err, CallEngineError::SetupFailed(_)));
        assert_eq!(engine.state(), CallState::Failed);
        assert!(transport.logged("end:s9"));
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accept_of_ended_call_is_cancelled() {
        let (engine, transport, media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        *transport.status.lock() = CallStatusUpdate::new(RemoteCallStatus::Ended);
        engine.check_incoming("c1").await.unwrap();

        let err = engine.accept_call("s9").await.unwrap_err();

        assert!(matches!(err, CallEngineError::Cancelled));
        assert_eq!(engine.state(), CallState::Ended);
        assert_eq!(transport.polls.load(Ordering::SeqCst), 1);
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callee_media_denied_rejects_call() {
        let (engine, transport, media) = setup();
        *transport.pending.lock() = Some(incoming_call());
        engine.check_incoming("c1").await.unwrap();
        media.deny.store(true, Ordering::SeqCst);

        let err = engine.accept_call("s9").await.unwrap_err();

        assert!(matches!(err, CallEngineError::Media(MediaError::Denied(_))));
        assert_eq!(engine.state(), CallState::Failed);
        assert!(transport.logged("reject:s9"));
        assert!(!transport.logged("answer:s9"));
    }

    #[test]
    fn test_seen_incoming_is_bounded() {
        let mut seen = VecDeque::new();
        for i in 0..SEEN_INCOMING_LIMIT + 6 {
            remember_incoming(&mut seen, &format!("s{}", i));
        }

        assert_eq!(seen.len(), SEEN_INCOMING_LIMIT);
        assert_eq!(seen.front().map(String::as_str), Some("s6"));
        assert!(seen.contains(&format!("s{}", SEEN_INCOMING_LIMIT + 5)));
    }

    #[tokio::test]
    async fn test_accept_unknown_call_fails() {
        let (engine, _transport, _media) = setup();
        let result = engine.accept_call("nope").await;
        assert!(matches!(result, Err(CallEngineError::NoIncomingCall(_))));
    }

    #[tokio::test]
    async fn test_remote_end_while_connected_cleans_up() {
        let (engine, _transport, media) = connected_callee().await;

        engine
            .apply_status_update(CallStatusUpdate::new(RemoteCallStatus::Ended))
            .await;

        assert_eq!(engine.state(), CallState::Ended);
        assert!(engine.session().unwrap().ended_at.is_some());
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
        assert_eq!(media.peer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.media_state(), (None, None));
    }

    #[tokio::test]
    async fn test_peer_failure_ends_connected_call() {
        let (engine, transport, media) = connected_callee().await;
        let mut rx = engine.subscribe();

        let events = media.events.lock().clone().unwrap();
        events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Failed))
            .unwrap();

        wait_for_state(&mut rx, CallState::Ended).await;
        settle(|| media.stops.load(Ordering::SeqCst) == 1).await;
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
        assert!(transport.logged("end:s9"));
    }

    // ------------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_terminal_session_absorbs_everything() {
        let (engine, transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        engine.end_call().await.unwrap();
        assert!(transport.logged("end:s1"));
        assert_eq!(engine.state(), CallState::Ended);

        engine.apply_status_update(accepted_with_answer()).await;
        engine
            .apply_status_update(CallStatusUpdate::new(RemoteCallStatus::Rejected))
            .await;

        assert_eq!(engine.state(), CallState::Ended);
        assert_eq!(media.peer.remote_sets.load(Ordering::SeqCst), 0);
        assert_eq!(engine.toggle_audio(), None);
        assert!(matches!(engine.end_call().await, Err(CallEngineError::NoActiveCall)));

        // Cleanup lief genau einmal
        assert_eq!(media.stops.load(Ordering::SeqCst), 1);
        assert_eq!(media.peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_toggle_flips_enabled_flag() {
        let (engine, _transport, _media) = setup();
        let mut rx = engine.subscribe();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        drain_states(&mut rx);

        assert_eq!(engine.toggle_video(), None);
        assert_eq!(engine.toggle_audio(), Some(false));
        assert_eq!(engine.media_state(), (None, Some(false)));
        assert!(matches!(
            rx.try_recv(),
            Ok(CallEvent::MediaToggled {
                kind: TrackKind::Audio,
                enabled: false
            })
        ));
        assert_eq!(engine.toggle_audio(), Some(true));
    }

    #[tokio::test]
    async fn test_new_call_after_previous_ended() {
        let (engine, _transport, media) = setup();
        engine.start_call("c1", CallType::Audio).await.unwrap();
        engine.end_call().await.unwrap();

        engine.start_call("c2", CallType::Audio).await.unwrap();
        assert_eq!(engine.state(), CallState::Ringing);
        assert_eq!(engine.session().unwrap().conversation_id, "c2");
        assert_eq!(media.acquired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_safe_without_call() {
        let (engine, _transport, _media) = setup();
        engine.watch_incoming("c1");
        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_registers_incoming_call() {
        let (engine, transport, _media) = setup();
        let mut rx = engine.subscribe();
        *transport.pending.lock() = Some(incoming_call());

        engine.watch_incoming("c1");
        wait_for_state(&mut rx, CallState::Incoming).await;
        engine.stop_watching();

        assert_eq!(engine.session().unwrap().id.as_deref(), Some("s9"));
    }
}
