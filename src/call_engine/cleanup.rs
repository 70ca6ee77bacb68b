//! Resource Guard - gibt Medien, Peer Connection und Timer genau einmal frei
//!
//! Jeder Exit-Pfad (Hangup, Ablehnung, Remote-Ende, Fehler, Teardown) läuft
//! über [`ResourceGuard::release`]. Handles werden dabei per `take()`
//! entnommen, ein zweiter Aufruf findet nichts mehr vor.

use super::media::{LocalMedia, PeerConnection};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct ResourceGuard {
    media: Option<Arc<dyn LocalMedia>>,
    peer_connection: Option<Arc<dyn PeerConnection>>,
    poll_task: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
}

impl ResourceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn media(&self) -> Option<Arc<dyn LocalMedia>> {
        self.media.clone()
    }

    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer_connection.clone()
    }

    pub fn set_media(&mut self, media: Arc<dyn LocalMedia>) {
        if let Some(old) = self.media.replace(media) {
            old.stop();
        }
    }

    pub fn set_peer_connection(&mut self, pc: Arc<dyn PeerConnection>) {
        if let Some(old) = self.peer_connection.replace(pc) {
            spawn_close(old);
        }
    }

    pub fn set_poll_task(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.poll_task.replace(handle) {
            old.abort();
        }
    }

    pub fn set_ring_timer(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.ring_timer.replace(handle) {
            old.abort();
        }
    }

    pub fn set_event_pump(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.event_pump.replace(handle) {
            old.abort();
        }
    }

    /// Nach Annahme des Anrufs läuft der Klingel-Timer nicht mehr weiter
    pub fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_none()
            && self.peer_connection.is_none()
            && self.poll_task.is_none()
            && self.ring_timer.is_none()
            && self.event_pump.is_none()
    }

    /// Gibt alles frei. Idempotent.
    ///
    /// Tracks werden gestoppt (nicht nur fallen gelassen), die Peer Connection
    /// wird in einem eigenen Task geschlossen und dessen Handle zurückgegeben.
    /// Tasks werden zuletzt abgebrochen, weil `release` auch aus einem dieser
    /// Tasks heraus aufgerufen wird.
    pub fn release(&mut self) -> Option<JoinHandle<()>> {
        if self.is_empty() {
            return None;
        }

        if let Some(media) = self.media.take() {
            tracing::debug!("Stopping local media tracks");
            media.stop();
        }

        let closing = self.peer_connection.take().and_then(spawn_close);

        for task in [
            self.ring_timer.take(),
            self.poll_task.take(),
            self.event_pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        closing
    }
}

fn spawn_close(pc: Arc<dyn PeerConnection>) -> Option<JoinHandle<()>> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(async move {
            pc.close().await;
        })),
        Err(_) => {
            tracing::warn!("No runtime available, dropping peer connection without close");
            None
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("media", &self.media.is_some())
            .field("peer_connection", &self.peer_connection.is_some())
            .field("poll_task", &self.poll_task.is_some())
            .field("ring_timer", &self.ring_timer.is_some())
            .field("event_pump", &self.event_pump.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
