//! Remote ICE Queue
//!
//! Jeder Poll liefert die komplette Candidate-Liste neu. Hier wird gegen
//! die bereits gesehenen Candidates gedifft (Schlüssel: Teilnehmer + Candidate,
//! nicht Position), eigene Candidates ausgefiltert und alles gepuffert,
//! solange noch keine Remote Description gesetzt ist.

use crate::signaling::{IceCandidate, IceCandidateRecord};
use std::collections::HashSet;

#[derive(Debug)]
pub struct RemoteIceQueue {
    local_participant: String,
    seen: HashSet<(String, IceCandidate)>,
    pending: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl RemoteIceQueue {
    pub fn new(local_participant: impl Into<String>) -> Self {
        Self {
            local_participant: local_participant.into(),
            seen: HashSet::new(),
            pending: Vec::new(),
            remote_description_set: false,
        }
    }

    /// Nimmt neue Records auf und gibt die Candidates zurück, die sofort anzuwenden sind
    ///
    /// Der zweite Rückgabewert enthält die neu gesehenen Records fürs Session-Log.
    pub fn accept(
        &mut self,
        records: &[IceCandidateRecord],
    ) -> (Vec<IceCandidate>, Vec<IceCandidateRecord>) {
        let mut fresh = Vec::new();

        for record in records {
            if record.participant_id == self.local_participant {
                continue;
            }
            let key = (record.participant_id.clone(), record.candidate.clone());
            if self.seen.insert(key) {
                fresh.push(record.clone());
            }
        }

        if fresh.is_empty() {
            return (Vec::new(), fresh);
        }

        if self.remote_description_set {
            let ready = fresh.iter().map(|r| r.candidate.clone()).collect();
            (ready, fresh)
        } else {
            tracing::debug!("Buffering {} ICE candidate(s) until remote description", fresh.len());
            self.pending.extend(fresh.iter().map(|r| r.candidate.clone()));
            (Vec::new(), fresh)
        }
    }

    /// Nach erfolgreichem `set_remote_description`: Puffer leeren
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending)
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
