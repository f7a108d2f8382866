use std::time::Duration;

use tokio::time::Instant;

use crate::rtc::{IceCandidate, SessionDescription};

/// A descriptor ready to be signaled: the local description plus every
/// candidate gathered so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flush {
    pub description: SessionDescription,
    pub candidates: Vec<IceCandidate>,
}

/// Batches trickled candidates into descriptor updates. Every change pushes
/// the flush deadline out by `idle`; gathering completion flushes at once and
/// anything arriving after it is due immediately.
#[derive(Debug)]
pub struct Coalescer {
    idle: Duration,
    description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    deadline: Option<Instant>,
    dirty: bool,
    complete: bool,
}

impl Coalescer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            description: None,
            candidates: Vec::new(),
            deadline: None,
            dirty: false,
            complete: false,
        }
    }

    pub fn set_description(&mut self, description: SessionDescription) {
        self.description = Some(description);
        self.touch();
    }

    pub fn push_candidate(&mut self, candidate: IceCandidate) {
        if self.candidates.contains(&candidate) {
            return;
        }
        self.candidates.push(candidate);
        self.touch();
    }

    fn touch(&mut self) {
        self.dirty = true;
        let now = Instant::now();
        self.deadline = Some(if self.complete { now } else { now + self.idle });
    }

    pub fn deadline(&self) -> Option<Instant> {
        if self.dirty && self.description.is_some() {
            self.deadline
        } else {
            None
        }
    }

    /// Gathering finished: flush whatever is pending now.
    pub fn complete(&mut self) -> Option<Flush> {
        self.complete = true;
        self.flush()
    }

    pub fn poll_expired(&mut self, now: Instant) -> Option<Flush> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    fn flush(&mut self) -> Option<Flush> {
        if !self.dirty {
            return None;
        }
        let description = self.description.clone()?;
        self.dirty = false;
        self.deadline = None;
        Some(Flush {
            description,
            candidates: self.candidates.clone(),
        })
    }
}
