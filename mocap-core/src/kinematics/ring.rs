//! Bounded in-memory frame store
//!
//! Keeps the most recent frames delivered by the receive loop so the engine
//! can query them without a round trip through the frame file.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{FrameRow, FrameSource};
use crate::error::{KinematicsError, ListenerError};
use crate::protocol::natnet::{MarkerBatch, MarkerListener};

#[derive(Debug, Default)]
struct Inner {
    rows: VecDeque<FrameRow>,
    frames: usize,
}

/// Ring of the last `capacity` frames, filled as a [`MarkerListener`]
#[derive(Debug)]
pub struct FrameRing {
    capacity: usize,
    label: Option<String>,
    inner: Mutex<Inner>,
}

impl FrameRing {
    /// `capacity` is in frames, not rows. Zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        FrameRing {
            capacity: capacity.max(1),
            label: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Only keep marker sets with this label
    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently held
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.frames).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rows.clear();
            inner.frames = 0;
        }
    }

    /// Add one batch of rows, evicting the oldest frames past capacity
    pub fn push(&self, batch: &MarkerBatch) -> Result<(), ListenerError> {
        if let Some(label) = &self.label {
            if &batch.set_label != label {
                return Ok(());
            }
        }
        if batch.samples.is_empty() {
            return Ok(());
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ListenerError::new("frame ring lock poisoned"))?;

        let continues_last = inner
            .rows
            .back()
            .is_some_and(|r| r.frame_number == batch.frame_number);
        if !continues_last {
            inner.frames += 1;
        }
        inner.rows.extend(batch.samples.iter().map(|s| {
            FrameRow::new(
                s.frame_number,
                f64::from(s.x),
                f64::from(s.y),
                f64::from(s.z),
            )
        }));

        while inner.frames > self.capacity {
            let Some(oldest) = inner.rows.front().map(|r| r.frame_number) else {
                break;
            };
            while inner
                .rows
                .front()
                .is_some_and(|r| r.frame_number == oldest)
            {
                inner.rows.pop_front();
            }
            inner.frames -= 1;
        }
        Ok(())
    }
}

impl MarkerListener for FrameRing {
    fn on_marker_set(&self, batch: MarkerBatch) -> Result<(), ListenerError> {
        self.push(&batch)
    }
}

impl FrameSource for FrameRing {
    fn read_rows(&self) -> Result<Vec<FrameRow>, KinematicsError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| KinematicsError::Integrity("frame ring lock poisoned".into()))?;
        Ok(inner.rows.iter().copied().collect())
    }
}
