//! The cause stack: the ambient "why" chain attached to every event.
//!
//! Callers push a frame when they start acting on someone's behalf (a player
//! command, a plugin task) and pop it when they are done. Frames are
//! independent of phase contexts but are conventionally kept 1:1 with them.
//! Every domain event carries the causes of all frames, bottom first,
//! followed by the causes of the context it was captured in.

use causa_world::cause::{Cause, CauseChain};

use crate::TrackerError;

/// Proof of one pushed frame. Not `Clone`: a frame is popped at most once.
#[derive(Debug)]
#[must_use = "a cause frame must be popped with CauseStack::pop_frame"]
pub struct CauseFrameHandle {
    serial: u64,
}

impl CauseFrameHandle {
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[derive(Debug, Clone)]
struct Frame {
    serial: u64,
    causes: Vec<Cause>,
}

/// LIFO stack of cause frames. The bottom frame always exists and cannot be
/// popped.
#[derive(Debug, Clone)]
pub struct CauseStack {
    frames: Vec<Frame>,
    next_serial: u64,
}

impl CauseStack {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame {
                serial: 0,
                causes: Vec::new(),
            }],
            next_serial: 1,
        }
    }

    pub fn push_frame(&mut self) -> CauseFrameHandle {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.frames.push(Frame {
            serial,
            causes: Vec::new(),
        });
        CauseFrameHandle { serial }
    }

    /// Add a cause to the top frame.
    pub fn push_cause(&mut self, cause: Cause) {
        if let Some(top) = self.frames.last_mut() {
            top.causes.push(cause);
        }
    }

    /// Pop the frame `handle` refers to, which must be the top one.
    ///
    /// A failed pop still consumes `handle`, so its frame stays on the stack
    /// for good. The error is fatal; the caller's frame discipline is broken.
    pub fn pop_frame(&mut self, handle: CauseFrameHandle) -> Result<(), TrackerError> {
        let top = self.frames.last().map(|f| f.serial).unwrap_or(0);
        if top == 0 || top != handle.serial {
            return Err(TrackerError::CauseFrameOutOfOrder {
                frame: handle.serial,
                top,
            });
        }
        self.frames.pop();
        Ok(())
    }

    /// Number of pushed frames (the bottom frame is not counted).
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    /// Every cause on the stack, bottom frame first.
    pub fn current_chain(&self) -> CauseChain {
        self.frames
            .iter()
            .flat_map(|f| f.causes.iter().cloned())
            .collect()
    }
}

impl Default for CauseStack {
    fn default() -> Self {
        Self::new()
    }
}
