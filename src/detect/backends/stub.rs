use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::Candidate;
use crate::frame::Frame;

/// Scripted backend for simulation and tests.
///
/// Each `detect` call pops the next queued result. Once the queue is empty the
/// backend keeps returning the last result it produced.
#[derive(Clone)]
pub struct ScriptedBackend {
    queue: Arc<Mutex<VecDeque<Vec<Candidate>>>>,
    last: Vec<Candidate>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Vec<Candidate>>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(script.into())),
            last: Vec::new(),
            calls: 0,
        }
    }

    /// Handle for queueing more results after the backend has been registered.
    pub fn script(&self) -> ScriptHandle {
        ScriptHandle {
            queue: self.queue.clone(),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

#[derive(Clone)]
pub struct ScriptHandle {
    queue: Arc<Mutex<VecDeque<Vec<Candidate>>>>,
}

impl ScriptHandle {
    pub fn push(&self, candidates: Vec<Candidate>) -> Result<()> {
        self.queue
            .lock()
            .map_err(|_| anyhow!("script queue lock poisoned"))?
            .push_back(candidates);
        Ok(())
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Candidate>> {
        self.calls += 1;
        let next = self
            .queue
            .lock()
            .map_err(|_| anyhow!("script queue lock poisoned"))?
            .pop_front();
        if let Some(next) = next {
            self.last = next;
        }
        Ok(self.last.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BBox;

    #[test]
    fn replays_script_then_holds_last() -> Result<()> {
        let cup = Candidate::object("cup", 0.9, BBox::new(0.0, 0.0, 4.0, 4.0));
        let mut backend = ScriptedBackend::new(vec![vec![], vec![cup.clone()]]);
        let frame = Frame::filled(4, 4, [0, 0, 0])?;
        assert!(backend.detect(&frame)?.is_empty());
        assert_eq!(backend.detect(&frame)?, vec![cup.clone()]);
        assert_eq!(backend.detect(&frame)?, vec![cup]);

        backend.script().push(Vec::new())?;
        assert!(backend.detect(&frame)?.is_empty());
        assert_eq!(backend.calls(), 4);
        Ok(())
    }
}
