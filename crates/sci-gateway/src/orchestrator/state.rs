//! Per-request dispatch lifecycle.
//!
//! `Classifying -> Dispatching -> (Aggregating | FallbackDispatching) ->
//! Assembling -> Done`, with `Failed` reachable from every non-terminal
//! stage.

use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    Classifying,
    Dispatching,
    Aggregating,
    FallbackDispatching,
    Assembling,
    Done,
    Failed,
}

impl DispatchStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchStage::Done | DispatchStage::Failed)
    }

    pub fn can_transition_to(&self, next: DispatchStage) -> bool {
        use DispatchStage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Classifying, Dispatching)
            | (Dispatching, Aggregating)
            | (Dispatching, FallbackDispatching)
            | (Aggregating, FallbackDispatching)
            | (Aggregating, Assembling)
            | (FallbackDispatching, Assembling)
            | (Assembling, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchStage::Classifying => "classifying",
            DispatchStage::Dispatching => "dispatching",
            DispatchStage::Aggregating => "aggregating",
            DispatchStage::FallbackDispatching => "fallback_dispatching",
            DispatchStage::Assembling => "assembling",
            DispatchStage::Done => "done",
            DispatchStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal dispatch transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: DispatchStage,
    pub to: DispatchStage,
}

/// Records the stages one request went through.
#[derive(Debug, Clone)]
pub struct StageTracker {
    request_id: String,
    current: DispatchStage,
    history: Vec<DispatchStage>,
    started: Instant,
}

impl StageTracker {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            current: DispatchStage::Classifying,
            history: vec![DispatchStage::Classifying],
            started: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn current(&self) -> DispatchStage {
        self.current
    }

    pub fn history(&self) -> &[DispatchStage] {
        &self.history
    }

    pub fn advance(&mut self, next: DispatchStage) -> Result<(), IllegalTransition> {
        if !self.current.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.current,
                to: next,
            });
        }
        debug!(
            "[{}] {} -> {} after {:?}",
            self.request_id,
            self.current,
            next,
            self.started.elapsed()
        );
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` unless the request already finished.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            self.current = DispatchStage::Failed;
            self.history.push(DispatchStage::Failed);
        }
    }

    pub fn went_through(&self, stage: DispatchStage) -> bool {
        self.history.contains(&stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = StageTracker::new("req-1");
        for stage in [
            DispatchStage::Dispatching,
            DispatchStage::Aggregating,
            DispatchStage::Assembling,
            DispatchStage::Done,
        ] {
            tracker.advance(stage).unwrap();
        }
        assert_eq!(tracker.current(), DispatchStage::Done);
        assert!(!tracker.went_through(DispatchStage::FallbackDispatching));
    }

    #[test]
    fn test_fallback_path() {
        let mut tracker = StageTracker::new("req-2");
        tracker.advance(DispatchStage::Dispatching).unwrap();
        tracker.advance(DispatchStage::FallbackDispatching).unwrap();
        tracker.advance(DispatchStage::Assembling).unwrap();
        assert!(tracker.went_through(DispatchStage::FallbackDispatching));
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let mut tracker = StageTracker::new("req-3");
        let err = tracker.advance(DispatchStage::Assembling).unwrap_err();
        assert_eq!(err.from, DispatchStage::Classifying);
        tracker.advance(DispatchStage::Dispatching).unwrap();
        assert!(tracker.advance(DispatchStage::Dispatching).is_err());
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = StageTracker::new("req-4");
        tracker.advance(DispatchStage::Dispatching).unwrap();
        tracker.fail();
        assert_eq!(tracker.current(), DispatchStage::Failed);
        assert!(tracker.advance(DispatchStage::Assembling).is_err());
        tracker.fail();
        assert_eq!(tracker.history().len(), 3);
    }
}
