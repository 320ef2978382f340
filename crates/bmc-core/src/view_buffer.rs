use crate::log_feed::LogEvent;
use std::collections::VecDeque;

pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Append-only view over the log feed. History backfill replaces the whole
/// buffer; live events append in arrival order. Focus is advisory only and
/// never removes events.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<LogEvent>,
    capacity: Option<usize>,
    focus: Option<String>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: Some(capacity),
            focus: None,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            events: VecDeque::new(),
            capacity: None,
            focus: None,
        }
    }

    /// Replaces the buffer contents with a fresh backfill batch. On overflow
    /// the oldest entries of the batch are dropped first.
    pub fn append_history(&mut self, batch: Vec<LogEvent>) {
        self.events.clear();
        self.events.extend(batch);
        self.trim();
    }

    pub fn append_one(&mut self, event: LogEvent) {
        self.events.push_back(event);
        self.trim();
    }

    fn trim(&mut self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while self.events.len() > capacity {
            self.events.pop_front();
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn set_focus(&mut self, focus: Option<String>) {
        self.focus = focus;
    }

    pub fn focus(&self) -> Option<&str> {
        self.focus.as_deref()
    }

    /// Without a focus every event counts as focused. With one, only events
    /// whose display name matches; the rest are rendered dimmed, not hidden.
    pub fn is_focused(&self, event: &LogEvent) -> bool {
        match &self.focus {
            None => true,
            Some(focus) => event.name == *focus,
        }
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}
