use std::{
    collections::VecDeque,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use riptide_sync_types::{
    ClientEvent,
    SessionId,
};
use serde_json::json;

/// Oldest marks are dropped past this point; a flapping connection must not
/// grow the ring without bound.
const MAX_MARKS: usize = 64;

/// Ring of timestamped marks for connection telemetry, keyed by session id.
/// Explicitly constructed and drained; there is no implicit global.
pub struct PerfMarkCollector {
    session_id: SessionId,
    marks: VecDeque<(&'static str, SystemTime)>,
}

impl PerfMarkCollector {
    pub fn init(session_id: SessionId) -> Self {
        Self {
            session_id,
            marks: VecDeque::new(),
        }
    }

    pub fn mark(&mut self, name: &'static str) {
        if self.marks.len() == MAX_MARKS {
            self.marks.pop_front();
        }
        self.marks.push_back((name, SystemTime::now()));
    }

    /// Drain the ring into a telemetry event.
    pub fn drain_event(&mut self, event_type: &str) -> ClientEvent {
        let marks: Vec<_> = self
            .marks
            .drain(..)
            .map(|(name, at)| {
                let unix_ms = at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                json!({"name": name, "at": unix_ms})
            })
            .collect();
        ClientEvent {
            event_type: event_type.to_owned(),
            event: json!({
                "sessionId": self.session_id.to_string(),
                "marks": marks,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use riptide_sync_types::SessionId;

    use super::{
        PerfMarkCollector,
        MAX_MARKS,
    };

    #[test]
    fn test_ring_is_bounded_and_drains() {
        let mut collector = PerfMarkCollector::init(SessionId::nil());
        for _ in 0..(MAX_MARKS + 10) {
            collector.mark("connect");
        }
        let event = collector.drain_event("LongDisconnect");
        assert_eq!(event.event_type, "LongDisconnect");
        assert_eq!(event.event["marks"].as_array().unwrap().len(), MAX_MARKS);
        // Drained: the next event starts empty.
        let event = collector.drain_event("LongDisconnect");
        assert!(event.event["marks"].as_array().unwrap().is_empty());
    }
}
