//! Passive bus observer for debugging: remembers the most recent events and
//! counts every event by type. It only ever reads from the bus.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::bus::{EventBus, Subscription};
use crate::events::{AIEvent, AIEventType};

pub const DEFAULT_INSPECTOR_CAPACITY: usize = 500;

type Listener = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct InspectorState {
    recent: VecDeque<AIEvent>,
    counts: HashMap<AIEventType, u64>,
    dropped: u64,
}

pub struct DeveloperInspector {
    state: Arc<Mutex<InspectorState>>,
    capacity: usize,
    subscription: Subscription,
}

impl DeveloperInspector {
    pub fn attach(bus: &EventBus, capacity: usize) -> Self {
        Self::attach_inner(bus, capacity, None)
    }

    /// Like [`attach`](Self::attach), additionally handing every event to
    /// `listener` as one JSON line.
    pub fn attach_with_listener<F>(bus: &EventBus, capacity: usize, listener: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self::attach_inner(bus, capacity, Some(Box::new(listener)))
    }

    fn attach_inner(bus: &EventBus, capacity: usize, listener: Option<Listener>) -> Self {
        let capacity = capacity.max(1);
        let state = Arc::new(Mutex::new(InspectorState::default()));
        let recorder = Arc::clone(&state);
        let subscription = bus.on_any(move |event| {
            {
                let mut state = recorder.lock();
                *state.counts.entry(event.event_type()).or_default() += 1;
                if state.recent.len() == capacity {
                    state.recent.pop_front();
                    state.dropped += 1;
                }
                state.recent.push_back(event.clone());
            }
            if let Some(listener) = &listener {
                listener(&serde_json::to_string(event)?);
            }
            Ok(())
        });
        Self {
            state,
            capacity,
            subscription,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained events, oldest first.
    pub fn snapshot(&self) -> Vec<AIEvent> {
        self.state.lock().recent.iter().cloned().collect()
    }

    /// Events seen per type since attach (or the last `clear`), including the
    /// ones that fell out of the ring.
    pub fn counts(&self) -> HashMap<AIEventType, u64> {
        self.state.lock().counts.clone()
    }

    pub fn count(&self, event_type: AIEventType) -> u64 {
        self.state
            .lock()
            .counts
            .get(&event_type)
            .copied()
            .unwrap_or(0)
    }

    /// Number of events evicted from the ring.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.recent.clear();
        state.counts.clear();
        state.dropped = 0;
    }

    /// Retained events serialized one per line.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let state = self.state.lock();
        let mut out = String::new();
        for event in &state.recent {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_active()
    }
}

impl Drop for DeveloperInspector {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{create_assistant_message, create_error, create_progress, create_session_end};

    #[test]
    fn test_ring_keeps_most_recent_events() {
        let bus = EventBus::new();
        let inspector = DeveloperInspector::attach(&bus, 2);

        for message in ["one", "two", "three"] {
            bus.emit(&create_progress(message, None).unwrap());
        }

        let messages: Vec<String> = inspector
            .snapshot()
            .iter()
            .map(|e| match e.kind() {
                crate::events::AIEventKind::Progress { message, .. } => message.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(inspector.count(AIEventType::Progress), 3);
        assert_eq!(inspector.dropped(), 1);
    }

    #[test]
    fn test_counts_by_type() {
        let bus = EventBus::new();
        let inspector = DeveloperInspector::attach(&bus, DEFAULT_INSPECTOR_CAPACITY);

        bus.emit(&create_assistant_message("a", true, Vec::new()).unwrap());
        bus.emit(&create_assistant_message("b", true, Vec::new()).unwrap());
        bus.emit(&create_error("boom").unwrap());

        let counts = inspector.counts();
        assert_eq!(counts.get(&AIEventType::AssistantMessage), Some(&2));
        assert_eq!(counts.get(&AIEventType::Error), Some(&1));
        assert_eq!(counts.get(&AIEventType::SessionEnd), None);

        inspector.clear();
        assert!(inspector.snapshot().is_empty());
        assert!(inspector.counts().is_empty());
    }

    #[test]
    fn test_json_lines_and_listener() {
        let bus = EventBus::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let inspector = DeveloperInspector::attach_with_listener(&bus, 10, move |line| {
            sink.lock().push(line.to_string())
        });

        bus.emit(&create_session_end("s1", "completed").unwrap().with_origin("s1"));

        let dump = inspector.to_json_lines().unwrap();
        assert_eq!(dump.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(dump.trim()).unwrap();
        assert_eq!(value["type"], "session_end");
        assert_eq!(value["reason"], "completed");
        assert_eq!(value["origin"], "s1");
        assert_eq!(lines.lock().as_slice(), [dump.trim().to_string()]);
    }

    #[test]
    fn test_detach_and_no_other_subscribers_affected() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let _sub = bus.on(AIEventType::Progress, move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        let inspector = DeveloperInspector::attach(&bus, 10);
        bus.emit(&create_progress("x", None).unwrap());
        inspector.detach();
        bus.emit(&create_progress("y", None).unwrap());

        assert!(!inspector.is_attached());
        assert_eq!(inspector.snapshot().len(), 1);
        assert_eq!(*seen.lock(), 2);
        assert_eq!(bus.handler_count(), 1);
    }
}
