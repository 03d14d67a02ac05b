use crate::event::RawEvent;

/// FIFO buffering window with a message-count bound.
///
/// The time bound lives in the pipeline run loop (a flush ticker); the
/// window itself only knows about the count bound. Draining is atomic: the
/// whole buffer is taken in one move, so pushes that race a flush land in
/// the next window.
pub struct BufferWindow {
    entries: Vec<RawEvent>,
    max_messages: usize,
}

impl BufferWindow {
    pub fn new(max_messages: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_messages.min(1024)),
            max_messages,
        }
    }

    /// Appends one event. Returns true when the count bound is reached and
    /// the caller must flush.
    pub fn push(&mut self, event: RawEvent) -> bool {
        self.entries.push(event);
        self.entries.len() >= self.max_messages
    }

    /// Drains the whole window, leaving it empty.
    pub fn drain(&mut self) -> Vec<RawEvent> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: u64) -> RawEvent {
        RawEvent {
            event_type: "job_status".to_string(),
            creation_ts: n as f64,
            payload: json!({ "experiment_id": n }),
        }
    }

    #[test]
    fn test_push_signals_flush_at_bound() {
        let mut buf = BufferWindow::new(3);
        assert!(!buf.push(event(1)));
        assert!(!buf.push(event(2)));
        assert!(buf.push(event(3)));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_drain_is_atomic_and_empties() {
        let mut buf = BufferWindow::new(10);
        buf.push(event(1));
        buf.push(event(2));

        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert!(buf.is_empty());

        // A push after drain lands in the next window.
        assert!(!buf.push(event(3)));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_bound_yields_expected_flush_count() {
        // 1001 events at a 256 bound: exactly 3 full flushes, 233 left over.
        let mut buf = BufferWindow::new(256);
        let mut flushes = 0;
        let mut drained = 0;

        for n in 0..1001 {
            if buf.push(event(n)) {
                drained += buf.drain().len();
                flushes += 1;
            }
        }

        assert_eq!(flushes, 3);
        assert_eq!(drained, 768);
        assert_eq!(buf.len(), 233);
    }
}
