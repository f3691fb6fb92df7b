/// Scroll-to-latest bookkeeping for the message list.
///
/// Every applied snapshot asks for a scroll, whatever changed in it. The
/// renderer consumes the request and scrolls to the slot just past the last
/// message.
#[derive(Debug, Default)]
pub struct ScrollTracker {
    pending_scroll_to_bottom: Option<usize>,
    requests_issued: u64,
}

impl ScrollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_scroll_to_bottom(&mut self, message_count: usize) {
        // A newer request supersedes one the renderer has not consumed yet.
        self.pending_scroll_to_bottom = Some(message_count);
        self.requests_issued += 1;
    }

    pub fn take_scroll_request(&mut self) -> Option<usize> {
        self.pending_scroll_to_bottom.take()
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending_scroll_to_bottom.is_some()
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued
    }

    pub fn reset(&mut self) {
        self.pending_scroll_to_bottom = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_request_wins_and_is_consumed_once() {
        let mut tracker = ScrollTracker::new();
        assert_eq!(tracker.take_scroll_request(), None);

        tracker.request_scroll_to_bottom(1);
        tracker.request_scroll_to_bottom(3);
        assert!(tracker.has_pending_request());
        assert_eq!(tracker.requests_issued(), 2);

        assert_eq!(tracker.take_scroll_request(), Some(3));
        assert_eq!(tracker.take_scroll_request(), None);
    }

    #[test]
    fn reset_drops_unconsumed_request_but_keeps_count() {
        let mut tracker = ScrollTracker::new();
        tracker.request_scroll_to_bottom(0);
        tracker.reset();

        assert!(!tracker.has_pending_request());
        assert_eq!(tracker.requests_issued(), 1);
    }
}
