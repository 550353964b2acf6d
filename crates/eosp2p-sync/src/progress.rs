//! Batch bookkeeping for a sync session.

/// Tracks the local head against a target block, one batch at a time.
///
/// A new batch is only handed out once every block of the previous one has
/// arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    head: u32,
    target: Option<u32>,
    requested_to: u32,
    batch_size: u32,
}

impl SyncProgress {
    pub fn new(head: u32, batch_size: u32) -> Self {
        Self {
            head,
            target: None,
            requested_to: head,
            batch_size: batch_size.max(1),
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn target(&self) -> Option<u32> {
        self.target
    }

    pub fn set_target(&mut self, target: u32) {
        self.target = Some(target);
    }

    /// Forget any outstanding batch, e.g. after switching sync peer.
    pub fn reset_requests(&mut self) {
        self.requested_to = self.head;
    }

    /// The next range to request, inclusive on both ends.
    pub fn next_request(&mut self) -> Option<(u32, u32)> {
        let target = self.target?;
        if self.head < self.requested_to || self.head >= target {
            return None;
        }
        let start = self.head + 1;
        let end = self.head.saturating_add(self.batch_size).min(target);
        self.requested_to = end;
        Some((start, end))
    }

    /// Record one received block.
    pub fn on_block(&mut self) {
        self.head = self.head.saturating_add(1);
    }

    pub fn is_done(&self) -> bool {
        self.target.is_some_and(|target| self.head >= target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_request_without_target() {
        let mut progress = SyncProgress::new(0, 10);
        assert_eq!(progress.next_request(), None);
        assert!(!progress.is_done());
    }

    #[test]
    fn test_batches_until_target() {
        let mut progress = SyncProgress::new(5, 10);
        progress.set_target(27);

        assert_eq!(progress.next_request(), Some((6, 15)));
        // Outstanding batch blocks the next one.
        assert_eq!(progress.next_request(), None);

        for _ in 0..10 {
            progress.on_block();
        }
        assert_eq!(progress.head(), 15);
        assert_eq!(progress.next_request(), Some((16, 25)));

        for _ in 0..10 {
            progress.on_block();
        }
        assert_eq!(progress.next_request(), Some((26, 27)));
        progress.on_block();
        progress.on_block();

        assert!(progress.is_done());
        assert_eq!(progress.next_request(), None);
    }

    #[test]
    fn test_target_behind_head_is_done() {
        let mut progress = SyncProgress::new(50, 10);
        progress.set_target(40);
        assert!(progress.is_done());
        assert_eq!(progress.next_request(), None);
    }

    #[test]
    fn test_reset_requests_reissues_batch() {
        let mut progress = SyncProgress::new(0, 4);
        progress.set_target(100);
        assert_eq!(progress.next_request(), Some((1, 4)));
        progress.on_block();

        progress.reset_requests();
        assert_eq!(progress.next_request(), Some((2, 5)));
    }
}
