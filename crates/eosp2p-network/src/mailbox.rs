//! Loop mailboxes.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Post into a loop mailbox without waiting.
///
/// Used wherever one loop feeds another (or itself): a loop that awaited
/// capacity in a mailbox whose consumer is waiting on it would deadlock.
/// When the mailbox is full the message is handed to a task that waits.
///
/// Only control events are posted (sync start and finish, peer errors);
/// packets go through the readers' awaited sends. The number of waiting
/// tasks is therefore bounded by peer events, not by traffic.
pub(crate) fn post<T: Send + 'static>(tx: &mpsc::Sender<T>, msg: T) {
    match tx.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => {
            warn!(capacity = tx.max_capacity(), "Mailbox full, delivering in background");
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(msg).await.is_err() {
                    debug!("Mailbox closed before delivery");
                }
            });
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Mailbox closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_when_full_delivers_later() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        post(&tx, 1);
        post(&tx, 2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_post_backlog_drains() {
        let (tx, mut rx) = mpsc::channel::<u32>(2);
        for i in 0..50 {
            post(&tx, i);
        }

        let mut received = Vec::new();
        while received.len() < 50 {
            received.push(rx.recv().await.unwrap());
        }
        received.sort_unstable();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_post_after_close_is_dropped() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        rx.close();
        post(&tx, 1);
        assert_eq!(rx.recv().await, None);
    }
}
