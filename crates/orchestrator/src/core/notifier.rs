use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::core::sync;

/// Fan-out of full snapshots to any number of subscribers.
///
/// Dropping the receiver returned by [`UpdateNotifier::subscribe`] is the way
/// to unsubscribe; closed channels are pruned on the next notification.
pub struct UpdateNotifier<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> UpdateNotifier<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        sync::lock(&self.senders).push(sender);
        receiver
    }

    /// Send `value` to every live subscriber.
    pub fn notify(&self, value: T) {
        sync::lock(&self.senders).retain(|sender| {
            let open = sender.send(value.clone()).is_ok();
            if !open {
                tracing::debug!("Subscriber disconnected, cleaning up channel");
            }
            open
        });
    }

    pub fn subscriber_count(&self) -> usize {
        sync::lock(&self.senders).len()
    }
}

impl<T: Clone> Default for UpdateNotifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_the_snapshot() {
        let notifier = UpdateNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.notify(vec![1, 2, 3]);

        assert_eq!(first.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(second.recv().await, Some(vec![1, 2, 3]));
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let notifier = UpdateNotifier::new();
        let kept = notifier.subscribe();
        drop(notifier.subscribe());
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.notify(1u8);

        assert_eq!(notifier.subscriber_count(), 1);
        drop(kept);
    }
}
