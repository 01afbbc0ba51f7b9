//! Rate-limited work queue.
//!
//! FIFO over an unbounded channel; the requeue counter travels with the
//! item. Retries re-enter at the tail after an exponential per-item delay,
//! never at the head.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::event::Event;

static BASE_DELAY: Duration = Duration::from_millis(5);
static MAX_DELAY: Duration = Duration::from_secs(16);

#[derive(Clone, Debug)]
pub struct Attempt {
    pub event: Event,
    pub requeues: u32,
}

impl Attempt {
    fn first(event: Event) -> Self {
        Self { event, requeues: 0 }
    }

    pub fn bump(self) -> Self {
        Self {
            event: self.event,
            requeues: self.requeues + 1,
        }
    }
}

#[derive(Clone)]
pub struct Queue {
    tx: UnboundedSender<Attempt>,
    shutting_down: Arc<AtomicBool>,
}

impl Queue {
    pub fn new() -> (Self, UnboundedReceiver<Attempt>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                tx,
                shutting_down: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn add(&self, event: Event) {
        self.send(Attempt::first(event));
    }

    /// Re-enqueues a failed attempt after its backoff delay.
    pub fn add_rate_limited(&self, attempt: Attempt) {
        let queue = self.clone();
        let wait = delay(attempt.requeues);

        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            queue.send(attempt);
        });
    }

    /// Marks the queue as draining and posts the terminal sentinel. Events
    /// already queued are still processed; retries are not.
    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.send(Attempt::first(Event::Stop));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn send(&self, attempt: Attempt) {
        if self.tx.send(attempt).is_err() {
            tracing::debug!("queue closed, dropping event");
        }
    }
}

fn delay(requeues: u32) -> Duration {
    BASE_DELAY
        .saturating_mul(2_u32.saturating_pow(requeues))
        .min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        assert_eq!(delay(0), Duration::from_millis(5));
        assert_eq!(delay(1), Duration::from_millis(10));
        assert_eq!(delay(3), Duration::from_millis(40));
        assert_eq!(delay(32), MAX_DELAY);
    }

    #[tokio::test]
    async fn events_come_back_in_order() {
        let (queue, mut rx) = Queue::new();

        queue.add(Event::OrphanedServicesGcTriggered);
        queue.add(Event::RepairEndpoints);

        assert!(matches!(
            rx.recv().await.unwrap().event,
            Event::OrphanedServicesGcTriggered
        ));
        assert!(matches!(rx.recv().await.unwrap().event, Event::RepairEndpoints));
    }

    #[tokio::test]
    async fn rate_limited_retries_come_back_bumped() {
        let (queue, mut rx) = Queue::new();

        queue.add_rate_limited(Attempt::first(Event::RepairEndpoints).bump());

        let attempt = rx.recv().await.unwrap();
        assert!(matches!(attempt.event, Event::RepairEndpoints));
        assert_eq!(attempt.requeues, 1);
    }

    #[tokio::test]
    async fn shutdown_posts_the_sentinel() {
        let (queue, mut rx) = Queue::new();

        assert!(!queue.is_shutting_down());
        queue.shut_down();

        assert!(queue.is_shutting_down());
        assert!(matches!(rx.recv().await.unwrap().event, Event::Stop));
    }
}
