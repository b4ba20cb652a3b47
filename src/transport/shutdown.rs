use std::sync::Arc;

use tokio::sync::watch;

/// Requests a session stop. Clones share one signal; triggering is idempotent.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side handed to every accept and read loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered, or the trigger is gone.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_resolves_after_trigger() {
        let trigger = ShutdownTrigger::new();
        let mut signal = trigger.subscribe();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move {
            signal.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal observed")
            .unwrap();
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn late_subscribers_see_earlier_trigger() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        let mut signal = trigger.subscribe();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("already triggered");
    }
}
