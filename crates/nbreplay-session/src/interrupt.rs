//! Cooperative cancellation of a running replay.

use tokio::sync::watch;

/// Cloneable trigger held by whoever may stop the replay (a Ctrl-C handler).
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: watch::Sender<bool>,
}

/// Observed by the orchestrator between and during cell executions.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

/// A connected trigger/observer pair.
pub fn interrupt_channel() -> (InterruptHandle, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptHandle { tx }, Interrupt { rx })
}

impl InterruptHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Interrupt {
        Interrupt {
            rx: self.tx.subscribe(),
        }
    }
}

impl Interrupt {
    /// An interrupt that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the interrupt fires. Pending forever if the trigger is
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|&fired| fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let (handle, mut interrupt) = interrupt_channel();
        assert!(!interrupt.is_triggered());
        let waiter = tokio::spawn(async move {
            interrupt.triggered().await;
            interrupt.is_triggered()
        });
        handle.trigger();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_sees_trigger() {
        let (handle, _interrupt) = interrupt_channel();
        let second = handle.subscribe();
        handle.trigger();
        assert!(second.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_stays_pending() {
        let mut interrupt = Interrupt::never();
        let res = tokio::time::timeout(Duration::from_secs(60), interrupt.triggered()).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stays_pending() {
        let (handle, mut interrupt) = interrupt_channel();
        drop(handle);
        let res = tokio::time::timeout(Duration::from_secs(60), interrupt.triggered()).await;
        assert!(res.is_err());
    }
}
