use std::sync::Arc;
use tokio::sync::watch;

/// A one-shot completion signal that any number of parties can wait for, e.g. the end of a
///  shutdown or the close of a channel. Waiting after completion returns immediately.
#[derive(Clone, Debug)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

/// The completing side of a [Completion]. Dropping it without completing also releases waiters,
///  so nothing waits forever for a party that went away.
#[derive(Clone, Debug)]
pub(crate) struct CompletionSignal {
    tx: Arc<watch::Sender<bool>>,
}

pub(crate) fn completion() -> (CompletionSignal, Completion) {
    let (tx, rx) = watch::channel(false);
    (CompletionSignal { tx: Arc::new(tx) }, Completion { rx })
}

impl CompletionSignal {
    pub fn complete(&self) {
        self.tx.send_replace(true);
    }
}

impl Completion {
    /// a completion that is complete from the start
    pub fn completed() -> Completion {
        let (signal, result) = completion();
        signal.complete();
        result
    }

    /// Wait for completion. Returns `false` if the completing side went away without completing.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        let completed = rx.wait_for(|done| *done).await.is_ok();
        completed
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_completion() {
        let (signal, completion) = completion();
        assert!(!completion.is_complete());

        let waiter = {
            let completion = completion.clone();
            tokio::spawn(async move { completion.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.complete();
        assert!(waiter.await.unwrap());
        assert!(completion.is_complete());
        assert!(completion.wait().await);
    }

    #[tokio::test]
    async fn test_dropped_signal_releases_waiters() {
        let (signal, completion) = completion();
        drop(signal);
        assert!(!completion.wait().await);
        assert!(!completion.is_complete());
    }

    #[tokio::test]
    async fn test_completed() {
        assert!(Completion::completed().wait().await);
    }
}
