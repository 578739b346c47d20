//! Process-wide fatal error trigger

use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;
use tracker_common::Error;

/// Raised once when the tracker can no longer guarantee durability
///
/// The first reason wins; later raises are only logged.
#[derive(Clone)]
pub struct FatalSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Fatal: {}", reason);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Raise if `err` belongs to the durability or recovery class
    pub fn check(&self, err: &Error) {
        if err.is_fatal() {
            self.raise(err.to_string());
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Wait until the signal is raised and return its reason
    pub async fn wait(&self) -> String {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // unreachable while `self` holds the sender
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let signal = FatalSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        signal.check(&Error::Timeout);
        assert!(signal.reason().is_none());

        signal.check(&Error::LogFailed);
        signal.raise("second");
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Error::LogFailed.to_string());
        assert_eq!(signal.reason(), Some(reason));
    }
}
