use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{CheckError, CheckResult};

/// Named cancellation tokens so an embedding app can stop a run by id.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, id: &str) -> bool {
        if let Some(token) = self.tokens.lock().remove(id) {
            token.cancel();
            return true;
        }
        false
    }

    pub fn remove(&self, id: &str) {
        self.tokens.lock().remove(id);
    }
}

pub fn ensure_active(cancel: &CancellationToken) -> CheckResult<()> {
    if cancel.is_cancelled() {
        return Err(CheckError::Cancelled);
    }
    Ok(())
}

/// Sleeps for `duration` unless the token fires first.
pub async fn wait_or_cancel(duration: Duration, cancel: &CancellationToken) -> CheckResult<()> {
    ensure_active(cancel)?;
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(CheckError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn registry_cancels_registered_token_once() {
        let registry = CancelRegistry::new();
        let token = registry.register("run-1");
        assert!(registry.cancel("run-1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("run-1"));
    }

    #[tokio::test]
    async fn wait_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = wait_or_cancel(Duration::from_secs(30), &token).await;
        assert!(matches!(result, Err(CheckError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn wait_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(wait_or_cancel(Duration::from_millis(5), &token).await.is_ok());
    }
}
