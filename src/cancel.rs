/*
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ProllyError, Result};

/// Cooperative cancellation handle carried by every long-running operation.
///
/// Cloning shares the flag. Worker threads poll the token at their blocking
/// points; once `cancel` is called, operations return
/// [`ProllyError::Canceled`] and discard pending work. There are no
/// internal timeouts; callers impose them by canceling.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Canceled)` once the token has fired.
    pub fn checked(&self) -> Result<()> {
        if self.is_canceled() {
            Err(ProllyError::Canceled)
        } else {
            Ok(())
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Blocking receive that stays selectable against a cancellation token.
///
/// Returns `Ok(None)` when every sender is gone, `Err(Canceled)` when the
/// token fires while waiting.
pub(crate) fn recv_cancelable<T>(
    rx: &Receiver<T>,
    cancel: &CancellationToken,
) -> Result<Option<T>> {
    loop {
        cancel.checked()?;
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(value) => return Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_token_starts_live() {
        let token = CancellationToken::new();
        assert!(!token.is_canceled());
        assert!(token.checked().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();

        assert!(token.is_canceled());
        assert!(matches!(token.checked(), Err(ProllyError::Canceled)));
    }

    #[test]
    fn test_recv_cancelable_returns_value() {
        let (tx, rx) = mpsc::channel();
        tx.send(7u32).unwrap();

        let got = recv_cancelable(&rx, &CancellationToken::new()).unwrap();
        assert_eq!(got, Some(7));
    }

    #[test]
    fn test_recv_cancelable_sees_disconnect() {
        let (tx, rx) = mpsc::channel::<u32>();
        drop(tx);

        let got = recv_cancelable(&rx, &CancellationToken::new()).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_recv_cancelable_observes_cancel() {
        let (_tx, rx) = mpsc::channel::<u32>();
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            recv_cancelable(&rx, &token),
            Err(ProllyError::Canceled)
        ));
    }
}
