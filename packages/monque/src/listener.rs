//! Change-notification dispatcher.
//!
//! Subscribes to the store's change stream and turns relevant changes (new
//! jobs, or updates that put a job back into pending) into debounced claim
//! cycles. Bursts coalesce into a single poll, which keeps bulk inserts from
//! turning into claim storms.
//!
//! Stream errors trigger reconnection with exponential backoff, capped at
//! three attempts; after that the scheduler emits a fallback event and keeps
//! running on polling alone, which always runs in parallel as the safety
//! net.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::JobEvent;
use crate::monque::Core;
use crate::store::JobChangeStream;

/// Debounce window for change-triggered polls.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Reconnection attempts before falling back to polling-only.
const MAX_RECONNECT: u32 = 3;

/// Backoff before reconnect `attempt` (1-based): `2^(attempt-1) * 1s`.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis(2u64.saturating_pow(attempt.saturating_sub(1)) * 1000)
}

pub(crate) async fn run(core: Arc<Core>, cancel: CancellationToken) {
    let mut stream = match core.store.watch().await {
        Ok(stream) => {
            core.events.emit(JobEvent::ListenerConnected);
            debug!("change listener connected");
            stream
        }
        Err(err) => {
            warn!(error = %err, "change listener failed to connect");
            core.events.emit(JobEvent::ListenerError {
                error: err.to_string(),
            });
            match reconnect(&core, &cancel).await {
                Some(stream) => stream,
                None => return,
            }
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                core.events.emit(JobEvent::ListenerClosed);
                debug!("change listener closed");
                return;
            }
            event = stream.next() => {
                let error = match event {
                    Some(Ok(change)) => {
                        if change.wakes_dispatch() && !cancel.is_cancelled() {
                            schedule_poll(&core);
                        }
                        continue;
                    }
                    Some(Err(err)) => err.to_string(),
                    None => "change stream ended".to_string(),
                };

                warn!(error = %error, "change stream error");
                core.events.emit(JobEvent::ListenerError { error });
                match reconnect(&core, &cancel).await {
                    Some(next) => stream = next,
                    None => return,
                }
            }
        }
    }
}

/// Reconnect with backoff. Returns `None` when shut down mid-wait or when
/// the attempts are exhausted (after emitting the fallback event).
async fn reconnect(core: &Arc<Core>, cancel: &CancellationToken) -> Option<JobChangeStream> {
    for attempt in 1..=MAX_RECONNECT {
        let delay = reconnect_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match core.store.watch().await {
            Ok(stream) => {
                info!(attempt, "change listener reconnected");
                core.events.emit(JobEvent::ListenerConnected);
                return Some(stream);
            }
            Err(err) => {
                warn!(attempt, error = %err, "change listener reconnect failed");
                core.events.emit(JobEvent::ListenerError {
                    error: err.to_string(),
                });
            }
        }
    }

    let reason = format!("reconnect attempts exhausted after {MAX_RECONNECT}");
    warn!(reason = %reason, "change listener falling back to polling");
    core.events.emit(JobEvent::ListenerFallback { reason });
    None
}

/// Schedule a single debounced claim cycle; further calls inside the window
/// coalesce into it.
fn schedule_poll(core: &Arc<Core>) {
    if core.debounce_pending.swap(true, Ordering::SeqCst) {
        return;
    }
    let core = Arc::clone(core);
    tokio::spawn(async move {
        tokio::time::sleep(DEBOUNCE).await;
        core.debounce_pending.store(false, Ordering::SeqCst);
        core.kick.notify_one();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_doubles_from_one_second() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(2), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(3), Duration::from_millis(4000));
    }
}
