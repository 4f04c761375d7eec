use crate::errors::GatewayError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Default delay before the typing indicator fires.
pub const TYPING_INDICATOR_DELAY: Duration = Duration::from_secs(4);

const STATE_IDLE: u8 = 0;
const STATE_RESOLVED: u8 = 1;

/// Races a fixed-delay timer against the engine's first real response.
///
/// Two states, transitioning once: `Idle` until the timer fires, then
/// `Resolved`. At fire time the indicator is sent only if no response has
/// been counted yet. This is a race, not a guarantee — a response landing
/// between the fire-time check and the counter increment may still produce a
/// redundant indicator, which is accepted. There is no cancellation: the
/// timer always runs to completion or no-ops, and `finish` must be awaited
/// before webhook processing completes so indicators are not dropped.
pub struct TypingRace {
    responses: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
    timer: JoinHandle<()>,
}

impl TypingRace {
    pub fn start<F, Fut>(delay: Duration, send_typing: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let responses = Arc::new(AtomicU32::new(0));
        let state = Arc::new(AtomicU8::new(STATE_IDLE));

        let timer = tokio::spawn({
            let responses = responses.clone();
            let state = state.clone();
            async move {
                tokio::time::sleep(delay).await;
                // Single Idle -> Resolved transition
                if state.swap(STATE_RESOLVED, Ordering::AcqRel) != STATE_IDLE {
                    return;
                }
                if responses.load(Ordering::Acquire) == 0 {
                    if let Err(e) = send_typing().await {
                        warn!("typing indicator send failed: {}", e);
                    }
                }
            }
        });

        Self {
            responses,
            state,
            timer,
        }
    }

    /// A cloneable handle for counting real responses as they are sent.
    pub fn counter(&self) -> ResponseCounter {
        ResponseCounter(self.responses.clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RESOLVED
    }

    /// Wait for the timer to run to completion (send or no-op).
    pub async fn finish(self) {
        let _ = self.timer.await;
    }
}

#[derive(Clone)]
pub struct ResponseCounter(Arc<AtomicU32>);

impl ResponseCounter {
    pub fn note_response(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}
