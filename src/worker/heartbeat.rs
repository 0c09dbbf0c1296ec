//! Background keep-alive for one in-flight delivery.
//!
//! Every `interval` it pushes the session lease and then the queue visibility
//! a full window forward, so the message never reappears while the lease is
//! still live. If the lease can no longer be renewed the claim is gone, the
//! flag returned by `is_lost()` flips and visibility is left to lapse.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{QueueError, SessionError};
use crate::queue::{ReceiptHandle, TaskQueue};
use crate::session::Claim;
use crate::store::SessionStore;

pub struct Heartbeat {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn start(
        sessions: Arc<dyn SessionStore>,
        queue: Arc<dyn TaskQueue>,
        receipt: ReceiptHandle,
        claim: Claim,
        interval: Duration,
        window: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;

                match sessions.renew_lease(&claim, window).await {
                    Ok(renewed) => {
                        debug!(
                            session_id = %claim.session_id,
                            generation = claim.generation,
                            lease_expires_at = %renewed.lease_expires_at,
                            "Lease renewed"
                        );
                    }
                    Err(SessionError::Database(e)) => {
                        warn!(session_id = %claim.session_id, error = %e, "Failed to renew lease");
                    }
                    Err(e) => {
                        warn!(
                            session_id = %claim.session_id,
                            generation = claim.generation,
                            error = %e,
                            "Claim lost"
                        );
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }

                match queue.extend(&receipt, window).await {
                    Ok(()) => {}
                    Err(QueueError::ReceiptExpired { .. }) => {
                        warn!(session_id = %claim.session_id, "Queue receipt expired while processing");
                    }
                    Err(e) => warn!(session_id = %claim.session_id, error = %e, "Failed to extend visibility"),
                }
            }
        });

        Self { handle, lost }
    }

    /// Whether a renewal found the claim superseded.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
