use std::sync::Arc;

use saga_core::{ErrorKind, LogRecord};
use saga_log::StepLog;
use saga_retry::RetryPolicy;
use tracing::warn;

use crate::error::{EngineError, Result};

/// Appends to the step log, retrying transient storage failures.
///
/// Nothing proceeds past a record until this returns `Ok`: no action is
/// invoked whose `Started` record has not been acknowledged.
#[derive(Clone)]
pub(crate) struct DurableWriter {
    log: Arc<dyn StepLog>,
    policy: RetryPolicy,
}

impl DurableWriter {
    pub(crate) fn new(log: Arc<dyn StepLog>, policy: RetryPolicy) -> Self {
        Self { log, policy }
    }

    pub(crate) async fn append(&self, record: &LogRecord) -> Result<()> {
        let saga_id = record.saga_id();
        let mut attempt = 1;
        loop {
            match self.log.append(record).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.is_retryable()
                        && self.policy.should_retry(attempt, ErrorKind::Transient) =>
                {
                    let delay = self.policy.next_delay(attempt);
                    warn!(
                        %saga_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "step log write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(EngineError::LogUnavailable {
                        saga_id,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
