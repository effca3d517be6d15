//! Supervised execution of user derivation algorithms.
//!
//! Algorithms are untrusted: they may throw, hang, or spin. Each invocation
//! runs on a worker pool; the caller blocks for at most the configured wait
//! budget. On timeout the invocation's cancel token is set and the partial
//! result discarded. A worker that never observes its token keeps running
//! until it finishes, but it can no longer affect the pipeline, and the
//! pool size bounds how many such orphans can exist at once.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use threadpool::ThreadPool;
use tracing::{debug, error};

use crate::dict::{ChannelDefinitionProvider, ChannelId};
use crate::lad::ChannelLad;
use crate::value::ChannelValue;
use crate::Result;

/// Map of parent channel id to the resolved parent value handed to an
/// algorithm.
pub type AcvMap = HashMap<ChannelId, ChannelValue>;

/// Cooperative cancellation flag. Long-running algorithms should poll
/// [is_cancelled](Self::is_cancelled) and bail out when set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Context handed to each algorithm invocation.
pub struct DerivationContext {
    pub cancel: CancelToken,
    pub lad: Arc<ChannelLad>,
    pub dict: Arc<dyn ChannelDefinitionProvider>,
    /// Child channel ids the definition declares for this derivation.
    pub children: Vec<ChannelId>,
}

/// A user-supplied derivation algorithm: N parents in, M children out.
pub trait DerivationAlgorithm: Send + Sync {
    fn derive(&self, parents: &AcvMap, ctx: &DerivationContext) -> Result<Vec<ChannelValue>>;
}

/// Outcome of one supervised invocation.
pub enum RunOutcome {
    Completed(Result<Vec<ChannelValue>>),
    TimedOut,
}

/// Runs algorithms on a named worker pool with a per-invocation wait
/// budget.
pub struct AlgorithmRunner {
    pool: ThreadPool,
    timeout: Duration,
}

impl AlgorithmRunner {
    #[must_use]
    pub fn new(workers: usize, timeout: Duration) -> Self {
        let pool = threadpool::Builder::new()
            .num_threads(workers.max(1))
            .thread_name("derivation_worker".into())
            .build();
        AlgorithmRunner {
            pool,
            timeout: timeout.max(Duration::from_millis(1)),
        }
    }

    /// Run one algorithm invocation, blocking up to the wait budget.
    ///
    /// On timeout the context's cancel token is set and [RunOutcome::TimedOut]
    /// returned; whatever the worker produces later is discarded.
    pub fn run(
        &self,
        derivation_id: &str,
        algorithm: Arc<dyn DerivationAlgorithm>,
        parents: AcvMap,
        ctx: DerivationContext,
    ) -> RunOutcome {
        let (tx, rx) = bounded(1);
        let cancel = ctx.cancel.clone();

        self.pool.execute(move || {
            let zult = algorithm.derive(&parents, &ctx);
            // Receiver gone means the supervisor timed out; drop the result.
            let _ = tx.send(zult);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(zult) => RunOutcome::Completed(zult),
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                error!(
                    derivation = derivation_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "forced to abandon derivation algorithm; worker cancelled"
                );
                RunOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Worker panicked before sending
                debug!(derivation = derivation_id, "derivation worker died");
                RunOutcome::Completed(Err(crate::Error::Derivation(format!(
                    "algorithm worker for {derivation_id} terminated abnormally"
                ))))
            }
        }
    }
}
