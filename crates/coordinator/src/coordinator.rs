//! Transaction entry point

use crate::atr::AtrManager;
use crate::attempt::{AttemptContext, AttemptState};
use crate::backoff::Backoff;
use crate::cleanup::{Cleanup, CleanupRequest};
use crate::config::TransactionConfig;
use crate::error::{ConfigError, OperationError, Result, TransactionError};
use crate::registry::CollectionRegistry;
use proven_common::{Timestamp, TransactionId};
use proven_kv::Collection;
use std::future::Future;
use std::sync::Arc;

/// User logic run once per attempt
///
/// Any `Fn(AttemptContext) -> impl Future<Output = Result<()>>` closure
/// implements this, so most callers never name the trait.
pub trait TransactionLogic: Send + Sync {
    fn execute(&self, ctx: AttemptContext) -> impl Future<Output = Result<()>> + Send;
}

impl<F, Fut> TransactionLogic for F
where
    F: Fn(AttemptContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn execute(&self, ctx: AttemptContext) -> impl Future<Output = Result<()>> + Send {
        self(ctx)
    }
}

/// Successful outcome of [`Transactions::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: TransactionId,

    /// Attempts made, including the one that committed
    pub attempts: usize,

    /// Whether every staged write was unstaged before returning
    ///
    /// When `false` the transaction is committed but some documents still
    /// show their old value to transaction-unaware readers until cleanup
    /// finishes unstaging them.
    pub unstaging_complete: bool,
}

struct TransactionsInner {
    config: Arc<TransactionConfig>,
    atr: AtrManager,
    registry: Arc<CollectionRegistry>,
    cleanup: Cleanup,
}

/// Runs transactions and owns their background cleanup
///
/// Cheap to clone; clones share configuration, known collections and cleanup.
#[derive(Clone)]
pub struct Transactions {
    inner: Arc<TransactionsInner>,
}

impl Transactions {
    /// Validate `config` and start background cleanup
    ///
    /// Background cleanup needs a tokio runtime; outside one only
    /// [`Cleanup::sweep`] and [`Cleanup::cleanup_entry`] are available.
    pub fn new(config: TransactionConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let atr = AtrManager::new(config.durability_level, config.num_atrs);
        let registry = Arc::new(CollectionRegistry::default());
        let cleanup = Cleanup::start(&config, atr.clone(), registry.clone());

        Ok(Self {
            inner: Arc::new(TransactionsInner {
                config: Arc::new(config),
                atr,
                registry,
                cleanup,
            }),
        })
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    /// Make a collection's ATRs visible to lost-attempt cleanup
    ///
    /// Collections are registered automatically the first time a
    /// transaction touches them. Writing a document staged by another
    /// client whose ATR lives in a collection never registered here fails
    /// with [`AtrError::UnknownCollection`](crate::AtrError::UnknownCollection)
    /// instead of waiting on an outcome this client cannot look up.
    pub fn register_collection(&self, collection: &Collection) {
        self.inner.registry.register(collection);
    }

    pub fn cleanup(&self) -> &Cleanup {
        &self.inner.cleanup
    }

    /// Run `logic` until it commits, fails, or the transaction expires
    ///
    /// Conflicts and transient failures roll the attempt back and run the
    /// logic again with a fresh [`AttemptContext`]. Once an attempt has passed
    /// its commit point the transaction succeeds, even if unstaging is left
    /// to cleanup.
    pub async fn run<F, Fut>(
        &self,
        logic: F,
    ) -> std::result::Result<TransactionResult, TransactionError>
    where
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        self.run_logic(logic).await
    }

    /// [`Transactions::run`] for logic implemented as a type
    pub async fn run_logic<L: TransactionLogic>(
        &self,
        logic: L,
    ) -> std::result::Result<TransactionResult, TransactionError> {
        let config = &self.inner.config;
        let transaction_id = TransactionId::new();
        let deadline = Timestamp::now().add_duration(config.expiration_time);
        let mut backoff = Backoff::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let ctx = AttemptContext::new(
                transaction_id,
                deadline,
                config.clone(),
                self.inner.atr.clone(),
                self.inner.registry.clone(),
            );
            tracing::debug!(
                "Transaction {} starting attempt {} ({})",
                transaction_id,
                attempts,
                ctx.attempt_id()
            );

            let executed =
                tokio::time::timeout(deadline.remaining(), logic.execute(ctx.clone())).await;
            let result = match executed {
                Ok(Ok(())) => ctx.complete().await,
                Ok(Err(e)) => Err(e),
                Err(_) => Err(OperationError::Expired),
            };

            let error = match result {
                Ok(()) => {
                    self.finish(&ctx);
                    return Ok(TransactionResult {
                        transaction_id,
                        attempts,
                        unstaging_complete: ctx.unstaging_complete(),
                    });
                }
                Err(e) => e,
            };

            // Logic failed after committing explicitly: the writes stand
            if ctx.state().is_committed() {
                self.finish(&ctx);
                return Err(TransactionError::Failed {
                    transaction_id,
                    state: ctx.state(),
                    cause: Box::new(error),
                });
            }

            let rolled_back = match ctx.abort().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        "Transaction {} attempt {} left staged writes behind: {}",
                        transaction_id,
                        ctx.attempt_id(),
                        e
                    );
                    false
                }
            };
            self.finish(&ctx);
            let state = ctx.state();

            if ctx.rolled_back_by_app() {
                return Err(TransactionError::Failed {
                    transaction_id,
                    state,
                    cause: Box::new(error),
                });
            }

            if matches!(error, OperationError::Expired) {
                tracing::debug!("Transaction {} expired", transaction_id);
                return Err(TransactionError::Expired {
                    transaction_id,
                    state,
                });
            }

            if rolled_back && error.is_retryable() {
                tracing::debug!(
                    "Transaction {} retrying after attempt {}: {}",
                    transaction_id,
                    attempts,
                    error
                );
                if backoff.wait(deadline).await {
                    continue;
                }
                return Err(TransactionError::Expired {
                    transaction_id,
                    state,
                });
            }

            return Err(TransactionError::Failed {
                transaction_id,
                state,
                cause: Box::new(error),
            });
        }
    }

    /// Hand an attempt that wrote an ATR entry to client cleanup
    fn finish(&self, ctx: &AttemptContext) {
        if let Some(atr) = ctx.atr_location() {
            self.inner.cleanup.enqueue(CleanupRequest {
                atr,
                attempt_id: ctx.attempt_id(),
            });
        }
    }

    /// Finish queued client cleanup and stop background tasks
    pub async fn close(&self) {
        self.inner.cleanup.close().await;
    }
}

impl std::fmt::Debug for Transactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactions")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
