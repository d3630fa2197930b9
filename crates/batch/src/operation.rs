//! The per-item bulk operation a batch executes.
//!
//! The engine does not know what an item is or what applying it means; it
//! only calls [`BulkOperation::apply_item`] once per item of a work-item job.
//! Implementations must be idempotent per item: a retried job may hand the
//! same item to the operation again.

use forgebatch_core::BatchId;

use crate::variables::Variables;

/// Per-item failure reported by a bulk operation.
///
/// Rendered as `"<code> <message>"`, e.g.
/// `"BATCH-23003 Item 'abc' cannot be migrated"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct ItemError {
    pub code: String,
    pub message: String,
}

impl ItemError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What an operation sees for one item.
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    pub batch_id: BatchId,
    pub item_id: &'a str,
    pub variables: &'a Variables,
}

/// A bulk operation, registered with the engine under its batch type.
pub trait BulkOperation: Send + Sync + 'static {
    /// Batch type tag this operation serves (also the work-item job type).
    fn batch_type(&self) -> &str;

    /// Apply the operation to one item. Each call commits independently.
    fn apply_item(&self, ctx: &ItemContext<'_>) -> Result<(), ItemError>;
}

/// Closure-backed operation.
pub struct OperationFn<F> {
    batch_type: String,
    apply: F,
}

impl<F> OperationFn<F>
where
    F: Fn(&ItemContext<'_>) -> Result<(), ItemError> + Send + Sync + 'static,
{
    pub fn new(batch_type: impl Into<String>, apply: F) -> Self {
        Self {
            batch_type: batch_type.into(),
            apply,
        }
    }
}

impl<F> core::fmt::Debug for OperationFn<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationFn")
            .field("batch_type", &self.batch_type)
            .finish_non_exhaustive()
    }
}

impl<F> BulkOperation for OperationFn<F>
where
    F: Fn(&ItemContext<'_>) -> Result<(), ItemError> + Send + Sync + 'static,
{
    fn batch_type(&self) -> &str {
        &self.batch_type
    }

    fn apply_item(&self, ctx: &ItemContext<'_>) -> Result<(), ItemError> {
        (self.apply)(ctx)
    }
}
