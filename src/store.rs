//! Document store capability.
//!
//! The store holds one document per job inside a watched collection and
//! delivers changes to that collection as a stream of batches. Delivery is
//! at-least-once: the same `added` change may arrive more than once.
//!
//! | Method | Used by |
//! |--------|---------|
//! | `subscribe()` | dispatcher, once at start |
//! | `unsubscribe()` | dispatcher, on shutdown |
//! | `fetch()` | reporter, terminal idempotence check |
//! | `update_fields()` | reporter, every lifecycle write |

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::document::{ChangeBatch, FieldUpdate, Fields};
use crate::error::StoreResult;
use crate::job::JobId;

/// Stream of change batches for a watched collection.
pub type ChangeFeed = BoxStream<'static, StoreResult<ChangeBatch>>;

/// Remote document collection holding job documents.
///
/// Implementations must be safe to use from many runners at once; the
/// dispatcher shares a single instance behind an `Arc`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open the change feed for `collection`.
    ///
    /// The stream ends when the subscription is closed.
    async fn subscribe(&self, collection: &str) -> StoreResult<ChangeFeed>;

    /// Stop delivery for `collection`.
    async fn unsubscribe(&self, collection: &str) -> StoreResult<()>;

    /// Current field values of a document.
    async fn fetch(&self, id: &JobId) -> StoreResult<Fields>;

    /// Merge `update` into the document. One call is one mutation.
    async fn update_fields(&self, id: &JobId, update: FieldUpdate) -> StoreResult<()>;
}
