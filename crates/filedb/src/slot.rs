//! A nullable object reference held by some owning record.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::blob::BlobStore;
use crate::engine::{Content, DedupEngine};
use crate::error::Result;
use crate::record::ObjectId;

/// An owner's handle on at most one stored payload.
///
/// The owner persists `id` in its own storage; the slot keeps the engine's
/// reference count in step when the payload is replaced or cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadSlot {
    pub id: Option<ObjectId>,
}

impl PayloadSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn holding(id: ObjectId) -> Self {
        Self { id: Some(id) }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }

    /// The payload bytes, or `None` for an empty slot.
    pub fn load_payload<B: BlobStore>(&self, engine: &DedupEngine<B>) -> Result<Option<Vec<u8>>> {
        self.id.map(|id| engine.read(id, true)).transpose()
    }

    /// Store `content` (or clear the slot with `None`) and release the old payload.
    ///
    /// The new content is added before the old reference is dropped, so
    /// replacing a payload with identical bytes never deletes it. If the add
    /// fails the slot is unchanged. If releasing the old payload fails, the
    /// error is returned but the slot already holds the new id, so the
    /// owner should persist `id` either way; the old object keeps the
    /// reference until it is released again.
    pub fn replace_payload<'a, B: BlobStore>(
        &mut self,
        engine: &DedupEngine<B>,
        content: Option<Content<'a>>,
    ) -> Result<Option<ObjectId>> {
        let new_id = match content {
            Some(content) => Some(engine.add(content, None)?.id),
            None => None,
        };

        let previous = std::mem::replace(&mut self.id, new_id);
        if let Some(previous) = previous {
            if let Err(err) = engine.release(previous, false) {
                warn!(id = %previous, error = %err, "failed to release replaced payload");
                return Err(err);
            }
        }
        Ok(self.id)
    }
}
