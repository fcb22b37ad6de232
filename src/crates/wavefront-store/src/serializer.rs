//! Snapshot serialization.
//!
//! Suspension snapshots pass through a [`SnapshotSerializer`] before storage.
//! Round-tripping at suspend time catches non-serializable state early and
//! yields a detached copy, so the stored snapshot never aliases live state.

use crate::error::Result;
use crate::state::RunState;

/// Converts run-state snapshots to and from bytes.
pub trait SnapshotSerializer: Send + Sync {
    fn serialize(&self, state: &RunState) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<RunState>;

    /// Round-trip a snapshot, producing a structurally independent copy.
    fn detach(&self, state: &RunState) -> Result<RunState> {
        let bytes = self.serialize(state)?;
        self.deserialize(&bytes)
    }
}

/// JSON-backed serializer. Snapshots stay human-inspectable in storage.
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl SnapshotSerializer for JsonSerializer {
    fn serialize(&self, state: &RunState) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<RunState> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
