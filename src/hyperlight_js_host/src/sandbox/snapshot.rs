/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;

use uuid::Uuid;

use crate::{Result, new_error};

/// An immutable capture of complete sandbox state: the driver's opaque
/// vCPU-and-memory payload, tagged with the originating sandbox and a
/// content checksum.
///
/// Snapshots are cheaply cloneable, may outlive the stage they were
/// taken from, and may be applied any number of times, but only to the
/// sandbox that produced them.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    sandbox_id: Uuid,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

impl Snapshot {
    pub(crate) fn new(sandbox_id: Uuid, payload: Vec<u8>) -> Self {
        let checksum = *blake3::hash(&payload).as_bytes();
        Self {
            inner: Arc::new(SnapshotInner {
                sandbox_id,
                checksum,
                payload,
            }),
        }
    }

    pub(crate) fn sandbox_id(&self) -> Uuid {
        self.inner.sandbox_id
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Recompute the payload checksum; a mismatch means the snapshot
    /// bytes were corrupted since capture.
    pub(crate) fn verify_integrity(&self) -> Result<()> {
        if *blake3::hash(&self.inner.payload).as_bytes() != self.inner.checksum {
            return Err(new_error!("snapshot payload failed its integrity check"));
        }
        Ok(())
    }

    /// Size of the captured payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.inner.payload.len()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("sandbox_id", &self.inner.sandbox_id)
            .field("payload_size", &self.inner.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_payload() {
        let snapshot = Snapshot::new(Uuid::new_v4(), vec![1, 2, 3]);
        let clone = snapshot.clone();
        assert_eq!(snapshot.payload().as_ptr(), clone.payload().as_ptr());
        assert_eq!(clone.payload_size(), 3);
    }

    #[test]
    fn integrity_check_passes_on_untouched_payloads() {
        let snapshot = Snapshot::new(Uuid::new_v4(), b"state".to_vec());
        snapshot.verify_integrity().unwrap();
    }
}
