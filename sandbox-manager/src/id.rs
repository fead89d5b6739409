use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use uuid::Uuid;

/// Issues sandbox ids of the form `sbx-<millis>-<seq>-<random>`, all hex.
///
/// The sequence number makes ids unique within one manager even when the
/// clock does not advance; the random suffix keeps them from colliding with
/// directories left behind by an earlier process.
#[derive(Debug, Default)]
pub(crate) struct IdGenerator {
    seq: AtomicU64,
}

impl IdGenerator {
    pub(crate) fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        let random = Uuid::new_v4().as_u128() & 0xffff_ffff;
        format!("sbx-{millis:x}-{seq:x}-{random:08x}")
    }
}
