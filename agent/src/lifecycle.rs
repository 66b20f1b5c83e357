use std::sync::atomic::{AtomicU8, Ordering};

const CONNECTED: u8 = 1 << 0;
const STATUS_UPDATE_REQUIRED: u8 = 1 << 1;

/// Connection bookkeeping shared between the transport callback task and
/// the telemetry task. Only the transport events mutate the flags; every
/// other reader observes them.
#[derive(Debug, Default)]
pub struct ConnectionFlags {
    bits: AtomicU8,
}

impl ConnectionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fresh connect, including reconnects, forces a full
    /// re-announce.
    pub fn on_connected(&self) {
        self.bits
            .fetch_or(CONNECTED | STATUS_UPDATE_REQUIRED, Ordering::SeqCst);
    }

    /// A half-finished announce from a dropped connection is not assumed
    /// valid, so the pending-update bit is cleared too.
    pub fn on_disconnected(&self) {
        self.bits
            .fetch_and(!(CONNECTED | STATUS_UPDATE_REQUIRED), Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & CONNECTED != 0
    }

    pub fn announce_required(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & STATUS_UPDATE_REQUIRED != 0
    }

    /// Called once the full announce sequence has completed.
    pub fn announce_done(&self) {
        self.bits.fetch_and(!STATUS_UPDATE_REQUIRED, Ordering::SeqCst);
    }
}
