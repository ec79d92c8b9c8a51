//! The set of consumed serial numbers.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::SERIAL_LEN;

/// Serial numbers that have been consumed by verification, keyed by their
/// canonical scalar bytes. One ledger is shared by every connection handler
/// of an engine, and entries are never removed for the life of the process.
#[derive(Debug, Default)]
pub struct SerialLedger {
    seen: Mutex<HashSet<[u8; SERIAL_LEN]>>,
}

impl SerialLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, serial: &[u8; SERIAL_LEN]) -> bool {
        self.seen
            .lock()
            .expect("serial ledger poisoned")
            .contains(serial)
    }

    /// Records a serial, returning false if it was already present. The
    /// single locked call keeps check-and-insert atomic with respect to
    /// concurrent verifications of the same serial.
    pub fn insert(&self, serial: [u8; SERIAL_LEN]) -> bool {
        self.seen
            .lock()
            .expect("serial ledger poisoned")
            .insert(serial)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("serial ledger poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
