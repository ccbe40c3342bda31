//! Event identity and deduplication.

use std::collections::HashSet;

use parking_lot::Mutex;
use sentinel_types::StackFrame;
use sha2::{Digest, Sha256};

/// How many innermost frames participate in the fingerprint.
const FINGERPRINT_FRAMES: usize = 3;

/// Distinct fingerprints held before the dedup set is wiped.
const DEDUP_SET_CAPACITY: usize = 1000;

/// Stable identity for a fault: its type plus the top stack frames.
///
/// Two faults with the same type thrown from the same place hash identically;
/// line numbers are deliberately excluded so minor code motion within a
/// method does not split an event's identity.
pub fn fingerprint(type_name: &str, frames: &[StackFrame]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());

    for frame in frames.iter().take(FINGERPRINT_FRAMES) {
        hasher.update(b"|");
        if let Some(class) = &frame.class_name {
            hasher.update(class.as_bytes());
        }
        hasher.update(b".");
        if let Some(method) = &frame.method_name {
            hasher.update(method.as_bytes());
        }
    }

    hex::encode(hasher.finalize())
}

/// Bounded window of already-reported fingerprints.
///
/// When the set grows past capacity it is cleared entirely: an occasional
/// duplicate burst is accepted over unbounded growth or per-entry expiry
/// bookkeeping. The reset semantics are load-bearing; do not swap in an LRU.
pub struct FingerprintSet {
    seen: Mutex<HashSet<String>>,
}

impl FingerprintSet {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Record a fingerprint. Returns `true` if it was new (caller should
    /// report), `false` if it is a duplicate within the current window.
    pub fn insert(&self, fingerprint: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(fingerprint) {
            return false;
        }
        if seen.len() >= DEDUP_SET_CAPACITY {
            log::debug!(
                "[CAPTURE] Dedup set reached {} entries, clearing",
                seen.len()
            );
            seen.clear();
        }
        seen.insert(fingerprint.to_string());
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

impl Default for FingerprintSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(class: &str, method: &str, line: u32) -> StackFrame {
        StackFrame {
            class_name: Some(class.to_string()),
            method_name: Some(method.to_string()),
            line,
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let frames = vec![
            frame("app::orders", "submit", 10),
            frame("app::api", "handle", 55),
            frame("app", "main", 3),
        ];
        assert_eq!(
            fingerprint("app::OrderError", &frames),
            fingerprint("app::OrderError", &frames.clone())
        );
    }

    #[test]
    fn test_fingerprint_ignores_line_numbers() {
        let a = vec![frame("app::orders", "submit", 10)];
        let b = vec![frame("app::orders", "submit", 99)];
        assert_eq!(fingerprint("E", &a), fingerprint("E", &b));
    }

    #[test]
    fn test_fingerprint_differs_on_type_and_frames() {
        let frames = vec![frame("app::orders", "submit", 10)];
        assert_ne!(fingerprint("E1", &frames), fingerprint("E2", &frames));

        let other = vec![frame("app::orders", "cancel", 10)];
        assert_ne!(fingerprint("E1", &frames), fingerprint("E1", &other));
    }

    #[test]
    fn test_fingerprint_only_top_three_frames_matter() {
        let mut a = vec![
            frame("m1", "f1", 1),
            frame("m2", "f2", 2),
            frame("m3", "f3", 3),
            frame("m4", "f4", 4),
        ];
        let fp = fingerprint("E", &a);
        a[3] = frame("different", "tail", 99);
        assert_eq!(fp, fingerprint("E", &a));
    }

    #[test]
    fn test_dedup_suppresses_repeats() {
        let set = FingerprintSet::new();
        assert!(set.insert("abc"));
        assert!(!set.insert("abc"));
        assert!(!set.insert("abc"));
    }

    #[test]
    fn test_dedup_amnesty_clears_entire_set() {
        let set = FingerprintSet::new();
        assert!(set.insert("target"));

        // Fill to capacity; the next distinct insert wipes the set first.
        for i in 0..DEDUP_SET_CAPACITY - 1 {
            assert!(set.insert(&format!("fp-{}", i)));
        }
        assert_eq!(set.len(), DEDUP_SET_CAPACITY);

        assert!(set.insert("overflow"));
        assert_eq!(set.len(), 1);

        // Previously seen fingerprints report again after the amnesty.
        assert!(set.insert("target"));
    }
}
