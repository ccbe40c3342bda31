//! Conditional capture points.
//!
//! Breakpoints here never suspend execution: a hit captures the current call
//! stack and ships it, subject to a per-point hit ceiling and a global
//! capture-rate ceiling so a hot-loop trigger cannot flood the pipeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sentinel_types::{BreakpointHitPayload, BreakpointSpec};
use tokio::time::Instant;

use crate::capture::stack;
use crate::connection::ConnectionManager;

/// Hit ceiling bounds; `set` clamps whatever the server asked for.
const MIN_HITS: u32 = 1;
const MAX_HITS: u32 = 50;

/// Global capture budget: at most this many hits per window across all
/// breakpoints.
const RATE_CAPACITY: u32 = 50;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Frames hidden from hit snapshots.
const OWN_FRAME_PREFIXES: &[&str] = &["sentinel_agent::breakpoints"];

/// A registered conditional capture point.
#[derive(Debug)]
pub struct Breakpoint {
    pub id: String,
    pub file_path: String,
    pub line_number: u32,
    /// Stored verbatim; evaluation is the call site's responsibility
    pub condition: Option<String>,
    pub max_hits: u32,
    pub created_at: DateTime<Utc>,
    hit_count: AtomicU32,
}

impl Breakpoint {
    pub fn hit_count(&self) -> u32 {
        self.hit_count.load(Ordering::SeqCst)
    }
}

/// Sliding one-second window over an integer counter.
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Global capture-rate ceiling shared by every breakpoint.
pub struct CaptureRateLimiter {
    capacity: u32,
    window: Duration,
    state: Mutex<RateWindow>,
}

impl CaptureRateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            state: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take one capture slot. The counter resets when the window elapses.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }
        if state.count < self.capacity {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

/// Holds remotely-registered breakpoints and produces hit snapshots.
pub struct BreakpointManager {
    connection: Arc<ConnectionManager>,
    breakpoints: DashMap<String, Breakpoint>,
    limiter: CaptureRateLimiter,
}

impl BreakpointManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            breakpoints: DashMap::new(),
            limiter: CaptureRateLimiter::new(RATE_CAPACITY, RATE_WINDOW),
        }
    }

    /// Register or replace a breakpoint (last-write-wins by id). The hit
    /// ceiling is clamped into `[1, 50]`; a missing ceiling means the maximum.
    pub fn set(&self, spec: BreakpointSpec) {
        let max_hits = spec.max_hits.unwrap_or(MAX_HITS).clamp(MIN_HITS, MAX_HITS);
        log::info!(
            "[BREAKPOINT] Set {} at {}:{} (max_hits {})",
            spec.id,
            spec.file_path,
            spec.line_number,
            max_hits
        );
        self.breakpoints.insert(
            spec.id.clone(),
            Breakpoint {
                id: spec.id,
                file_path: spec.file_path,
                line_number: spec.line_number,
                condition: spec.condition,
                max_hits,
                created_at: Utc::now(),
                hit_count: AtomicU32::new(0),
            },
        );
    }

    /// Remove a breakpoint. Unknown ids are a no-op.
    pub fn remove(&self, id: &str) {
        if self.breakpoints.remove(id).is_some() {
            log::info!("[BREAKPOINT] Removed {}", id);
        }
    }

    /// Drop every breakpoint (agent shutdown).
    pub fn clear(&self) {
        self.breakpoints.clear();
    }

    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// Stored condition for a breakpoint, for call sites that evaluate it.
    pub fn condition(&self, id: &str) -> Option<String> {
        self.breakpoints.get(id).and_then(|bp| bp.condition.clone())
    }

    /// Current hit count for a breakpoint.
    pub fn hit_count(&self, id: &str) -> Option<u32> {
        self.breakpoints.get(id).map(|bp| bp.hit_count())
    }

    /// Record a trigger. No-op when the id is unknown, the hit ceiling is
    /// reached, or the global rate limiter rejects the attempt; otherwise the
    /// current stack is captured and a `breakpoint_hit` payload enqueued.
    pub fn hit(&self, id: &str) {
        let Some(breakpoint) = self.breakpoints.get(id) else {
            return;
        };

        if breakpoint.hit_count() >= breakpoint.max_hits {
            return;
        }
        if !self.limiter.try_acquire() {
            log::debug!("[BREAKPOINT] Rate limiter rejected hit on {}", id);
            return;
        }

        // Atomic increment that never crosses the ceiling under races.
        let max_hits = breakpoint.max_hits;
        let Ok(previous) = breakpoint.hit_count.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |count| (count < max_hits).then_some(count + 1),
        ) else {
            return;
        };
        let hit_count = previous + 1;

        let payload = BreakpointHitPayload {
            breakpoint_id: breakpoint.id.clone(),
            captured_at: Utc::now().timestamp_millis(),
            file_path: breakpoint.file_path.clone(),
            line_number: breakpoint.line_number,
            stack_trace: stack::capture_frames(OWN_FRAME_PREFIXES),
            hit_count,
        };
        drop(breakpoint);

        match serde_json::to_value(&payload) {
            Ok(value) => self.connection.enqueue("breakpoint_hit", value),
            Err(e) => log::debug!("[BREAKPOINT] Failed to serialize hit for {}: {}", id, e),
        }
    }
}
