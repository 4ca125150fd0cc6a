//! Wall-clock helpers for stats replies.

use std::time::{Duration, SystemTime};

/// Time elapsed since `start`, zero when the clock went backwards
pub fn elapsed_since(start: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(start)
        .unwrap_or(Duration::ZERO)
}
