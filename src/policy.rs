//! Upstream selection policies.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;

use crate::error::ConfigError;

/// Orders the proxy pool for one query or push cycle.
#[derive(Debug)]
pub enum Policy {
    /// Uniform shuffle on every call.
    Random,
    /// Rotate the pool by one position per call.
    RoundRobin(AtomicUsize),
}

impl Default for Policy {
    fn default() -> Self {
        Policy::round_robin()
    }
}

impl Policy {
    pub fn round_robin() -> Self {
        Policy::RoundRobin(AtomicUsize::new(0))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Random => "random",
            Policy::RoundRobin(_) => "round_robin",
        }
    }

    /// Return a reordered copy of `items`.
    pub fn order<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let mut out = items.to_vec();
        if out.len() < 2 {
            return out;
        }
        match self {
            Policy::Random => out.shuffle(&mut rand::thread_rng()),
            Policy::RoundRobin(cursor) => {
                let start = cursor.fetch_add(1, Ordering::Relaxed) % out.len();
                out.rotate_left(start);
            }
        }
        out
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Policy::Random),
            "round_robin" => Ok(Policy::round_robin()),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}
