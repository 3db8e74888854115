//! C2 — Pool Manager: per-session connection pools plus the dedicated
//! registry used by shells.
//!
//! Grounded on `other_examples/900509d2` (`ConnectionPool`/`PooledConnection`
//! RAII-release guard over a bounded free-list) for the pool shape, and on
//! `other_examples/2c7db84c` (`sftp-pool.rs`) for the 30s liveness-skip
//! validation policy. The three-tier role split (dedicated/shared/transfer)
//! generalizes the teacher's single dedicated-shell connection
//! (`session/manager.rs`) to all three QoS tiers named in distilled §4.2.

mod manager;

pub use manager::PoolManager;

use std::time::Duration;

/// Acquisition role. Determines which pool (or the dedicated registry) an
/// acquire call draws from, and the acquire priority within that pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// PTY/shell traffic. Always the dedicated connection; never pooled.
    Terminal,
    /// One-shot `exec` commands. Priority 1 in the shared pool.
    Command,
    /// Bulk SFTP transfer workers. Priority 0 (highest) in the transfer pool.
    Transfer,
}

/// Tunable knobs for one (session, role) pool, per distilled §3/§4.2.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// `role=command`: min 2, max 8, idle 5 min.
    pub fn shared_default() -> Self {
        Self {
            min: 2,
            max: 8,
            idle_timeout: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(10),
        }
    }

    /// `role=transfer`: min 1, max 5, idle 10 min.
    pub fn transfer_default() -> Self {
        Self {
            min: 1,
            max: 5,
            idle_timeout: Duration::from_secs(10 * 60),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Acquisition priority; 0 is highest. Used to order the FIFO-within-band
/// wait queue (distilled §4.2: "ties broken LIFO").
pub fn priority_for(role: Role) -> u8 {
    match role {
        Role::Terminal => 0,
        Role::Transfer => 0,
        Role::Command => 1,
    }
}
