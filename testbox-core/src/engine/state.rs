//! Environment Lifecycle State Machine
//!
//! ```text
//! Created ─► Activating ─► Active ─► Deactivating ─► Inactive ─► CleanupStart ─► Cleaning ─► CleanupComplete
//!    │                                                 │  ▲            ▲
//!    └──────────────────────── CleanupStart ◄──────────┘  └ Activating │
//!                                                                      │
//! (any non-terminal) ─► Error ─── forced cleanup ──────────────────────┘
//! ```
//!
//! `CleanupComplete` and `Error` are terminal; `Error` still accepts a forced
//! cleanup so stuck resources never block teardown.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Created,
    Activating,
    Active,
    Deactivating,
    Inactive,
    CleanupStart,
    Cleaning,
    CleanupComplete,
    Error,
}

impl EnvironmentStatus {
    pub const ALL: [EnvironmentStatus; 9] = [
        Self::Created,
        Self::Activating,
        Self::Active,
        Self::Deactivating,
        Self::Inactive,
        Self::CleanupStart,
        Self::Cleaning,
        Self::CleanupComplete,
        Self::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleanupComplete | Self::Error)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    ///
    /// `forced` unlocks the jump to `CleanupStart` from any state that has not
    /// already finished cleaning.
    pub fn can_transition_to(self, next: EnvironmentStatus, forced: bool) -> bool {
        use EnvironmentStatus::*;

        if next == Error {
            return !self.is_terminal();
        }
        if forced && next == CleanupStart {
            return self != CleanupComplete;
        }
        matches!(
            (self, next),
            (Created, Activating)
                | (Created, CleanupStart)
                | (Activating, Active)
                | (Active, Deactivating)
                | (Deactivating, Inactive)
                | (Inactive, Activating)
                | (Inactive, CleanupStart)
                | (CleanupStart, Cleaning)
                | (Cleaning, CleanupComplete)
        )
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Inactive => "inactive",
            Self::CleanupStart => "cleanup_start",
            Self::Cleaning => "cleaning",
            Self::CleanupComplete => "cleanup_complete",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}
