//! Configuration for the scheduling coordinator.
//!
//! Provides the [`CoordinatorConfig`] struct shared by the negotiation engine,
//! the chat orchestrator, and the availability machinery. Users construct this
//! manually — no file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use meetmesh::CoordinatorConfig;
//!
//! // Use the defaults (human-paced streaming, 09:00–22:00 working hours)
//! let config = CoordinatorConfig::default();
//!
//! // Or switch the pacing off entirely, e.g. in tests
//! let config = CoordinatorConfig {
//!     step_delay: Duration::ZERO,
//!     short_delay: Duration::ZERO,
//!     ..CoordinatorConfig::default()
//! };
//! ```

use std::time::Duration;

/// Knobs shared across the coordinator components.
///
/// The two delay fields pace the streamed negotiation transcript so human
/// observers can follow it. The pacing is a product behavior, not an
/// implementation artifact: lowering it to zero keeps the per-message ordering
/// intact but removes the legible rhythm.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Pause after a decision message is streamed.
    pub step_delay: Duration,
    /// Pause after an intermediate ("checking…") message and between rounds.
    pub short_delay: Duration,
    /// Timeout applied to LLM HTTP calls.
    pub llm_timeout: Duration,
    /// Timeout applied to calendar HTTP calls.
    pub calendar_timeout: Duration,
    /// First hour of the day considered schedulable (inclusive).
    pub work_start_hour: u32,
    /// Last hour of the day considered schedulable (exclusive).
    pub work_end_hour: u32,
    /// How far ahead an agent looks when it loads its owner's calendar.
    pub planning_horizon_days: i64,
    /// Window used by recommendation mode when the request names no dates.
    pub recommendation_window_days: i64,
    /// Hard cap on negotiation rounds before escalating to a human.
    pub max_rounds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            short_delay: Duration::from_millis(300),
            llm_timeout: Duration::from_secs(20),
            calendar_timeout: Duration::from_secs(20),
            work_start_hour: 9,
            work_end_hour: 22,
            planning_horizon_days: 365,
            recommendation_window_days: 14,
            max_rounds: 5,
        }
    }
}
