//! Event loop configuration.
//!
//! # Examples
//!
//! ```
//! use deferred::{EventLoop, EventLoopConfig, RejectionPolicy};
//!
//! let config = EventLoopConfig::default()
//!     .with_max_turns(10_000)
//!     .with_rejection_policy(RejectionPolicy::Ignore);
//! let event_loop = EventLoop::with_config(config).unwrap();
//! assert_eq!(event_loop.config().max_turns, Some(10_000));
//! ```

use serde::{Deserialize, Serialize};

use crate::Error;

/// What the event loop does with rejections still unhandled once idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Log each one through `tracing::warn!`.
    #[default]
    Warn,
    /// Only collect them for [`EventLoop::take_unhandled_rejections`].
    ///
    /// [`EventLoop::take_unhandled_rejections`]: crate::EventLoop::take_unhandled_rejections
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Most tasks a single drain may run. `None` means no limit.
    pub max_turns: Option<usize>,
    pub unhandled_rejections: RejectionPolicy,
    /// Most unhandled rejections kept once reported; the oldest go first.
    /// `None` keeps all of them until taken.
    pub max_retained_rejections: Option<usize>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: None,
            unhandled_rejections: RejectionPolicy::default(),
            max_retained_rejections: Some(1024),
        }
    }
}

impl EventLoopConfig {
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.unhandled_rejections = policy;
        self
    }

    pub fn with_max_retained_rejections(mut self, max: Option<usize>) -> Self {
        self.max_retained_rejections = max;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_turns == Some(0) {
            return Err(Error::InvalidConfig("max_turns must be at least 1"));
        }
        Ok(())
    }
}
