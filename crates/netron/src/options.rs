//! Runtime configuration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// How long a request to a remote peer waits for its reply.
    pub response_timeout: Duration,
    /// Whether a default supplied for an unset property is written back onto
    /// the instance, rather than only returned.
    pub seed_property_defaults: bool,
    /// Capacity of the broadcast channels carrying events.
    pub event_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(180),
            seed_property_defaults: false,
            event_capacity: 256,
        }
    }
}
