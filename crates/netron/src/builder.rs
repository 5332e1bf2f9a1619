//! # Netron Builder
//!
//! Fluent API for configuring a runtime before it starts accepting contexts
//! and connections.

use std::sync::Arc;
use std::time::Duration;

use crate::identity::Identity;
use crate::identity::PeerInfo;
use crate::netron::Netron;
use crate::options::Options;
use crate::registry::IdAllocator;
use crate::registry::SequentialIds;

pub struct NetronBuilder {
    info: Option<PeerInfo>,
    options: Options,
    ids: Option<Arc<dyn IdAllocator>>,
}

impl NetronBuilder {
    pub fn new() -> Self {
        Self {
            info: None,
            options: Options::default(),
            ids: None,
        }
    }

    pub fn info(mut self, info: PeerInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn identity(self, id: Identity) -> Self {
        self.info(PeerInfo::new(id))
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.options.response_timeout = timeout;
        self
    }

    pub fn seed_property_defaults(mut self, seed: bool) -> Self {
        self.options.seed_property_defaults = seed;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity;
        self
    }

    /// Replaces the sequential definition id allocator.
    pub fn id_allocator(mut self, ids: Arc<dyn IdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Arc<Netron> {
        let info = self.info.unwrap_or_else(PeerInfo::random);
        let ids = self.ids.unwrap_or_else(|| Arc::new(SequentialIds::new()));
        Netron::from_parts(info, self.options, ids)
    }
}

impl Default for NetronBuilder {
    fn default() -> Self {
        Self::new()
    }
}
