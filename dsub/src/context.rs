use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dsub_conf::{Options, Settings};

use crate::manager::{DestinationManager, SchemaRegistry};
use crate::stats::Stats;
use crate::Result;

/// Everything the engine shares, built once and passed to each controller.
#[derive(Clone)]
pub struct EngineContext {
    inner: Arc<EngineContextInner>,
}

pub struct EngineContextInner {
    pub settings: Settings,
    pub destinations: DestinationManager,
    pub schemas: Arc<SchemaRegistry>,
    pub stats: Arc<Stats>,
}

impl Deref for EngineContext {
    type Target = EngineContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineContext {{ destinations: {} }}", self.destinations.len())
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl EngineContext {
    pub fn new(settings: Settings) -> Self {
        let schemas = Arc::new(SchemaRegistry::default());
        let stats = Arc::new(Stats::new());
        EngineContext {
            inner: Arc::new(EngineContextInner {
                destinations: DestinationManager::new(schemas.clone(), stats.clone()),
                settings,
                schemas,
                stats,
            }),
        }
    }

    /// Load settings from files and environment, see [`Settings::new`].
    pub fn from_options(opts: Options) -> Result<Self> {
        let settings = Settings::new(opts)?;
        settings.logs();
        Ok(Self::new(settings))
    }

    #[inline]
    pub fn task_timeout(&self) -> Duration {
        self.settings.subscription.task_timeout
    }

    /// Credit for a subscriber that asked for `requested`, `0` meaning "server default".
    #[inline]
    pub fn credit(&self, requested: u16) -> usize {
        self.settings.subscription.receive_maximum(requested) as usize
    }
}
