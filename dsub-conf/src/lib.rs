#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

use dsub_utils::deserialize_duration;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub subscription: Subscription,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl Settings {
    /// Layered load: system file, local file, `--config` file, then `DSUB__*` environment.
    pub fn new(opts: Options) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/dsub/dsub").required(false))
            .add_source(File::with_name("dsub").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("dsub").prefix_separator("__").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(task_timeout) = opts.task_timeout.as_ref() {
            inner.subscription.task_timeout = dsub_utils::to_duration(task_timeout);
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    /// Settings from an in-memory TOML document, without touching files or the environment.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let inner: Inner =
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)).build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("subscription.task_timeout is {:?}", self.subscription.task_timeout);
        log::info!("subscription.receive_maximum is {}", self.subscription.receive_maximum);
        log::info!("subscription.max_receive_maximum is {}", self.subscription.max_receive_maximum);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    //Deadline for subscribe, unsubscribe and wake waits.
    #[serde(default = "Subscription::task_timeout_default", deserialize_with = "deserialize_duration")]
    pub task_timeout: Duration,

    //Credit used when the subscriber does not announce one.
    #[serde(default = "Subscription::receive_maximum_default")]
    pub receive_maximum: u16,

    //Upper bound for requested credit.
    #[serde(default = "Subscription::max_receive_maximum_default")]
    pub max_receive_maximum: u16,

    //Appended to the session id to key a browser subscription.
    #[serde(default = "Subscription::browser_suffix_default")]
    pub browser_suffix: String,
}

impl Default for Subscription {
    #[inline]
    fn default() -> Self {
        Self {
            task_timeout: Self::task_timeout_default(),
            receive_maximum: Self::receive_maximum_default(),
            max_receive_maximum: Self::max_receive_maximum_default(),
            browser_suffix: Self::browser_suffix_default(),
        }
    }
}

impl Subscription {
    fn task_timeout_default() -> Duration {
        Duration::from_secs(60)
    }
    fn receive_maximum_default() -> u16 {
        1
    }
    fn max_receive_maximum_default() -> u16 {
        u16::MAX
    }
    fn browser_suffix_default() -> String {
        "$browse".into()
    }

    /// Clamp a requested credit into `1..=max_receive_maximum`, `0` meaning "not given".
    #[inline]
    pub fn receive_maximum(&self, requested: u16) -> u16 {
        if requested == 0 {
            self.receive_maximum.max(1)
        } else {
            requested.min(self.max_receive_maximum.max(1))
        }
    }
}
