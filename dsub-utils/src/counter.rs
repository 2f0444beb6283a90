use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::json;

/// Current value plus the highest value it has reached.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    peak: AtomicIsize,
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter {
            current: AtomicIsize::new(self.count()),
            peak: AtomicIsize::new(self.max()),
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Serialize for Counter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("Counter", 2)?;
        s.serialize_field("count", &self.count())?;
        s.serialize_field("max", &self.max())?;
        s.end()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.current.fetch_add(c, Ordering::SeqCst);
        self.peak.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.current.fetch_sub(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn set(&self, c: isize) {
        self.current.store(c, Ordering::SeqCst);
        self.peak.fetch_max(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.peak.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}
