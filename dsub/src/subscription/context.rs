use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;

use crate::message::Message;
use crate::selector::Selector;
use crate::topic::Filter;
use crate::types::{
    AckMode, ContextKey, DestinationMode, QoS, RetainHandling, SubscriptionIdentifier, TopicFilter,
};
use crate::{Error, Result};

const SHARE_PREFIX: &str = "$share/";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubscriptionFlags: u8 {
        /// Ignore messages published by the same session.
        const NO_LOCAL = 0b0000_0001;
        const RETAIN_AS_PUBLISHED = 0b0000_0010;
        const ALLOW_OVERLAP = 0b0000_0100;
        /// Non-consuming read of what the destination already holds.
        const BROWSER = 0b0000_1000;
        /// Hold delivery until the subscriber resumes it.
        const SYNC = 0b0001_0000;
    }
}

/// One subscribe request. Immutable once built; shared by every per-destination
/// subscription created from it.
#[derive(Clone)]
pub struct SubscriptionContext {
    raw: String,
    filter: TopicFilter,
    parsed: Filter,
    mode: DestinationMode,
    qos: QoS,
    retain_handling: RetainHandling,
    ack_mode: AckMode,
    selector: Option<Selector>,
    flags: SubscriptionFlags,
    subscription_id: Option<SubscriptionIdentifier>,
    receive_maximum: u16,
    share_name: Option<String>,
    replaced: bool,
}

impl fmt::Debug for SubscriptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({:?}, {:?}, {:?}, {:?}, rm:{})",
            self.raw, self.qos, self.retain_handling, self.ack_mode, self.flags, self.receive_maximum
        )
    }
}

impl SubscriptionContext {
    #[inline]
    pub fn builder<F: Into<String>>(filter: F) -> SubscriptionContextBuilder {
        SubscriptionContextBuilder::new(filter.into())
    }

    /// Key of this request inside its controller: the filter with its namespace.
    #[inline]
    pub fn key(&self) -> ContextKey {
        normalize_key(&self.raw)
    }

    /// The filter with any mode namespace removed.
    #[inline]
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    #[inline]
    pub fn raw_filter(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn mode(&self) -> DestinationMode {
        self.mode
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.parsed.has_wildcard()
    }

    #[inline]
    pub fn matches(&self, destination: &str) -> bool {
        self.parsed.matches(destination)
    }

    #[inline]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    #[inline]
    pub fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    #[inline]
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    #[inline]
    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    #[inline]
    pub fn flags(&self) -> SubscriptionFlags {
        self.flags
    }

    #[inline]
    pub fn no_local(&self) -> bool {
        self.flags.contains(SubscriptionFlags::NO_LOCAL)
    }

    /// Group name of a shared subscription, `$share/<name>/<filter>`.
    #[inline]
    pub fn share_name(&self) -> Option<&str> {
        self.share_name.as_deref()
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.share_name.is_some()
    }

    /// Whether this request drops some messages of a matching destination.
    #[inline]
    pub fn filters_messages(&self) -> bool {
        self.selector.is_some() || self.no_local()
    }

    /// This request's own verdict on `msg`, received by the session `session_id`.
    ///
    /// A selector that fails to evaluate counts as not matching.
    pub fn accepts(&self, msg: &Message, session_id: &str) -> Result<bool> {
        if self.no_local() && msg.session_id() == Some(session_id) {
            return Ok(false);
        }
        match self.selector.as_ref() {
            Some(selector) => selector.evaluate(msg),
            None => Ok(true),
        }
    }

    #[inline]
    pub fn is_browser(&self) -> bool {
        self.flags.contains(SubscriptionFlags::BROWSER)
    }

    #[inline]
    pub fn is_sync(&self) -> bool {
        self.flags.contains(SubscriptionFlags::SYNC)
    }

    #[inline]
    pub fn subscription_id(&self) -> Option<SubscriptionIdentifier> {
        self.subscription_id
    }

    /// Requested credit, `0` when the subscriber left it to the server.
    #[inline]
    pub fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    /// Set when this request replaced an earlier one with the same key.
    #[inline]
    pub fn is_replaced(&self) -> bool {
        self.replaced
    }

    #[inline]
    pub fn replaced(&self) -> Self {
        let mut ctx = self.clone();
        ctx.replaced = true;
        ctx
    }

    /// Whether a newly created subscription should be seeded with the retained message.
    #[inline]
    pub fn wants_retained_on_create(&self) -> bool {
        match self.retain_handling {
            RetainHandling::DoNotSend => false,
            RetainHandling::SendAlways => true,
            RetainHandling::SendIfNew => !self.replaced,
        }
    }
}

#[inline]
pub(crate) fn normalize_key(filter: &str) -> ContextKey {
    filter.replace("//", "/")
}

pub struct SubscriptionContextBuilder {
    filter: String,
    qos: QoS,
    retain_handling: RetainHandling,
    ack_mode: Option<AckMode>,
    selector: Option<String>,
    flags: SubscriptionFlags,
    subscription_id: Option<SubscriptionIdentifier>,
    receive_maximum: u16,
    share_name: Option<String>,
}

impl SubscriptionContextBuilder {
    fn new(filter: String) -> Self {
        Self {
            filter,
            qos: QoS::AtMostOnce,
            retain_handling: RetainHandling::SendAlways,
            ack_mode: None,
            selector: None,
            flags: SubscriptionFlags::empty(),
            subscription_id: None,
            receive_maximum: 0,
            share_name: None,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain_handling(mut self, retain_handling: RetainHandling) -> Self {
        self.retain_handling = retain_handling;
        self
    }

    /// Defaults to the mode implied by the QoS.
    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = Some(ack_mode);
        self
    }

    pub fn selector<S: Into<String>>(mut self, selector: S) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn flags(mut self, flags: SubscriptionFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn no_local(self, yes: bool) -> Self {
        self.flag(SubscriptionFlags::NO_LOCAL, yes)
    }

    pub fn browser(self, yes: bool) -> Self {
        self.flag(SubscriptionFlags::BROWSER, yes)
    }

    pub fn sync(self, yes: bool) -> Self {
        self.flag(SubscriptionFlags::SYNC, yes)
    }

    pub fn subscription_id(mut self, id: SubscriptionIdentifier) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.receive_maximum = receive_maximum;
        self
    }

    /// Same as a `$share/<name>/` prefix on the filter.
    pub fn share<S: Into<String>>(mut self, name: S) -> Self {
        self.share_name = Some(name.into());
        self
    }

    fn flag(mut self, flag: SubscriptionFlags, yes: bool) -> Self {
        self.flags.set(flag, yes);
        self
    }

    pub fn build(self) -> Result<SubscriptionContext> {
        let (mode, filter) = DestinationMode::parse(&self.filter);
        let (share_name, filter) = match filter.strip_prefix(SHARE_PREFIX) {
            Some(rest) => match rest.split_once('/') {
                Some((name, filter)) if !name.is_empty() => (Some(name.to_owned()), filter),
                _ => return Err(Error::msg(format!("bad shared subscription `{}`", self.filter))),
            },
            None => (self.share_name.clone().filter(|n| !n.is_empty()), filter),
        };
        if share_name.is_some()
            && (mode != DestinationMode::Normal
                || self.flags.intersects(SubscriptionFlags::NO_LOCAL | SubscriptionFlags::BROWSER))
        {
            return Err(Error::msg(format!("`{}` cannot be shared", self.filter)));
        }
        if filter.is_empty() {
            return Err(Error::msg(format!("empty subscription filter `{}`", self.filter)));
        }
        let parsed = Filter::from_str(filter).map_err(anyhow::Error::new)?;
        let selector = match self.selector.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Some(Selector::from_str(s)?),
            _ => None,
        };
        Ok(SubscriptionContext {
            filter: TopicFilter::from(filter),
            raw: self.filter.clone(),
            parsed,
            mode,
            qos: self.qos,
            retain_handling: self.retain_handling,
            ack_mode: self.ack_mode.unwrap_or_else(|| AckMode::from(self.qos)),
            selector,
            flags: self.flags,
            subscription_id: self.subscription_id,
            receive_maximum: self.receive_maximum,
            share_name,
            replaced: false,
        })
    }
}

/// Contexts attached to one per-destination subscription, deduplicated by key.
#[derive(Debug, Clone, Default)]
pub struct ContextList(Vec<Arc<SubscriptionContext>>);

impl ContextList {
    #[inline]
    pub fn new(ctx: Arc<SubscriptionContext>) -> Self {
        ContextList(vec![ctx])
    }

    /// A context with an existing key replaces the old one. Returns true if it was new.
    #[inline]
    pub fn add(&mut self, ctx: Arc<SubscriptionContext>) -> bool {
        let key = ctx.key();
        match self.0.iter_mut().find(|c| c.key() == key) {
            Some(c) => {
                *c = ctx;
                false
            }
            None => {
                self.0.push(ctx);
                true
            }
        }
    }

    #[inline]
    pub fn remove(&mut self, key: &str) -> bool {
        let len = self.0.len();
        self.0.retain(|c| c.key() != key);
        len != self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn first(&self) -> Option<&Arc<SubscriptionContext>> {
        self.0.first()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SubscriptionContext>> {
        self.0.iter()
    }

    #[inline]
    pub fn filters(&self) -> Vec<String> {
        self.0.iter().map(|c| c.raw_filter().to_owned()).collect()
    }

    #[inline]
    pub fn any<F: Fn(&SubscriptionContext) -> bool>(&self, f: F) -> bool {
        self.0.iter().any(|c| f(c))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0.clear()
    }
}
