use std::collections::BTreeSet;

use crate::channel::ChannelDescriptor;

/// Decides whether a channel takes part in a pack operation.
///
/// Predicates only look at channel metadata, so two processes with the same
/// registry and the same predicate select the same channels.
pub trait PackPredicate: Send + Sync {
    fn evaluate(&self, channel: &ChannelDescriptor) -> bool;
}

impl<F> PackPredicate for F
where
    F: Fn(&ChannelDescriptor) -> bool + Send + Sync,
{
    fn evaluate(&self, channel: &ChannelDescriptor) -> bool {
        self(channel)
    }
}

/// Every registered channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllChannels;

impl PackPredicate for AllChannels {
    fn evaluate(&self, _channel: &ChannelDescriptor) -> bool {
        true
    }
}

/// Channels that must survive a checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentChannels;

impl PackPredicate for PersistentChannels {
    fn evaluate(&self, channel: &ChannelDescriptor) -> bool {
        channel.persistent
    }
}

/// Channels needed on the other side of a process boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeChannels;

impl PackPredicate for ExchangeChannels {
    fn evaluate(&self, channel: &ChannelDescriptor) -> bool {
        channel.exchange
    }
}

/// An explicit set of channel names.
#[derive(Debug, Clone, Default)]
pub struct NamedChannels(BTreeSet<String>);

impl NamedChannels {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }
}

impl PackPredicate for NamedChannels {
    fn evaluate(&self, channel: &ChannelDescriptor) -> bool {
        self.0.contains(&channel.name)
    }
}
