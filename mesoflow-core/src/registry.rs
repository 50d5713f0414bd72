use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::channel::{ChannelDescriptor, ChannelOptions};
use crate::element::ElementType;
use crate::error::ChannelError;
use crate::predicate::PackPredicate;
use crate::reserved::{self, ReservedField};

/// Kind of entity a collection stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Particles,
    Objects,
    Bisegments,
}

/// Name -> descriptor mapping of one entity collection.
///
/// Populated during setup and read-only afterwards. Channels are kept sorted by
/// name, so every listing is deterministic and independent of registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRegistry {
    collection: String,
    kind: EntityKind,
    channels: BTreeMap<String, ChannelDescriptor>,
}

impl ChannelRegistry {
    /// Create a registry holding the default reserved channels for `kind`.
    pub fn new(collection: impl Into<String>, kind: EntityKind) -> Self {
        let mut registry = Self {
            collection: collection.into(),
            kind,
            channels: BTreeMap::new(),
        };
        for field in reserved::defaults_for(kind).iter().filter_map(|name| reserved::lookup(name)) {
            registry.insert_reserved(field);
        }
        registry
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Register a user channel; exchanged across process boundaries, not shifted.
    pub fn register_channel(
        &mut self,
        name: &str,
        element_type: ElementType,
        persistent: bool,
    ) -> Result<&ChannelDescriptor, ChannelError> {
        self.register_channel_with(name, element_type, ChannelOptions::default().persistent(persistent))
    }

    pub fn register_channel_with(
        &mut self,
        name: &str,
        element_type: ElementType,
        options: ChannelOptions,
    ) -> Result<&ChannelDescriptor, ChannelError> {
        let reserved = reserved::is_reserved(name);
        if reserved || self.channels.contains_key(name) {
            return Err(ChannelError::DuplicateChannel {
                name: name.to_string(),
                collection: self.collection.clone(),
                reserved,
            });
        }

        debug!("registering channel '{}' ({}) in '{}'", name, element_type, self.collection);
        let descriptor = ChannelDescriptor {
            name: name.to_string(),
            element_type,
            per_entity: true,
            persistent: options.persistent,
            exchange: options.exchange,
            shift: options.shift,
        };
        Ok(self.channels.entry(name.to_string()).or_insert(descriptor))
    }

    /// Register a reserved channel with its canonical type and flags.
    ///
    /// Registering a reserved channel that is already present is a no-op.
    pub fn register_reserved(&mut self, name: &str) -> Result<&ChannelDescriptor, ChannelError> {
        let field = reserved::lookup(name).ok_or_else(|| ChannelError::NotReserved {
            name: name.to_string(),
        })?;
        if !field.applies_to(self.kind) {
            return Err(ChannelError::ReservedForOtherKind {
                name: name.to_string(),
                kind: self.kind,
            });
        }
        Ok(self.insert_reserved(field))
    }

    fn insert_reserved(&mut self, field: &ReservedField) -> &ChannelDescriptor {
        self.channels.entry(field.name.to_string()).or_insert_with(|| {
            ChannelDescriptor {
                name: field.name.to_string(),
                element_type: field.element_type,
                per_entity: true,
                persistent: field.persistent,
                exchange: field.exchange,
                shift: field.shift,
            }
        })
    }

    pub fn get(&self, name: &str) -> Result<&ChannelDescriptor, ChannelError> {
        self.channels.get(name).ok_or_else(|| ChannelError::UnknownChannel {
            name: name.to_string(),
            collection: self.collection.clone(),
        })
    }

    /// Channels selected by `predicate`, sorted by name.
    ///
    /// The returned iterator is lazy and can be cloned to restart the listing.
    pub fn list_channels<'a, P>(
        &'a self,
        predicate: &'a P,
    ) -> impl Iterator<Item = &'a ChannelDescriptor> + Clone + 'a
    where
        P: PackPredicate + ?Sized,
    {
        self.channels.values().filter(move |c| predicate.evaluate(c))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelDescriptor> {
        self.channels.values()
    }
}
