use log::debug;
use mesoflow_core::{ChannelData, ChannelRegistry, DataContainer, ElementType, PackPredicate};

use crate::error::PackError;

/// Position of one channel inside a packed entity record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub name: String,
    pub element_type: ElementType,
    /// Byte offset from the start of the record.
    pub offset: usize,
    pub shift: bool,
}

/// Byte layout of one packed entity: the selected channels in name order,
/// back to back. A buffer of `n` entities is `n` records of `stride` bytes.
///
/// Both ends of a transfer derive the layout from their own registry, so it
/// never travels with the data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackLayout {
    entries: Vec<LayoutEntry>,
    stride: usize,
}

impl PackLayout {
    pub fn new<P: PackPredicate + ?Sized>(registry: &ChannelRegistry, predicate: &P) -> Self {
        let mut stride = 0;
        let entries: Vec<LayoutEntry> = registry
            .list_channels(predicate)
            .map(|channel| {
                let entry = LayoutEntry {
                    name: channel.name.clone(),
                    element_type: channel.element_type,
                    offset: stride,
                    shift: channel.shift,
                };
                stride += channel.size_bytes();
                entry
            })
            .collect();

        debug!(
            "layout for '{}': {} channels, {} bytes per entity",
            registry.collection(),
            entries.len(),
            stride
        );
        Self { entries, stride }
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Bytes per packed entity.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size_bytes(&self, entities: usize) -> usize {
        entities * self.stride
    }

    /// Resolve every entry against `container`, in layout order.
    pub(crate) fn columns<'c>(
        &self,
        container: &'c DataContainer,
    ) -> Result<Vec<(&LayoutEntry, &'c ChannelData)>, PackError> {
        self.entries
            .iter()
            .map(|entry| match container.channel_data(&entry.name) {
                Ok(data) if data.element_type() == entry.element_type => Ok((entry, data)),
                _ => Err(self.stale(container, entry)),
            })
            .collect()
    }

    pub(crate) fn stale(&self, container: &DataContainer, entry: &LayoutEntry) -> PackError {
        PackError::StaleLayout {
            collection: container.name().to_string(),
            channel: entry.name.clone(),
        }
    }
}
