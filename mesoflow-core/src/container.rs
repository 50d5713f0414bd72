use log::debug;
use std::collections::HashMap;

use crate::channel::{ChannelData, ChannelDescriptor, ChannelOptions};
use crate::element::{Element, ElementType};
use crate::error::ChannelError;
use crate::registry::{ChannelRegistry, EntityKind};

/// Per-channel arrays of one entity collection.
///
/// Every array has exactly `len()` elements. `resize` is the only structural
/// mutation and takes `&mut self`, so no reader can observe a partially resized
/// container.
#[derive(Debug, Clone)]
pub struct DataContainer {
    registry: ChannelRegistry,
    size: usize,
    arrays: HashMap<String, ChannelData>,
}

impl DataContainer {
    /// Create an empty container with one array per channel of `registry`.
    pub fn new(registry: ChannelRegistry) -> Self {
        let arrays = registry
            .iter()
            .map(|c| (c.name.clone(), ChannelData::new(c.element_type, 0)))
            .collect();
        Self {
            registry,
            size: 0,
            arrays,
        }
    }

    /// Shorthand for a fresh collection of `kind` holding the default reserved channels.
    pub fn with_kind(collection: impl Into<String>, kind: EntityKind) -> Self {
        Self::new(ChannelRegistry::new(collection, kind))
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn name(&self) -> &str {
        self.registry.collection()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn register_channel(
        &mut self,
        name: &str,
        element_type: ElementType,
        persistent: bool,
    ) -> Result<(), ChannelError> {
        self.register_channel_with(name, element_type, ChannelOptions::default().persistent(persistent))
    }

    pub fn register_channel_with(
        &mut self,
        name: &str,
        element_type: ElementType,
        options: ChannelOptions,
    ) -> Result<(), ChannelError> {
        self.registry.register_channel_with(name, element_type, options)?;
        self.arrays
            .insert(name.to_string(), ChannelData::new(element_type, self.size));
        Ok(())
    }

    pub fn register_reserved(&mut self, name: &str) -> Result<(), ChannelError> {
        let descriptor = self.registry.register_reserved(name)?;
        let (name, element_type) = (descriptor.name.clone(), descriptor.element_type);
        let size = self.size;
        self.arrays
            .entry(name)
            .or_insert_with(|| ChannelData::new(element_type, size));
        Ok(())
    }

    /// Resize every channel to `new_size`. New elements are default-initialized.
    pub fn resize(&mut self, new_size: usize) {
        if new_size == self.size {
            return;
        }
        // Grow all allocations first so the length change below cannot fail halfway.
        for data in self.arrays.values_mut() {
            data.reserve_total(new_size);
        }
        for data in self.arrays.values_mut() {
            data.resize(new_size);
        }
        debug!("resized '{}' from {} to {} entities", self.name(), self.size, new_size);
        self.size = new_size;
    }

    /// Typed read-only view of channel `name`.
    pub fn channel<T: Element>(&self, name: &str) -> Result<&[T], ChannelError> {
        let data = self.channel_data(name)?;
        data.as_slice::<T>().ok_or_else(|| ChannelError::TypeMismatch {
            name: name.to_string(),
            expected: T::TYPE,
            actual: data.element_type(),
        })
    }

    pub fn channel_mut<T: Element>(&mut self, name: &str) -> Result<&mut [T], ChannelError> {
        let data = self.channel_data_mut(name)?;
        let actual = data.element_type();
        data.as_mut_slice::<T>().ok_or_else(|| ChannelError::TypeMismatch {
            name: name.to_string(),
            expected: T::TYPE,
            actual,
        })
    }

    pub fn channel_data(&self, name: &str) -> Result<&ChannelData, ChannelError> {
        self.arrays.get(name).ok_or_else(|| self.unknown(name))
    }

    pub fn channel_data_mut(&mut self, name: &str) -> Result<&mut ChannelData, ChannelError> {
        let collection = self.registry.collection();
        self.arrays.get_mut(name).ok_or_else(|| ChannelError::UnknownChannel {
            name: name.to_string(),
            collection: collection.to_string(),
        })
    }

    /// Mutable access to several channels at once, with their descriptors.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = (&ChannelDescriptor, &mut ChannelData)> {
        let registry = &self.registry;
        self.arrays
            .iter_mut()
            .filter_map(move |(name, data)| registry.get(name).ok().map(|c| (c, data)))
    }

    fn unknown(&self, name: &str) -> ChannelError {
        ChannelError::UnknownChannel {
            name: name.to_string(),
            collection: self.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reserved::{GLOBAL_IDS, POSITIONS, VELOCITIES};
    use glam::Vec3;

    fn particles() -> DataContainer {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.register_channel("charge", ElementType::Float, true).unwrap();
        container
    }

    #[test]
    fn resize_keeps_all_channels_in_step() {
        let mut container = particles();
        container.resize(100);
        assert_eq!(container.len(), 100);
        for (_, data) in container.channels_mut() {
            assert_eq!(data.len(), 100);
        }

        container.channel_mut::<Vec3>(POSITIONS).unwrap()[99] = Vec3::ONE;
        container.resize(40);
        assert!(container.registry().iter().all(|c| container.channel_data(&c.name).unwrap().len() == 40));
    }

    #[test]
    fn grown_elements_are_default() {
        let mut container = particles();
        container.resize(2);
        container.channel_mut::<i64>(GLOBAL_IDS).unwrap().copy_from_slice(&[5, 6]);
        container.resize(4);
        assert_eq!(container.channel::<i64>(GLOBAL_IDS).unwrap(), &[5, 6, 0, 0]);
        assert_eq!(container.channel::<Vec3>(VELOCITIES).unwrap()[3], Vec3::ZERO);
    }

    #[test]
    fn channel_registered_late_matches_size() {
        let mut container = particles();
        container.resize(7);
        container.register_channel("tag", ElementType::Int, false).unwrap();
        assert_eq!(container.channel::<i32>("tag").unwrap().len(), 7);
    }

    #[test]
    fn lookups_report_unknown_and_mistyped_channels() {
        let container = particles();
        assert!(matches!(
            container.channel::<f32>("missing"),
            Err(ChannelError::UnknownChannel { .. })
        ));
        assert!(matches!(
            container.channel::<f64>("charge"),
            Err(ChannelError::TypeMismatch { expected: ElementType::Double, .. })
        ));
    }

    #[test]
    fn duplicate_registration_leaves_array_untouched() {
        let mut container = particles();
        container.resize(3);
        container.channel_mut::<f32>("charge").unwrap()[0] = 2.0;
        assert!(container.register_channel("charge", ElementType::Float, false).is_err());
        assert_eq!(container.channel::<f32>("charge").unwrap()[0], 2.0);
    }
}
