//! Gather selected channels of selected entities into flat byte buffers and
//! scatter them back.
//!
//! A [`Packer`] and an [`Unpacker`] built with the same predicate over
//! registries holding the same channels agree byte for byte, without ever
//! exchanging a schema. Call `update` once per burst of operations, not per
//! entity: it re-evaluates the predicate over the registry.

use glam::Vec3;
use mesoflow_core::{AllChannels, ChannelData, ChannelRegistry, DataContainer, PackPredicate};
use rayon::prelude::*;

use crate::error::PackError;
use crate::layout::{LayoutEntry, PackLayout};

/// Where unpacked entities land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackTarget {
    /// Grow the container and fill the new slots (incoming migrants).
    Append,
    /// Overwrite existing entities, one index per unpacked entity (halo refresh).
    Overwrite(Vec<usize>),
}

pub struct Packer {
    predicate: Box<dyn PackPredicate>,
    layout: PackLayout,
}

impl Packer {
    pub fn new(predicate: impl PackPredicate + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            layout: PackLayout::default(),
        }
    }

    /// Recompute the active channels and stride from `registry`.
    pub fn update(&mut self, registry: &ChannelRegistry) {
        self.layout = PackLayout::new(registry, self.predicate.as_ref());
    }

    pub fn layout(&self) -> &PackLayout {
        &self.layout
    }

    /// Exact number of bytes `pack` writes for `entities` indices.
    pub fn size_bytes(&self, entities: usize) -> usize {
        self.layout.size_bytes(entities)
    }

    /// Copy the active channels of the entities at `indices` into `destination`,
    /// starting at `offset`. Entity order follows `indices`. Returns the number of
    /// bytes written, always `size_bytes(indices.len())`.
    ///
    /// # Panics
    ///
    /// Panics if `destination` has fewer than `offset + size_bytes(indices.len())` bytes.
    pub fn pack(
        &self,
        container: &DataContainer,
        indices: &[usize],
        destination: &mut [u8],
        offset: usize,
    ) -> Result<usize, PackError> {
        self.pack_impl(container, indices, destination, offset, None)
    }

    /// Like [`Packer::pack`], translating every coordinate channel by `shift`.
    pub fn pack_shifted(
        &self,
        container: &DataContainer,
        indices: &[usize],
        destination: &mut [u8],
        offset: usize,
        shift: Vec3,
    ) -> Result<usize, PackError> {
        self.pack_impl(container, indices, destination, offset, Some(shift))
    }

    fn pack_impl(
        &self,
        container: &DataContainer,
        indices: &[usize],
        destination: &mut [u8],
        offset: usize,
        shift: Option<Vec3>,
    ) -> Result<usize, PackError> {
        let needed = self.size_bytes(indices.len());
        assert!(
            destination.len() >= offset + needed,
            "pack destination holds {} bytes, {} needed at offset {}",
            destination.len(),
            needed,
            offset
        );

        let len = container.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(PackError::IndexOutOfBounds { index, len });
        }

        let columns = self.layout.columns(container)?;
        let stride = self.layout.stride();
        if stride == 0 {
            return Ok(0);
        }

        destination[offset..offset + needed]
            .par_chunks_mut(stride)
            .zip(indices.par_iter())
            .for_each(|(record, &index)| {
                for (entry, data) in &columns {
                    let shift = shift.filter(|_| entry.shift);
                    data.write_element(index, &mut record[entry.offset..], shift);
                }
            });
        Ok(needed)
    }
}

pub struct Unpacker {
    predicate: Box<dyn PackPredicate>,
    layout: PackLayout,
}

impl Unpacker {
    pub fn new(predicate: impl PackPredicate + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            layout: PackLayout::default(),
        }
    }

    pub fn update(&mut self, registry: &ChannelRegistry) {
        self.layout = PackLayout::new(registry, self.predicate.as_ref());
    }

    pub fn layout(&self) -> &PackLayout {
        &self.layout
    }

    pub fn size_bytes(&self, entities: usize) -> usize {
        self.layout.size_bytes(entities)
    }

    /// Rebuild `count` packed entities from `source[source_offset..]` into
    /// `container`. Returns the number of bytes consumed.
    ///
    /// Every check runs before the container is touched: on error it is unchanged.
    pub fn unpack(
        &self,
        source: &[u8],
        source_offset: usize,
        count: usize,
        container: &mut DataContainer,
        target: &UnpackTarget,
    ) -> Result<usize, PackError> {
        let needed = self.size_bytes(count);
        let available = source.len().saturating_sub(source_offset);
        if available < needed {
            return Err(PackError::SizeMismatch { needed, available });
        }

        let len = container.len();
        let slots: Vec<usize> = match target {
            UnpackTarget::Append => (len..len + count).collect(),
            UnpackTarget::Overwrite(indices) => {
                if indices.len() != count {
                    return Err(PackError::TargetCountMismatch {
                        count,
                        targets: indices.len(),
                    });
                }
                if let Some(&index) = indices.iter().find(|&&i| i >= len) {
                    return Err(PackError::IndexOutOfBounds { index, len });
                }
                indices.clone()
            }
        };
        self.layout.columns(container)?;

        if let UnpackTarget::Append = target {
            container.resize(len + count);
        }
        let stride = self.layout.stride();
        if stride == 0 || count == 0 {
            return Ok(0);
        }

        let records = &source[source_offset..source_offset + needed];
        let mut columns: Vec<(&LayoutEntry, &mut ChannelData)> = container
            .channels_mut()
            .filter_map(|(channel, data)| self.layout.entry(&channel.name).map(|entry| (entry, data)))
            .collect();
        columns.par_iter_mut().for_each(|(entry, data)| {
            for (record, &slot) in records.chunks_exact(stride).zip(&slots) {
                data.read_element(slot, &record[entry.offset..]);
            }
        });
        Ok(needed)
    }
}

/// Compact `container` to the entities at `keep`, in that order.
///
/// Only pack, unpack and resize are used, so every channel moves together.
pub fn retain_entities(container: &mut DataContainer, keep: &[usize]) -> Result<(), PackError> {
    let registry = container.registry().clone();
    let mut packer = Packer::new(AllChannels);
    let mut unpacker = Unpacker::new(AllChannels);
    packer.update(&registry);
    unpacker.update(&registry);

    let mut buffer = vec![0u8; packer.size_bytes(keep.len())];
    packer.pack(container, keep, &mut buffer, 0)?;
    let slots = (0..keep.len()).collect();
    unpacker.unpack(&buffer, 0, keep.len(), container, &UnpackTarget::Overwrite(slots))?;
    container.resize(keep.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesoflow_core::reserved::{FORCES, GLOBAL_IDS, POSITIONS, VELOCITIES};
    use mesoflow_core::{ElementType, EntityKind, ExchangeChannels, NamedChannels, PersistentChannels};

    fn filled(count: usize) -> DataContainer {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.register_channel("charge", ElementType::Double, true).unwrap();
        container.resize(count);
        for i in 0..count {
            let x = i as f32;
            container.channel_mut::<i64>(GLOBAL_IDS).unwrap()[i] = 1000 + i as i64;
            container.channel_mut::<Vec3>(POSITIONS).unwrap()[i] = Vec3::new(x, -x, 0.5 * x);
            container.channel_mut::<Vec3>(VELOCITIES).unwrap()[i] = Vec3::splat(x + 0.25);
            container.channel_mut::<Vec3>(FORCES).unwrap()[i] = Vec3::X * x;
            container.channel_mut::<f64>("charge").unwrap()[i] = -(i as f64);
        }
        container
    }

    fn pair<P: PackPredicate + Clone + 'static>(predicate: P, registry: &ChannelRegistry) -> (Packer, Unpacker) {
        let mut packer = Packer::new(predicate.clone());
        let mut unpacker = Unpacker::new(predicate);
        packer.update(registry);
        unpacker.update(registry);
        (packer, unpacker)
    }

    #[test]
    fn selected_entities_land_in_fresh_container() {
        let source = filled(100);
        let named = NamedChannels::new([GLOBAL_IDS, POSITIONS, VELOCITIES]);
        let (packer, unpacker) = pair(named, source.registry());

        let indices = [3, 7, 42];
        let mut buffer = vec![0u8; packer.size_bytes(indices.len())];
        packer.pack(&source, &indices, &mut buffer, 0).unwrap();

        let mut fresh = DataContainer::with_kind("pv", EntityKind::Particles);
        fresh.register_channel("charge", ElementType::Double, true).unwrap();
        fresh.resize(3);
        unpacker
            .unpack(&buffer, 0, 3, &mut fresh, &UnpackTarget::Overwrite(vec![0, 1, 2]))
            .unwrap();

        for (slot, &index) in indices.iter().enumerate() {
            for name in [POSITIONS, VELOCITIES] {
                assert_eq!(
                    fresh.channel::<Vec3>(name).unwrap()[slot],
                    source.channel::<Vec3>(name).unwrap()[index]
                );
            }
            assert_eq!(
                fresh.channel::<i64>(GLOBAL_IDS).unwrap()[slot],
                source.channel::<i64>(GLOBAL_IDS).unwrap()[index]
            );
            // not selected, stays default
            assert_eq!(fresh.channel::<f64>("charge").unwrap()[slot], 0.0);
        }
    }

    fn kinematics() -> DataContainer {
        let mut container = DataContainer::with_kind("beads", EntityKind::Objects);
        container.register_channel("positions", ElementType::Float3, true).unwrap();
        container.register_channel("velocities", ElementType::Float3, true).unwrap();
        container
    }

    #[test]
    fn all_channels_move_between_identical_registries() {
        let mut source = kinematics();
        source.resize(100);
        for i in 0..100 {
            let x = i as f32;
            source.channel_mut::<i64>(GLOBAL_IDS).unwrap()[i] = 7 * i as i64;
            source.channel_mut::<Vec3>("positions").unwrap()[i] = Vec3::new(x, 2.0 * x, -x);
            source.channel_mut::<Vec3>("velocities").unwrap()[i] = Vec3::splat(0.5 - x);
        }
        let (packer, unpacker) = pair(AllChannels, source.registry());

        let indices = [3, 7, 42];
        let mut buffer = vec![0u8; packer.size_bytes(indices.len())];
        packer.pack(&source, &indices, &mut buffer, 0).unwrap();

        let mut fresh = kinematics();
        assert_eq!(fresh.registry().len(), 3);
        unpacker.unpack(&buffer, 0, 3, &mut fresh, &UnpackTarget::Append).unwrap();

        assert_eq!(fresh.len(), 3);
        assert_eq!(fresh.channel::<i64>(GLOBAL_IDS).unwrap(), &[21, 49, 294]);
        for (slot, &index) in indices.iter().enumerate() {
            for name in ["positions", "velocities"] {
                assert_eq!(
                    fresh.channel::<Vec3>(name).unwrap()[slot],
                    source.channel::<Vec3>(name).unwrap()[index]
                );
            }
        }
    }

    #[test]
    fn pack_writes_exactly_size_bytes() {
        let source = filled(10);
        let (packer, _) = pair(PersistentChannels, source.registry());
        let indices = [9, 0, 4, 4];
        let needed = packer.size_bytes(indices.len());

        let sentinel = 0xAB;
        let mut buffer = vec![sentinel; 8 + needed + 8];
        let written = packer.pack(&source, &indices, &mut buffer, 8).unwrap();
        assert_eq!(written, needed);
        assert!(buffer[..8].iter().all(|&b| b == sentinel));
        assert!(buffer[8 + needed..].iter().all(|&b| b == sentinel));
    }

    #[test]
    fn append_grows_container_and_keeps_existing_entities() {
        let source = filled(5);
        let (packer, unpacker) = pair(ExchangeChannels, source.registry());
        let mut buffer = vec![0u8; packer.size_bytes(2)];
        packer.pack(&source, &[1, 3], &mut buffer, 0).unwrap();

        let mut target = filled(2);
        let consumed = unpacker.unpack(&buffer, 0, 2, &mut target, &UnpackTarget::Append).unwrap();
        assert_eq!(consumed, buffer.len());
        assert_eq!(target.len(), 4);
        assert_eq!(target.channel::<i64>(GLOBAL_IDS).unwrap(), &[1000, 1001, 1001, 1003]);
        // forces are not exchanged
        assert_eq!(target.channel::<Vec3>(FORCES).unwrap()[3], Vec3::ZERO);
        assert_eq!(target.channel::<f64>("charge").unwrap()[2], -1.0);
    }

    #[test]
    fn short_source_is_a_size_mismatch() {
        let source = filled(4);
        let (packer, unpacker) = pair(PersistentChannels, source.registry());
        let mut buffer = vec![0u8; packer.size_bytes(4)];
        packer.pack(&source, &[0, 1, 2, 3], &mut buffer, 0).unwrap();

        let mut target = filled(1);
        let err = unpacker
            .unpack(&buffer, 1, 4, &mut target, &UnpackTarget::Append)
            .unwrap_err();
        assert_eq!(
            err,
            PackError::SizeMismatch {
                needed: buffer.len(),
                available: buffer.len() - 1
            }
        );
        assert_eq!(target.len(), 1);
    }

    #[test]
    #[should_panic(expected = "pack destination")]
    fn undersized_destination_panics() {
        let source = filled(4);
        let (packer, _) = pair(PersistentChannels, source.registry());
        let mut buffer = vec![0u8; packer.size_bytes(2) - 1];
        let _ = packer.pack(&source, &[0, 1], &mut buffer, 0);
    }

    #[test]
    fn bad_indices_are_rejected() {
        let source = filled(4);
        let (packer, unpacker) = pair(PersistentChannels, source.registry());
        let mut buffer = vec![0u8; packer.size_bytes(1)];
        assert_eq!(
            packer.pack(&source, &[4], &mut buffer, 0),
            Err(PackError::IndexOutOfBounds { index: 4, len: 4 })
        );

        let mut target = filled(2);
        assert!(matches!(
            unpacker.unpack(&buffer, 0, 1, &mut target, &UnpackTarget::Overwrite(vec![0, 1])),
            Err(PackError::TargetCountMismatch { count: 1, targets: 2 })
        ));
        assert!(matches!(
            unpacker.unpack(&buffer, 0, 1, &mut target, &UnpackTarget::Overwrite(vec![2])),
            Err(PackError::IndexOutOfBounds { index: 2, len: 2 })
        ));
    }

    #[test]
    fn layout_from_other_collection_is_stale() {
        let source = filled(2);
        let (packer, _) = pair(PersistentChannels, source.registry());
        let plain = DataContainer::with_kind("pv", EntityKind::Particles);
        let mut buffer = vec![0u8; 0];
        assert!(matches!(
            packer.pack(&plain, &[], &mut buffer, 0),
            Err(PackError::StaleLayout { .. })
        ));
    }

    #[test]
    fn shift_applies_to_coordinates_only() {
        let source = filled(3);
        let (packer, unpacker) = pair(ExchangeChannels, source.registry());
        let mut buffer = vec![0u8; packer.size_bytes(1)];
        packer
            .pack_shifted(&source, &[2], &mut buffer, 0, Vec3::new(-10.0, 0.0, 0.0))
            .unwrap();

        let mut target = filled(0);
        unpacker.unpack(&buffer, 0, 1, &mut target, &UnpackTarget::Append).unwrap();
        assert_eq!(target.channel::<Vec3>(POSITIONS).unwrap()[0], Vec3::new(-8.0, -2.0, 1.0));
        assert_eq!(target.channel::<Vec3>(VELOCITIES).unwrap()[0], Vec3::splat(2.25));
    }

    #[test]
    fn retain_compacts_in_given_order() {
        let mut container = filled(6);
        retain_entities(&mut container, &[5, 1, 2]).unwrap();
        assert_eq!(container.len(), 3);
        assert_eq!(container.channel::<i64>(GLOBAL_IDS).unwrap(), &[1005, 1001, 1002]);
        assert_eq!(container.channel::<Vec3>(FORCES).unwrap()[0], Vec3::X * 5.0);
    }
}
