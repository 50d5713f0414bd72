//! Moving packed entities between processes.
//!
//! A frame is a fixed-size header followed by the packed records. The header
//! only says how many entities follow and how many bytes they take; the
//! receiver checks that against its own layout and never learns the sender's.

use crossbeam_channel::{unbounded, Receiver, Sender};
use glam::Vec3;
use log::debug;
use mesoflow_core::{ChannelRegistry, DataContainer, PackPredicate};
use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, PackError};
use crate::packer::{retain_entities, Packer, UnpackTarget, Unpacker};

/// Point-to-point byte transport between the ranks of a group.
pub trait PeerLink: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, peer: usize, frame: Vec<u8>) -> Result<(), ExchangeError>;

    /// Block until the next frame from `peer` arrives.
    fn recv(&self, peer: usize) -> Result<Vec<u8>, ExchangeError>;
}

/// Fully connected in-process link; frames between any two ranks arrive in order.
pub struct MeshLink {
    rank: usize,
    outgoing: Vec<Sender<Vec<u8>>>,
    incoming: Vec<Receiver<Vec<u8>>>,
}

impl MeshLink {
    /// Links for every rank of a group of `size`, ordered by rank.
    pub fn mesh(size: usize) -> Vec<MeshLink> {
        let mut outgoing: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut incoming: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for from in 0..size {
            for to in 0..size {
                let (tx, rx) = unbounded();
                outgoing[from].push(tx);
                incoming[to].push(rx);
            }
        }

        outgoing
            .into_iter()
            .zip(incoming)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| MeshLink {
                rank,
                outgoing,
                incoming,
            })
            .collect()
    }

    fn peer_error(&self, peer: usize, reason: &str) -> ExchangeError {
        ExchangeError::Link {
            peer,
            reason: reason.to_string(),
        }
    }
}

impl PeerLink for MeshLink {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outgoing.len()
    }

    fn send(&self, peer: usize, frame: Vec<u8>) -> Result<(), ExchangeError> {
        self.outgoing
            .get(peer)
            .ok_or_else(|| self.peer_error(peer, "no such rank"))?
            .send(frame)
            .map_err(|_| self.peer_error(peer, "peer hung up"))
    }

    fn recv(&self, peer: usize) -> Result<Vec<u8>, ExchangeError> {
        self.incoming
            .get(peer)
            .ok_or_else(|| self.peer_error(peer, "no such rank"))?
            .recv()
            .map_err(|_| self.peer_error(peer, "peer hung up"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FrameHeader {
    count: u64,
    payload_bytes: u64,
}

/// Counts from one migration round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub sent: usize,
    pub received: usize,
}

/// Packs entities for peers and unpacks what peers send back, with a shared predicate.
pub struct Exchanger {
    packer: Packer,
    unpacker: Unpacker,
}

impl Exchanger {
    pub fn new<P: PackPredicate + Clone + 'static>(predicate: P) -> Self {
        Self {
            packer: Packer::new(predicate.clone()),
            unpacker: Unpacker::new(predicate),
        }
    }

    pub fn update(&mut self, registry: &ChannelRegistry) {
        self.packer.update(registry);
        self.unpacker.update(registry);
    }

    /// Send the entities at `indices` to `peer`, translated by `shift` if given.
    pub fn send_entities(
        &self,
        link: &dyn PeerLink,
        peer: usize,
        container: &DataContainer,
        indices: &[usize],
        shift: Option<Vec3>,
    ) -> Result<(), ExchangeError> {
        let payload_bytes = self.packer.size_bytes(indices.len());
        let header = FrameHeader {
            count: indices.len() as u64,
            payload_bytes: payload_bytes as u64,
        };
        let mut frame = bincode::serialize(&header)?;
        let offset = frame.len();
        frame.resize(offset + payload_bytes, 0);
        match shift {
            Some(shift) => self.packer.pack_shifted(container, indices, &mut frame, offset, shift)?,
            None => self.packer.pack(container, indices, &mut frame, offset)?,
        };
        link.send(peer, frame)
    }

    /// Receive one frame from `peer` into `container`. Returns the entity count.
    pub fn recv_entities(
        &self,
        link: &dyn PeerLink,
        peer: usize,
        container: &mut DataContainer,
        target: &UnpackTarget,
    ) -> Result<usize, ExchangeError> {
        let frame = link.recv(peer)?;
        let header: FrameHeader = bincode::deserialize(&frame)?;
        let offset = bincode::serialized_size(&header)? as usize;

        let count = header.count as usize;
        let needed = self.unpacker.size_bytes(count);
        let available = frame.len() - offset;
        if header.payload_bytes as usize != needed || available != needed {
            return Err(PackError::SizeMismatch { needed, available }.into());
        }
        self.unpacker.unpack(&frame, offset, count, container, target)?;
        Ok(count)
    }

    /// One all-to-all migration round.
    ///
    /// `owners[i]` is the rank that must own entity `i` afterwards; `shift_to(peer)`
    /// translates coordinates from this rank's frame into `peer`'s. Every rank
    /// sends one frame to every other rank, possibly empty, then receives one
    /// from each.
    pub fn migrate(
        &self,
        link: &dyn PeerLink,
        container: &mut DataContainer,
        owners: &[usize],
        shift_to: impl Fn(usize) -> Vec3,
    ) -> Result<MigrationStats, ExchangeError> {
        if owners.len() != container.len() {
            return Err(PackError::TargetCountMismatch {
                count: container.len(),
                targets: owners.len(),
            }
            .into());
        }

        let rank = link.rank();
        let mut stats = MigrationStats::default();
        for peer in (0..link.size()).filter(|&p| p != rank) {
            let leaving: Vec<usize> = (0..owners.len()).filter(|&i| owners[i] == peer).collect();
            self.send_entities(link, peer, container, &leaving, Some(shift_to(peer)))?;
            stats.sent += leaving.len();
        }

        if stats.sent > 0 {
            let keep: Vec<usize> = (0..owners.len()).filter(|&i| owners[i] == rank).collect();
            retain_entities(container, &keep)?;
        }
        for peer in (0..link.size()).filter(|&p| p != rank) {
            stats.received += self.recv_entities(link, peer, container, &UnpackTarget::Append)?;
        }

        if stats.sent + stats.received > 0 {
            debug!(
                "rank {} migration on '{}': {} out, {} in",
                rank,
                container.name(),
                stats.sent,
                stats.received
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesoflow_core::reserved::{GLOBAL_IDS, POSITIONS};
    use mesoflow_core::{EntityKind, ExchangeChannels};
    use std::thread;

    fn particles(ids: &[i64], x: f32) -> DataContainer {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.resize(ids.len());
        container.channel_mut::<i64>(GLOBAL_IDS).unwrap().copy_from_slice(ids);
        for p in container.channel_mut::<Vec3>(POSITIONS).unwrap() {
            *p = Vec3::new(x, 0.0, 0.0);
        }
        container
    }

    fn exchanger(container: &DataContainer) -> Exchanger {
        let mut exchanger = Exchanger::new(ExchangeChannels);
        exchanger.update(container.registry());
        exchanger
    }

    #[test]
    fn halo_refresh_overwrites_in_place() {
        let links = MeshLink::mesh(2);
        let sender = particles(&[10, 11, 12], 1.0);
        let mut receiver = particles(&[0, 0], 0.0);
        let exchanger = exchanger(&sender);

        exchanger.send_entities(&links[0], 1, &sender, &[2, 0], None).unwrap();
        let count = exchanger
            .recv_entities(&links[1], 0, &mut receiver, &UnpackTarget::Overwrite(vec![1, 0]))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(receiver.channel::<i64>(GLOBAL_IDS).unwrap(), &[10, 12]);
    }

    #[test]
    fn mismatched_layouts_fail_instead_of_corrupting() {
        let links = MeshLink::mesh(2);
        let mut sender = particles(&[1], 0.0);
        sender.register_channel("charge", mesoflow_core::ElementType::Float, false).unwrap();
        let mut receiver = particles(&[], 0.0);

        exchanger(&sender).send_entities(&links[0], 1, &sender, &[0], None).unwrap();
        let err = exchanger(&receiver)
            .recv_entities(&links[1], 0, &mut receiver, &UnpackTarget::Append)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Pack(PackError::SizeMismatch { .. })));
        assert!(receiver.is_empty());
    }

    #[test]
    fn migration_moves_entities_between_ranks() {
        let links = MeshLink::mesh(2);
        let handles: Vec<_> = links
            .into_iter()
            .map(|link| {
                thread::spawn(move || {
                    let rank = link.rank();
                    let base = 100 * rank as i64;
                    let mut container = particles(&[base, base + 1, base + 2], 5.0);
                    let exchanger = exchanger(&container);
                    // entity 1 of each rank moves to the other rank
                    let owners = [rank, 1 - rank, rank];
                    let stats = exchanger
                        .migrate(&link, &mut container, &owners, |_| Vec3::new(-5.0, 0.0, 0.0))
                        .unwrap();
                    (rank, stats, container)
                })
            })
            .collect();

        for handle in handles {
            let (rank, stats, container) = handle.join().unwrap();
            assert_eq!(stats, MigrationStats { sent: 1, received: 1 });
            let other = 100 * (1 - rank) as i64;
            let base = 100 * rank as i64;
            assert_eq!(container.channel::<i64>(GLOBAL_IDS).unwrap(), &[base, base + 2, other + 1]);
            let positions = container.channel::<Vec3>(POSITIONS).unwrap();
            assert_eq!(positions[0].x, 5.0);
            assert_eq!(positions[2].x, 0.0);
        }
    }

    #[test]
    fn unknown_peer_is_a_link_error() {
        let links = MeshLink::mesh(1);
        assert!(matches!(links[0].send(3, Vec::new()), Err(ExchangeError::Link { peer: 3, .. })));
    }
}
