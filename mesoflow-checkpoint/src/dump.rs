//! Structured dumps: a small JSON descriptor next to dense binary payload shards.
//!
//! The descriptor names the collection, its topology (one shard per rank with
//! its entity count), the packed record size and every channel with its type
//! and offset inside a record. Payload shards are the raw output of the packer.

use log::{debug, error};
use mesoflow_core::fsutil::write_atomic;
use mesoflow_core::{AllChannels, DataContainer, ElementType, EntityKind, PackPredicate, ProcessGroup, SimState};
use mesoflow_transport::{PackError, PackLayout, Packer, UnpackTarget, Unpacker};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CheckpointError, Result};

pub const DUMP_FORMAT: &str = "mesoflow-dump";
pub const DUMP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub format: String,
    pub version: u32,
    pub collection: String,
    pub time: f64,
    pub step: i64,
    pub topology: Topology,
    pub record_bytes: usize,
    pub channels: Vec<ChannelRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub kind: EntityKind,
    pub total: u64,
    pub shards: Vec<Shard>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub rank: usize,
    pub file: String,
    pub entities: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub offset: usize,
}

impl Descriptor {
    /// Describe a dump of `collection` packed with `layout`, one shard per entry of
    /// `entities_per_rank`.
    pub fn new(
        stem: &str,
        container: &DataContainer,
        layout: &PackLayout,
        state: &SimState,
        entities_per_rank: &[u64],
    ) -> Self {
        let shards = entities_per_rank
            .iter()
            .enumerate()
            .map(|(rank, &entities)| Shard {
                rank,
                file: shard_file_name(stem, rank),
                entities,
            })
            .collect();

        Self {
            format: DUMP_FORMAT.to_string(),
            version: DUMP_VERSION,
            collection: container.name().to_string(),
            time: state.current_time,
            step: state.current_step,
            topology: Topology {
                kind: container.registry().kind(),
                total: entities_per_rank.iter().sum(),
                shards,
            },
            record_bytes: layout.stride(),
            channels: layout
                .entries()
                .iter()
                .map(|e| ChannelRecord {
                    name: e.name.clone(),
                    element_type: e.element_type,
                    offset: e.offset,
                })
                .collect(),
        }
    }

    /// Check that `layout`, computed from the reader's own registry, decodes
    /// records exactly as they were written.
    pub fn check_layout(&self, layout: &PackLayout) -> Result<()> {
        let mismatch = |detail: String| CheckpointError::LayoutMismatch {
            collection: self.collection.clone(),
            detail,
        };
        if layout.stride() != self.record_bytes {
            return Err(mismatch(format!(
                "record is {} bytes, dump has {}",
                layout.stride(),
                self.record_bytes
            )));
        }
        if layout.entries().len() != self.channels.len() {
            return Err(mismatch(format!(
                "{} channels selected, dump has {}",
                layout.entries().len(),
                self.channels.len()
            )));
        }
        for (entry, record) in layout.entries().iter().zip(&self.channels) {
            if entry.name != record.name || entry.element_type != record.element_type || entry.offset != record.offset {
                return Err(mismatch(format!(
                    "expected '{}' ({}) at offset {}, dump has '{}' ({}) at offset {}",
                    entry.name, entry.element_type, entry.offset, record.name, record.element_type, record.offset
                )));
            }
        }
        Ok(())
    }

    pub fn shard(&self, rank: usize) -> Option<&Shard> {
        self.topology.shards.iter().find(|s| s.rank == rank)
    }
}

pub fn descriptor_file_name(stem: &str) -> String {
    format!("{stem}.json")
}

pub fn shard_file_name(stem: &str, rank: usize) -> String {
    format!("{stem}.{rank:04}.bin")
}

pub fn write_descriptor(path: &Path, descriptor: &Descriptor) -> Result<()> {
    let text = serde_json::to_vec_pretty(descriptor).map_err(|source| CheckpointError::Descriptor {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &text).map_err(|e| CheckpointError::io(path, e))
}

/// Parse a descriptor. Payload contents are not checked here.
pub fn read_descriptor(path: &Path) -> Result<Descriptor> {
    let text = fs::read(path).map_err(|e| CheckpointError::io(path, e))?;
    let descriptor: Descriptor = serde_json::from_slice(&text).map_err(|source| CheckpointError::Descriptor {
        path: path.to_path_buf(),
        source,
    })?;
    if descriptor.format != DUMP_FORMAT || descriptor.version != DUMP_VERSION {
        return Err(CheckpointError::UnsupportedFormat {
            path: path.to_path_buf(),
            format: descriptor.format,
            version: descriptor.version,
        });
    }
    Ok(descriptor)
}

/// Collective dump of one collection into `folder`.
///
/// Every rank writes its own payload shard; the coordinator then writes the
/// shared descriptor, but only if every shard made it to disk. Every rank runs
/// the same collectives whatever happens locally, so a failure on one rank can
/// never leave the others waiting.
pub fn dump_collection<P: PackPredicate + 'static>(
    group: &dyn ProcessGroup,
    folder: &Path,
    stem: &str,
    container: &DataContainer,
    predicate: P,
    state: &SimState,
) -> Result<()> {
    let mut packer = Packer::new(predicate);
    packer.update(container.registry());

    let shard_path = folder.join(shard_file_name(stem, group.rank()));
    let local = write_shard(&packer, container, &shard_path);
    if let Err(e) = &local {
        error!("rank {} failed to write {:?}: {}", group.rank(), shard_path, e);
    }

    let entities = group.all_gather_u64(container.len() as u64);
    let failed = failed_ranks(group, local.is_ok());

    let mut descriptor_written = true;
    if group.is_coordinator() && failed.is_empty() {
        let descriptor = Descriptor::new(stem, container, packer.layout(), state, &entities);
        let path = folder.join(descriptor_file_name(stem));
        if let Err(e) = write_descriptor(&path, &descriptor) {
            error!("failed to write descriptor {:?}: {}", path, e);
            descriptor_written = false;
        }
    }
    let descriptor_failed = failed_ranks(group, descriptor_written);

    local?;
    if !failed.is_empty() || !descriptor_failed.is_empty() {
        let mut ranks = failed;
        ranks.extend(descriptor_failed);
        return Err(CheckpointError::IncompleteDump {
            stem: stem.to_string(),
            ranks,
        });
    }
    debug!("rank {} dumped {} entities of '{}'", group.rank(), container.len(), stem);
    Ok(())
}

fn write_shard(packer: &Packer, container: &DataContainer, path: &Path) -> Result<()> {
    let indices: Vec<usize> = (0..container.len()).collect();
    let mut payload = vec![0u8; packer.size_bytes(indices.len())];
    packer.pack(container, &indices, &mut payload, 0)?;
    write_atomic(path, &payload).map_err(|e| CheckpointError::io(path, e))
}

/// Replace the contents of `container` with this rank's shard of the dump
/// described by `<folder>/<stem>.json`, decoding with `predicate` over the
/// container's own registry. Channels outside the predicate are default-initialized.
pub fn load_collection<P: PackPredicate + 'static>(
    group: &dyn ProcessGroup,
    folder: &Path,
    stem: &str,
    container: &mut DataContainer,
    predicate: P,
) -> Result<Descriptor> {
    let descriptor = read_descriptor(&folder.join(descriptor_file_name(stem)))?;

    let mut unpacker = Unpacker::new(predicate);
    unpacker.update(container.registry());
    descriptor.check_layout(unpacker.layout())?;

    let found = descriptor.topology.shards.len();
    let shard = descriptor
        .shard(group.rank())
        .filter(|_| found == group.size())
        .ok_or_else(|| CheckpointError::ShardMismatch {
            collection: descriptor.collection.clone(),
            expected: group.size(),
            found,
        })?;

    let path = folder.join(&shard.file);
    let payload = fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
    let count = shard.entities as usize;
    let needed = unpacker.size_bytes(count);
    if payload.len() != needed {
        return Err(PackError::SizeMismatch {
            needed,
            available: payload.len(),
        }
        .into());
    }

    container.resize(0);
    unpacker.unpack(&payload, 0, count, container, &UnpackTarget::Append)?;
    debug!("rank {} loaded {} entities of '{}' from {:?}", group.rank(), count, stem, path);
    Ok(descriptor)
}

/// Ranks whose `ok` flag was false, as seen identically by every rank.
pub(crate) fn failed_ranks(group: &dyn ProcessGroup, ok: bool) -> Vec<usize> {
    group
        .all_gather_u64(u64::from(ok))
        .into_iter()
        .enumerate()
        .filter(|&(_, flag)| flag == 0)
        .map(|(rank, _)| rank)
        .collect()
}

/// Analysis export of every channel of `collections` for the current step into
/// `<folder>/<collection>-<step:08>.json` plus shards.
pub fn export_collections<'a>(
    group: &dyn ProcessGroup,
    folder: &Path,
    collections: impl IntoIterator<Item = &'a DataContainer>,
    state: &SimState,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(folder).map_err(|e| CheckpointError::io(folder, e))?;
    let mut descriptors = Vec::new();
    for container in collections {
        let stem = format!("{}-{:08}", container.name(), state.current_step);
        dump_collection(group, folder, &stem, container, AllChannels, state)?;
        descriptors.push(folder.join(descriptor_file_name(&stem)));
    }
    Ok(descriptors)
}
