use log::{debug, info, warn};
use mesoflow_checkpoint::{export_collections, CheckpointError, CheckpointManager};
use mesoflow_config::{CollectionConfig, Config, ExportSettings};
use mesoflow_core::glam::Vec3;
use mesoflow_core::reserved::MOTIONS;
use mesoflow_core::{
    ChannelError, ChannelOptions, DataContainer, EntityKind, ExchangeChannels, ProcessGroup, SimState, ThreadGroup,
};
use mesoflow_simulation::{
    coordinates, ForwardEuler, Integrator, PeriodicWrap, RandomForcing, SlabDecomposition, UniformInitialConditions,
};
use mesoflow_transport::{ExchangeError, Exchanger, MeshLink, SharedContainer, TransferError, TransferQueue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use thiserror::Error;

const INITIAL_VELOCITY_JITTER: f32 = 0.01;

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("ranks {0:?} failed")]
    PeerFailed(Vec<usize>),

    #[error("rank thread panicked")]
    Panicked,

    #[error("cannot spawn rank thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("rank {rank}: {source}")]
    Rank {
        rank: usize,
        #[source]
        source: Box<RunError>,
    },
}

/// Where a rank ended up.
#[derive(Debug, Clone)]
pub struct RankSummary {
    pub rank: usize,
    pub step: i64,
    pub time: f64,
    pub entities: Vec<(String, usize)>,
}

struct Stages {
    forcing: RandomForcing,
    euler: ForwardEuler,
    wrap: PeriodicWrap,
}

/// One in-process rank: its subdomain, its share of every collection and the
/// step loop driving them.
pub struct Rank {
    group: ThreadGroup,
    link: MeshLink,
    slabs: SlabDecomposition,
    state: SimState,
    collections: Vec<SharedContainer>,
    stages: Vec<Stages>,
    exchangers: Vec<Exchanger>,
    /// Transfers that must land before the collections are checkpointed.
    transfers: TransferQueue,
    checkpoints: CheckpointManager,
    export: Option<ExportSettings>,
    steps: i64,
}

impl Rank {
    /// Build the rank and bring it to its first step, either from fresh initial
    /// conditions or from the newest checkpoint under `restart`. Collective.
    pub fn start(
        config: &Config,
        seed: u64,
        group: ThreadGroup,
        link: MeshLink,
        restart: Option<&Path>,
    ) -> Result<Self, RunError> {
        let rank = group.rank();
        let origin = Vec3::from(config.domain.global_start);
        let slabs = SlabDecomposition::new(origin, Vec3::from(config.domain.global_size), config.ranks);
        let state = SimState::new(slabs.domain(rank), config.dt);
        let mut seeds = StdRng::seed_from_u64(seed.wrapping_add(rank as u64));

        let mut collections = Vec::with_capacity(config.collections.len());
        let mut stages = Vec::with_capacity(config.collections.len());
        let mut exchangers = Vec::with_capacity(config.collections.len());
        for collection in &config.collections {
            let container = build_container(collection)?;
            let mut exchanger = Exchanger::new(ExchangeChannels);
            exchanger.update(container.registry());
            stages.push(Stages {
                forcing: RandomForcing::new(config.forcing, seeds.gen()),
                euler: ForwardEuler::new(collection.mass),
                wrap: PeriodicWrap::new(origin),
            });
            exchangers.push(exchanger);
            collections.push(Arc::new(RwLock::new(container)));
        }
        let transfers = TransferQueue::new(&format!("rank-{rank}")).map_err(RunError::Spawn)?;

        let mut this = Self {
            group,
            link,
            slabs,
            state,
            collections,
            stages,
            exchangers,
            transfers,
            checkpoints: CheckpointManager::new(config.checkpoint.clone()),
            export: config.export.clone(),
            steps: config.steps as i64,
        };

        match restart {
            Some(root) => this.restart(root)?,
            None => {
                for (shared, collection) in this.collections.iter().zip(&config.collections) {
                    let (first, count) = share(collection.count, config.ranks, rank);
                    let mut container = write(shared)?;
                    UniformInitialConditions::new(seeds.gen(), INITIAL_VELOCITY_JITTER).generate(
                        &this.state,
                        &mut container,
                        count,
                        first as i64,
                    )?;
                }
                this.checkpoint()?;
            }
        }
        Ok(this)
    }

    fn restart(&mut self, root: &Path) -> Result<(), RunError> {
        let restored = self
            .checkpoints
            .restart(&self.group, root, &mut self.state, &self.collections, Some(&self.transfers))
            .map_err(RunError::from);
        // Shard loading is local, so ranks must agree before stepping together.
        let id = self.agree(restored)?;
        if self.group.is_coordinator() {
            info!("resuming from checkpoint {} at step {}", id, self.state.current_step);
        }
        Ok(())
    }

    /// Run until the configured step count or until `stop` is raised on any rank.
    pub fn run(mut self, stop: &AtomicBool) -> Result<RankSummary, RunError> {
        while self.state.current_step < self.steps {
            let stopping = self
                .group
                .all_gather_u64(u64::from(stop.load(Ordering::SeqCst)))
                .contains(&1);
            if stopping {
                self.interrupted();
                break;
            }

            self.step()?;
            self.checkpoint()?;
            self.export();
        }

        self.transfers.synchronize()?;
        let mut entities = Vec::with_capacity(self.collections.len());
        for shared in &self.collections {
            let container = shared.read().map_err(|_| TransferError::Poisoned("container"))?;
            entities.push((container.name().to_string(), container.len()));
        }
        Ok(RankSummary {
            rank: self.group.rank(),
            step: self.state.current_step,
            time: self.state.current_time,
            entities,
        })
    }

    fn step(&mut self) -> Result<(), RunError> {
        let rank = self.group.rank();
        let slabs = self.slabs;
        let lanes = self.collections.iter().zip(&mut self.stages).zip(&self.exchangers);
        for ((shared, stages), exchanger) in lanes {
            let mut container = write(shared)?;
            stages.forcing.stage(&self.state, &mut container)?;
            stages.euler.stage(&self.state, &mut container)?;
            stages.wrap.stage(&self.state, &mut container)?;

            let owners = slabs.owners(rank, &coordinates(&container)?);
            exchanger.migrate(&self.link, &mut container, &owners, |peer| slabs.shift(rank, peer))?;
        }
        self.state.advance();
        debug!("rank {} reached step {}", rank, self.state.current_step);
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), RunError> {
        if !self.checkpoints.needs_checkpoint(self.state.current_step) {
            return Ok(());
        }
        self.write_checkpoint()
    }

    fn write_checkpoint(&mut self) -> Result<(), RunError> {
        match self
            .checkpoints
            .checkpoint(&self.group, &self.state, &self.collections, Some(&self.transfers))
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("rank {}: continuing without this checkpoint: {}", self.group.rank(), e);
                Ok(())
            }
        }
    }

    fn interrupted(&mut self) {
        if self.group.is_coordinator() {
            info!("interrupted at step {}", self.state.current_step);
        }
        if self.checkpoints.policy().is_enabled() {
            if let Err(e) = self.write_checkpoint() {
                warn!("rank {}: final checkpoint failed: {}", self.group.rank(), e);
            }
        }
    }

    fn export(&self) {
        let Some(export) = &self.export else {
            return;
        };
        if self.state.current_step as u64 % export.every != 0 {
            return;
        }
        // Export is collective, so a poisoned collection is still written.
        let guards: Vec<_> = self
            .collections
            .iter()
            .map(|shared| shared.read().unwrap_or_else(PoisonError::into_inner))
            .collect();
        let containers = guards.iter().map(|guard| &**guard);
        match export_collections(&self.group, &export.folder, containers, &self.state) {
            Ok(paths) if self.group.is_coordinator() => {
                debug!("exported step {} to {:?}", self.state.current_step, paths)
            }
            Ok(_) => {}
            Err(e) => warn!("rank {}: export failed: {}", self.group.rank(), e),
        }
    }

    /// Fails on every rank if it failed on any.
    fn agree<T>(&self, result: Result<T, RunError>) -> Result<T, RunError> {
        let failed: Vec<usize> = self
            .group
            .all_gather_u64(u64::from(result.is_ok()))
            .into_iter()
            .enumerate()
            .filter(|&(_, ok)| ok == 0)
            .map(|(rank, _)| rank)
            .collect();
        match result {
            Ok(_) if !failed.is_empty() => Err(RunError::PeerFailed(failed)),
            other => other,
        }
    }
}

fn write(shared: &SharedContainer) -> Result<RwLockWriteGuard<'_, DataContainer>, TransferError> {
    shared.write().map_err(|_| TransferError::Poisoned("container"))
}

fn build_container(collection: &CollectionConfig) -> Result<DataContainer, ChannelError> {
    let mut container = DataContainer::with_kind(collection.name.clone(), collection.kind);

    let mut reserved: Vec<&str> = collection.reserved.iter().map(String::as_str).collect();
    if collection.kind == EntityKind::Objects {
        reserved.push(MOTIONS);
    }
    for name in reserved {
        if !container.registry().contains(name) {
            container.register_reserved(name)?;
        }
    }

    for channel in &collection.channels {
        let options = ChannelOptions::default()
            .persistent(channel.persistent)
            .exchange(channel.exchange);
        container.register_channel_with(&channel.name, channel.element_type, options)?;
    }
    Ok(container)
}

/// First global index and entity count `rank` starts with.
fn share(count: usize, ranks: usize, rank: usize) -> (usize, usize) {
    let base = count / ranks;
    let extra = count % ranks;
    (rank * base + rank.min(extra), base + usize::from(rank < extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesoflow_config::ChannelConfig;
    use mesoflow_core::reserved::{GLOBAL_IDS, POSITIONS};
    use mesoflow_core::ElementType;

    #[test]
    fn shares_cover_every_entity_once() {
        let shares: Vec<_> = (0..3).map(|rank| share(10, 3, rank)).collect();
        assert_eq!(shares, vec![(0, 4), (4, 3), (7, 3)]);
        assert_eq!(share(2, 4, 3), (2, 0));
    }

    #[test]
    fn objects_always_carry_motions() {
        let collection = CollectionConfig {
            name: "rigid".to_string(),
            kind: EntityKind::Objects,
            count: 2,
            mass: 1.0,
            reserved: vec![MOTIONS.to_string()],
            channels: vec![ChannelConfig {
                name: "tag".to_string(),
                element_type: ElementType::Int,
                persistent: true,
                exchange: false,
            }],
        };
        let container = build_container(&collection).unwrap();
        let registry = container.registry();
        assert!(registry.contains(MOTIONS));
        assert!(registry.contains(GLOBAL_IDS));
        assert!(!registry.contains(POSITIONS));
        let tag = registry.get("tag").unwrap();
        assert!(tag.persistent && !tag.exchange);
    }
}
