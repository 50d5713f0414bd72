use crossbeam_channel::{unbounded, Sender};
use log::{debug, warn};
use mesoflow_core::DataContainer;
use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::error::TransferError;
use crate::packer::{Packer, UnpackTarget, Unpacker};

pub type SharedContainer = Arc<RwLock<DataContainer>>;
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

type Job = Box<dyn FnOnce() -> Result<(), TransferError> + Send>;

enum Command {
    Run(Job),
    Sync(Sender<Option<TransferError>>),
}

/// In-order execution queue for pack and unpack work.
///
/// Jobs run on a dedicated worker thread in submission order. Program order on
/// the submitting side implies nothing about completion: [`TransferQueue::synchronize`]
/// is the only join point, and anything that reads results (a checkpoint, a
/// dependent unpack on another queue) must call it first.
pub struct TransferQueue {
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl TransferQueue {
    pub fn new(name: &str) -> io::Result<Self> {
        let (commands, inbox) = unbounded::<Command>();
        let worker = thread::Builder::new()
            .name(format!("transfer-{name}"))
            .spawn(move || {
                let mut first_error = None;
                for command in inbox {
                    match command {
                        Command::Run(job) => {
                            if let Err(e) = job() {
                                warn!("transfer job failed: {e}");
                                first_error.get_or_insert(e);
                            }
                        }
                        Command::Sync(reply) => {
                            let _ = reply.send(first_error.take());
                        }
                    }
                }
            })?;

        Ok(Self {
            commands: Some(commands),
            worker: Some(worker),
        })
    }

    /// Schedule an arbitrary job behind everything already queued.
    pub fn enqueue<F>(&self, job: F) -> Result<(), TransferError>
    where
        F: FnOnce() -> Result<(), TransferError> + Send + 'static,
    {
        self.commands
            .as_ref()
            .ok_or(TransferError::Disconnected)?
            .send(Command::Run(Box::new(job)))
            .map_err(|_| TransferError::Disconnected)
    }

    /// Schedule a pack of `indices` from `container` into `buffer` at `offset`.
    /// The buffer is grown if needed.
    pub fn enqueue_pack(
        &self,
        packer: Arc<Packer>,
        container: SharedContainer,
        indices: Vec<usize>,
        buffer: SharedBuffer,
        offset: usize,
    ) -> Result<(), TransferError> {
        self.enqueue(move || {
            // Buffer before container, as in unpack.
            let mut buffer = buffer.lock().map_err(|_| TransferError::Poisoned("buffer"))?;
            let container = container.read().map_err(|_| TransferError::Poisoned("container"))?;
            let end = offset + packer.size_bytes(indices.len());
            if buffer.len() < end {
                buffer.resize(end, 0);
            }
            packer.pack(&container, &indices, &mut buffer, offset)?;
            Ok(())
        })
    }

    /// Schedule an unpack of `count` entities from `buffer` at `offset` into `container`.
    ///
    /// Pack and unpack jobs both lock the buffer before the container, so
    /// queues sharing either may run concurrently.
    pub fn enqueue_unpack(
        &self,
        unpacker: Arc<Unpacker>,
        buffer: SharedBuffer,
        offset: usize,
        count: usize,
        container: SharedContainer,
        target: UnpackTarget,
    ) -> Result<(), TransferError> {
        self.enqueue(move || {
            let buffer = buffer.lock().map_err(|_| TransferError::Poisoned("buffer"))?;
            let mut container = container.write().map_err(|_| TransferError::Poisoned("container"))?;
            unpacker.unpack(&buffer, offset, count, &mut container, &target)?;
            Ok(())
        })
    }

    /// Wait for every queued job. Returns the first error raised since the
    /// previous synchronization.
    pub fn synchronize(&self) -> Result<(), TransferError> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.commands
            .as_ref()
            .ok_or(TransferError::Disconnected)?
            .send(Command::Sync(reply))
            .map_err(|_| TransferError::Disconnected)?;
        match response.recv() {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(e),
            Err(_) => Err(TransferError::Disconnected),
        }
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("transfer worker panicked");
            }
        }
        debug!("transfer queue shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PackError;
    use glam::Vec3;
    use mesoflow_core::reserved::{GLOBAL_IDS, POSITIONS};
    use mesoflow_core::{EntityKind, PersistentChannels};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shared(count: usize) -> SharedContainer {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.resize(count);
        for (i, id) in container.channel_mut::<i64>(GLOBAL_IDS).unwrap().iter_mut().enumerate() {
            *id = i as i64;
        }
        container.channel_mut::<Vec3>(POSITIONS).unwrap()[1] = Vec3::ONE;
        Arc::new(RwLock::new(container))
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = TransferQueue::new("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            queue
                .enqueue(move || {
                    seen.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        queue.synchronize().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn pack_then_unpack_through_queue() {
        let source = shared(4);
        let target = shared(0);
        let registry = source.read().unwrap().registry().clone();

        let mut packer = Packer::new(PersistentChannels);
        let mut unpacker = Unpacker::new(PersistentChannels);
        packer.update(&registry);
        unpacker.update(&registry);

        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let queue = TransferQueue::new("roundtrip").unwrap();
        queue
            .enqueue_pack(Arc::new(packer), Arc::clone(&source), vec![1, 3], Arc::clone(&buffer), 0)
            .unwrap();
        queue
            .enqueue_unpack(Arc::new(unpacker), buffer, 0, 2, Arc::clone(&target), UnpackTarget::Append)
            .unwrap();
        queue.synchronize().unwrap();

        let target = target.read().unwrap();
        assert_eq!(target.channel::<i64>(GLOBAL_IDS).unwrap(), &[1, 3]);
        assert_eq!(target.channel::<Vec3>(POSITIONS).unwrap()[0], Vec3::ONE);
    }

    #[test]
    fn synchronize_reports_first_error_once() {
        let queue = TransferQueue::new("errors").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        queue
            .enqueue(|| Err(PackError::SizeMismatch { needed: 8, available: 4 }.into()))
            .unwrap();
        queue.enqueue(|| Err(TransferError::Poisoned("buffer"))).unwrap();
        let counter = Arc::clone(&ran);
        queue
            .enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            queue.synchronize(),
            Err(TransferError::Pack(PackError::SizeMismatch { .. }))
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(queue.synchronize().is_ok());
    }

    #[test]
    fn queues_sharing_buffer_and_container_make_progress() {
        let container = shared(8);
        let registry = container.read().unwrap().registry().clone();
        let mut packer = Packer::new(PersistentChannels);
        let mut unpacker = Unpacker::new(PersistentChannels);
        packer.update(&registry);
        unpacker.update(&registry);
        let (packer, unpacker) = (Arc::new(packer), Arc::new(unpacker));

        let buffer: SharedBuffer = Arc::new(Mutex::new(vec![0; packer.size_bytes(8)]));
        let packing = TransferQueue::new("packing").unwrap();
        let unpacking = TransferQueue::new("unpacking").unwrap();
        packing
            .enqueue_pack(Arc::clone(&packer), Arc::clone(&container), (0..8).collect(), Arc::clone(&buffer), 0)
            .unwrap();
        packing.synchronize().unwrap();

        for _ in 0..200 {
            packing
                .enqueue_pack(Arc::clone(&packer), Arc::clone(&container), (0..8).collect(), Arc::clone(&buffer), 0)
                .unwrap();
            unpacking
                .enqueue_unpack(
                    Arc::clone(&unpacker),
                    Arc::clone(&buffer),
                    0,
                    8,
                    Arc::clone(&container),
                    UnpackTarget::Overwrite((0..8).collect()),
                )
                .unwrap();
        }
        packing.synchronize().unwrap();
        unpacking.synchronize().unwrap();

        let container = container.read().unwrap();
        assert_eq!(container.channel::<i64>(GLOBAL_IDS).unwrap(), &(0..8).collect::<Vec<i64>>()[..]);
        assert_eq!(container.channel::<Vec3>(POSITIONS).unwrap()[1], Vec3::ONE);
    }
}
