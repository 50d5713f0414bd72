use glam::Vec3;
use mesoflow_core::DomainInfo;

/// Splits the global box into equal slabs along x, one per rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlabDecomposition {
    origin: Vec3,
    global_size: Vec3,
    ranks: usize,
}

impl SlabDecomposition {
    pub fn new(origin: Vec3, global_size: Vec3, ranks: usize) -> Self {
        Self {
            origin,
            global_size,
            ranks: ranks.max(1),
        }
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    fn width(&self) -> f32 {
        self.global_size.x / self.ranks as f32
    }

    /// Subdomain geometry of `rank`.
    pub fn domain(&self, rank: usize) -> DomainInfo {
        let width = self.width();
        let start = self.origin + Vec3::new(width * rank as f32, 0.0, 0.0);
        let local = Vec3::new(width, self.global_size.y, self.global_size.z);
        DomainInfo::new(self.global_size, start, local)
    }

    /// Rank owning global point `x`. Points outside the box go to the nearest slab.
    pub fn owner(&self, x: Vec3) -> usize {
        let slab = ((x.x - self.origin.x) / self.width()).floor();
        if slab <= 0.0 {
            0
        } else {
            (slab as usize).min(self.ranks - 1)
        }
    }

    /// Translation taking a local coordinate of `from` into the local frame of `to`.
    pub fn shift(&self, from: usize, to: usize) -> Vec3 {
        self.domain(from).local_to_global(Vec3::ZERO) - self.domain(to).local_to_global(Vec3::ZERO)
    }

    /// Owning rank of each local-frame coordinate held by `rank`.
    pub fn owners(&self, rank: usize, local: &[Vec3]) -> Vec<usize> {
        let domain = self.domain(rank);
        local.iter().map(|&x| self.owner(domain.local_to_global(x))).collect()
    }
}
