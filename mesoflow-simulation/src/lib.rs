//! Minimal physics to drive the data layer: explicit time stepping, periodic
//! boundaries, random forcing and initial conditions.
//!
//! Stages only read the global state; advancing time is the driver's job.

use glam::Vec3;
use log::debug;
use mesoflow_core::reserved::{FORCES, GLOBAL_IDS, MOTIONS, POSITIONS, VELOCITIES};
use mesoflow_core::{ChannelError, DataContainer, RigidMotion, SimState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub mod decomposition;

pub use decomposition::SlabDecomposition;

/// One stage of a simulation step over a collection.
pub trait Integrator: Send {
    fn stage(&mut self, state: &SimState, container: &mut DataContainer) -> Result<(), ChannelError>;
}

/// Explicit Euler step of particles (positions, velocities, forces) and rigid
/// objects (motions). Forces are consumed: they are zeroed after the step.
#[derive(Debug, Clone, Copy)]
pub struct ForwardEuler {
    pub mass: f32,
}

impl ForwardEuler {
    pub fn new(mass: f32) -> Self {
        Self { mass }
    }
}

impl Integrator for ForwardEuler {
    fn stage(&mut self, state: &SimState, container: &mut DataContainer) -> Result<(), ChannelError> {
        let dt = state.dt;
        let inv_mass = 1.0 / self.mass;

        if container.registry().contains(POSITIONS) {
            let forces = container.channel::<Vec3>(FORCES)?.to_vec();
            let velocities = container.channel_mut::<Vec3>(VELOCITIES)?;
            for (v, f) in velocities.iter_mut().zip(&forces) {
                *v += *f * inv_mass * dt;
            }
            let velocities = velocities.to_vec();
            for (x, v) in container.channel_mut::<Vec3>(POSITIONS)?.iter_mut().zip(&velocities) {
                *x += *v * dt;
            }
            container.channel_mut::<Vec3>(FORCES)?.fill(Vec3::ZERO);
        }

        if container.registry().contains(MOTIONS) {
            for motion in container.channel_mut::<RigidMotion>(MOTIONS)? {
                motion.vel += motion.force * inv_mass * dt;
                motion.r += (motion.vel * dt).as_dvec3();
                motion.force = Vec3::ZERO;
                motion.torque = Vec3::ZERO;
            }
        }
        Ok(())
    }
}

/// Random force kicks of bounded amplitude, reproducible from a seed.
#[derive(Debug, Clone)]
pub struct RandomForcing {
    amplitude: f32,
    rng: StdRng,
}

impl RandomForcing {
    pub fn new(amplitude: f32, seed: u64) -> Self {
        Self {
            amplitude,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn kick(&mut self) -> Vec3 {
        let a = self.amplitude;
        Vec3::new(
            self.rng.gen_range(-a..=a),
            self.rng.gen_range(-a..=a),
            self.rng.gen_range(-a..=a),
        )
    }
}

impl Integrator for RandomForcing {
    fn stage(&mut self, _state: &SimState, container: &mut DataContainer) -> Result<(), ChannelError> {
        if self.amplitude <= 0.0 {
            return Ok(());
        }
        if container.registry().contains(FORCES) {
            for f in container.channel_mut::<Vec3>(FORCES)? {
                *f += self.kick();
            }
        }
        if container.registry().contains(MOTIONS) {
            for motion in container.channel_mut::<RigidMotion>(MOTIONS)? {
                motion.force += self.kick();
            }
        }
        Ok(())
    }
}

/// Wraps coordinates back into the periodic global box.
///
/// Positions are stored in the local frame of the owning rank; a wrapped entity
/// may land in another rank's subdomain and must be migrated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicWrap {
    origin: Vec3,
}

impl PeriodicWrap {
    pub fn new(origin: Vec3) -> Self {
        Self { origin }
    }

    fn wrap(&self, global: Vec3, size: Vec3) -> Vec3 {
        let offset = global - self.origin;
        self.origin + Vec3::new(wrap_axis(offset.x, size.x), wrap_axis(offset.y, size.y), wrap_axis(offset.z, size.z))
    }
}

impl Integrator for PeriodicWrap {
    fn stage(&mut self, state: &SimState, container: &mut DataContainer) -> Result<(), ChannelError> {
        let domain = state.domain;
        let size = domain.global_size;

        if container.registry().contains(POSITIONS) {
            for x in container.channel_mut::<Vec3>(POSITIONS)? {
                *x = domain.global_to_local(self.wrap(domain.local_to_global(*x), size));
            }
        }
        if container.registry().contains(MOTIONS) {
            for motion in container.channel_mut::<RigidMotion>(MOTIONS)? {
                let global = domain.local_to_global(motion.r.as_vec3());
                let wrapped = domain.global_to_local(self.wrap(global, size));
                motion.r += (wrapped - motion.r.as_vec3()).as_dvec3();
            }
        }
        Ok(())
    }
}

// Into [0, size); rem_euclid can round up to `size` for tiny negative inputs.
fn wrap_axis(x: f32, size: f32) -> f32 {
    let r = x.rem_euclid(size);
    if r >= size {
        0.0
    } else {
        r
    }
}

/// Uniformly distributed entities in the local subdomain with small random
/// velocities and sequential global ids.
#[derive(Debug, Clone)]
pub struct UniformInitialConditions {
    pub velocity_jitter: f32,
    rng: StdRng,
}

impl UniformInitialConditions {
    pub fn new(seed: u64, velocity_jitter: f32) -> Self {
        Self {
            velocity_jitter,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fill `container` with `count` fresh entities, ids starting at `first_id`.
    pub fn generate(
        &mut self,
        state: &SimState,
        container: &mut DataContainer,
        count: usize,
        first_id: i64,
    ) -> Result<(), ChannelError> {
        container.resize(count);
        for (i, id) in container.channel_mut::<i64>(GLOBAL_IDS)?.iter_mut().enumerate() {
            *id = first_id + i as i64;
        }

        let half = 0.5 * state.domain.local_size;
        if container.registry().contains(POSITIONS) {
            let points: Vec<Vec3> = (0..count).map(|_| self.point(half)).collect();
            container.channel_mut::<Vec3>(POSITIONS)?.copy_from_slice(&points);
            let velocities: Vec<Vec3> = (0..count).map(|_| self.jitter()).collect();
            container.channel_mut::<Vec3>(VELOCITIES)?.copy_from_slice(&velocities);
        }
        if container.registry().contains(MOTIONS) {
            let motions: Vec<RigidMotion> = (0..count)
                .map(|_| RigidMotion {
                    r: self.point(half).as_dvec3(),
                    vel: self.jitter(),
                    ..RigidMotion::default()
                })
                .collect();
            container.channel_mut::<RigidMotion>(MOTIONS)?.copy_from_slice(&motions);
        }
        debug!("generated {} entities of '{}' from id {}", count, container.name(), first_id);
        Ok(())
    }

    // Local frame: the subdomain spans [-half, half).
    fn point(&mut self, half: Vec3) -> Vec3 {
        Vec3::new(
            self.rng.gen_range(-half.x..half.x),
            self.rng.gen_range(-half.y..half.y),
            self.rng.gen_range(-half.z..half.z),
        )
    }

    fn jitter(&mut self) -> Vec3 {
        let j = self.velocity_jitter;
        if j <= 0.0 {
            return Vec3::ZERO;
        }
        Vec3::new(self.rng.gen_range(-j..j), self.rng.gen_range(-j..j), self.rng.gen_range(-j..j))
    }
}

/// Local-frame coordinate of every entity: particle positions or object centres.
pub fn coordinates(container: &DataContainer) -> Result<Vec<Vec3>, ChannelError> {
    if container.registry().contains(POSITIONS) {
        return Ok(container.channel::<Vec3>(POSITIONS)?.to_vec());
    }
    if container.registry().contains(MOTIONS) {
        return Ok(container
            .channel::<RigidMotion>(MOTIONS)?
            .iter()
            .map(|m| m.r.as_vec3())
            .collect());
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesoflow_core::{DomainInfo, ElementType, EntityKind};

    fn state() -> SimState {
        SimState::new(DomainInfo::undivided(Vec3::splat(10.0)), 0.5)
    }

    #[test]
    fn euler_consumes_forces() {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.resize(1);
        container.channel_mut::<Vec3>(FORCES).unwrap()[0] = Vec3::new(2.0, 0.0, 0.0);
        container.channel_mut::<Vec3>(VELOCITIES).unwrap()[0] = Vec3::new(0.0, 1.0, 0.0);

        ForwardEuler::new(2.0).stage(&state(), &mut container).unwrap();
        assert_eq!(container.channel::<Vec3>(VELOCITIES).unwrap()[0], Vec3::new(0.5, 1.0, 0.0));
        assert_eq!(container.channel::<Vec3>(POSITIONS).unwrap()[0], Vec3::new(0.25, 0.5, 0.0));
        assert_eq!(container.channel::<Vec3>(FORCES).unwrap()[0], Vec3::ZERO);
    }

    #[test]
    fn euler_moves_rigid_objects() {
        let mut container = DataContainer::with_kind("rigid", EntityKind::Objects);
        container.register_reserved(MOTIONS).unwrap();
        container.resize(1);
        container.channel_mut::<RigidMotion>(MOTIONS).unwrap()[0].vel = Vec3::X;

        ForwardEuler::new(1.0).stage(&state(), &mut container).unwrap();
        assert_eq!(container.channel::<RigidMotion>(MOTIONS).unwrap()[0].r.x, 0.5);
    }

    #[test]
    fn wrap_keeps_positions_in_box() {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.resize(2);
        // local frame spans [-5, 5)
        container
            .channel_mut::<Vec3>(POSITIONS)
            .unwrap()
            .copy_from_slice(&[Vec3::new(6.0, -7.0, 0.0), Vec3::new(1.0, 2.0, 3.0)]);

        PeriodicWrap::new(Vec3::ZERO).stage(&state(), &mut container).unwrap();
        let positions = container.channel::<Vec3>(POSITIONS).unwrap();
        assert_eq!(positions[0], Vec3::new(-4.0, 3.0, 0.0));
        assert_eq!(positions[1], Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn initial_conditions_are_seeded_and_inside_subdomain() {
        let make = || {
            let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
            UniformInitialConditions::new(7, 0.1)
                .generate(&state(), &mut container, 50, 1000)
                .unwrap();
            container
        };
        let (a, b) = (make(), make());
        assert_eq!(a.channel::<Vec3>(POSITIONS).unwrap(), b.channel::<Vec3>(POSITIONS).unwrap());
        assert_eq!(a.channel::<i64>(GLOBAL_IDS).unwrap()[49], 1049);

        let domain = state().domain;
        assert!(a
            .channel::<Vec3>(POSITIONS)
            .unwrap()
            .iter()
            .all(|&x| domain.in_subdomain(domain.local_to_global(x))));
    }

    #[test]
    fn forcing_without_amplitude_is_a_no_op() {
        let mut container = DataContainer::with_kind("pv", EntityKind::Particles);
        container.register_channel("charge", ElementType::Float, false).unwrap();
        container.resize(3);
        RandomForcing::new(0.0, 1).stage(&state(), &mut container).unwrap();
        assert!(container.channel::<Vec3>(FORCES).unwrap().iter().all(|f| *f == Vec3::ZERO));

        RandomForcing::new(1.0, 1).stage(&state(), &mut container).unwrap();
        assert!(container.channel::<Vec3>(FORCES).unwrap().iter().all(|f| f.abs().max_element() <= 1.0));
    }
}
