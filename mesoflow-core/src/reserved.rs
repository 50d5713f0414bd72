//! Reserved channel names for well-known quantities.
//!
//! The table is built once per process and never changes afterwards. Registries
//! consult it when a channel is registered: user channels may not take a reserved
//! name, and reserved channels always get their canonical type and flags.
//! Names starting with `__` are internal.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;

use crate::element::ElementType;
use crate::registry::EntityKind;

// per entity fields (particles or objects)
pub const GLOBAL_IDS: &str = "ids";

// per particle fields
pub const POSITIONS: &str = "__positions";
pub const VELOCITIES: &str = "__velocities";
pub const FORCES: &str = "__forces";
pub const STRESSES: &str = "stresses";
pub const DENSITIES: &str = "densities";
pub const OLD_POSITIONS: &str = "old_positions";

// per object fields
pub const MOTIONS: &str = "motions";
pub const OLD_MOTIONS: &str = "old_motions";
pub const COM_EXTENTS: &str = "com_extents";
pub const AREA_VOLUMES: &str = "area_volumes";
pub const MEMBRANE_TYPE_ID: &str = "membrane_type_id";
pub const AREAS: &str = "areas";
pub const MEAN_CURVATURES: &str = "meanCurvatures";
pub const LEN_THETA_TOT: &str = "lenThetaTot";

// per bisegment fields
pub const POLY_STATES: &str = "states";
pub const ENERGIES: &str = "energies";
pub const ROD_KAPPA: &str = "biseg_kappa";
pub const ROD_TAU_L: &str = "biseg_tau_l";

/// Canonical definition of a reserved channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedField {
    pub name: &'static str,
    pub element_type: ElementType,
    pub kinds: &'static [EntityKind],
    pub persistent: bool,
    pub exchange: bool,
    pub shift: bool,
}

impl ReservedField {
    pub fn applies_to(&self, kind: EntityKind) -> bool {
        self.kinds.contains(&kind)
    }
}

const PARTICLES: &[EntityKind] = &[EntityKind::Particles];
const OBJECTS: &[EntityKind] = &[EntityKind::Objects];
const BISEGMENTS: &[EntityKind] = &[EntityKind::Bisegments];
const ENTITIES: &[EntityKind] = &[EntityKind::Particles, EntityKind::Objects];

const fn field(
    name: &'static str,
    element_type: ElementType,
    kinds: &'static [EntityKind],
    persistent: bool,
    exchange: bool,
    shift: bool,
) -> ReservedField {
    ReservedField { name, element_type, kinds, persistent, exchange, shift }
}

static RESERVED: Lazy<BTreeMap<&'static str, ReservedField>> = Lazy::new(|| {
    use ElementType::*;
    [
        field(GLOBAL_IDS, Int64, ENTITIES, true, true, false),
        field(POSITIONS, Float3, PARTICLES, true, true, true),
        field(VELOCITIES, Float3, PARTICLES, true, true, false),
        field(FORCES, Float3, PARTICLES, false, false, false),
        field(STRESSES, Stress, PARTICLES, false, false, false),
        field(DENSITIES, Float, PARTICLES, false, false, false),
        field(OLD_POSITIONS, Float3, PARTICLES, true, true, true),
        field(MOTIONS, RigidMotion, OBJECTS, true, true, true),
        field(OLD_MOTIONS, RigidMotion, OBJECTS, true, true, true),
        field(COM_EXTENTS, ComExtent, OBJECTS, false, true, true),
        field(AREA_VOLUMES, Float2, OBJECTS, false, false, false),
        field(MEMBRANE_TYPE_ID, Int, OBJECTS, true, true, false),
        field(AREAS, Float, OBJECTS, false, false, false),
        field(MEAN_CURVATURES, Float, OBJECTS, false, false, false),
        field(LEN_THETA_TOT, Float, OBJECTS, false, false, false),
        field(POLY_STATES, Int, BISEGMENTS, true, true, false),
        field(ENERGIES, Float, BISEGMENTS, false, false, false),
        field(ROD_KAPPA, Float4, BISEGMENTS, false, false, false),
        field(ROD_TAU_L, Float2, BISEGMENTS, false, false, false),
    ]
    .into_iter()
    .map(|f| (f.name, f))
    .collect()
});

pub fn lookup(name: &str) -> Option<&'static ReservedField> {
    RESERVED.get(name)
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains_key(name)
}

/// All reserved fields, sorted by name.
pub fn fields() -> impl Iterator<Item = &'static ReservedField> {
    RESERVED.values()
}

/// Reserved channels every collection of `kind` is created with.
pub fn defaults_for(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Particles => &[GLOBAL_IDS, POSITIONS, VELOCITIES, FORCES],
        EntityKind::Objects => &[GLOBAL_IDS],
        EntityKind::Bisegments => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_knows_well_known_quantities() {
        let positions = lookup(POSITIONS).unwrap();
        assert_eq!(positions.element_type, ElementType::Float3);
        assert!(positions.shift);
        assert!(positions.applies_to(EntityKind::Particles));
        assert!(!positions.applies_to(EntityKind::Objects));

        assert!(lookup(GLOBAL_IDS).unwrap().applies_to(EntityKind::Objects));
        assert!(!is_reserved("charge"));
    }

    #[test]
    fn defaults_are_reserved_for_their_kind() {
        for kind in [EntityKind::Particles, EntityKind::Objects, EntityKind::Bisegments] {
            for name in defaults_for(kind) {
                assert!(lookup(name).unwrap().applies_to(kind), "{name} for {kind:?}");
            }
        }
    }
}
