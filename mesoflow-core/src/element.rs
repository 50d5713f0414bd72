//! Element types that a channel can hold, and their fixed little-endian byte encoding.
//!
//! The set of element types is closed: every channel carries one [`ElementType`] tag
//! and the container stores it as the matching [`ChannelData`] variant. The byte
//! encoding is what independent processes agree on when they exchange packed
//! buffers, so it never depends on in-memory layout.

use bytes::{Buf, BufMut};
use glam::{DVec3, Quat, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::ChannelData;

/// Type tag of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Int,
    Int64,
    Float,
    Double,
    Float2,
    Float3,
    Float4,
    Quaternion,
    Stress,
    RigidMotion,
    ComExtent,
}

impl ElementType {
    /// Number of bytes one element occupies in a packed buffer.
    pub const fn size_bytes(self) -> usize {
        match self {
            ElementType::Int => 4,
            ElementType::Int64 => 8,
            ElementType::Float => 4,
            ElementType::Double => 8,
            ElementType::Float2 => 8,
            ElementType::Float3 => 12,
            ElementType::Float4 => 16,
            ElementType::Quaternion => 16,
            ElementType::Stress => 24,
            // r (3 x f64) + q (4 x f32) + vel, omega, force, torque (4 x 3 x f32)
            ElementType::RigidMotion => 24 + 16 + 48,
            ElementType::ComExtent => 36,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Int => "int",
            ElementType::Int64 => "int64",
            ElementType::Float => "float",
            ElementType::Double => "double",
            ElementType::Float2 => "float2",
            ElementType::Float3 => "float3",
            ElementType::Float4 => "float4",
            ElementType::Quaternion => "quaternion",
            ElementType::Stress => "stress",
            ElementType::RigidMotion => "rigid_motion",
            ElementType::ComExtent => "com_extent",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Symmetric stress tensor, one per particle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stress {
    pub xx: f32,
    pub xy: f32,
    pub xz: f32,
    pub yy: f32,
    pub yz: f32,
    pub zz: f32,
}

/// Rigid body state of one object. The center is kept in double precision.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RigidMotion {
    pub r: DVec3,
    pub q: Quat,
    pub vel: Vec3,
    pub omega: Vec3,
    pub force: Vec3,
    pub torque: Vec3,
}

/// Center of mass and axis-aligned bounding box of one object.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComExtent {
    pub com: Vec3,
    pub low: Vec3,
    pub high: Vec3,
}

/// A value type that can be stored in a channel and encoded into a packed buffer.
///
/// `put` must write exactly `TYPE.size_bytes()` bytes and `get` must consume
/// exactly as many.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const TYPE: ElementType;

    fn put<B: BufMut>(&self, out: &mut B);

    fn get<B: Buf>(input: &mut B) -> Self;

    /// Translate coordinate-like values by `shift`. Identity for everything else.
    fn shifted(self, _shift: Vec3) -> Self {
        self
    }

    /// Borrow the typed array inside `data`, if it holds this element type.
    fn view(data: &ChannelData) -> Option<&[Self]>;

    fn view_mut(data: &mut ChannelData) -> Option<&mut [Self]>;
}

// Typed views for one `ChannelData` variant.
macro_rules! views {
    ($variant:ident) => {
        fn view(data: &ChannelData) -> Option<&[Self]> {
            match data {
                ChannelData::$variant(values) => Some(values.as_slice()),
                _ => None,
            }
        }

        fn view_mut(data: &mut ChannelData) -> Option<&mut [Self]> {
            match data {
                ChannelData::$variant(values) => Some(values.as_mut_slice()),
                _ => None,
            }
        }
    };
}

macro_rules! scalar_element {
    ($ty:ty, $variant:ident, $put:ident, $get:ident) => {
        impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;

            fn put<B: BufMut>(&self, out: &mut B) {
                out.$put(*self);
            }

            fn get<B: Buf>(input: &mut B) -> Self {
                input.$get()
            }

            views!($variant);
        }
    };
}

scalar_element!(i32, Int, put_i32_le, get_i32_le);
scalar_element!(i64, Int64, put_i64_le, get_i64_le);
scalar_element!(f32, Float, put_f32_le, get_f32_le);
scalar_element!(f64, Double, put_f64_le, get_f64_le);

fn put_vec3<B: BufMut>(v: Vec3, out: &mut B) {
    out.put_f32_le(v.x);
    out.put_f32_le(v.y);
    out.put_f32_le(v.z);
}

fn get_vec3<B: Buf>(input: &mut B) -> Vec3 {
    let x = input.get_f32_le();
    let y = input.get_f32_le();
    let z = input.get_f32_le();
    Vec3::new(x, y, z)
}

impl Element for Vec2 {
    const TYPE: ElementType = ElementType::Float2;

    fn put<B: BufMut>(&self, out: &mut B) {
        out.put_f32_le(self.x);
        out.put_f32_le(self.y);
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        let x = input.get_f32_le();
        let y = input.get_f32_le();
        Vec2::new(x, y)
    }

    views!(Float2);
}

impl Element for Vec3 {
    const TYPE: ElementType = ElementType::Float3;

    fn put<B: BufMut>(&self, out: &mut B) {
        put_vec3(*self, out);
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        get_vec3(input)
    }

    fn shifted(self, shift: Vec3) -> Self {
        self + shift
    }

    views!(Float3);
}

impl Element for Vec4 {
    const TYPE: ElementType = ElementType::Float4;

    fn put<B: BufMut>(&self, out: &mut B) {
        for c in self.to_array() {
            out.put_f32_le(c);
        }
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        let x = input.get_f32_le();
        let y = input.get_f32_le();
        let z = input.get_f32_le();
        let w = input.get_f32_le();
        Vec4::new(x, y, z, w)
    }

    views!(Float4);
}

impl Element for Quat {
    const TYPE: ElementType = ElementType::Quaternion;

    fn put<B: BufMut>(&self, out: &mut B) {
        for c in self.to_array() {
            out.put_f32_le(c);
        }
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        let x = input.get_f32_le();
        let y = input.get_f32_le();
        let z = input.get_f32_le();
        let w = input.get_f32_le();
        Quat::from_xyzw(x, y, z, w)
    }

    views!(Quaternion);
}

impl Element for Stress {
    const TYPE: ElementType = ElementType::Stress;

    fn put<B: BufMut>(&self, out: &mut B) {
        for c in [self.xx, self.xy, self.xz, self.yy, self.yz, self.zz] {
            out.put_f32_le(c);
        }
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        Stress {
            xx: input.get_f32_le(),
            xy: input.get_f32_le(),
            xz: input.get_f32_le(),
            yy: input.get_f32_le(),
            yz: input.get_f32_le(),
            zz: input.get_f32_le(),
        }
    }

    views!(Stress);
}

impl Element for RigidMotion {
    const TYPE: ElementType = ElementType::RigidMotion;

    fn put<B: BufMut>(&self, out: &mut B) {
        out.put_f64_le(self.r.x);
        out.put_f64_le(self.r.y);
        out.put_f64_le(self.r.z);
        self.q.put(out);
        put_vec3(self.vel, out);
        put_vec3(self.omega, out);
        put_vec3(self.force, out);
        put_vec3(self.torque, out);
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        let x = input.get_f64_le();
        let y = input.get_f64_le();
        let z = input.get_f64_le();
        RigidMotion {
            r: DVec3::new(x, y, z),
            q: Quat::get(input),
            vel: get_vec3(input),
            omega: get_vec3(input),
            force: get_vec3(input),
            torque: get_vec3(input),
        }
    }

    fn shifted(mut self, shift: Vec3) -> Self {
        self.r += shift.as_dvec3();
        self
    }

    views!(RigidMotion);
}

impl Element for ComExtent {
    const TYPE: ElementType = ElementType::ComExtent;

    fn put<B: BufMut>(&self, out: &mut B) {
        put_vec3(self.com, out);
        put_vec3(self.low, out);
        put_vec3(self.high, out);
    }

    fn get<B: Buf>(input: &mut B) -> Self {
        ComExtent {
            com: get_vec3(input),
            low: get_vec3(input),
            high: get_vec3(input),
        }
    }

    fn shifted(self, shift: Vec3) -> Self {
        ComExtent {
            com: self.com + shift,
            low: self.low + shift,
            high: self.high + shift,
        }
    }

    views!(ComExtent);
}
