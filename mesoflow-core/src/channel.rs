use glam::{Quat, Vec2, Vec3, Vec4};

use crate::element::{ComExtent, Element, ElementType, RigidMotion, Stress};

/// Metadata of one registered channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelDescriptor {
    pub name: String,
    pub element_type: ElementType,
    /// Every channel held by a container stores one value per entity.
    pub per_entity: bool,
    /// Must survive a checkpoint/restart cycle.
    pub persistent: bool,
    /// Travels with an entity when it crosses a process boundary.
    pub exchange: bool,
    /// Holds coordinates that are translated when an entity changes frame.
    pub shift: bool,
}

impl ChannelDescriptor {
    pub fn size_bytes(&self) -> usize {
        self.element_type.size_bytes()
    }
}

/// Flags applied when registering a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub persistent: bool,
    pub exchange: bool,
    pub shift: bool,
}

impl ChannelOptions {
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn exchange(mut self, exchange: bool) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn shift(mut self, shift: bool) -> Self {
        self.shift = shift;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            exchange: true,
            shift: false,
        }
    }
}

/// Storage of one channel: a typed array, tagged by element type.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelData {
    Int(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Float2(Vec<Vec2>),
    Float3(Vec<Vec3>),
    Float4(Vec<Vec4>),
    Quaternion(Vec<Quat>),
    Stress(Vec<Stress>),
    RigidMotion(Vec<RigidMotion>),
    ComExtent(Vec<ComExtent>),
}

// Runs `$body` with `$values` bound to the inner vector, whatever its element type.
macro_rules! with_values {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            ChannelData::Int($values) => $body,
            ChannelData::Int64($values) => $body,
            ChannelData::Float($values) => $body,
            ChannelData::Double($values) => $body,
            ChannelData::Float2($values) => $body,
            ChannelData::Float3($values) => $body,
            ChannelData::Float4($values) => $body,
            ChannelData::Quaternion($values) => $body,
            ChannelData::Stress($values) => $body,
            ChannelData::RigidMotion($values) => $body,
            ChannelData::ComExtent($values) => $body,
        }
    };
}

impl ChannelData {
    /// Allocate `len` default-initialized elements of `element_type`.
    pub fn new(element_type: ElementType, len: usize) -> Self {
        match element_type {
            ElementType::Int => ChannelData::Int(vec![0; len]),
            ElementType::Int64 => ChannelData::Int64(vec![0; len]),
            ElementType::Float => ChannelData::Float(vec![0.0; len]),
            ElementType::Double => ChannelData::Double(vec![0.0; len]),
            ElementType::Float2 => ChannelData::Float2(vec![Vec2::default(); len]),
            ElementType::Float3 => ChannelData::Float3(vec![Vec3::default(); len]),
            ElementType::Float4 => ChannelData::Float4(vec![Vec4::default(); len]),
            ElementType::Quaternion => ChannelData::Quaternion(vec![Quat::default(); len]),
            ElementType::Stress => ChannelData::Stress(vec![Stress::default(); len]),
            ElementType::RigidMotion => ChannelData::RigidMotion(vec![RigidMotion::default(); len]),
            ElementType::ComExtent => ChannelData::ComExtent(vec![ComExtent::default(); len]),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            ChannelData::Int(_) => ElementType::Int,
            ChannelData::Int64(_) => ElementType::Int64,
            ChannelData::Float(_) => ElementType::Float,
            ChannelData::Double(_) => ElementType::Double,
            ChannelData::Float2(_) => ElementType::Float2,
            ChannelData::Float3(_) => ElementType::Float3,
            ChannelData::Float4(_) => ElementType::Float4,
            ChannelData::Quaternion(_) => ElementType::Quaternion,
            ChannelData::Stress(_) => ElementType::Stress,
            ChannelData::RigidMotion(_) => ElementType::RigidMotion,
            ChannelData::ComExtent(_) => ElementType::ComExtent,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn reserve_total(&mut self, len: usize) {
        with_values!(self, values => values.reserve(len.saturating_sub(values.len())))
    }

    /// Resize to `len`; new elements take the element type's default value.
    pub(crate) fn resize(&mut self, len: usize) {
        with_values!(self, values => values.resize(len, Default::default()))
    }

    /// Encode element `index` into the front of `out`, translating it by `shift` if given.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds or `out` is shorter than the element size.
    pub fn write_element(&self, index: usize, out: &mut [u8], shift: Option<Vec3>) {
        let mut out = out;
        with_values!(self, values => {
            let value = values[index];
            match shift {
                Some(shift) => value.shifted(shift).put(&mut out),
                None => value.put(&mut out),
            }
        })
    }

    /// Decode one element from the front of `input` into slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds or `input` is shorter than the element size.
    pub fn read_element(&mut self, index: usize, input: &[u8]) {
        let mut input = input;
        with_values!(self, values => values[index] = Element::get(&mut input))
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(self)
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::view_mut(self)
    }
}
