//! Entity class descriptors and the opaque per-field codec
//!
//! A class describes how many flattened properties an entity has and how a
//! single property value turns into bytes. The rest of the crate never looks
//! inside a field: it only compares, copies and re-emits the bytes produced
//! by `FieldCodec`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::entity::MAX_PROPERTIES;

/// Index of a registered class
pub type ClassId = u16;

/// Flattened property index within a class
pub type PropIndex = u16;

/// A single networked property value as supplied by the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Vector([f32; 3]),
    Text(String),
    Bytes(Vec<u8>),
}

impl Default for PropertyValue {
    fn default() -> Self {
        PropertyValue::Int(0)
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode property {prop}: {reason}")]
    Encode { prop: PropIndex, reason: String },
    #[error("failed to decode property {prop}: {reason}")]
    Decode { prop: PropIndex, reason: String },
    #[error("class {class} expects {expected} properties, got {actual}")]
    PropertyCount {
        class: ClassId,
        expected: usize,
        actual: usize,
    },
    #[error("class {0} exceeds the flattened property limit")]
    TooManyProperties(ClassId),
    #[error("unknown class {0}")]
    UnknownClass(ClassId),
    #[error("class id {0} registered twice")]
    DuplicateClass(ClassId),
    #[error("baseline update: {0}")]
    Baseline(String),
}

/// Encode/decode one field. The bit-level format of a value is owned by the codec.
pub trait FieldCodec: Send + Sync + fmt::Debug {
    fn encode_field(
        &self,
        prop: PropIndex,
        value: &PropertyValue,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError>;

    fn decode_field(&self, prop: PropIndex, bytes: &[u8]) -> Result<PropertyValue, CodecError>;
}

/// Default codec: bincode's compact varint encoding of `PropertyValue`
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeFieldCodec;

impl FieldCodec for BincodeFieldCodec {
    fn encode_field(
        &self,
        prop: PropIndex,
        value: &PropertyValue,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| CodecError::Encode {
                prop,
                reason: e.to_string(),
            })?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn decode_field(&self, prop: PropIndex, bytes: &[u8]) -> Result<PropertyValue, CodecError> {
        let (value, read) = bincode::serde::decode_from_slice::<PropertyValue, _>(
            bytes,
            bincode::config::standard(),
        )
        .map_err(|e| CodecError::Decode {
            prop,
            reason: e.to_string(),
        })?;
        if read != bytes.len() {
            return Err(CodecError::Decode {
                prop,
                reason: format!("{} trailing bytes", bytes.len() - read),
            });
        }
        Ok(value)
    }
}

/// Serialized property blob: every field's bytes back to back plus field offsets.
///
/// Field `i` occupies `bytes[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackedData {
    bytes: Vec<u8>,
    offsets: Vec<u32>,
}

impl PackedData {
    /// Build from already-encoded fields, in property order.
    pub fn from_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut bytes = Vec::new();
        let mut offsets = vec![0u32];
        for field in fields {
            bytes.extend_from_slice(field);
            offsets.push(bytes.len() as u32);
        }
        Self { bytes, offsets }
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Bytes of one field. Panics on an out-of-range index.
    #[inline]
    pub fn field(&self, prop: PropIndex) -> &[u8] {
        let i = prop as usize;
        &self.bytes[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    pub fn fields(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.offsets
            .windows(2)
            .map(move |w| &self.bytes[w[0] as usize..w[1] as usize])
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Field-by-field byte comparison, ascending. Costs O(field count).
    ///
    /// Fields beyond the shorter blob count as changed.
    pub fn changed_fields<'a>(&'a self, other: &'a PackedData) -> impl Iterator<Item = PropIndex> + 'a {
        let count = self.field_count().max(other.field_count());
        (0..count).filter_map(move |i| {
            let prop = i as PropIndex;
            let same = i < self.field_count()
                && i < other.field_count()
                && self.field(prop) == other.field(prop);
            (!same).then_some(prop)
        })
    }
}

/// Static description of one flattened property
#[derive(Debug, Clone, Default)]
pub struct PropertyDescriptor {
    pub name: String,
    /// Value is encoded relative to the absolute tick, so an unchanged entity
    /// still has to be re-packed every tick.
    pub tick_relative: bool,
}

/// Networked entity class
#[derive(Debug)]
pub struct ClassDescriptor {
    id: ClassId,
    name: String,
    properties: Vec<PropertyDescriptor>,
    codec: Arc<dyn FieldCodec>,
    baseline: Option<Arc<PackedData>>,
}

impl ClassDescriptor {
    /// Class with `property_count` anonymous properties and the bincode codec.
    pub fn new(id: ClassId, name: impl Into<String>, property_count: usize) -> Self {
        let properties = (0..property_count)
            .map(|i| PropertyDescriptor {
                name: format!("prop_{}", i),
                tick_relative: false,
            })
            .collect();
        Self {
            id,
            name: name.into(),
            properties,
            codec: Arc::new(BincodeFieldCodec),
            baseline: None,
        }
    }

    pub fn with_properties(mut self, properties: Vec<PropertyDescriptor>) -> Self {
        self.properties = properties;
        self.baseline = None;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn FieldCodec>) -> Self {
        self.codec = codec;
        self.baseline = None;
        self
    }

    /// Mark properties as encoded relative to the absolute tick.
    pub fn with_tick_relative(mut self, props: &[PropIndex]) -> Self {
        for &prop in props {
            if let Some(desc) = self.properties.get_mut(prop as usize) {
                desc.tick_relative = true;
            }
        }
        self
    }

    /// Class-default values used as the EnterView source.
    pub fn with_baseline(mut self, values: &[PropertyValue]) -> Result<Self, CodecError> {
        let baseline = self.encode(values)?;
        self.baseline = Some(Arc::new(baseline));
        Ok(self)
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn flattened_property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn property(&self, prop: PropIndex) -> Option<&PropertyDescriptor> {
        self.properties.get(prop as usize)
    }

    pub fn has_tick_relative_properties(&self) -> bool {
        self.properties.iter().any(|p| p.tick_relative)
    }

    /// Configured class-default baseline
    pub fn baseline(&self) -> Option<&Arc<PackedData>> {
        self.baseline.as_ref()
    }

    pub fn codec(&self) -> &dyn FieldCodec {
        self.codec.as_ref()
    }

    /// Encode a full value set into a packed blob.
    pub fn encode(&self, values: &[PropertyValue]) -> Result<PackedData, CodecError> {
        if values.len() != self.properties.len() {
            return Err(CodecError::PropertyCount {
                class: self.id,
                expected: self.properties.len(),
                actual: values.len(),
            });
        }

        let mut bytes = Vec::with_capacity(values.len() * 4);
        let mut offsets = Vec::with_capacity(values.len() + 1);
        offsets.push(0);
        for (i, value) in values.iter().enumerate() {
            self.codec.encode_field(i as PropIndex, value, &mut bytes)?;
            offsets.push(bytes.len() as u32);
        }
        Ok(PackedData { bytes, offsets })
    }

    /// Decode every field of a packed blob.
    pub fn decode(&self, data: &PackedData) -> Result<Vec<PropertyValue>, CodecError> {
        if data.field_count() != self.properties.len() {
            return Err(CodecError::PropertyCount {
                class: self.id,
                expected: self.properties.len(),
                actual: data.field_count(),
            });
        }
        data.fields()
            .enumerate()
            .map(|(i, bytes)| self.codec.decode_field(i as PropIndex, bytes))
            .collect()
    }
}

/// Registered classes, indexed by `ClassId`
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<Option<Arc<ClassDescriptor>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassDescriptor) -> Result<Arc<ClassDescriptor>, CodecError> {
        let id = class.id();
        if class.flattened_property_count() > MAX_PROPERTIES {
            return Err(CodecError::TooManyProperties(id));
        }
        let index = id as usize;
        if index >= self.classes.len() {
            self.classes.resize(index + 1, None);
        }
        if self.classes[index].is_some() {
            return Err(CodecError::DuplicateClass(id));
        }
        let class = Arc::new(class);
        self.classes[index] = Some(Arc::clone(&class));
        Ok(class)
    }

    pub fn get(&self, id: ClassId) -> Option<&Arc<ClassDescriptor>> {
        self.classes.get(id as usize).and_then(Option::as_ref)
    }

    pub fn require(&self, id: ClassId) -> Result<&Arc<ClassDescriptor>, CodecError> {
        self.get(id).ok_or(CodecError::UnknownClass(id))
    }

    pub fn len(&self) -> usize {
        self.classes.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
