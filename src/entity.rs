//! C5: the entity runtime.
//!
//! Entities are passive property bags keyed by schema-defined ordered codec lists; the
//! runtime never does name-based reflection; decoding order is always "the next codec in
//! this entity type's list." Subscriptions are a static `(type_name, member) → [callback]`
//! table built once at controller construction, replacing the dynamic
//! `getattr(type_name.lower() + "_" + snake)` dispatch of the original implementation.

use std::collections::HashMap;
use std::sync::Arc;

use pickled::value::Value as PickleValue;
use crate::bitpack::{as_list, restricted_loads, value_as_i64, value_as_str, Cursor};
use crate::error::{PacketError, ReplayError};
use crate::schema::{EntityDef, FieldCodec, FieldKind, MethodDef};
use crate::types::EntityId;

/// A single decoded property or method-argument value. Schema codecs never need a richer
/// type than this; battle-controller hooks pattern-match the variant they expect and fail
/// loudly (`DispatchFailure`) on a mismatch.
#[derive(Debug, Clone)]
pub enum DecodedValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    F32(f32),
    String(String),
    Blob(Vec<u8>),
    Pickle(PickleValue),
}

impl DecodedValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            DecodedValue::U8(v) => Some(*v as u32),
            DecodedValue::U16(v) => Some(*v as u32),
            DecodedValue::U32(v) => Some(*v),
            DecodedValue::I32(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            DecodedValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::U8(v) => Some(*v as i64),
            DecodedValue::U16(v) => Some(*v as i64),
            DecodedValue::U32(v) => Some(*v as i64),
            DecodedValue::U64(v) => Some(*v as i64),
            DecodedValue::I32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::U8(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_pickle(&self) -> Option<&PickleValue> {
        match self {
            DecodedValue::Pickle(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

fn decode_field(codec: &FieldCodec, cur: &mut Cursor) -> Result<DecodedValue, ReplayError> {
    match codec.kind {
        FieldKind::U8 => Ok(DecodedValue::U8(cur.read_u8()?)),
        FieldKind::U16 => Ok(DecodedValue::U16(cur.read_u16()?)),
        FieldKind::U32 => Ok(DecodedValue::U32(cur.read_u32()?)),
        FieldKind::U64 => Ok(DecodedValue::U64(cur.read_u64()?)),
        FieldKind::I32 => Ok(DecodedValue::I32(cur.read_i32()?)),
        FieldKind::F32 => Ok(DecodedValue::F32(cur.read_f32()?)),
        FieldKind::String => {
            let blob = cur.read_blob()?;
            Ok(DecodedValue::String(String::from_utf8_lossy(blob).into_owned()))
        }
        FieldKind::Blob => Ok(DecodedValue::Blob(cur.read_blob()?.to_vec())),
        FieldKind::Pickle => {
            let blob = cur.read_blob()?;
            Ok(DecodedValue::Pickle(restricted_loads(blob)?))
        }
        FieldKind::Fixed(len) => Ok(DecodedValue::Blob(cur.take_vec(len as usize)?)),
    }
}

/// A live, mutable entity instance. The controller owns these by id; entities carry no
/// back-pointer to the controller (see the cyclic-reference note in the design docs).
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub type_name: String,
    pub type_index: u32,
    pub base_properties: HashMap<String, DecodedValue>,
    pub client_properties: HashMap<String, DecodedValue>,
    pub client_properties_internal: HashMap<String, DecodedValue>,
    pub position: (f32, f32, f32),
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub is_in_aoi: bool,
    def: Arc<EntityDef>,
}

impl Entity {
    pub fn new(id: EntityId, def: Arc<EntityDef>) -> Self {
        Entity {
            id,
            type_name: def.name.clone(),
            type_index: def.index,
            base_properties: HashMap::new(),
            client_properties: HashMap::new(),
            client_properties_internal: HashMap::new(),
            position: (0.0, 0.0, 0.0),
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            is_in_aoi: false,
            def,
        }
    }

    fn codec_at<'a>(list: &'a [FieldCodec], index: usize, type_name: &str) -> Result<&'a FieldCodec, ReplayError> {
        list.get(index).ok_or_else(|| {
            ReplayError::Packet(PacketError::SchemaMismatch {
                entity_id: 0,
                type_name: type_name.to_string(),
                index,
            })
        })
    }

    pub fn set_base_property(&mut self, index: usize, cur: &mut Cursor) -> Result<(), ReplayError> {
        let codec = Self::codec_at(&self.def.base_properties, index, &self.type_name)?.clone();
        let value = decode_field(&codec, cur)?;
        self.base_properties.insert(codec.name, value);
        Ok(())
    }

    pub fn set_client_property_internal(&mut self, index: usize, cur: &mut Cursor) -> Result<(), ReplayError> {
        let codec = Self::codec_at(&self.def.client_properties_internal, index, &self.type_name)?.clone();
        let value = decode_field(&codec, cur)?;
        self.client_properties_internal.insert(codec.name, value);
        Ok(())
    }

    pub fn set_client_property(&mut self, index: usize, cur: &mut Cursor) -> Result<(), ReplayError> {
        let codec = Self::codec_at(&self.def.client_properties, index, &self.type_name)?.clone();
        let value = decode_field(&codec, cur)?;
        self.client_properties.insert(codec.name, value);
        Ok(())
    }

    fn method_at<'a>(list: &'a [MethodDef], index: usize, type_name: &str) -> Result<&'a MethodDef, ReplayError> {
        list.get(index).ok_or_else(|| {
            ReplayError::Packet(PacketError::SchemaMismatch {
                entity_id: 0,
                type_name: type_name.to_string(),
                index,
            })
        })
    }

    /// Decodes the method's full argument list per its codec, in order, and returns
    /// `(method_name, args)` for the caller to fan out to subscribers — the entity itself
    /// holds no subscriber list, only the controller's registry does.
    pub fn decode_method_call(&self, index: usize, cur: &mut Cursor) -> Result<(String, Vec<DecodedValue>), ReplayError> {
        let method = Self::method_at(&self.def.methods, index, &self.type_name)?;
        let mut args = Vec::with_capacity(method.args.len());
        for arg in &method.args {
            args.push(decode_field(arg, cur)?);
        }
        Ok((method.name.clone(), args))
    }

    pub fn client_property(&self, name: &str) -> Option<&DecodedValue> {
        self.client_properties.get(name)
    }

    /// The schema definition backing this entity, for callers (the orchestrator) that
    /// need to know how many base/internal properties to walk, or a property's name at
    /// a given wire index, without duplicating the schema lookup.
    pub fn def(&self) -> &EntityDef {
        &self.def
    }

    /// Decodes a `NestedProperty` packet's payload: a root property index, then a
    /// restricted-pickled `(path, value)` pair, where `path` is the list of dict-key/
    /// array-index segments below the root property. Returns the dotted path
    /// (`"<root>.<segment>.<segment>..."`) and the leaf value, the shape the battle
    /// controller's nested-property hooks expect.
    pub fn decode_nested_property(&self, data: &[u8]) -> Result<NestedEdit, ReplayError> {
        let mut cur = Cursor::new(data);
        let index = cur.read_u8()? as usize;
        let codec = Self::codec_at(&self.def.client_properties, index, &self.type_name)?;
        let root_property = codec.name.clone();

        let remaining = cur.read_blob_of(cur.remaining())?;
        let decoded = restricted_loads(remaining)?;
        let items = as_list(&decoded);
        let path_segments = items.first().map(as_list).unwrap_or(&[]);
        let value = items.get(1).cloned().unwrap_or(PickleValue::None);

        let mut path = root_property.clone();
        for segment in path_segments {
            path.push('.');
            path.push_str(&path_segment_to_string(segment));
        }

        Ok(NestedEdit { root_property, path, value })
    }
}

fn path_segment_to_string(segment: &PickleValue) -> String {
    value_as_str(segment)
        .or_else(|| value_as_i64(segment).map(|i| i.to_string()))
        .unwrap_or_default()
}

/// Decodes an `EntityCreate` payload's state blob: `values_count:u8` then
/// `(index:u8, encoded value)` repeats until exhausted. Trailing bytes after the declared
/// count is a hard error (mirrors the original's `assert values.read() == b""`).
pub fn apply_entity_create_state(entity: &mut Entity, state: &[u8]) -> Result<(), ReplayError> {
    let mut cur = Cursor::new(state);
    let count = cur.read_u8()? as usize;
    for _ in 0..count {
        let index = cur.read_u8()? as usize;
        entity.set_client_property(index, &mut cur)?;
    }
    if !cur.is_empty() {
        return Err(ReplayError::Parse(format!(
            "EntityCreate state for entity {} had {} trailing bytes",
            entity.id,
            cur.remaining()
        )));
    }
    Ok(())
}

/// One member of a `(type_name, member_name)` subscription: either a method-call hook, a
/// flat property-change hook, or a nested dotted-path property-change hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Method { type_name: &'static str, method: &'static str },
    Property { type_name: &'static str, property: &'static str },
    NestedProperty { type_name: &'static str, path: &'static str },
}

/// A structured nested-property edit as emitted by a `NestedProperty` packet: a root
/// property name, a dotted subscript path under it, and the restricted-decoded leaf value.
#[derive(Debug, Clone)]
pub struct NestedEdit {
    pub root_property: String,
    pub path: String,
    pub value: PickleValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    fn def_with_one_u32() -> Arc<EntityDef> {
        Arc::new(EntityDef {
            name: "TestType".to_string(),
            index: 0,
            base_properties: vec![FieldCodec { name: "hp".to_string(), kind: FieldKind::U32 }],
            client_properties: vec![FieldCodec { name: "speed".to_string(), kind: FieldKind::U32 }],
            client_properties_internal: vec![],
            cell_properties: vec![],
            methods: vec![],
        })
    }

    #[test]
    fn set_base_property_decodes_and_stores() {
        let mut entity = Entity::new(EntityId(1), def_with_one_u32());
        let bytes = 42u32.to_le_bytes();
        let mut cur = Cursor::new(&bytes);
        entity.set_base_property(0, &mut cur).unwrap();
        assert_eq!(entity.base_properties["hp"].as_u32(), Some(42));
    }

    #[test]
    fn unknown_property_index_is_schema_mismatch() {
        let mut entity = Entity::new(EntityId(1), def_with_one_u32());
        let bytes = [0u8; 4];
        let mut cur = Cursor::new(&bytes);
        let err = entity.set_base_property(5, &mut cur).unwrap_err();
        assert!(matches!(err, ReplayError::Packet(PacketError::SchemaMismatch { .. })));
    }

    #[test]
    fn entity_create_state_rejects_trailing_bytes() {
        let mut entity = Entity::new(EntityId(1), def_with_one_u32());
        let mut state = vec![1u8, 0u8];
        state.extend_from_slice(&7u32.to_le_bytes());
        state.push(0xFF); // trailing garbage
        let err = apply_entity_create_state(&mut entity, &state).unwrap_err();
        assert!(matches!(err, ReplayError::Parse(_)));
    }

    #[test]
    fn entity_create_state_applies_all_values() {
        let mut entity = Entity::new(EntityId(1), def_with_one_u32());
        let mut state = vec![1u8, 0u8];
        state.extend_from_slice(&7u32.to_le_bytes());
        apply_entity_create_state(&mut entity, &state).unwrap();
        assert_eq!(entity.client_properties["speed"].as_u32(), Some(7));
    }
}
