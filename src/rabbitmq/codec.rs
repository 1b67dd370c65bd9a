// src/rabbitmq/codec.rs
// JSON encoding for request and reply bodies.
//
// Writes go through serde as-is (wire types are `rename_all = "camelCase"`).
// Reads are case-insensitive: object keys are matched against the target
// struct's field names and enum variant names ignoring ASCII case, at every
// nesting level. When two keys name the same field, the later one wins.
//
// `#[serde(flatten)]` and internally tagged, adjacently tagged or untagged
// enums are buffered by serde before they reach this adapter, so their keys
// and tags must match exactly (camelCase, as written).

use serde::de::value::StringDeserializer;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, EnumAccess, IntoDeserializer, MapAccess,
    SeqAccess, Unexpected, VariantAccess, Visitor,
};
use serde::{forward_to_deserialize_any, Serialize};
use serde_json::{Map, Value};

pub fn encode<T: Serialize + ?Sized>(message: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
    let value: Value = serde_json::from_slice(body)?;
    from_value(value)
}

pub fn decode_str<T: DeserializeOwned>(body: &str) -> serde_json::Result<T> {
    decode(body.as_bytes())
}

pub fn from_value<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
    T::deserialize(CaseInsensitive(value))
}

struct CaseInsensitive(Value);

impl<'de> Deserializer<'de> for CaseInsensitive {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(ObjectAccess::new(map, &[])),
            Value::Array(items) => visitor.visit_seq(ArrayAccess::new(items)),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(CaseInsensitive(other)),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.0.deserialize_unit(visitor)
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.0.deserialize_unit_struct(name, visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(ObjectAccess::new(map, fields)),
            Value::Array(items) => visitor.visit_seq(ArrayAccess::new(items)),
            other => other.deserialize_struct(name, fields, visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        let (variant, payload) = match self.0 {
            Value::String(variant) => (variant, None),
            Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
                Some((variant, payload)) => (variant, Some(payload)),
                None => return Err(de::Error::invalid_length(0, &"map with a single key")),
            },
            Value::Object(map) => {
                return Err(de::Error::invalid_length(map.len(), &"map with a single key"))
            }
            other => return Err(de::Error::invalid_type(unexpected(&other), &"enum")),
        };
        visitor.visit_enum(VariantEntry {
            variant: matching_name(variants, variant),
            payload,
        })
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf seq tuple tuple_struct map identifier ignored_any
    }
}

/// The declared name equal to `name` ignoring ASCII case, or `name` itself.
fn matching_name(names: &'static [&'static str], name: String) -> String {
    match names.iter().find(|known| known.eq_ignore_ascii_case(&name)) {
        Some(known) => known.to_string(),
        None => name,
    }
}

fn unexpected(value: &Value) -> Unexpected<'_> {
    match value {
        Value::Null => Unexpected::Unit,
        Value::Bool(b) => Unexpected::Bool(*b),
        Value::Number(n) => match n.as_f64() {
            Some(f) => Unexpected::Float(f),
            None => Unexpected::Other("number"),
        },
        Value::String(s) => Unexpected::Str(s),
        Value::Array(_) => Unexpected::Seq,
        Value::Object(_) => Unexpected::Map,
    }
}

struct ObjectAccess {
    entries: std::vec::IntoIter<(String, Value)>,
    pending: Option<Value>,
}

impl ObjectAccess {
    /// Keys are renamed to the field they match; a later key for an
    /// already-seen field replaces the earlier value.
    fn new(map: Map<String, Value>, fields: &'static [&'static str]) -> Self {
        let mut entries: Vec<(String, Value)> = Vec::with_capacity(map.len());
        for (key, value) in map {
            let name = matching_name(fields, key);
            let seen = if fields.iter().any(|field| *field == name) {
                entries.iter_mut().find(|(seen, _)| *seen == name)
            } else {
                None
            };
            match seen {
                Some(entry) => entry.1 = value,
                None => entries.push((name, value)),
            }
        }
        Self {
            entries: entries.into_iter(),
            pending: None,
        }
    }
}

impl<'de> MapAccess<'de> for ObjectAccess {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Self::Error> {
        match self.entries.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                let key: StringDeserializer<serde_json::Error> = key.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Self::Error> {
        match self.pending.take() {
            Some(value) => seed.deserialize(CaseInsensitive(value)),
            None => Err(de::Error::custom("value requested before key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

struct ArrayAccess {
    items: std::vec::IntoIter<Value>,
}

impl ArrayAccess {
    fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<'de> SeqAccess<'de> for ArrayAccess {
    type Error = serde_json::Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Self::Error> {
        match self.items.next() {
            Some(value) => seed.deserialize(CaseInsensitive(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

/// `"Variant"` or `{"Variant": payload}`, with the name already matched.
struct VariantEntry {
    variant: String,
    payload: Option<Value>,
}

impl<'de> EnumAccess<'de> for VariantEntry {
    type Error = serde_json::Error;
    type Variant = VariantPayload;

    fn variant_seed<V: DeserializeSeed<'de>>(
        self,
        seed: V,
    ) -> Result<(V::Value, Self::Variant), Self::Error> {
        let variant: StringDeserializer<serde_json::Error> = self.variant.into_deserializer();
        let variant = seed.deserialize(variant)?;
        Ok((variant, VariantPayload(self.payload)))
    }
}

struct VariantPayload(Option<Value>);

impl<'de> VariantAccess<'de> for VariantPayload {
    type Error = serde_json::Error;

    fn unit_variant(self) -> Result<(), Self::Error> {
        match self.0 {
            None | Some(Value::Null) => Ok(()),
            Some(other) => Err(de::Error::invalid_type(unexpected(&other), &"unit variant")),
        }
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, Self::Error> {
        match self.0 {
            Some(value) => seed.deserialize(CaseInsensitive(value)),
            None => Err(de::Error::invalid_type(Unexpected::UnitVariant, &"newtype variant")),
        }
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Some(Value::Array(items)) => visitor.visit_seq(ArrayAccess::new(items)),
            Some(other) => Err(de::Error::invalid_type(unexpected(&other), &"tuple variant")),
            None => Err(de::Error::invalid_type(Unexpected::UnitVariant, &"tuple variant")),
        }
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Some(Value::Object(map)) => visitor.visit_map(ObjectAccess::new(map, fields)),
            Some(Value::Array(items)) => visitor.visit_seq(ArrayAccess::new(items)),
            Some(other) => Err(de::Error::invalid_type(unexpected(&other), &"struct variant")),
            None => Err(de::Error::invalid_type(Unexpected::UnitVariant, &"struct variant")),
        }
    }
}
