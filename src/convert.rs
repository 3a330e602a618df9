//! Value converter - dynamic protobuf messages to and from generic JSON values.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost::Message;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor, ReflectMessage,
    Value as ReflectValue,
};
use serde_json::{Map, Number, Value};
use thiserror::Error;

const NULL_VALUE: &str = "google.protobuf.NullValue";

/// Message types with a canonical JSON form that is rendered as such
/// instead of field by field.
const CANONICAL_JSON: &[&str] = &[
    "google.protobuf.Any",
    "google.protobuf.Duration",
    "google.protobuf.FieldMask",
    "google.protobuf.ListValue",
    "google.protobuf.Struct",
    "google.protobuf.Timestamp",
    "google.protobuf.Value",
];

/// Scalar wrappers, rendered as their bare `value`.
const WRAPPERS: &[&str] = &[
    "google.protobuf.BoolValue",
    "google.protobuf.BytesValue",
    "google.protobuf.DoubleValue",
    "google.protobuf.FloatValue",
    "google.protobuf.Int32Value",
    "google.protobuf.Int64Value",
    "google.protobuf.StringValue",
    "google.protobuf.UInt32Value",
    "google.protobuf.UInt64Value",
];

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to decode {message} from wire: {source}")]
    Wire {
        message: String,
        #[source]
        source: prost::DecodeError,
    },
    #[error("failed to serialize value: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to build {message} from value: {source}")]
    Decode {
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a wire payload using only the message descriptor.
pub fn decode(desc: MessageDescriptor, payload: &[u8]) -> Result<DynamicMessage, ConvertError> {
    let message = desc.full_name().to_string();
    DynamicMessage::decode(desc, payload).map_err(|source| ConvertError::Wire { message, source })
}

pub fn encode(message: &DynamicMessage) -> Vec<u8> {
    message.encode_to_vec()
}

/// Convert the fields present on `message` into a generic map.
///
/// Unset fields are left out rather than filled with defaults, numbers keep
/// their exact decimal text, bytes become base64 and enums their symbolic
/// name (`google.protobuf.NullValue` becomes `null`).
pub fn message_to_value(message: &DynamicMessage) -> Map<String, Value> {
    message
        .fields()
        .map(|(field, value)| (field.name().to_string(), field_value(&field, value)))
        .collect()
}

/// Build a message of type `desc` from a generic map.
///
/// Goes through JSON text so the schema's JSON mapping (field name aliases,
/// string-encoded 64-bit integers, well-known types) applies.
pub fn value_to_message(
    value: &Map<String, Value>,
    desc: MessageDescriptor,
) -> Result<DynamicMessage, ConvertError> {
    let message = desc.full_name().to_string();
    let text = serde_json::to_string(value).map_err(ConvertError::Serialize)?;

    let mut deserializer = serde_json::Deserializer::from_str(&text);
    let decoded = DynamicMessage::deserialize(desc, &mut deserializer)
        .and_then(|decoded| deserializer.end().map(|()| decoded))
        .map_err(|source| ConvertError::Decode { message, source })?;
    Ok(decoded)
}

fn field_value(field: &FieldDescriptor, value: &ReflectValue) -> Value {
    match value {
        ReflectValue::List(items) => {
            let kind = field.kind();
            Value::Array(items.iter().map(|item| scalar(&kind, item)).collect())
        }
        ReflectValue::Map(entries) => {
            let kind = match field.kind() {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                other => other,
            };
            Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (map_key(key), scalar(&kind, item)))
                    .collect(),
            )
        }
        other => scalar(&field.kind(), other),
    }
}

fn scalar(kind: &Kind, value: &ReflectValue) -> Value {
    match value {
        ReflectValue::Bool(b) => Value::Bool(*b),
        ReflectValue::I32(n) => number(n.to_string()),
        ReflectValue::I64(n) => number(n.to_string()),
        ReflectValue::U32(n) => number(n.to_string()),
        ReflectValue::U64(n) => number(n.to_string()),
        ReflectValue::F32(n) if !n.is_finite() => non_finite(f64::from(*n)),
        ReflectValue::F64(n) if !n.is_finite() => non_finite(*n),
        ReflectValue::F32(n) => number(n.to_string()),
        ReflectValue::F64(n) => number(n.to_string()),
        ReflectValue::String(s) => Value::String(s.clone()),
        ReflectValue::Bytes(b) => Value::String(STANDARD.encode(b)),
        ReflectValue::EnumNumber(n) => enum_value(kind, *n),
        ReflectValue::Message(m) => message_value(m),
        ReflectValue::List(items) => Value::Array(items.iter().map(|i| scalar(kind, i)).collect()),
        ReflectValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, item)| (map_key(key), scalar(kind, item)))
                .collect(),
        ),
    }
}

fn number(text: String) -> Value {
    match text.parse::<Number>() {
        Ok(n) => Value::Number(n),
        Err(_) => Value::String(text),
    }
}

fn non_finite(n: f64) -> Value {
    let text = if n.is_nan() {
        "NaN"
    } else if n.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    };
    Value::String(text.to_string())
}

fn enum_value(kind: &Kind, number: i32) -> Value {
    let Kind::Enum(desc) = kind else {
        return Value::Number(number.into());
    };
    if desc.full_name() == NULL_VALUE {
        return Value::Null;
    }
    match desc.get_value(number) {
        Some(v) => Value::String(v.name().to_string()),
        None => Value::Number(number.into()),
    }
}

fn message_value(message: &DynamicMessage) -> Value {
    let desc = message.descriptor();
    if WRAPPERS.contains(&desc.full_name()) {
        if let Some(field) = desc.get_field_by_name("value") {
            return scalar(&field.kind(), &message.get_field(&field));
        }
    }
    if CANONICAL_JSON.contains(&desc.full_name()) {
        if let Ok(value) = serde_json::to_value(message) {
            return value;
        }
    }
    Value::Object(message_to_value(message))
}

fn map_key(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pool_from_source;
    use prost_reflect::DescriptorPool;
    use serde_json::json;
    use std::collections::HashMap;

    const SCALARS: &str = r#"
syntax = "proto3";
package conv;

import "google/protobuf/struct.proto";
import "google/protobuf/timestamp.proto";
import "google/protobuf/wrappers.proto";

enum Color {
  COLOR_UNSPECIFIED = 0;
  RED = 1;
  GREEN = 2;
}

message Inner {
  string label = 1;
}

message Scalars {
  int32 i32 = 1;
  int64 i64 = 2;
  uint32 u32 = 3;
  uint64 u64 = 4;
  sint32 s32 = 5;
  sint64 s64 = 6;
  fixed32 f32 = 7;
  fixed64 f64 = 8;
  sfixed32 sf32 = 9;
  sfixed64 sf64 = 10;
  float fl = 11;
  double db = 12;
  bool flag = 13;
  string text = 14;
  bytes blob = 15;
  Color color = 16;
  Inner inner = 17;
  repeated string tags = 18;
  map<int32, string> names = 19;
  optional google.protobuf.NullValue nothing = 20;
  google.protobuf.Struct meta = 21;
  google.protobuf.Timestamp at = 22;
  repeated Inner items = 23;
  google.protobuf.Int64Value count = 24;
  google.protobuf.StringValue nick = 25;
}
"#;

    fn pool() -> DescriptorPool {
        pool_from_source("conv.proto", SCALARS)
    }

    fn scalars(pool: &DescriptorPool) -> MessageDescriptor {
        pool.get_message_by_name("conv.Scalars").unwrap()
    }

    #[test]
    fn absent_fields_are_omitted() {
        let pool = pool();
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("text", ReflectValue::String("hi".into()));

        let value = message_to_value(&message);
        assert_eq!(value.len(), 1);
        assert_eq!(value["text"], json!("hi"));
    }

    #[test]
    fn numbers_keep_exact_integers() {
        let pool = pool();
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("i64", ReflectValue::I64(9_007_199_254_740_993));
        message.set_field_by_name("u64", ReflectValue::U64(u64::MAX));
        message.set_field_by_name("s32", ReflectValue::I32(-7));
        message.set_field_by_name("fl", ReflectValue::F32(1.1));

        let value = message_to_value(&message);
        assert_eq!(value["i64"], json!(9_007_199_254_740_993_i64));
        assert_eq!(value["u64"], json!(u64::MAX));
        assert_eq!(value["s32"], json!(-7));
        assert_eq!(value["fl"].to_string(), "1.1");
    }

    #[test]
    fn bytes_enums_and_nulls() {
        let pool = pool();
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("blob", ReflectValue::Bytes(b"hello".to_vec().into()));
        message.set_field_by_name("color", ReflectValue::EnumNumber(2));
        message.set_field_by_name("nothing", ReflectValue::EnumNumber(0));

        let value = message_to_value(&message);
        assert_eq!(value["blob"], json!("aGVsbG8="));
        assert_eq!(value["color"], json!("GREEN"));
        assert_eq!(value["nothing"], Value::Null);
    }

    #[test]
    fn lists_maps_and_nested_messages() {
        let pool = pool();
        let desc = scalars(&pool);
        let inner = pool.get_message_by_name("conv.Inner").unwrap();

        let mut nested = DynamicMessage::new(inner);
        nested.set_field_by_name("label", ReflectValue::String("x".into()));

        let mut message = DynamicMessage::new(desc);
        message.set_field_by_name("inner", ReflectValue::Message(nested.clone()));
        message.set_field_by_name(
            "tags",
            ReflectValue::List(vec![
                ReflectValue::String("a".into()),
                ReflectValue::String("b".into()),
            ]),
        );
        message.set_field_by_name(
            "names",
            ReflectValue::Map(HashMap::from([(
                MapKey::I32(1),
                ReflectValue::String("one".into()),
            )])),
        );
        message.set_field_by_name("items", ReflectValue::List(vec![ReflectValue::Message(nested)]));

        let value = message_to_value(&message);
        assert_eq!(value["inner"], json!({"label": "x"}));
        assert_eq!(value["tags"], json!(["a", "b"]));
        assert_eq!(value["names"], json!({"1": "one"}));
        assert_eq!(value["items"], json!([{"label": "x"}]));
    }

    #[test]
    fn well_known_types_use_canonical_json() {
        let pool = pool();
        let value = json!({
            "meta": {"k": "v", "n": null},
            "at": "2024-01-02T03:04:05Z"
        });
        let message = value_to_message(value.as_object().unwrap(), scalars(&pool)).unwrap();
        let back = message_to_value(&message);
        assert_eq!(back["meta"], json!({"k": "v", "n": null}));
        assert_eq!(back["at"], json!("2024-01-02T03:04:05Z"));
    }

    #[test]
    fn wrappers_render_as_bare_scalars() {
        let pool = pool();
        let mut count =
            DynamicMessage::new(pool.get_message_by_name("google.protobuf.Int64Value").unwrap());
        count.set_field_by_name("value", ReflectValue::I64(5));
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("count", ReflectValue::Message(count));
        message.set_field_by_name("i64", ReflectValue::I64(5));

        let value = message_to_value(&message);
        assert_eq!(value["count"], json!(5));
        assert_eq!(value["count"], value["i64"]);
        assert!(crate::matcher::matches(
            crate::stub::Mode::Contains,
            json!({"count": 5}).as_object().unwrap(),
            &value
        ));

        let back = value_to_message(&value, scalars(&pool)).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn unset_wrapper_value_is_default() {
        let pool = pool();
        let nick =
            DynamicMessage::new(pool.get_message_by_name("google.protobuf.StringValue").unwrap());
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("nick", ReflectValue::Message(nick));

        assert_eq!(message_to_value(&message)["nick"], json!(""));
    }

    #[test]
    fn scalar_round_trip() {
        let pool = pool();
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("i32", ReflectValue::I32(i32::MIN));
        message.set_field_by_name("i64", ReflectValue::I64(i64::MAX));
        message.set_field_by_name("u32", ReflectValue::U32(u32::MAX));
        message.set_field_by_name("u64", ReflectValue::U64(u64::MAX));
        message.set_field_by_name("s32", ReflectValue::I32(-12));
        message.set_field_by_name("s64", ReflectValue::I64(-9_007_199_254_740_993));
        message.set_field_by_name("f32", ReflectValue::U32(42));
        message.set_field_by_name("f64", ReflectValue::U64(1 << 60));
        message.set_field_by_name("sf32", ReflectValue::I32(-3));
        message.set_field_by_name("sf64", ReflectValue::I64(-(1 << 60)));
        message.set_field_by_name("fl", ReflectValue::F32(0.1));
        message.set_field_by_name("db", ReflectValue::F64(2.718281828459045));
        message.set_field_by_name("flag", ReflectValue::Bool(true));
        message.set_field_by_name("text", ReflectValue::String("héllo".into()));
        message.set_field_by_name("blob", ReflectValue::Bytes(vec![0, 255, 7].into()));
        message.set_field_by_name("color", ReflectValue::EnumNumber(1));

        let value = message_to_value(&message);
        let back = value_to_message(&value, scalars(&pool)).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn non_finite_floats_round_trip() {
        let pool = pool();
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("db", ReflectValue::F64(f64::INFINITY));
        message.set_field_by_name("fl", ReflectValue::F32(f32::NEG_INFINITY));

        let value = message_to_value(&message);
        assert_eq!(value["db"], json!("Infinity"));
        assert_eq!(value["fl"], json!("-Infinity"));

        let back = value_to_message(&value, scalars(&pool)).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn json_names_are_accepted() {
        let pool = pool_from_source(
            "names.proto",
            r#"
syntax = "proto3";
package names;
message Person { string first_name = 1; }
"#,
        );
        let desc = pool.get_message_by_name("names.Person").unwrap();
        let a = value_to_message(json!({"first_name": "Ann"}).as_object().unwrap(), desc.clone())
            .unwrap();
        let b = value_to_message(json!({"firstName": "Ann"}).as_object().unwrap(), desc).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_field_is_decode_error() {
        let pool = pool();
        let err = value_to_message(json!({"missing": 1}).as_object().unwrap(), scalars(&pool))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Decode { .. }));
    }

    #[test]
    fn type_mismatch_is_decode_error() {
        let pool = pool();
        let err = value_to_message(json!({"flag": "yes"}).as_object().unwrap(), scalars(&pool))
            .unwrap_err();
        assert!(err.to_string().contains("conv.Scalars"));
    }

    #[test]
    fn wire_decode_round_trip() {
        let pool = pool();
        let mut message = DynamicMessage::new(scalars(&pool));
        message.set_field_by_name("text", ReflectValue::String("wire".into()));
        let decoded = decode(scalars(&pool), &encode(&message)).unwrap();
        assert_eq!(decoded, message);
        assert!(decode(scalars(&pool), &[0xff, 0xff]).is_err());
    }
}
