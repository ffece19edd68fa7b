//! Wire-format and checkpoint serialization tests
//!
//! Round-trip fidelity of the tagged JSON encoding for values and types,
//! and checkpoint persistence through a real file.

use constellation_engine::value::{list_of, record_of};
use constellation_engine::{ExecutionCheckpoint, SemType, Value};
use std::collections::BTreeMap;
use std::io::Write;

fn round_trip(value: &Value) -> Value {
    let text = serde_json::to_string(value).expect("serializes");
    serde_json::from_str(&text).expect("deserializes")
}

#[test]
fn test_primitives_round_trip() {
    for value in [
        Value::String("héllo \"quoted\" text".to_string()),
        Value::Int(i64::MIN),
        Value::Int(i64::MAX),
        Value::Float(-0.5),
        Value::Boolean(true),
        Value::Unit,
    ] {
        assert_eq!(round_trip(&value), value);
    }
}

#[test]
fn test_primitive_wire_shape() {
    let json = Value::Int(5).to_json();
    assert_eq!(json["tag"], "Int");
    assert_eq!(json["value"], 5);

    let json = Value::Unit.to_json();
    assert_eq!(json["tag"], "Unit");
}

#[test]
fn test_list_carries_subtype() {
    let value = list_of(vec![Value::Int(1)], SemType::Int);
    let json = value.to_json();
    assert_eq!(json["tag"], "List");
    assert_eq!(json["subtype"]["tag"], "Int");
    assert_eq!(round_trip(&value), value);
}

#[test]
fn test_map_wire_shape_is_entry_array() {
    // Non-string keys force the entry-array representation
    let value = Value::Map {
        entries: vec![
            (
                record_of(vec![("k", Value::Int(1))]),
                Value::String("composite key".to_string()),
            ),
            (record_of(vec![("k", Value::Int(2))]), Value::String("two".to_string())),
        ],
        key_type: SemType::Record(vec![("k".to_string(), SemType::Int)]),
        value_type: SemType::String,
    };
    let json = value.to_json();
    let entries = json["value"].as_array().expect("entry array");
    assert_eq!(entries.len(), 2);
    assert!(entries[0].get("key").is_some());
    assert!(entries[0].get("value").is_some());
    assert!(json.get("keysType").is_some());
    assert!(json.get("valuesType").is_some());
    assert_eq!(round_trip(&value), value);
}

#[test]
fn test_record_wire_shape_has_structure() {
    let value = record_of(vec![
        ("name", Value::String("ada".to_string())),
        ("age", Value::Int(36)),
    ]);
    let json = value.to_json();
    assert_eq!(json["tag"], "Record");
    assert_eq!(json["structure"]["name"]["tag"], "String");
    assert_eq!(json["structure"]["age"]["tag"], "Int");
    assert_eq!(round_trip(&value), value);
}

#[test]
fn test_record_field_order_survives() {
    let value = record_of(vec![
        ("zulu", Value::Int(1)),
        ("alpha", Value::Int(2)),
        ("mike", Value::Int(3)),
    ]);
    let back = round_trip(&value);
    // Order-preserving equality, not just equivalence
    assert_eq!(back, value);
}

#[test]
fn test_optional_wire_tags() {
    let some = Value::Some(Box::new(Value::Int(5)));
    let json = some.to_json();
    assert_eq!(json["tag"], "Some");
    assert_eq!(json["innerType"]["tag"], "Int");

    let none = Value::None(SemType::String);
    let json = none.to_json();
    assert_eq!(json["tag"], "None");
    assert_eq!(json["innerType"]["tag"], "String");

    assert_eq!(round_trip(&some), some);
    assert_eq!(round_trip(&none), none);
}

#[test]
fn test_deeply_nested_round_trip() {
    let value = record_of(vec![
        (
            "matrix",
            list_of(
                vec![
                    list_of(vec![Value::Float(1.0), Value::Float(2.5)], SemType::Float),
                    list_of(vec![], SemType::Float),
                ],
                SemType::List(Box::new(SemType::Float)),
            ),
        ),
        (
            "maybe",
            Value::Some(Box::new(record_of(vec![(
                "inner",
                Value::None(SemType::Boolean),
            )]))),
        ),
    ]);
    assert_eq!(round_trip(&value), value);
}

#[test]
fn test_type_encoding_round_trips() {
    let types = vec![
        SemType::Unit,
        SemType::Map(
            Box::new(SemType::Record(vec![("id".to_string(), SemType::Int)])),
            Box::new(SemType::Optional(Box::new(SemType::String))),
        ),
        SemType::Union(vec![
            ("ok".to_string(), SemType::Int),
            ("error".to_string(), SemType::String),
        ]),
    ];
    for ty in types {
        let text = serde_json::to_string(&ty).expect("serializes");
        let back: SemType = serde_json::from_str(&text).expect("deserializes");
        assert_eq!(back, ty);
    }
}

#[test]
fn test_malformed_wire_data_rejected() {
    for bad in [
        serde_json::json!(42),
        serde_json::json!({"value": 1}),
        serde_json::json!({"tag": "Int", "value": "nope"}),
        serde_json::json!({"tag": "List", "value": []}),
        serde_json::json!({"tag": "Some"}),
    ] {
        assert!(Value::from_json(&bad).is_err(), "accepted {bad}");
    }
}

#[test]
fn test_checkpoint_persists_through_file() {
    let state = constellation_engine::ExecutionState {
        data: [(
            constellation_engine::DataNodeId(3),
            constellation_engine::executor::DataEntry {
                ty: SemType::Int,
                value: Some(Value::Int(99)),
                status: constellation_engine::NodeStatus::Fired { duration_ms: 12 },
            },
        )]
        .into_iter()
        .collect(),
        module_status: BTreeMap::new(),
    };
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "payload".to_string(),
        record_of(vec![("n", Value::Int(1))]),
    );
    let checkpoint = ExecutionCheckpoint::capture(
        uuid::Uuid::new_v4(),
        "persisted",
        &state,
        constellation_engine::ModuleNodeId(2),
        Some("wait for approval".to_string()),
        inputs,
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("checkpoint.json");
    let mut file = std::fs::File::create(&path).expect("create");
    file.write_all(checkpoint.to_json().expect("encodes").as_bytes())
        .expect("write");

    let text = std::fs::read_to_string(&path).expect("read");
    let back = ExecutionCheckpoint::from_json(&text).expect("decodes");
    assert_eq!(back, checkpoint);
    assert_eq!(
        back.completed()[&constellation_engine::DataNodeId(3)],
        Value::Int(99)
    );
}
