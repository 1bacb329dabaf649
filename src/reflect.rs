//! Field reflection bridge.
//!
//! Script instances keep their fields in a Rhai object map, which the inspector cannot
//! consume directly. At registry build time each behaviour type gets a [`FieldTable`]: one
//! kind-checked accessor per supported public field. Everything else on the instance stays
//! invisible to tooling.

use glam::{Vec2, Vec3, Vec4};
use rhai::{Dynamic, FLOAT, INT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use crate::behaviour::Behaviour;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Int,
    Float,
    Bool,
    Text,
    Vec2,
    Vec3,
    Vec4,
    Array,
    Map,
}

impl FieldKind {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword {
            "int" => FieldKind::Int,
            "float" => FieldKind::Float,
            "bool" => FieldKind::Bool,
            "string" => FieldKind::Text,
            "vec2" => FieldKind::Vec2,
            "vec3" => FieldKind::Vec3,
            "vec4" => FieldKind::Vec4,
            "array" => FieldKind::Array,
            "map" => FieldKind::Map,
            _ => return None,
        };
        Some(kind)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Text => "string",
            FieldKind::Vec2 => "vec2",
            FieldKind::Vec3 => "vec3",
            FieldKind::Vec4 => "vec4",
            FieldKind::Array => "array",
            FieldKind::Map => "map",
        }
    }

    /// Kinds the inspector knows how to edit.
    pub fn is_supported(self) -> bool {
        !matches!(self, FieldKind::Array | FieldKind::Map)
    }

    pub fn zero_value(self) -> Dynamic {
        match self {
            FieldKind::Int => Dynamic::from_int(0),
            FieldKind::Float => Dynamic::from_float(0.0),
            FieldKind::Bool => Dynamic::from_bool(false),
            FieldKind::Text => Dynamic::from(String::new()),
            FieldKind::Vec2 => Dynamic::from(Vec2::ZERO),
            FieldKind::Vec3 => Dynamic::from(Vec3::ZERO),
            FieldKind::Vec4 => Dynamic::from(Vec4::ZERO),
            FieldKind::Array => Dynamic::from_array(Vec::new()),
            FieldKind::Map => Dynamic::from_map(rhai::Map::new()),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Int(INT),
    Float(FLOAT),
    Bool(bool),
    Text(String),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Vec2(_) => FieldKind::Vec2,
            FieldValue::Vec3(_) => FieldKind::Vec3,
            FieldValue::Vec4(_) => FieldKind::Vec4,
        }
    }

    /// Ints widen into float fields; every other pairing must match exactly.
    pub fn coerce(self, kind: FieldKind) -> Option<FieldValue> {
        match (self, kind) {
            (FieldValue::Int(value), FieldKind::Float) => Some(FieldValue::Float(value as FLOAT)),
            (value, kind) if value.kind() == kind => Some(value),
            _ => None,
        }
    }

    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            FieldValue::Int(value) => Dynamic::from_int(*value),
            FieldValue::Float(value) => Dynamic::from_float(*value),
            FieldValue::Bool(value) => Dynamic::from_bool(*value),
            FieldValue::Text(value) => Dynamic::from(value.clone()),
            FieldValue::Vec2(value) => Dynamic::from(Vec2::from_array(*value)),
            FieldValue::Vec3(value) => Dynamic::from(Vec3::from_array(*value)),
            FieldValue::Vec4(value) => Dynamic::from(Vec4::from_array(*value)),
        }
    }

    pub fn from_dynamic(kind: FieldKind, value: &Dynamic) -> Option<FieldValue> {
        match kind {
            FieldKind::Int => value.as_int().ok().map(FieldValue::Int),
            FieldKind::Float => value
                .as_float()
                .ok()
                .or_else(|| value.as_int().ok().map(|int| int as FLOAT))
                .map(FieldValue::Float),
            FieldKind::Bool => value.as_bool().ok().map(FieldValue::Bool),
            FieldKind::Text => value.clone().into_string().ok().map(FieldValue::Text),
            FieldKind::Vec2 => value.clone().try_cast::<Vec2>().map(|v| FieldValue::Vec2(v.to_array())),
            FieldKind::Vec3 => value.clone().try_cast::<Vec3>().map(|v| FieldValue::Vec3(v.to_array())),
            FieldKind::Vec4 => value.clone().try_cast::<Vec4>().map(|v| FieldValue::Vec4(v.to_array())),
            FieldKind::Array | FieldKind::Map => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(value) => write!(f, "{value}"),
            FieldValue::Float(value) => write!(f, "{value}"),
            FieldValue::Bool(value) => write!(f, "{value}"),
            FieldValue::Text(value) => write!(f, "{value:?}"),
            FieldValue::Vec2([x, y]) => write!(f, "vec2({x}, {y})"),
            FieldValue::Vec3([x, y, z]) => write!(f, "vec3({x}, {y}, {z})"),
            FieldValue::Vec4([x, y, z, w]) => write!(f, "vec4({x}, {y}, {z}, {w})"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReflectError {
    #[error("field `{field}` is not exposed on `{type_name}`")]
    NotExposed { type_name: String, field: String },
    #[error("field `{field}` expects a {expected} value, got {found}")]
    KindMismatch { field: String, expected: FieldKind, found: FieldKind },
    #[error("field `{field}` holds a value that is not a {expected}")]
    CorruptValue { field: String, expected: FieldKind },
    #[error("behaviour type `{0}` is not registered")]
    UnknownType(String),
    #[error("no live `{type_name}` instance on entity {entity}")]
    NoInstance { entity: String, type_name: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldEntry {
    pub name: String,
    pub kind: FieldKind,
    pub value: FieldValue,
}

type Getter = Rc<dyn Fn(&dyn Behaviour) -> Result<FieldValue, ReflectError>>;
type Setter = Rc<dyn Fn(&mut dyn Behaviour, FieldValue) -> Result<(), ReflectError>>;

#[derive(Clone)]
pub struct FieldAccessor {
    name: String,
    kind: FieldKind,
    get: Getter,
    set: Setter,
}

impl FieldAccessor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn get(&self, instance: &dyn Behaviour) -> Result<FieldValue, ReflectError> {
        (self.get)(instance)
    }

    pub fn set(&self, instance: &mut dyn Behaviour, value: FieldValue) -> Result<(), ReflectError> {
        (self.set)(instance, value)
    }
}

impl fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor").field("name", &self.name).field("kind", &self.kind).finish()
    }
}

/// Exposed fields of one behaviour type, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct FieldTable {
    type_name: String,
    accessors: Vec<FieldAccessor>,
}

impl FieldTable {
    pub fn builder(type_name: impl Into<String>) -> FieldTableBuilder {
        FieldTableBuilder { table: FieldTable { type_name: type_name.into(), accessors: Vec::new() } }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn accessors(&self) -> &[FieldAccessor] {
        &self.accessors
    }

    pub fn accessor(&self, name: &str) -> Result<&FieldAccessor, ReflectError> {
        self.accessors.iter().find(|accessor| accessor.name == name).ok_or_else(|| ReflectError::NotExposed {
            type_name: self.type_name.clone(),
            field: name.to_string(),
        })
    }
}

pub struct FieldTableBuilder {
    table: FieldTable,
}

impl FieldTableBuilder {
    /// Unsupported kinds are skipped; the descriptor still records them.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        if !kind.is_supported() {
            return self;
        }
        let name = name.into();
        let get_name = name.clone();
        let get: Getter = Rc::new(move |instance: &dyn Behaviour| {
            let stored = instance.read_field(&get_name).ok_or_else(|| ReflectError::NotExposed {
                type_name: instance.type_name().to_string(),
                field: get_name.clone(),
            })?;
            FieldValue::from_dynamic(kind, &stored)
                .ok_or_else(|| ReflectError::CorruptValue { field: get_name.clone(), expected: kind })
        });
        let set_name = name.clone();
        let set: Setter = Rc::new(move |instance: &mut dyn Behaviour, value: FieldValue| {
            let found = value.kind();
            let value = value.coerce(kind).ok_or_else(|| ReflectError::KindMismatch {
                field: set_name.clone(),
                expected: kind,
                found,
            })?;
            if instance.write_field(&set_name, value.to_dynamic()) {
                Ok(())
            } else {
                Err(ReflectError::NotExposed { type_name: instance.type_name().to_string(), field: set_name.clone() })
            }
        });
        self.table.accessors.push(FieldAccessor { name, kind, get, set });
        self
    }

    pub fn build(self) -> FieldTable {
        self.table
    }
}

pub fn list_fields(table: &FieldTable, instance: &dyn Behaviour) -> Vec<FieldEntry> {
    table
        .accessors
        .iter()
        .filter_map(|accessor| match accessor.get(instance) {
            Ok(value) => Some(FieldEntry { name: accessor.name.clone(), kind: accessor.kind, value }),
            Err(err) => {
                tracing::debug!(type_name = table.type_name(), "skipping field: {err}");
                None
            }
        })
        .collect()
}

pub fn get_field(table: &FieldTable, instance: &dyn Behaviour, name: &str) -> Result<FieldValue, ReflectError> {
    table.accessor(name)?.get(instance)
}

pub fn set_field(
    table: &FieldTable,
    instance: &mut dyn Behaviour,
    name: &str,
    value: FieldValue,
) -> Result<(), ReflectError> {
    table.accessor(name)?.set(instance, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::tests::MapBehaviour;

    fn table() -> FieldTable {
        FieldTable::builder("Probe")
            .field("speed", FieldKind::Float)
            .field("label", FieldKind::Text)
            .field("path", FieldKind::Array)
            .field("offset", FieldKind::Vec3)
            .build()
    }

    fn probe() -> MapBehaviour {
        MapBehaviour::new(
            "Probe",
            [
                ("speed", Dynamic::from_float(90.0)),
                ("label", Dynamic::from("probe".to_string())),
                ("path", Dynamic::from_array(vec![Dynamic::from_int(1)])),
                ("offset", Dynamic::from(Vec3::new(1.0, 2.0, 3.0))),
                ("hidden", Dynamic::from_int(7)),
            ],
        )
    }

    #[test]
    fn keywords_round_trip_and_support_flags() {
        for keyword in ["int", "float", "bool", "string", "vec2", "vec3", "vec4", "array", "map"] {
            let kind = FieldKind::from_keyword(keyword).expect("known keyword");
            assert_eq!(kind.keyword(), keyword);
        }
        assert!(FieldKind::from_keyword("list").is_none());
        assert!(!FieldKind::Array.is_supported());
        assert!(!FieldKind::Map.is_supported());
        assert!(FieldKind::Vec4.is_supported());
    }

    #[test]
    fn lists_only_supported_fields() {
        let instance = probe();
        let names: Vec<_> = list_fields(&table(), &instance).into_iter().map(|entry| entry.name).collect();
        assert_eq!(names, vec!["speed", "label", "offset"]);
    }

    #[test]
    fn unsupported_and_unknown_fields_are_not_exposed() {
        let mut instance = probe();
        let table = table();
        assert!(matches!(get_field(&table, &instance, "path"), Err(ReflectError::NotExposed { .. })));
        assert!(matches!(
            set_field(&table, &mut instance, "hidden", FieldValue::Int(1)),
            Err(ReflectError::NotExposed { .. })
        ));
        assert_eq!(instance.read_field("hidden").and_then(|v| v.as_int().ok()), Some(7));
    }

    #[test]
    fn set_coerces_ints_and_rejects_mismatches() {
        let mut instance = probe();
        let table = table();
        set_field(&table, &mut instance, "speed", FieldValue::Int(180)).expect("int widens to float");
        assert_eq!(get_field(&table, &instance, "speed"), Ok(FieldValue::Float(180.0)));
        let err = set_field(&table, &mut instance, "label", FieldValue::Bool(true)).unwrap_err();
        assert_eq!(
            err,
            ReflectError::KindMismatch { field: "label".into(), expected: FieldKind::Text, found: FieldKind::Bool }
        );
        set_field(&table, &mut instance, "offset", FieldValue::Vec3([0.0, 1.0, 0.0])).expect("set vec3");
        assert_eq!(get_field(&table, &instance, "offset"), Ok(FieldValue::Vec3([0.0, 1.0, 0.0])));
    }

    #[test]
    fn field_values_serialize_with_kind_tags() {
        let json = serde_json::to_string(&FieldValue::Vec2([1.0, 2.0])).expect("serialize");
        assert_eq!(json, r#"{"kind":"vec2","value":[1.0,2.0]}"#);
    }
}
