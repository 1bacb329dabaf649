use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

use crate::behaviour::{Behaviour, EntityId, HookSet, ScriptInstance};
use crate::compiler::{CompiledType, CompiledUnit, TypeProgram};
use crate::diagnostics::SourceLocation;
use crate::reflect::{FieldKind, FieldTable, FieldValue};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub is_supported: bool,
    /// Declared default; `None` for unsupported kinds.
    pub default: Option<FieldValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTypeDescriptor {
    pub type_name: String,
    pub ancestry: Vec<String>,
    pub hooks: HookSet,
    pub fields: Vec<FieldDescriptor>,
    pub location: SourceLocation,
}

impl ScriptTypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryWarning {
    DuplicateTypeName { type_name: String, locations: Vec<SourceLocation> },
}

impl fmt::Display for RegistryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryWarning::DuplicateTypeName { type_name, locations } => {
                let places: Vec<String> = locations.iter().map(ToString::to_string).collect();
                write!(f, "type `{type_name}` is declared {} times ({}); it is not registered", locations.len(), places.join(", "))
            }
        }
    }
}

struct RegistryEntry {
    descriptor: ScriptTypeDescriptor,
    program: Rc<TypeProgram>,
    fields: FieldTable,
}

/// Behaviour types of the active unit, keyed by name. Rebuilt wholesale on every
/// successful reload.
#[derive(Default)]
pub struct TypeRegistry {
    unit_id: Option<Uuid>,
    entries: BTreeMap<String, RegistryEntry>,
    warnings: Vec<RegistryWarning>,
}

impl TypeRegistry {
    pub fn build(unit: &CompiledUnit) -> Self {
        let mut registry = Self { unit_id: Some(unit.id), ..Self::default() };
        if !unit.passed() {
            tracing::warn!(unit = %unit.id, "refusing to build a registry from a unit with errors");
            registry.unit_id = None;
            return registry;
        }

        let mut by_name: HashMap<&str, Vec<&CompiledType>> = HashMap::new();
        for ty in &unit.types {
            by_name.entry(ty.name.as_str()).or_default().push(ty);
        }
        let mut duplicates: Vec<(&str, Vec<SourceLocation>)> = by_name
            .iter()
            .filter(|(_, declared)| declared.len() > 1)
            .map(|(name, declared)| (*name, declared.iter().map(|ty| ty.location.clone()).collect()))
            .collect();
        duplicates.sort_by(|a, b| a.0.cmp(b.0));
        for (type_name, locations) in duplicates {
            let warning = RegistryWarning::DuplicateTypeName { type_name: type_name.to_string(), locations };
            tracing::warn!("{warning}");
            registry.warnings.push(warning);
        }

        for ty in &unit.types {
            if !ty.is_instantiable() || by_name.get(ty.name.as_str()).map_or(0, Vec::len) > 1 {
                continue;
            }
            let Some(program) = ty.program.clone() else {
                tracing::warn!(type_name = %ty.name, "behaviour type has no program; skipped");
                continue;
            };
            let descriptor = describe(ty);
            let fields = descriptor
                .fields
                .iter()
                .fold(FieldTable::builder(&ty.name), |builder, field| builder.field(&field.name, field.kind))
                .build();
            registry.entries.insert(ty.name.clone(), RegistryEntry { descriptor, program, fields });
        }
        tracing::debug!(unit = %unit.id, types = registry.entries.len(), "type registry built");
        registry
    }

    pub fn unit_id(&self) -> Option<Uuid> {
        self.unit_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&ScriptTypeDescriptor> {
        self.entries.get(type_name).map(|entry| &entry.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ScriptTypeDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    pub fn field_table(&self, type_name: &str) -> Option<&FieldTable> {
        self.entries.get(type_name).map(|entry| &entry.fields)
    }

    pub fn warnings(&self) -> &[RegistryWarning] {
        &self.warnings
    }

    /// Creates a fresh instance with declared defaults, bound to `owner`. Hooks are not run.
    pub fn instantiate(&self, type_name: &str, owner: EntityId) -> Option<Box<dyn Behaviour>> {
        let entry = self.entries.get(type_name)?;
        Some(Box::new(ScriptInstance::new(Rc::clone(&entry.program), owner)))
    }
}

fn describe(ty: &CompiledType) -> ScriptTypeDescriptor {
    let fields = ty
        .public_fields()
        .map(|field| FieldDescriptor {
            name: field.name.clone(),
            kind: field.kind,
            is_supported: field.kind.is_supported(),
            default: FieldValue::from_dynamic(field.kind, &field.default),
        })
        .collect();
    ScriptTypeDescriptor {
        type_name: ty.name.clone(),
        ancestry: ty.ancestry.clone(),
        hooks: ty.hooks,
        fields,
        location: ty.location.clone(),
    }
}
