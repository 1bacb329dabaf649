use glam::{Vec2, Vec3, Vec4};
use rhai::{Dynamic, ImmutableString, Map, AST, FLOAT};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::behaviour::{Hook, HookSet, BEHAVIOUR_BASE};
use crate::diagnostics::{Diagnostic, DiagnosticCode, SourceLocation};
use crate::reflect::FieldKind;

use super::symbols::FunctionOrigin;
use super::syntax::{Literal, TypeDecl, Visibility};
use super::ParsedFile;

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub public: bool,
    pub default: Dynamic,
    pub declared_in: String,
}

/// Everything needed to run one concrete behaviour type: helper functions, inherited
/// methods and the type's own methods merged into a single AST, later definitions
/// overriding earlier ones.
#[derive(Debug)]
pub struct TypeProgram {
    pub type_name: ImmutableString,
    pub ast: AST,
    pub hooks: HookSet,
    pub fields: Vec<FieldSpec>,
    pub origins: HashMap<String, FunctionOrigin>,
}

impl TypeProgram {
    pub fn initial_fields(&self) -> Map {
        self.fields.iter().map(|field| (field.name.as_str().into(), field.default.clone())).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledType {
    pub name: String,
    pub base: Option<String>,
    /// Own name first, then each base up to (not including) the built-in one.
    pub ancestry: Vec<String>,
    pub is_abstract: bool,
    pub is_behaviour: bool,
    pub hooks: HookSet,
    pub fields: Vec<FieldSpec>,
    pub location: SourceLocation,
    /// Present only for concrete behaviour types of a unit that passed.
    pub program: Option<Rc<TypeProgram>>,
}

impl CompiledType {
    pub fn is_instantiable(&self) -> bool {
        self.is_behaviour && !self.is_abstract
    }

    pub fn public_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|field| field.public)
    }
}

#[derive(Debug, Default)]
pub struct Linked {
    pub types: Vec<CompiledType>,
    pub diagnostics: Vec<Diagnostic>,
}

struct TypeNode<'a> {
    file: usize,
    index: usize,
    decl: &'a TypeDecl,
}

enum Ancestry {
    /// Root-first chain ending at the type itself.
    Behaviour(Vec<usize>),
    Plain(Vec<usize>),
    Broken,
}

/// Resolves bases across the whole corpus and checks every declaration. Programs are
/// built only when `emit_programs` is set and linking itself found no error.
pub fn link(files: &[Rc<ParsedFile>], emit_programs: bool) -> Linked {
    let nodes: Vec<TypeNode<'_>> = files
        .iter()
        .enumerate()
        .flat_map(|(file, parsed)| {
            parsed.tree.types.iter().enumerate().map(move |(index, decl)| TypeNode { file, index, decl })
        })
        .collect();
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        by_name.entry(node.decl.name.as_str()).or_default().push(i);
    }

    let mut diagnostics = Vec::new();
    check_helper_duplicates(files, &mut diagnostics);
    for node in &nodes {
        if node.decl.name == BEHAVIOUR_BASE {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::ReservedTypeName,
                node.decl.location.clone(),
                format!("`{BEHAVIOUR_BASE}` is the built-in base type and cannot be redeclared"),
            ));
        }
    }

    let ancestry: Vec<Ancestry> = (0..nodes.len()).map(|i| resolve(i, &nodes, &by_name, &mut diagnostics)).collect();
    let own_fields: Vec<Vec<FieldSpec>> =
        nodes.iter().map(|node| check_own_fields(node.decl, &mut diagnostics)).collect();

    let mut types = Vec::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        let decl = node.decl;
        let (chain, is_behaviour) = match &ancestry[i] {
            Ancestry::Behaviour(chain) => (chain.clone(), true),
            Ancestry::Plain(chain) => (chain.clone(), false),
            Ancestry::Broken => (vec![i], false),
        };

        let mut fields: Vec<FieldSpec> = Vec::new();
        for &ancestor in &chain {
            for field in &own_fields[ancestor] {
                if let Some(existing) = fields.iter().find(|f| f.name == field.name) {
                    if ancestor == i {
                        let location = decl
                            .fields
                            .iter()
                            .find(|f| f.name == field.name)
                            .map(|f| f.location.clone())
                            .unwrap_or_else(|| decl.location.clone());
                        diagnostics.push(Diagnostic::new(
                            DiagnosticCode::ShadowedField,
                            location,
                            format!("field `{}` shadows the one inherited from `{}`", field.name, existing.declared_in),
                        ));
                    }
                    continue;
                }
                fields.push(field.clone());
            }
        }

        let own_hooks = if is_behaviour { check_methods(node.decl, &mut diagnostics) } else { HookSet::empty() };
        let hooks = chain
            .iter()
            .filter(|&&ancestor| ancestor != i)
            .fold(own_hooks, |acc, &ancestor| acc | declared_hooks(nodes[ancestor].decl));

        match &ancestry[i] {
            Ancestry::Behaviour(_) if !decl.is_abstract && hooks.is_empty() => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticCode::NoHooks,
                    decl.location.clone(),
                    format!("`{}` defines no lifecycle hook and will never run", decl.name),
                ));
            }
            Ancestry::Plain(_) => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticCode::NotABehaviour,
                    decl.location.clone(),
                    format!("`{}` does not derive from `{BEHAVIOUR_BASE}` and will not be registered", decl.name),
                ));
            }
            _ => {}
        }

        types.push(CompiledType {
            name: decl.name.clone(),
            base: decl.base.as_ref().map(|(name, _)| name.clone()),
            ancestry: chain.iter().rev().map(|&n| nodes[n].decl.name.clone()).collect(),
            is_abstract: decl.is_abstract,
            is_behaviour,
            hooks,
            fields,
            location: decl.location.clone(),
            program: None,
        });
    }

    if emit_programs && crate::diagnostics::passes(&diagnostics) {
        for (i, compiled) in types.iter_mut().enumerate() {
            let Ancestry::Behaviour(chain) = &ancestry[i] else { continue };
            if compiled.is_abstract {
                continue;
            }
            compiled.program = Some(Rc::new(build_program(compiled, chain, &nodes, files)));
        }
    }

    Linked { types, diagnostics }
}

fn resolve(
    i: usize,
    nodes: &[TypeNode<'_>],
    by_name: &HashMap<&str, Vec<usize>>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Ancestry {
    let mut chain = vec![i];
    let mut visited = HashSet::from([i]);
    let mut current = i;
    loop {
        let Some((base, location)) = &nodes[current].decl.base else {
            chain.reverse();
            return Ancestry::Plain(chain);
        };
        if base == BEHAVIOUR_BASE {
            chain.reverse();
            return Ancestry::Behaviour(chain);
        }
        let next = match by_name.get(base.as_str()).map(Vec::as_slice) {
            None | Some([]) => {
                if current == i {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticCode::UnknownBaseType,
                        location.clone(),
                        format!("unknown base type `{base}`"),
                    ));
                }
                return Ancestry::Broken;
            }
            Some([only]) => *only,
            Some(candidates) => {
                // Warning only; the type and its descendants are never instantiable.
                let places: Vec<String> = candidates.iter().map(|&c| nodes[c].decl.location.to_string()).collect();
                let name = &nodes[i].decl.name;
                let message = if current == i {
                    format!("base type `{base}` is declared more than once ({}); `{name}` is not registered", places.join(", "))
                } else {
                    format!("ancestor `{base}` is declared more than once ({}); `{name}` is not registered", places.join(", "))
                };
                let at = if current == i { location.clone() } else { nodes[i].decl.location.clone() };
                diagnostics.push(Diagnostic::new(DiagnosticCode::AmbiguousBaseType, at, message));
                return Ancestry::Broken;
            }
        };
        if !visited.insert(next) {
            if next == i {
                let mut names: Vec<&str> = chain.iter().map(|&n| nodes[n].decl.name.as_str()).collect();
                names.push(nodes[i].decl.name.as_str());
                let base_location = nodes[i].decl.base.as_ref().map(|(_, loc)| loc.clone());
                diagnostics.push(Diagnostic::new(
                    DiagnosticCode::InheritanceCycle,
                    base_location.unwrap_or_else(|| nodes[i].decl.location.clone()),
                    format!("inheritance cycle: {}", names.join(" -> ")),
                ));
            }
            return Ancestry::Broken;
        }
        chain.push(next);
        current = next;
    }
}

fn check_own_fields(decl: &TypeDecl, diagnostics: &mut Vec<Diagnostic>) -> Vec<FieldSpec> {
    let mut specs: Vec<FieldSpec> = Vec::with_capacity(decl.fields.len());
    for field in &decl.fields {
        if specs.iter().any(|spec| spec.name == field.name) {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::DuplicateField,
                field.location.clone(),
                format!("field `{}` is declared twice in `{}`", field.name, decl.name),
            ));
            continue;
        }
        let default = match &field.default {
            None => field.kind.zero_value(),
            Some(literal) => match default_value(field.kind, literal) {
                Some(value) => value,
                None => {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticCode::DefaultKindMismatch,
                        field.location.clone(),
                        format!(
                            "default for `{}` is a {} but the field is declared {}",
                            field.name,
                            literal.describe(),
                            field.kind
                        ),
                    ));
                    field.kind.zero_value()
                }
            },
        };
        specs.push(FieldSpec {
            name: field.name.clone(),
            kind: field.kind,
            public: field.visibility == Visibility::Public,
            default,
            declared_in: decl.name.clone(),
        });
    }
    specs
}

fn check_methods(decl: &TypeDecl, diagnostics: &mut Vec<Diagnostic>) -> HookSet {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut hooks = HookSet::empty();
    for method in &decl.methods {
        if !seen.insert(method.name.as_str()) {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::DuplicateMethod,
                method.location.clone(),
                format!("method `{}` is defined twice in `{}`", method.name, decl.name),
            ));
            continue;
        }
        let Some(hook) = Hook::from_name(&method.name) else { continue };
        if method.params.len() != hook.arity() {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::HookSignature,
                method.location.clone(),
                format!(
                    "hook `{}` takes {} parameter(s), found {}; expected `{}`",
                    hook.name(),
                    hook.arity(),
                    method.params.len(),
                    hook.signature()
                ),
            ));
            continue;
        }
        hooks |= hook.flag();
    }
    hooks
}

fn declared_hooks(decl: &TypeDecl) -> HookSet {
    decl.methods
        .iter()
        .filter_map(|method| Hook::from_name(&method.name).filter(|hook| hook.arity() == method.params.len()))
        .fold(HookSet::empty(), |acc, hook| acc | hook.flag())
}

/// Free functions share one namespace across the corpus; a name and arity may be defined
/// only once.
fn check_helper_duplicates(files: &[Rc<ParsedFile>], diagnostics: &mut Vec<Diagnostic>) {
    let mut seen: HashMap<(&str, usize), &SourceLocation> = HashMap::new();
    for function in files.iter().flat_map(|file| &file.tree.functions) {
        let key = (function.name.as_str(), function.params.len());
        match seen.get(&key) {
            Some(first) => diagnostics.push(Diagnostic::new(
                DiagnosticCode::DuplicateMethod,
                function.location.clone(),
                format!(
                    "function `{}` with {} parameter(s) is already defined at {first}",
                    function.name,
                    function.params.len()
                ),
            )),
            None => {
                seen.insert(key, &function.location);
            }
        }
    }
}

fn build_program(compiled: &CompiledType, chain: &[usize], nodes: &[TypeNode<'_>], files: &[Rc<ParsedFile>]) -> TypeProgram {
    let mut ast = AST::empty();
    let mut origins = HashMap::new();
    for helper in files.iter().flat_map(|file| &file.functions) {
        ast.combine(helper.ast.clone());
        origins.insert(helper.name.clone(), helper.origin.clone());
    }
    for &n in chain {
        let node = &nodes[n];
        for method in &files[node.file].methods[node.index] {
            ast.combine(method.ast.clone());
            origins.insert(method.name.clone(), method.origin.clone());
        }
    }
    TypeProgram {
        type_name: compiled.name.as_str().into(),
        ast,
        hooks: compiled.hooks,
        fields: compiled.fields.clone(),
        origins,
    }
}

fn default_value(kind: FieldKind, literal: &Literal) -> Option<Dynamic> {
    let value = match (kind, literal) {
        (FieldKind::Int, Literal::Int(value)) => Dynamic::from_int(*value),
        (FieldKind::Float, Literal::Int(value)) => Dynamic::from_float(*value as FLOAT),
        (FieldKind::Float, Literal::Float(value)) => Dynamic::from_float(*value),
        (FieldKind::Bool, Literal::Bool(value)) => Dynamic::from_bool(*value),
        (FieldKind::Text, Literal::Text(value)) => Dynamic::from(value.clone()),
        (FieldKind::Vec2, Literal::Vector(c)) if c.len() == 2 => Dynamic::from(Vec2::new(c[0] as f32, c[1] as f32)),
        (FieldKind::Vec3, Literal::Vector(c)) if c.len() == 3 => {
            Dynamic::from(Vec3::new(c[0] as f32, c[1] as f32, c[2] as f32))
        }
        (FieldKind::Vec4, Literal::Vector(c)) if c.len() == 4 => {
            Dynamic::from(Vec4::new(c[0] as f32, c[1] as f32, c[2] as f32, c[3] as f32))
        }
        (FieldKind::Array, Literal::Array(_)) | (FieldKind::Map, Literal::Map(_)) => literal_value(literal),
        _ => return None,
    };
    Some(value)
}

fn literal_value(literal: &Literal) -> Dynamic {
    match literal {
        Literal::Int(value) => Dynamic::from_int(*value),
        Literal::Float(value) => Dynamic::from_float(*value),
        Literal::Bool(value) => Dynamic::from_bool(*value),
        Literal::Text(value) => Dynamic::from(value.clone()),
        Literal::Vector(c) => match c.as_slice() {
            [x, y] => Dynamic::from(Vec2::new(*x as f32, *y as f32)),
            [x, y, z] => Dynamic::from(Vec3::new(*x as f32, *y as f32, *z as f32)),
            [x, y, z, w] => Dynamic::from(Vec4::new(*x as f32, *y as f32, *z as f32, *w as f32)),
            _ => Dynamic::UNIT,
        },
        Literal::Array(items) => Dynamic::from_array(items.iter().map(literal_value).collect()),
        Literal::Map(entries) => {
            Dynamic::from_map(entries.iter().map(|(key, value)| (key.as_str().into(), literal_value(value))).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::tests::{compile_source, compile_sources};
    use crate::diagnostics::DiagnosticCode;

    fn codes(unit: &crate::compiler::CompiledUnit) -> Vec<DiagnosticCode> {
        unit.diagnostics.iter().map(|d| d.code).filter(|code| *code != DiagnosticCode::UnitSummary).collect()
    }

    #[test]
    fn bases_resolve_across_files_and_fields_are_inherited() {
        let unit = compile_sources(&[
            ("base.ks", "abstract type Rotator : Behaviour {\n    pub speed: float = 90;\n    fn update(ctx, dt) { this.angle += this.speed * dt; }\n}\n"),
            ("spinner.ks", "type Spinner : Rotator {\n    let angle: float;\n}\n"),
        ]);
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        let spinner = unit.find_type("Spinner").expect("spinner");
        assert_eq!(spinner.ancestry, vec!["Spinner".to_string(), "Rotator".to_string()]);
        let names: Vec<_> = spinner.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["speed", "angle"]);
        assert_eq!(spinner.fields[0].default.as_float().ok(), Some(90.0));
        assert!(spinner.program.is_some());
        assert!(unit.find_type("Rotator").expect("rotator").program.is_none());
    }

    #[test]
    fn unknown_base_and_cycles_are_errors() {
        let unit = compile_source(
            "bad.ks",
            "type A : Missing { fn update(ctx, dt) {} }\ntype B : C { }\ntype C : B { }\n",
        );
        assert!(!unit.passed());
        let found = codes(&unit);
        assert!(found.contains(&DiagnosticCode::UnknownBaseType));
        assert_eq!(found.iter().filter(|c| **c == DiagnosticCode::InheritanceCycle).count(), 2);
        assert!(unit.types.iter().all(|ty| ty.program.is_none()));
    }

    #[test]
    fn duplicate_names_used_as_a_base_only_warn() {
        let unit = compile_sources(&[
            ("a.ks", "type Twin : Behaviour { fn update(ctx, dt) {} }\n"),
            ("b.ks", "type Twin : Behaviour { fn update(ctx, dt) {} }\n"),
        ]);
        assert!(unit.passed(), "{:?}", unit.diagnostics);

        let unit = compile_sources(&[
            ("a.ks", "type Twin : Behaviour { fn update(ctx, dt) {} }\n"),
            ("b.ks", "type Twin : Behaviour { fn update(ctx, dt) {} }\ntype Child : Twin { }\n"),
        ]);
        assert_eq!(codes(&unit), vec![DiagnosticCode::AmbiguousBaseType]);
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        assert!(!unit.find_type("Child").expect("child").is_instantiable());
    }

    #[test]
    fn ambiguity_further_up_the_chain_excludes_descendants() {
        let unit = compile_sources(&[
            ("a.ks", "type Twin : Behaviour { fn update(ctx, dt) {} }\n"),
            ("b.ks", "type Twin : Behaviour { fn update(ctx, dt) {} }\ntype Child : Twin { }\ntype Grandchild : Child { }\n"),
        ]);
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        assert_eq!(codes(&unit), vec![DiagnosticCode::AmbiguousBaseType; 2]);
        let grandchild = unit.find_type("Grandchild").expect("grandchild");
        assert!(grandchild.program.is_none());
        assert!(!grandchild.is_instantiable());
    }

    #[test]
    fn helpers_from_any_file_are_visible_to_every_type() {
        let unit = compile_sources(&[
            ("helpers.ks", "fn double(x) { x * 2 }\n"),
            ("user.ks", "type User : Behaviour {\n    pub n: int = 1;\n    fn update(ctx, dt) { this.n = double(this.n); }\n}\n"),
        ]);
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        let program = unit.find_type("User").and_then(|ty| ty.program.clone()).expect("program");
        assert!(program.ast.iter_functions().any(|f| f.name == "double" && f.params.len() == 1));
        assert_eq!(program.origins["double"].path, std::path::PathBuf::from("helpers.ks"));
    }

    #[test]
    fn helper_redefined_in_another_file_is_an_error() {
        let unit = compile_sources(&[
            ("a.ks", "fn double(x) { x * 2 }\ntype A : Behaviour { fn update(ctx, dt) {} }\n"),
            ("b.ks", "fn double(x) { x + x }\nfn double() { 0 }\n"),
        ]);
        assert!(!unit.passed());
        let duplicates: Vec<_> = unit.errors().filter(|d| d.code == DiagnosticCode::DuplicateMethod).collect();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].location.path, std::path::PathBuf::from("b.ks"));
    }

    #[test]
    fn member_checks_report_each_problem() {
        let unit = compile_source(
            "members.ks",
            r#"
type Behaviour { }
abstract type Base : Behaviour { pub speed: float; }
type Probe : Base {
    pub speed: float;
    pub label: string = 3;
    pub count: int;
    pub count: int;
    fn update(ctx) { }
    fn helper() { }
    fn helper() { }
}
type Idle : Behaviour { pub x: int; }
type Data { pub y: int; }
"#,
        );
        let found = codes(&unit);
        for expected in [
            DiagnosticCode::ReservedTypeName,
            DiagnosticCode::ShadowedField,
            DiagnosticCode::DefaultKindMismatch,
            DiagnosticCode::DuplicateField,
            DiagnosticCode::HookSignature,
            DiagnosticCode::DuplicateMethod,
            DiagnosticCode::NoHooks,
            DiagnosticCode::NotABehaviour,
        ] {
            assert!(found.contains(&expected), "missing {expected:?} in {found:?}");
        }
    }

    #[test]
    fn child_methods_override_parent_methods() {
        let unit = compile_source(
            "override.ks",
            r#"
fn step() { 1 }
abstract type Base : Behaviour {
    pub n: int;
    fn update(ctx, dt) { this.n += this.amount(); }
    fn amount() { step() }
}
type Double : Base {
    fn amount() { step() * 2 }
}
"#,
        );
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        let program = unit.find_type("Double").and_then(|ty| ty.program.clone()).expect("program");
        assert!(program.hooks.contains(crate::behaviour::HookSet::UPDATE));
        assert_eq!(program.origins["amount"].decl_line, 9);
    }
}
