use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::{Diagnostic, DiagnosticCode, SourceLocation};

use super::syntax::SyntaxTree;

/// Always in scope; `use core;` is accepted and ignored.
pub const CORE_MODULE: &str = "core";

/// Rhai's own namespace for module-level constants.
const GLOBAL_NAMESPACE: &str = "global";

const STANDARD_MODULES: [&str; 5] = ["entity", "math", "physics", "audio", "input"];

/// Host modules a behaviour module may `use`. Fixed for a given host build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSet {
    modules: BTreeSet<&'static str>,
}

impl ReferenceSet {
    pub fn standard() -> Self {
        Self { modules: STANDARD_MODULES.into_iter().collect() }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.iter().copied()
    }
}

impl Default for ReferenceSet {
    fn default() -> Self {
        Self::standard()
    }
}

pub fn check_references(tree: &SyntaxTree, references: &ReferenceSet) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut declared = BTreeMap::new();
    for decl in &tree.uses {
        if decl.module == CORE_MODULE {
            continue;
        }
        if !references.contains(&decl.module) {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::UnknownModule,
                decl.location.clone(),
                format!("unknown module `{}`; available: {}", decl.module, available(references)),
            ));
            continue;
        }
        declared.entry(decl.module.as_str()).or_insert(&decl.location);
    }

    let bodies = tree
        .functions
        .iter()
        .chain(tree.types.iter().flat_map(|ty| ty.methods.iter()))
        .map(|function| &function.body);
    let mut used = BTreeSet::new();
    for body in bodies {
        for module_ref in &body.module_refs {
            let name = module_ref.name.as_str();
            if name == GLOBAL_NAMESPACE {
                continue;
            }
            let location = SourceLocation::new(&tree.path, module_ref.line, module_ref.col);
            if !references.contains(name) {
                diagnostics.push(Diagnostic::new(
                    DiagnosticCode::UnknownModule,
                    location,
                    format!("unknown module `{name}`; available: {}", available(references)),
                ));
            } else if !declared.contains_key(name) {
                diagnostics.push(Diagnostic::new(
                    DiagnosticCode::UndeclaredModule,
                    location,
                    format!("module `{name}` is used without `use {name};`"),
                ));
            } else {
                used.insert(name);
            }
        }
    }

    for (name, location) in declared {
        if !used.contains(name) {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::UnusedModule,
                location.clone(),
                format!("`use {name};` is never referenced"),
            ));
        }
    }
    diagnostics
}

fn available(references: &ReferenceSet) -> String {
    references.modules().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::syntax::parse_module;
    use std::path::Path;

    fn check(source: &str) -> Vec<Diagnostic> {
        let (tree, syntax) = parse_module(Path::new("refs.ks"), source);
        assert!(syntax.is_empty(), "syntax errors: {syntax:?}");
        check_references(&tree, &ReferenceSet::standard())
    }

    #[test]
    fn declared_and_used_modules_are_clean() {
        let diagnostics = check("use core;\nuse math;\nfn f(x) { math::clamp(x, 0.0, 1.0) }");
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
    }

    #[test]
    fn unknown_undeclared_and_unused_are_reported() {
        let diagnostics = check("use network;\nuse audio;\nfn f(ctx) { physics::apply_impulse(ctx, vec2(0.0, 1.0)); }");
        let codes: Vec<_> = diagnostics.iter().map(|d| d.code).collect();
        assert_eq!(
            codes,
            vec![DiagnosticCode::UnknownModule, DiagnosticCode::UndeclaredModule, DiagnosticCode::UnusedModule]
        );
        assert_eq!(diagnostics[1].location.line, 3);
        assert_eq!(diagnostics[1].location.column, 13);
        assert!(!diagnostics[2].is_error());
    }
}
