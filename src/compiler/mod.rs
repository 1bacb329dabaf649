//! Turns a corpus of behaviour modules into a [`CompiledUnit`].
//!
//! Each file is parsed on its own and cached by content hash. Method bodies are lowered
//! to standalone Rhai functions and compiled individually so syntax errors point at the
//! right line. Linking then resolves base types across the whole corpus and assembles
//! one program per concrete behaviour type.

pub mod link;
pub mod references;
pub mod symbols;
pub mod syntax;

use anyhow::Result;
use rhai::{Engine, AST};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;
use uuid::Uuid;

use crate::api::{build_engine, CommandSink};
use crate::config::LimitsConfig;
use crate::diagnostics::{passes, Diagnostic, DiagnosticCode, DiagnosticSummary, SourceLocation};
use crate::watcher::{SourceBatch, SourceFile};

pub use link::{CompiledType, FieldSpec, TypeProgram};
use references::{check_references, ReferenceSet};
use symbols::{DebugSymbols, FieldImage, FunctionImage, FunctionOrigin, ModuleImage, SymbolEntry, TypeImage, UnitImage, HOST_ABI_VERSION};
use syntax::{parse_module, FnDecl, SyntaxTree, Visibility};

/// A function body lowered to `fn name(params) { body }` and compiled.
#[derive(Debug, Clone)]
pub struct LoweredFn {
    pub name: String,
    pub params: Vec<String>,
    pub lowered: String,
    pub ast: AST,
    pub origin: FunctionOrigin,
}

impl LoweredFn {
    fn image(&self) -> FunctionImage {
        FunctionImage { name: self.name.clone(), params: self.params.clone(), lowered: self.lowered.clone() }
    }
}

/// Per-file front-end result, reused while the file's content hash is unchanged.
#[derive(Debug)]
pub struct ParsedFile {
    pub path: PathBuf,
    pub hash: blake3::Hash,
    pub tree: SyntaxTree,
    pub functions: Vec<LoweredFn>,
    /// Indexed like `tree.types`.
    pub methods: Vec<Vec<LoweredFn>>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub id: Uuid,
    pub corpus_hash: String,
    pub diagnostics: Vec<Diagnostic>,
    /// bincode-encoded [`UnitImage`]; empty when the unit was rejected.
    pub executable_blob: Vec<u8>,
    /// JSON [`DebugSymbols`], when requested.
    pub debug_symbols_blob: Option<Vec<u8>>,
    pub types: Vec<CompiledType>,
    /// Set iff no diagnostic is an error. Whether the unit is running is up to the runtime.
    pub is_active: bool,
}

impl CompiledUnit {
    /// A unit may be activated iff none of its diagnostics is an error.
    pub fn passed(&self) -> bool {
        passes(&self.diagnostics)
    }

    pub fn find_type(&self, name: &str) -> Option<&CompiledType> {
        self.types.iter().find(|ty| ty.name == name)
    }

    pub fn summary(&self) -> DiagnosticSummary {
        DiagnosticSummary::from_diagnostics(&self.diagnostics)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

pub struct Compiler {
    engine: Engine,
    references: ReferenceSet,
    cache: HashMap<PathBuf, Rc<ParsedFile>>,
    emit_debug_symbols: bool,
}

impl Compiler {
    pub fn new(references: ReferenceSet) -> Self {
        let engine = build_engine(&references, &LimitsConfig::default(), &CommandSink::default());
        Self { engine, references, cache: HashMap::new(), emit_debug_symbols: false }
    }

    pub fn with_debug_symbols(mut self, enabled: bool) -> Self {
        self.emit_debug_symbols = enabled;
        self
    }

    pub fn set_debug_symbols(&mut self, enabled: bool) {
        self.emit_debug_symbols = enabled;
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn cached_files(&self) -> usize {
        self.cache.len()
    }

    /// Compiles a batch from the watcher; notes about unreadable files lead the diagnostics
    /// and count towards the compile gate.
    pub fn compile_batch(&mut self, batch: &SourceBatch) -> CompiledUnit {
        self.compile_with(&batch.files, batch.diagnostics.clone())
    }

    pub fn compile(&mut self, sources: &[SourceFile]) -> CompiledUnit {
        self.compile_with(sources, Vec::new())
    }

    fn compile_with(&mut self, sources: &[SourceFile], mut diagnostics: Vec<Diagnostic>) -> CompiledUnit {
        let started = Instant::now();
        let id = Uuid::new_v4();
        let corpus_hash = corpus_hash(sources);
        let mut files = Vec::with_capacity(sources.len());
        let mut reused = 0usize;
        for source in sources {
            let hash = blake3::hash(source.raw_content.as_bytes());
            let parsed = match self.cache.get(&source.path) {
                Some(cached) if cached.hash == hash => {
                    reused += 1;
                    Rc::clone(cached)
                }
                _ => {
                    let parsed = Rc::new(self.parse_file(source, hash));
                    self.cache.insert(source.path.clone(), Rc::clone(&parsed));
                    parsed
                }
            };
            diagnostics.extend(parsed.diagnostics.iter().cloned());
            files.push(parsed);
        }
        self.cache.retain(|path, _| sources.iter().any(|source| &source.path == path));

        let front_end_passed = passes(&diagnostics);
        let linked = link::link(&files, front_end_passed);
        diagnostics.extend(linked.diagnostics);
        let mut types = linked.types;

        let mut executable_blob = Vec::new();
        let mut debug_symbols_blob = None;
        if passes(&diagnostics) {
            match self.emit(id, &corpus_hash, &files) {
                Ok((blob, symbols)) => {
                    executable_blob = blob;
                    debug_symbols_blob = symbols;
                }
                Err(err) => {
                    let location = sources
                        .first()
                        .map(|source| SourceLocation::file_start(&source.path))
                        .unwrap_or_else(|| SourceLocation::new(".", 1, 1));
                    diagnostics.push(Diagnostic::new(
                        DiagnosticCode::EmitFailure,
                        location,
                        format!("failed to emit unit: {err:#}"),
                    ));
                }
            }
        }
        if !passes(&diagnostics) {
            for ty in &mut types {
                ty.program = None;
            }
        }

        let is_active = passes(&diagnostics);
        let summary = DiagnosticSummary::from_diagnostics(&diagnostics);
        let location = sources
            .first()
            .and_then(|source| source.path.parent())
            .map(SourceLocation::file_start)
            .unwrap_or_else(|| SourceLocation::new(".", 1, 1));
        diagnostics.push(Diagnostic::new(
            DiagnosticCode::UnitSummary,
            location,
            format!(
                "unit {id}: {} file(s), {} type(s), {summary}",
                sources.len(),
                types.len()
            ),
        ));
        tracing::info!(
            unit = %id,
            files = sources.len(),
            reused,
            types = types.len(),
            errors = summary.errors,
            warnings = summary.warnings,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "compiled script unit"
        );

        CompiledUnit {
            id,
            corpus_hash,
            diagnostics,
            executable_blob,
            debug_symbols_blob,
            types,
            is_active,
        }
    }

    fn parse_file(&self, source: &SourceFile, hash: blake3::Hash) -> ParsedFile {
        let (tree, mut diagnostics) = parse_module(&source.path, &source.raw_content);
        diagnostics.extend(check_references(&tree, &self.references));
        let mut functions = Vec::with_capacity(tree.functions.len());
        for decl in &tree.functions {
            if let Some(lowered) = self.lower(&source.path, decl, &mut diagnostics) {
                functions.push(lowered);
            }
        }
        let mut methods = Vec::with_capacity(tree.types.len());
        for ty in &tree.types {
            let mut lowered_methods = Vec::with_capacity(ty.methods.len());
            for decl in &ty.methods {
                if let Some(lowered) = self.lower(&source.path, decl, &mut diagnostics) {
                    lowered_methods.push(lowered);
                }
            }
            methods.push(lowered_methods);
        }
        tracing::debug!(path = %source.path.display(), diagnostics = diagnostics.len(), "parsed script module");
        ParsedFile { path: source.path.clone(), hash, tree, functions, methods, diagnostics }
    }

    fn lower(&self, path: &Path, decl: &FnDecl, diagnostics: &mut Vec<Diagnostic>) -> Option<LoweredFn> {
        let header = format!("fn {}({}) {{", decl.name, decl.params.join(", "));
        let lowered = format!("{header}{}}}", decl.body.text);
        let origin = FunctionOrigin {
            path: path.to_path_buf(),
            decl_line: decl.location.line,
            decl_column: decl.location.column,
            body_line: decl.body.line,
            body_column: decl.body.col,
            header_len: header.chars().count(),
        };
        match self.engine.compile(&lowered) {
            Ok(ast) => Some(LoweredFn { name: decl.name.clone(), params: decl.params.clone(), lowered, ast, origin }),
            Err(err) => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticCode::BodySyntax,
                    origin.map(err.position()),
                    format!("in `{}`: {}", decl.name, err.err_type()),
                ));
                None
            }
        }
    }

    fn emit(&self, id: Uuid, corpus_hash: &str, files: &[Rc<ParsedFile>]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let mut image = UnitImage {
            abi_version: HOST_ABI_VERSION,
            unit_id: id.to_string(),
            corpus_hash: corpus_hash.to_string(),
            modules: Vec::with_capacity(files.len()),
            types: Vec::new(),
        };
        let mut symbols = DebugSymbols {
            abi_version: HOST_ABI_VERSION,
            unit_id: id.to_string(),
            corpus_hash: corpus_hash.to_string(),
            entries: Vec::new(),
        };
        for file in files {
            image.modules.push(ModuleImage {
                path: file.path.clone(),
                functions: file.functions.iter().map(LoweredFn::image).collect(),
            });
            symbols.entries.extend(file.functions.iter().map(|function| symbol_entry(None, function)));
            for (decl, methods) in file.tree.types.iter().zip(&file.methods) {
                image.types.push(TypeImage {
                    name: decl.name.clone(),
                    base: decl.base.as_ref().map(|(name, _)| name.clone()),
                    is_abstract: decl.is_abstract,
                    path: file.path.clone(),
                    fields: decl
                        .fields
                        .iter()
                        .map(|field| FieldImage {
                            name: field.name.clone(),
                            kind: field.kind.keyword().to_string(),
                            public: field.visibility == Visibility::Public,
                        })
                        .collect(),
                    methods: methods.iter().map(LoweredFn::image).collect(),
                });
                symbols.entries.extend(methods.iter().map(|method| symbol_entry(Some(&decl.name), method)));
            }
        }
        let blob = image.encode()?;
        let symbols = if self.emit_debug_symbols { Some(symbols.to_json()?) } else { None };
        Ok((blob, symbols))
    }
}

fn symbol_entry(type_name: Option<&str>, function: &LoweredFn) -> SymbolEntry {
    SymbolEntry {
        type_name: type_name.map(str::to_string),
        function: function.name.clone(),
        arity: function.params.len(),
        origin: function.origin.clone(),
    }
}

/// Order-sensitive hash over every (path, content) pair; sources arrive sorted by path.
fn corpus_hash(sources: &[SourceFile]) -> String {
    let mut hasher = blake3::Hasher::new();
    for source in sources {
        hasher.update(source.path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(source.raw_content.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::SystemTime;

    pub(crate) fn sources(files: &[(&str, &str)]) -> Vec<SourceFile> {
        files
            .iter()
            .map(|(path, text)| SourceFile {
                path: PathBuf::from(path),
                raw_content: text.to_string(),
                last_modified: SystemTime::UNIX_EPOCH,
            })
            .collect()
    }

    pub(crate) fn compile_sources(files: &[(&str, &str)]) -> CompiledUnit {
        Compiler::new(ReferenceSet::standard()).compile(&sources(files))
    }

    pub(crate) fn compile_source(path: &str, text: &str) -> CompiledUnit {
        compile_sources(&[(path, text)])
    }

    const SPINNER: &str = "use entity;\n\ntype Spinner : Behaviour {\n    pub speed: float = 90.0;\n    let angle: float;\n    fn update(ctx, dt) {\n        this.angle += this.speed * dt;\n        entity::set_rotation(ctx, this.angle);\n    }\n}\n";

    #[test]
    fn clean_unit_emits_blob_and_summary() {
        let mut compiler = Compiler::new(ReferenceSet::standard()).with_debug_symbols(true);
        let unit = compiler.compile(&sources(&[("spinner.ks", SPINNER)]));
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        assert_eq!(unit.diagnostics.last().map(|d| d.code), Some(DiagnosticCode::UnitSummary));
        let image = UnitImage::decode(&unit.executable_blob).expect("decode image");
        assert_eq!(image.unit_id, unit.id.to_string());
        assert_eq!(image.types[0].name, "Spinner");
        let symbols = DebugSymbols::from_json(unit.debug_symbols_blob.as_deref().expect("symbols")).expect("json");
        let update = symbols.lookup(Some("Spinner"), "update").expect("update symbol");
        assert_eq!(update.origin.decl_line, 6);
    }

    #[test]
    fn body_errors_are_mapped_to_source_lines() {
        let unit = compile_source(
            "broken.ks",
            "type Broken : Behaviour {\n    fn update(ctx, dt) {\n        let x = ;\n    }\n}\n",
        );
        assert!(!unit.passed());
        assert!(unit.executable_blob.is_empty());
        let error = unit.errors().next().expect("error");
        assert_eq!(error.code, DiagnosticCode::BodySyntax);
        assert_eq!(error.location.line, 3);
        assert!(unit.types.iter().all(|ty| ty.program.is_none()));
    }

    #[test]
    fn active_flag_follows_the_compile_gate() {
        let clean = compile_source("a.ks", "type A : Behaviour { fn update(ctx, dt) {} }");
        assert!(clean.passed());
        assert!(clean.is_active);
        let broken = compile_source("b.ks", "type B : Missing { fn update(ctx, dt) {} }");
        assert!(!broken.passed());
        assert!(!broken.is_active);
    }

    #[test]
    fn unreadable_sources_in_a_batch_block_the_unit() {
        let mut batch = SourceBatch { files: sources(&[("ok.ks", SPINNER), ("bad.ks", "")]), diagnostics: Vec::new() };
        batch.diagnostics.push(Diagnostic::new(
            DiagnosticCode::SourceUnreadable,
            SourceLocation::file_start(Path::new("bad.ks")),
            "stream did not contain valid UTF-8",
        ));
        let unit = Compiler::new(ReferenceSet::standard()).compile_batch(&batch);
        assert!(!unit.is_active);
        assert!(unit.executable_blob.is_empty());
        assert_eq!(unit.diagnostics.first().map(|d| d.code), Some(DiagnosticCode::SourceUnreadable));
    }

    #[test]
    fn undeclared_variables_are_compile_errors() {
        let unit = compile_source("strict.ks", "type S : Behaviour {\n    fn update(ctx, dt) { speed += dt; }\n}\n");
        let error = unit.errors().next().expect("strict variables");
        assert_eq!(error.code, DiagnosticCode::BodySyntax);
        assert_eq!(error.location.line, 2);
    }

    #[test]
    fn unchanged_files_are_served_from_the_cache() {
        let mut compiler = Compiler::new(ReferenceSet::standard());
        let first = compiler.compile(&sources(&[("a.ks", SPINNER), ("b.ks", "type B : Behaviour { fn on_create(ctx) {} }")]));
        let second = compiler.compile(&sources(&[("a.ks", SPINNER), ("b.ks", "type B : Behaviour { fn on_create(ctx) { } }")]));
        assert_ne!(first.id, second.id);
        assert_ne!(first.corpus_hash, second.corpus_hash);
        assert_eq!(compiler.cached_files(), 2);
        let third = compiler.compile(&sources(&[("a.ks", SPINNER)]));
        assert_eq!(compiler.cached_files(), 1);
        assert!(third.passed());
    }

    #[test]
    fn empty_corpus_passes_with_no_types() {
        let unit = Compiler::new(ReferenceSet::standard()).compile(&[]);
        assert!(unit.passed());
        assert!(unit.types.is_empty());
    }
}
