//! Frame driver and reload orchestrator.
//!
//! [`ScriptRuntime`] is the single owner of everything a reload touches: the watcher, the
//! compiler, the active unit, the registry and the attachment table. A reload either swaps
//! all of them at once or leaves all of them alone.

use rhai::Engine;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use uuid::Uuid;

use crate::api::{build_engine, CommandSink, ScriptCommand};
use crate::behaviour::{EntityId, HookHost};
use crate::compiler::references::ReferenceSet;
use crate::compiler::{CompiledUnit, Compiler};
use crate::config::RuntimeConfig;
use crate::diagnostics::{Diagnostic, Severity};
use crate::events::{CollisionEvent, FrameInput, InputEvent};
use crate::lifecycle::{Attachment, LifecycleManager, RecordedError};
use crate::reflect::{self, FieldEntry, FieldTable, FieldValue, ReflectError};
use crate::registry::TypeRegistry;
use crate::watcher::{SourceBatch, SourceFile, SourceWatcher, WatchStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The unit was activated and every attachment was re-resolved against it.
    Activated { unit_id: Uuid, types: usize, rebound: usize, failed: usize },
    /// The unit had errors; the previous unit keeps running.
    Rejected { errors: usize },
}

#[derive(Debug, Clone)]
pub struct ReloadReport {
    pub outcome: ReloadOutcome,
    pub diagnostics: Vec<Diagnostic>,
}

impl ReloadReport {
    pub fn activated(&self) -> bool {
        matches!(self.outcome, ReloadOutcome::Activated { .. })
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no compiled unit is active")]
    NoActiveUnit,
    #[error("unit `{0}` was rejected and has nothing to export")]
    Rejected(Uuid),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFiles {
    pub executable: PathBuf,
    pub symbols: Option<PathBuf>,
}

/// Writes `<unit_name>.ksu` and, when the unit carries them, `<unit_name>.ksym.json`.
pub fn export_unit(unit: &CompiledUnit, output_dir: &Path, unit_name: &str) -> Result<ExportedFiles, ExportError> {
    if !unit.passed() || unit.executable_blob.is_empty() {
        return Err(ExportError::Rejected(unit.id));
    }
    fs::create_dir_all(output_dir).map_err(|source| ExportError::Io { path: output_dir.to_path_buf(), source })?;
    let executable = output_dir.join(format!("{unit_name}.ksu"));
    write_file(&executable, &unit.executable_blob)?;
    let symbols = match &unit.debug_symbols_blob {
        Some(blob) => {
            let path = output_dir.join(format!("{unit_name}.ksym.json"));
            write_file(&path, blob)?;
            Some(path)
        }
        None => None,
    };
    tracing::info!(unit = %unit.id, path = %executable.display(), symbols = symbols.is_some(), "exported unit");
    Ok(ExportedFiles { executable, symbols })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    fs::write(path, bytes).map_err(|source| ExportError::Io { path: path.to_path_buf(), source })
}

pub struct ScriptRuntime {
    config: RuntimeConfig,
    engine: Engine,
    sink: CommandSink,
    input: Rc<FrameInput>,
    watcher: SourceWatcher,
    compiler: Compiler,
    active: Option<CompiledUnit>,
    registry: TypeRegistry,
    lifecycle: LifecycleManager,
    last_diagnostics: Vec<Diagnostic>,
}

impl ScriptRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let references = ReferenceSet::standard();
        let sink = CommandSink::default();
        let engine = build_engine(&references, &config.limits, &sink);
        let compiler = Compiler::new(references).with_debug_symbols(config.scripts.debug_symbols);
        Self {
            watcher: SourceWatcher::from_config(&config.scripts),
            lifecycle: LifecycleManager::new(&config.reload),
            engine,
            sink,
            input: Rc::new(FrameInput::default()),
            compiler,
            active: None,
            registry: TypeRegistry::default(),
            last_diagnostics: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// One host tick: poll for changes (reloading synchronously if any), then create and
    /// update instances, then deliver this frame's input events.
    pub fn frame(&mut self, dt: f32, input: FrameInput) -> Option<ReloadReport> {
        self.input = Rc::new(input);
        let report = self.reload_if_changed();
        self.tick(dt);
        let events = self.input.events.clone();
        for event in &events {
            self.dispatch_input(event);
        }
        report
    }

    pub fn reload_if_changed(&mut self) -> Option<ReloadReport> {
        match self.watcher.poll() {
            WatchStatus::NoChange => None,
            WatchStatus::ChangeDetected(changes) => {
                tracing::info!(
                    root = %self.watcher.root().display(),
                    added = changes.added.len(),
                    modified = changes.modified.len(),
                    removed = changes.removed.len(),
                    "script change detected; recompiling"
                );
                let batch = self.watcher.load_sources();
                Some(self.reload_batch(&batch))
            }
        }
    }

    /// Rescans and recompiles even when nothing looks changed.
    pub fn force_reload(&mut self) -> ReloadReport {
        if let Err(err) = self.watcher.rescan() {
            tracing::warn!(root = %self.watcher.root().display(), "script directory scan failed: {err:#}");
        }
        let batch = self.watcher.load_sources();
        self.reload_batch(&batch)
    }

    /// Compiles an in-memory corpus, bypassing the watcher.
    pub fn reload_from_sources(&mut self, sources: &[SourceFile]) -> ReloadReport {
        let unit = self.compiler.compile(sources);
        self.activate(unit)
    }

    fn reload_batch(&mut self, batch: &SourceBatch) -> ReloadReport {
        let unit = self.compiler.compile_batch(batch);
        self.activate(unit)
    }

    fn activate(&mut self, unit: CompiledUnit) -> ReloadReport {
        for diagnostic in &unit.diagnostics {
            match diagnostic.severity {
                Severity::Error => tracing::error!("{diagnostic}"),
                Severity::Warning => tracing::warn!("{diagnostic}"),
                Severity::Info => tracing::debug!("{diagnostic}"),
            }
        }
        self.last_diagnostics = unit.diagnostics.clone();
        if !unit.passed() {
            let errors = unit.errors().count();
            tracing::warn!(unit = %unit.id, errors, "script unit rejected; keeping the previous unit");
            return ReloadReport { outcome: ReloadOutcome::Rejected { errors }, diagnostics: unit.diagnostics };
        }

        self.registry = TypeRegistry::build(&unit);
        let host = HookHost { engine: &self.engine, sink: &self.sink, input: &self.input };
        let summary = self.lifecycle.on_reload_succeeded(&self.registry, &host);
        let outcome = ReloadOutcome::Activated {
            unit_id: unit.id,
            types: self.registry.len(),
            rebound: summary.rebound,
            failed: summary.failed,
        };
        tracing::info!(
            unit = %unit.id,
            types = self.registry.len(),
            rebound = summary.rebound,
            failed = summary.failed,
            "script unit activated"
        );
        let diagnostics = unit.diagnostics.clone();
        if let Some(previous) = self.active.replace(unit) {
            tracing::debug!(unit = %previous.id, "previous unit retired");
        }
        ReloadReport { outcome, diagnostics }
    }

    pub fn tick(&mut self, dt: f32) {
        let host = HookHost { engine: &self.engine, sink: &self.sink, input: &self.input };
        self.lifecycle.tick(&self.registry, &host, dt);
    }

    pub fn attach(&mut self, entity: EntityId, type_name: impl Into<String>) -> bool {
        self.lifecycle.attach(entity, type_name)
    }

    pub fn detach(&mut self, entity: EntityId, type_name: &str) -> bool {
        let host = HookHost { engine: &self.engine, sink: &self.sink, input: &self.input };
        self.lifecycle.detach(entity, type_name, &host)
    }

    pub fn detach_entity(&mut self, entity: EntityId) -> usize {
        let host = HookHost { engine: &self.engine, sink: &self.sink, input: &self.input };
        self.lifecycle.detach_entity(entity, &host)
    }

    pub fn dispatch_input(&mut self, event: &InputEvent) {
        let host = HookHost { engine: &self.engine, sink: &self.sink, input: &self.input };
        self.lifecycle.dispatch_input(&host, event);
    }

    pub fn dispatch_collision(&mut self, event: &CollisionEvent) {
        let host = HookHost { engine: &self.engine, sink: &self.sink, input: &self.input };
        self.lifecycle.dispatch_collision(&host, event);
    }

    pub fn list_fields(&self, entity: EntityId, type_name: &str) -> Result<Vec<FieldEntry>, ReflectError> {
        let table = self.field_table(type_name)?;
        let instance = self
            .lifecycle
            .find(entity, type_name)
            .and_then(Attachment::instance)
            .ok_or_else(|| no_instance(entity, type_name))?;
        Ok(reflect::list_fields(table, instance))
    }

    pub fn get_field(&self, entity: EntityId, type_name: &str, field: &str) -> Result<FieldValue, ReflectError> {
        let table = self.field_table(type_name)?;
        let instance = self
            .lifecycle
            .find(entity, type_name)
            .and_then(Attachment::instance)
            .ok_or_else(|| no_instance(entity, type_name))?;
        reflect::get_field(table, instance, field)
    }

    pub fn set_field(
        &mut self,
        entity: EntityId,
        type_name: &str,
        field: &str,
        value: FieldValue,
    ) -> Result<(), ReflectError> {
        let table = self.registry.field_table(type_name).ok_or_else(|| ReflectError::UnknownType(type_name.to_string()))?;
        let instance = self
            .lifecycle
            .find_mut(entity, type_name)
            .and_then(Attachment::instance_mut)
            .ok_or_else(|| no_instance(entity, type_name))?;
        reflect::set_field(table, instance, field, value)
    }

    fn field_table(&self, type_name: &str) -> Result<&FieldTable, ReflectError> {
        self.registry.field_table(type_name).ok_or_else(|| ReflectError::UnknownType(type_name.to_string()))
    }

    pub fn export_symbols(&self, output_dir: impl AsRef<Path>, unit_name: &str) -> Result<ExportedFiles, ExportError> {
        let unit = self.active.as_ref().ok_or(ExportError::NoActiveUnit)?;
        export_unit(unit, output_dir.as_ref(), unit_name)
    }

    pub fn take_commands(&self) -> Vec<ScriptCommand> {
        self.sink.take_commands()
    }

    pub fn take_logs(&self) -> Vec<String> {
        self.sink.take_logs()
    }

    /// Diagnostics of the most recent compile, activated or not.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.last_diagnostics
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn active_unit(&self) -> Option<&CompiledUnit> {
        self.active.as_ref()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn hook_errors(&self) -> impl Iterator<Item = &RecordedError> {
        self.lifecycle.errors()
    }

    pub fn take_hook_errors(&mut self) -> Vec<RecordedError> {
        self.lifecycle.take_errors()
    }
}

fn no_instance(entity: EntityId, type_name: &str) -> ReflectError {
    ReflectError::NoInstance { entity: entity.to_string(), type_name: type_name.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tests::sources;
    use crate::lifecycle::AttachmentState;

    const COUNTER: &str = r#"
type Counter : Behaviour {
    pub step: int = 1;
    pub total: int;
    fn update(ctx, dt) { this.total += this.step; }
}
"#;

    fn runtime() -> ScriptRuntime {
        ScriptRuntime::new(RuntimeConfig::default())
    }

    #[test]
    fn rejected_reload_keeps_the_running_unit() {
        let mut runtime = runtime();
        let first = runtime.reload_from_sources(&sources(&[("counter.ks", COUNTER)]));
        assert!(first.activated(), "{:?}", first.diagnostics);
        let owner = EntityId::from_raw(1);
        runtime.attach(owner, "Counter");
        runtime.tick(0.1);
        runtime.tick(0.1);
        let unit_id = runtime.active_unit().map(|unit| unit.id);

        let broken = runtime.reload_from_sources(&sources(&[("counter.ks", "type Counter : Behaviour { fn update(ctx) {} }")]));
        assert_eq!(broken.outcome, ReloadOutcome::Rejected { errors: 1 });
        assert_eq!(runtime.active_unit().map(|unit| unit.id), unit_id);
        assert_eq!(runtime.get_field(owner, "Counter", "total"), Ok(FieldValue::Int(2)));
        assert!(runtime.diagnostics().iter().any(Diagnostic::is_error));
    }

    #[test]
    fn reflection_round_trips_through_the_runtime() {
        let mut runtime = runtime();
        runtime.reload_from_sources(&sources(&[("counter.ks", COUNTER)]));
        let owner = EntityId::from_raw(4);
        assert!(matches!(
            runtime.get_field(owner, "Counter", "step"),
            Err(ReflectError::NoInstance { .. })
        ));
        runtime.attach(owner, "Counter");
        runtime.tick(0.0);
        runtime.set_field(owner, "Counter", "step", FieldValue::Int(5)).expect("set step");
        runtime.tick(0.0);
        let fields = runtime.list_fields(owner, "Counter").expect("list");
        let names: Vec<_> = fields.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["step", "total"]);
        assert_eq!(runtime.get_field(owner, "Counter", "total"), Ok(FieldValue::Int(6)));
        assert_eq!(
            runtime.get_field(owner, "Nope", "total"),
            Err(ReflectError::UnknownType("Nope".to_string()))
        );
    }

    #[test]
    fn attachments_made_before_the_first_unit_bind_on_activation() {
        let mut runtime = runtime();
        let owner = EntityId::from_raw(2);
        runtime.attach(owner, "Counter");
        runtime.tick(0.1);
        assert_eq!(runtime.lifecycle().attachments()[0].state(), AttachmentState::Pending);
        let report = runtime.reload_from_sources(&sources(&[("counter.ks", COUNTER)]));
        assert!(matches!(report.outcome, ReloadOutcome::Activated { rebound: 1, failed: 0, types: 1, .. }));
        assert_eq!(runtime.lifecycle().attachments()[0].state(), AttachmentState::Live);
    }

    #[test]
    fn export_requires_an_active_unit() {
        let runtime = runtime();
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(runtime.export_symbols(dir.path(), "game"), Err(ExportError::NoActiveUnit)));
    }
}
