use std::path::PathBuf;

use anyhow::{bail, Result};
use kestrel_scripting::compiler::references::ReferenceSet;
use kestrel_scripting::compiler::Compiler;
use kestrel_scripting::config::ScriptsConfig;
use kestrel_scripting::init_tracing;
use kestrel_scripting::runtime::export_unit;
use kestrel_scripting::watcher::SourceWatcher;

/// Usage: script_check [SCRIPT_DIR] [EXPORT_DIR]
///
/// Compiles every behaviour module under SCRIPT_DIR, prints the diagnostics, and when an
/// export directory is given writes the unit and its debug symbols there.
fn main() -> Result<()> {
    init_tracing("warn");
    let args: Vec<_> = std::env::args().collect();
    let script_root = args.get(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("assets/scripts"));
    let export_dir = args.get(2).map(PathBuf::from);
    println!("[script-check] compiling behaviours under '{}'", script_root.display());

    let config = ScriptsConfig { root: script_root, recursive: true, ..ScriptsConfig::default() };
    let mut watcher = SourceWatcher::from_config(&config);
    watcher.rescan()?;
    let batch = watcher.load_sources();
    let mut compiler = Compiler::new(ReferenceSet::standard()).with_debug_symbols(export_dir.is_some());
    let unit = compiler.compile_batch(&batch);
    for diagnostic in &unit.diagnostics {
        println!("{diagnostic}");
    }
    let summary = unit.summary();
    if !unit.passed() {
        bail!("{} file(s) failed to compile: {summary}", batch.files.len());
    }
    if let Some(dir) = export_dir {
        let exported = export_unit(&unit, &dir, "behaviours")?;
        println!("[script-check] wrote {}", exported.executable.display());
        if let Some(symbols) = exported.symbols {
            println!("[script-check] wrote {}", symbols.display());
        }
    }
    println!("[script-check] ok: {} type(s), {summary}", unit.types.len());
    Ok(())
}
