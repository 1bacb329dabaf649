use std::fs;

use kestrel_scripting::compiler::symbols::{DebugSymbols, UnitImage, HOST_ABI_VERSION};
use kestrel_scripting::config::RuntimeConfig;
use kestrel_scripting::runtime::ExportError;
use kestrel_scripting::ScriptRuntime;

const MOVER: &str = r#"use math;

fn half(x) { x * 0.5 }

type Mover : Behaviour {
    pub speed: float = 2.0;
    fn update(ctx, dt) {
        this.speed = math::clamp(half(this.speed), 0.0, 10.0);
    }
}
"#;

#[test]
fn active_unit_exports_executable_and_symbols() {
    let scripts = tempfile::tempdir().expect("scripts dir");
    let out = tempfile::tempdir().expect("output dir");
    fs::write(scripts.path().join("mover.ks"), MOVER).expect("write script");
    let mut config = RuntimeConfig::default();
    config.scripts.root = scripts.path().to_path_buf();
    config.scripts.debug_symbols = true;
    let mut runtime = ScriptRuntime::new(config);
    assert!(matches!(runtime.export_symbols(out.path(), "game"), Err(ExportError::NoActiveUnit)));

    let report = runtime.force_reload();
    assert!(report.activated(), "{:?}", report.diagnostics);
    let exported = runtime.export_symbols(out.path(), "game").expect("export");
    assert_eq!(exported.executable, out.path().join("game.ksu"));

    let image = UnitImage::load(&exported.executable).expect("load image");
    assert_eq!(image.abi_version, HOST_ABI_VERSION);
    let unit = runtime.active_unit().expect("active unit");
    assert_eq!(image.unit_id, unit.id.to_string());
    assert_eq!(image.corpus_hash, unit.corpus_hash);
    assert_eq!(image.types.len(), 1);
    assert_eq!(image.types[0].name, "Mover");

    let symbols_path = exported.symbols.expect("symbols requested");
    let symbols = DebugSymbols::from_json(&fs::read(symbols_path).expect("read symbols")).expect("parse symbols");
    let update = symbols.lookup(Some("Mover"), "update").expect("update symbol");
    assert_eq!(update.origin.decl_line, 7);
    let helper = symbols.lookup(None, "half").expect("helper symbol");
    assert_eq!(helper.origin.decl_line, 3);
}

#[test]
fn symbols_are_skipped_unless_requested() {
    let scripts = tempfile::tempdir().expect("scripts dir");
    let out = tempfile::tempdir().expect("output dir");
    fs::write(scripts.path().join("mover.ks"), MOVER).expect("write script");
    let mut config = RuntimeConfig::default();
    config.scripts.root = scripts.path().to_path_buf();
    let mut runtime = ScriptRuntime::new(config);
    assert!(runtime.force_reload().activated());
    let exported = runtime.export_symbols(out.path(), "game").expect("export");
    assert!(exported.symbols.is_none());
    assert!(!out.path().join("game.ksym.json").exists());
}
