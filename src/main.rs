use anyhow::Result;
use kestrel_scripting::cli::CliOverrides;
use kestrel_scripting::config::RuntimeConfig;
use kestrel_scripting::ecs::{apply_commands, sync_attachments, ScriptWorld};
use kestrel_scripting::events::FrameInput;
use kestrel_scripting::time::Time;
use kestrel_scripting::{init_tracing, ReloadOutcome, ScriptRuntime};

const DEFAULT_CONFIG: &str = "config/runtime.json";

fn main() {
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    init_tracing("info");
    if let Err(err) = run(cli) {
        eprintln!("Application error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: CliOverrides) -> Result<()> {
    let mut config = match cli.config_path() {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::load_or_default(DEFAULT_CONFIG),
    };
    let overrides = cli.into_config_overrides();
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "applying command-line overrides");
        config.apply_overrides(&overrides);
    }

    let mut ecs = ScriptWorld::new();
    for entity in &config.harness.entities {
        let id = ecs.spawn_from_config(entity);
        tracing::info!(name = %entity.name, entity = %id, behaviours = ?entity.behaviours, "spawned entity");
    }
    let frames = config.harness.frames;
    let mut time = Time::fixed(config.harness.fixed_dt);
    let mut runtime = ScriptRuntime::new(config);
    let input = FrameInput::default();

    for frame in 0..frames {
        time.tick();
        sync_attachments(&mut ecs.world, &mut runtime);
        if let Some(report) = runtime.frame(time.delta_seconds(), input.carry_over()) {
            match report.outcome {
                ReloadOutcome::Activated { unit_id, types, rebound, failed } => {
                    tracing::info!(frame, %unit_id, types, rebound, failed, "reloaded behaviours");
                }
                ReloadOutcome::Rejected { errors } => {
                    for diagnostic in report.diagnostics.iter().filter(|d| d.is_error()) {
                        eprintln!("{diagnostic}");
                    }
                    tracing::warn!(frame, errors, "reload rejected; previous behaviours keep running");
                }
            }
        }
        for line in runtime.take_logs() {
            tracing::info!(target: "script", "{line}");
        }
        for command in apply_commands(&mut ecs.world, runtime.take_commands()) {
            tracing::debug!(?command, "no handler for script command in headless mode");
        }
        ecs.fixed_step(time.delta_seconds());
    }

    let faulted = runtime.hook_errors().count();
    tracing::info!(
        frames,
        elapsed = time.elapsed_seconds(),
        attachments = runtime.lifecycle().attachments().len(),
        hook_errors = faulted,
        "headless run finished"
    );
    Ok(())
}
