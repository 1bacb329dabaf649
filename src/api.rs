//! Host API visible to behaviour scripts.
//!
//! Scripts never touch the world directly. Every effect is queued as a [`ScriptCommand`]
//! and applied by the host after the frame's callbacks have run.

use bevy_ecs::prelude::Entity;
use glam::{Vec2, Vec3, Vec4};
use rand::Rng;
use rhai::{Dynamic, Engine, ImmutableString, Module, FLOAT, INT};
use std::cell::RefCell;
use std::rc::Rc;

use crate::compiler::references::ReferenceSet;
use crate::config::LimitsConfig;
use crate::events::FrameInput;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    SetTranslation { entity: Entity, translation: Vec2 },
    SetRotation { entity: Entity, degrees: f32 },
    SetVelocity { entity: Entity, velocity: Vec2 },
    ApplyImpulse { entity: Entity, impulse: Vec2 },
    PlaySound { entity: Entity, clip: String },
    Despawn { entity: Entity },
}

#[derive(Default)]
struct SinkState {
    commands: Vec<ScriptCommand>,
    logs: Vec<String>,
}

/// Shared queue the script functions write into. Single-threaded by construction.
#[derive(Clone, Default)]
pub struct CommandSink(Rc<RefCell<SinkState>>);

impl CommandSink {
    pub fn push_command(&self, command: ScriptCommand) {
        self.0.borrow_mut().commands.push(command);
    }

    pub fn push_log(&self, message: impl Into<String>) {
        self.0.borrow_mut().logs.push(message.into());
    }

    pub fn take_commands(&self) -> Vec<ScriptCommand> {
        std::mem::take(&mut self.0.borrow_mut().commands)
    }

    pub fn take_logs(&self) -> Vec<String> {
        std::mem::take(&mut self.0.borrow_mut().logs)
    }

    pub fn pending_commands(&self) -> usize {
        self.0.borrow().commands.len()
    }
}

/// First argument of every hook (`ctx`). Identifies the calling instance.
#[derive(Clone)]
pub struct ScriptContext {
    entity: Entity,
    type_name: ImmutableString,
    sink: CommandSink,
    input: Rc<FrameInput>,
}

impl ScriptContext {
    pub fn new(entity: Entity, type_name: ImmutableString, sink: CommandSink, input: Rc<FrameInput>) -> Self {
        Self { entity, type_name, sink, input }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    fn emit(&self, command: ScriptCommand) {
        self.sink.push_command(command);
    }

    fn log(&mut self, value: Dynamic) {
        self.sink.push_log(format!("[{}#{}] {}", self.type_name, self.entity.index(), value));
    }
}

macro_rules! register_vector {
    ($engine:expr, $ty:ty, $name:literal, $ctor:literal, $($axis:ident),+) => {{
        $engine.register_type_with_name::<$ty>($name);
        $engine.register_fn($ctor, |$($axis: FLOAT),+| <$ty>::new($($axis as f32),+));
        $(
            $engine.register_get_set(
                stringify!($axis),
                |v: &mut $ty| v.$axis as FLOAT,
                |v: &mut $ty, value: FLOAT| v.$axis = value as f32,
            );
        )+
        $engine.register_fn("+", |a: $ty, b: $ty| a + b);
        $engine.register_fn("-", |a: $ty, b: $ty| a - b);
        $engine.register_fn("*", |a: $ty, s: FLOAT| a * s as f32);
        $engine.register_fn("==", |a: $ty, b: $ty| a == b);
        $engine.register_fn("length", |v: &mut $ty| v.length() as FLOAT);
        $engine.register_fn("to_string", |v: &mut $ty| format!("{v}"));
        $engine.register_fn("to_debug", |v: &mut $ty| format!("{v:?}"));
    }};
}

/// Engine used both to compile bodies and to run hooks, so calls resolve the same way
/// in both places.
pub fn build_engine(references: &ReferenceSet, limits: &LimitsConfig, sink: &CommandSink) -> Engine {
    let mut engine = Engine::new();
    engine.set_fast_operators(true);
    engine.set_strict_variables(true);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);

    let print_sink = sink.clone();
    engine.on_print(move |text| print_sink.push_log(format!("[print] {text}")));
    let debug_sink = sink.clone();
    engine.on_debug(move |text, source, pos| {
        let origin = source.unwrap_or("script");
        debug_sink.push_log(format!("[debug] {origin} @ {pos:?}: {text}"));
    });

    register_core(&mut engine);
    for name in references.modules() {
        if let Some(module) = build_module(name) {
            engine.register_static_module(name, module.into());
        }
    }
    engine
}

fn register_core(engine: &mut Engine) {
    register_vector!(engine, Vec2, "Vec2", "vec2", x, y);
    register_vector!(engine, Vec3, "Vec3", "vec3", x, y, z);
    register_vector!(engine, Vec4, "Vec4", "vec4", x, y, z, w);

    engine.register_type_with_name::<ScriptContext>("Context");
    engine.register_get("entity", |ctx: &mut ScriptContext| ctx.entity.to_bits() as INT);
    engine.register_get("type_name", |ctx: &mut ScriptContext| ctx.type_name.clone());
    engine.register_fn("log", ScriptContext::log);
}

fn build_module(name: &str) -> Option<Module> {
    let mut module = Module::new();
    match name {
        "entity" => {
            module.set_native_fn("set_translation", |ctx: ScriptContext, translation: Vec2| {
                ctx.emit(ScriptCommand::SetTranslation { entity: ctx.entity, translation });
                Ok(())
            });
            module.set_native_fn("set_rotation", |ctx: ScriptContext, degrees: FLOAT| {
                ctx.emit(ScriptCommand::SetRotation { entity: ctx.entity, degrees: degrees as f32 });
                Ok(())
            });
            module.set_native_fn("despawn", |ctx: ScriptContext| {
                ctx.emit(ScriptCommand::Despawn { entity: ctx.entity });
                Ok(())
            });
            module.set_native_fn("id", |ctx: ScriptContext| Ok(ctx.entity.to_bits() as INT));
        }
        "physics" => {
            module.set_native_fn("set_velocity", |ctx: ScriptContext, velocity: Vec2| {
                ctx.emit(ScriptCommand::SetVelocity { entity: ctx.entity, velocity });
                Ok(())
            });
            module.set_native_fn("apply_impulse", |ctx: ScriptContext, impulse: Vec2| {
                ctx.emit(ScriptCommand::ApplyImpulse { entity: ctx.entity, impulse });
                Ok(())
            });
        }
        "audio" => {
            module.set_native_fn("play", |ctx: ScriptContext, clip: ImmutableString| {
                ctx.emit(ScriptCommand::PlaySound { entity: ctx.entity, clip: clip.to_string() });
                Ok(())
            });
        }
        "input" => {
            module.set_native_fn("is_down", |ctx: ScriptContext, key: ImmutableString| {
                Ok(ctx.input.is_down(key.as_str()))
            });
        }
        "math" => {
            module.set_native_fn("lerp", |a: FLOAT, b: FLOAT, t: FLOAT| Ok(a + (b - a) * t));
            module.set_native_fn("clamp", |value: FLOAT, min: FLOAT, max: FLOAT| Ok(value.max(min).min(max)));
            module.set_native_fn("deg_to_rad", |degrees: FLOAT| Ok(degrees.to_radians()));
            module.set_native_fn("rad_to_deg", |radians: FLOAT| Ok(radians.to_degrees()));
            module.set_native_fn("pi", || Ok(std::f64::consts::PI as FLOAT));
            module.set_native_fn("rand", |min: FLOAT, max: FLOAT| {
                if min >= max {
                    return Ok(min);
                }
                Ok(rand::thread_rng().gen_range(min..max))
            });
            module.set_native_fn("length", |v: Vec2| Ok(v.length() as FLOAT));
            module.set_native_fn("length", |v: Vec3| Ok(v.length() as FLOAT));
            module.set_native_fn("normalize", |v: Vec2| Ok(v.normalize_or_zero()));
            module.set_native_fn("normalize", |v: Vec3| Ok(v.normalize_or_zero()));
            module.set_native_fn("dot", |a: Vec2, b: Vec2| Ok(a.dot(b) as FLOAT));
            module.set_native_fn("dot", |a: Vec3, b: Vec3| Ok(a.dot(b) as FLOAT));
        }
        _ => return None,
    }
    Some(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Scope;

    fn engine_with_sink() -> (Engine, CommandSink) {
        let sink = CommandSink::default();
        let engine = build_engine(&ReferenceSet::standard(), &LimitsConfig::default(), &sink);
        (engine, sink)
    }

    #[test]
    fn vectors_support_arithmetic_and_fields() {
        let (engine, _) = engine_with_sink();
        let v: Vec2 = engine.eval("let v = vec2(1.0, 2.0) + vec2(0.5, 0.5); v.x = v.x * 2.0; v * 2.0").expect("eval");
        assert_eq!(v, Vec2::new(6.0, 5.0));
        let len: FLOAT = engine.eval("math::length(vec3(3.0, 4.0, 0.0))").expect("eval");
        assert!((len - 5.0).abs() < 1e-6);
    }

    #[test]
    fn module_calls_queue_commands_for_the_context_entity() {
        let (engine, sink) = engine_with_sink();
        let entity = Entity::from_raw(4);
        let mut held = FrameInput::default();
        held.press("Space");
        let ctx = ScriptContext::new(entity, "Probe".into(), sink.clone(), Rc::new(held));
        let mut scope = Scope::new();
        scope.push("ctx", ctx);
        let down: bool = engine
            .eval_with_scope(
                &mut scope,
                "entity::set_rotation(ctx, 45.0); audio::play(ctx, \"ding\"); ctx.log(`at ${ctx.entity}`); input::is_down(ctx, \"Space\")",
            )
            .expect("eval");
        assert!(down);
        assert_eq!(
            sink.take_commands(),
            vec![
                ScriptCommand::SetRotation { entity, degrees: 45.0 },
                ScriptCommand::PlaySound { entity, clip: "ding".to_string() },
            ]
        );
        let logs = sink.take_logs();
        assert_eq!(logs, vec![format!("[Probe#4] at {}", entity.to_bits())]);
        assert_eq!(sink.pending_commands(), 0);
    }

    #[test]
    fn print_is_routed_into_the_log_queue() {
        let (engine, sink) = engine_with_sink();
        engine.run("print(\"hello\")").expect("run");
        assert_eq!(sink.take_logs(), vec!["[print] hello".to_string()]);
    }

    #[test]
    fn operation_limit_stops_runaway_loops() {
        let sink = CommandSink::default();
        let limits = LimitsConfig { max_operations: 1_000, max_call_levels: 8 };
        let engine = build_engine(&ReferenceSet::standard(), &limits, &sink);
        assert!(engine.run("loop { }").is_err());
    }
}
