use bitflags::bitflags;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Map, Scope, FLOAT};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use crate::api::{CommandSink, ScriptContext};
use crate::compiler::TypeProgram;
use crate::diagnostics::SourceLocation;
use crate::events::{CollisionEvent, FrameInput, InputEvent};

pub type EntityId = bevy_ecs::entity::Entity;

/// Name of the built-in base every behaviour type derives from.
pub const BEHAVIOUR_BASE: &str = "Behaviour";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    Create,
    Update,
    Destroy,
    Input,
    Collision,
}

impl Hook {
    pub const ALL: [Hook; 5] = [Hook::Create, Hook::Update, Hook::Destroy, Hook::Input, Hook::Collision];

    pub fn name(self) -> &'static str {
        match self {
            Hook::Create => "on_create",
            Hook::Update => "update",
            Hook::Destroy => "on_destroy",
            Hook::Input => "on_input",
            Hook::Collision => "on_collision",
        }
    }

    /// Parameter count including `ctx`.
    pub fn arity(self) -> usize {
        match self {
            Hook::Create | Hook::Destroy => 1,
            Hook::Update | Hook::Input | Hook::Collision => 2,
        }
    }

    pub fn signature(self) -> &'static str {
        match self {
            Hook::Create => "on_create(ctx)",
            Hook::Update => "update(ctx, dt)",
            Hook::Destroy => "on_destroy(ctx)",
            Hook::Input => "on_input(ctx, event)",
            Hook::Collision => "on_collision(ctx, other)",
        }
    }

    pub fn flag(self) -> HookSet {
        match self {
            Hook::Create => HookSet::CREATE,
            Hook::Update => HookSet::UPDATE,
            Hook::Destroy => HookSet::DESTROY,
            Hook::Input => HookSet::INPUT,
            Hook::Collision => HookSet::COLLISION,
        }
    }

    pub fn from_name(name: &str) -> Option<Hook> {
        Hook::ALL.into_iter().find(|hook| hook.name() == name)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HookSet: u8 {
        const CREATE = 1 << 0;
        const UPDATE = 1 << 1;
        const DESTROY = 1 << 2;
        const INPUT = 1 << 3;
        const COLLISION = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{type_name}.{hook} failed{}: {message}", .location.as_ref().map(|l| format!(" at {l}")).unwrap_or_default())]
pub struct HookError {
    pub type_name: String,
    pub hook: Hook,
    pub message: String,
    pub location: Option<SourceLocation>,
}

/// What a hook may reach while it runs.
pub struct HookHost<'a> {
    pub engine: &'a Engine,
    pub sink: &'a CommandSink,
    pub input: &'a Rc<FrameInput>,
}

/// A live behaviour bound to one entity. Hooks a type does not define are no-ops.
pub trait Behaviour {
    fn type_name(&self) -> &str;
    fn owner(&self) -> EntityId;

    fn on_create(&mut self, _host: &HookHost<'_>) -> Result<(), HookError> {
        Ok(())
    }

    fn update(&mut self, _host: &HookHost<'_>, _dt: f32) -> Result<(), HookError> {
        Ok(())
    }

    fn on_destroy(&mut self, _host: &HookHost<'_>) -> Result<(), HookError> {
        Ok(())
    }

    fn on_input(&mut self, _host: &HookHost<'_>, _event: &InputEvent) -> Result<(), HookError> {
        Ok(())
    }

    fn on_collision(&mut self, _host: &HookHost<'_>, _event: &CollisionEvent) -> Result<(), HookError> {
        Ok(())
    }

    fn read_field(&self, name: &str) -> Option<Dynamic>;

    /// Returns false when the instance has no field called `name`.
    fn write_field(&mut self, name: &str, value: Dynamic) -> bool;
}

/// Instance of a compiled script type. Field storage is the object map bound to `this`.
pub struct ScriptInstance {
    program: Rc<TypeProgram>,
    owner: EntityId,
    fields: Map,
}

impl ScriptInstance {
    pub fn new(program: Rc<TypeProgram>, owner: EntityId) -> Self {
        let fields = program.initial_fields();
        Self { program, owner, fields }
    }

    pub fn program(&self) -> &Rc<TypeProgram> {
        &self.program
    }

    fn invoke<A: FuncArgs>(
        &mut self,
        host: &HookHost<'_>,
        hook: Hook,
        make_args: impl FnOnce(ScriptContext) -> A,
    ) -> Result<(), HookError> {
        if !self.program.hooks.contains(hook.flag()) {
            return Ok(());
        }
        let ctx = ScriptContext::new(self.owner, self.program.type_name.clone(), host.sink.clone(), Rc::clone(host.input));
        let mut this = Dynamic::from_map(std::mem::take(&mut self.fields));
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut this);
        let result =
            host.engine.call_fn_with_options::<Dynamic>(options, &mut scope, &self.program.ast, hook.name(), make_args(ctx));
        match this.try_cast::<Map>() {
            Some(fields) => self.fields = fields,
            None => {
                tracing::warn!(type_name = %self.program.type_name, hook = hook.name(), "`this` was replaced by a non-map value; fields reset");
                self.fields = self.program.initial_fields();
            }
        }
        result.map(|_| ()).map_err(|err| hook_error(&self.program, hook, err))
    }
}

impl Behaviour for ScriptInstance {
    fn type_name(&self) -> &str {
        self.program.type_name.as_str()
    }

    fn owner(&self) -> EntityId {
        self.owner
    }

    fn on_create(&mut self, host: &HookHost<'_>) -> Result<(), HookError> {
        self.invoke(host, Hook::Create, |ctx| (ctx,))
    }

    fn update(&mut self, host: &HookHost<'_>, dt: f32) -> Result<(), HookError> {
        self.invoke(host, Hook::Update, |ctx| (ctx, dt as FLOAT))
    }

    fn on_destroy(&mut self, host: &HookHost<'_>) -> Result<(), HookError> {
        self.invoke(host, Hook::Destroy, |ctx| (ctx,))
    }

    fn on_input(&mut self, host: &HookHost<'_>, event: &InputEvent) -> Result<(), HookError> {
        let event = event.to_dynamic();
        self.invoke(host, Hook::Input, |ctx| (ctx, event))
    }

    fn on_collision(&mut self, host: &HookHost<'_>, event: &CollisionEvent) -> Result<(), HookError> {
        let other = event.to_dynamic_for(self.owner);
        self.invoke(host, Hook::Collision, |ctx| (ctx, other))
    }

    fn read_field(&self, name: &str) -> Option<Dynamic> {
        self.fields.get(name).cloned()
    }

    fn write_field(&mut self, name: &str, value: Dynamic) -> bool {
        match self.fields.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

/// Unwraps nested call frames to the innermost error and maps its position back into
/// the behaviour source.
fn hook_error(program: &TypeProgram, hook: Hook, err: Box<EvalAltResult>) -> HookError {
    let mut function = hook.name().to_string();
    let mut err = err;
    let mut leaf = loop {
        match *err {
            EvalAltResult::ErrorInFunctionCall(name, _, inner, _) => {
                function = name;
                err = inner;
            }
            other => break other,
        }
    };
    let position = leaf.take_position();
    let location = program.origins.get(&function).map(|origin| origin.map(position));
    HookError { type_name: program.type_name.to_string(), hook, message: leaf.to_string(), location }
}
