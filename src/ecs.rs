use bevy_ecs::prelude::*;
use glam::Vec2;
use std::collections::BTreeSet;

use crate::api::ScriptCommand;
use crate::config::HarnessEntity;
use crate::runtime::ScriptRuntime;

// ---------- Components ----------
#[derive(Component, Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub translation: Vec2,
    /// Radians.
    pub rotation: f32,
    pub scale: Vec2,
}
impl Default for Transform {
    fn default() -> Self {
        Self { translation: Vec2::ZERO, rotation: 0.0, scale: Vec2::splat(1.0) }
    }
}
#[derive(Component, Clone, Copy, Debug, Default, PartialEq)]
pub struct Velocity(pub Vec2);
#[derive(Component, Clone, Debug, PartialEq, Eq)]
pub struct EntityName(pub String);

/// Behaviour types to run on this entity, by name. The runtime owns the instances.
#[derive(Component, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptBehaviour {
    pub script_types: Vec<String>,
}

impl ScriptBehaviour {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { script_types: types.into_iter().map(Into::into).collect() }
    }
}

#[derive(Resource, Default)]
pub struct TimeDelta(pub f32);

// ---------- World container ----------
pub struct ScriptWorld {
    pub world: World,
    schedule_fixed: Schedule,
}

impl Default for ScriptWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptWorld {
    pub fn new() -> Self {
        let mut world = World::new();
        world.insert_resource(TimeDelta(0.0));
        let mut schedule_fixed = Schedule::default();
        schedule_fixed.add_systems(sys_integrate_velocities);
        Self { world, schedule_fixed }
    }

    pub fn spawn_scripted(&mut self, name: &str, translation: Vec2, behaviours: ScriptBehaviour) -> Entity {
        self.world
            .spawn((
                EntityName(name.to_string()),
                Transform { translation, ..Transform::default() },
                Velocity::default(),
                behaviours,
            ))
            .id()
    }

    pub fn spawn_from_config(&mut self, entity: &HarnessEntity) -> Entity {
        let translation = entity.translation.map(Vec2::from).unwrap_or(Vec2::ZERO);
        self.spawn_scripted(&entity.name, translation, ScriptBehaviour::new(entity.behaviours.iter().cloned()))
    }

    pub fn fixed_step(&mut self, dt: f32) {
        self.world.resource_mut::<TimeDelta>().0 = dt;
        self.schedule_fixed.run(&mut self.world);
    }

    pub fn entity_named(&mut self, name: &str) -> Option<Entity> {
        let mut q = self.world.query::<(Entity, &EntityName)>();
        q.iter(&self.world).find(|(_, n)| n.0 == name).map(|(e, _)| e)
    }

    pub fn transform(&self, entity: Entity) -> Option<Transform> {
        self.world.get::<Transform>(entity).copied()
    }

    pub fn velocity(&self, entity: Entity) -> Option<Vec2> {
        self.world.get::<Velocity>(entity).map(|v| v.0)
    }

    pub fn entity_count(&self) -> usize {
        self.world.entities().len() as usize
    }
}

fn sys_integrate_velocities(mut q: Query<(&mut Transform, &Velocity)>, dt: Res<TimeDelta>) {
    for (mut t, v) in &mut q {
        t.translation += v.0 * dt.0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub attached: usize,
    pub detached: usize,
}

/// Brings the runtime's attachment table in line with the `ScriptBehaviour` components.
/// Pairs whose entity or component entry is gone are detached (running `on_destroy`).
pub fn sync_attachments(world: &mut World, runtime: &mut ScriptRuntime) -> SyncSummary {
    let mut wanted: Vec<(Entity, String)> = Vec::new();
    let mut q = world.query::<(Entity, &ScriptBehaviour)>();
    for (entity, behaviour) in q.iter(world) {
        for script_type in &behaviour.script_types {
            wanted.push((entity, script_type.clone()));
        }
    }
    let existing: BTreeSet<(Entity, String)> = runtime
        .lifecycle()
        .attachments()
        .iter()
        .map(|a| (a.owner(), a.type_name().to_string()))
        .collect();
    let wanted_set: BTreeSet<&(Entity, String)> = wanted.iter().collect();

    let mut summary = SyncSummary::default();
    for pair in &existing {
        if !wanted_set.contains(pair) && runtime.detach(pair.0, &pair.1) {
            summary.detached += 1;
        }
    }
    for (entity, script_type) in wanted {
        if !existing.contains(&(entity, script_type.clone())) && runtime.attach(entity, script_type) {
            summary.attached += 1;
        }
    }
    if summary != SyncSummary::default() {
        tracing::debug!(attached = summary.attached, detached = summary.detached, "synced behaviour attachments");
    }
    summary
}

/// Applies the commands the world can satisfy on its own and hands back the rest
/// (sounds and impulses) for the host's audio and physics layers.
pub fn apply_commands(world: &mut World, commands: Vec<ScriptCommand>) -> Vec<ScriptCommand> {
    let mut unhandled = Vec::new();
    for command in commands {
        let applied = match &command {
            ScriptCommand::SetTranslation { entity, translation } => {
                world.get_mut::<Transform>(*entity).map(|mut t| t.translation = *translation).is_some()
            }
            ScriptCommand::SetRotation { entity, degrees } => {
                world.get_mut::<Transform>(*entity).map(|mut t| t.rotation = degrees.to_radians()).is_some()
            }
            ScriptCommand::SetVelocity { entity, velocity } => {
                world.get_mut::<Velocity>(*entity).map(|mut v| v.0 = *velocity).is_some()
            }
            ScriptCommand::Despawn { entity } => world.despawn(*entity),
            ScriptCommand::ApplyImpulse { .. } | ScriptCommand::PlaySound { .. } => {
                unhandled.push(command);
                continue;
            }
        };
        if !applied {
            tracing::debug!(?command, "script command targets a missing entity or component; dropped");
        }
    }
    unhandled
}
