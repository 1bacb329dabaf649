use bevy_ecs::prelude::Entity;
use rhai::{Dynamic, Map, FLOAT, INT};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    KeyPressed { key: String },
    KeyReleased { key: String },
    PointerMoved { x: f32, y: f32 },
    PointerPressed { button: u8, x: f32, y: f32 },
}

impl InputEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InputEvent::KeyPressed { .. } => "key_pressed",
            InputEvent::KeyReleased { .. } => "key_released",
            InputEvent::PointerMoved { .. } => "pointer_moved",
            InputEvent::PointerPressed { .. } => "pointer_pressed",
        }
    }

    /// Scripts receive events as object maps, e.g. `#{ kind: "key_pressed", key: "Space" }`.
    pub fn to_dynamic(&self) -> Dynamic {
        let mut map = Map::new();
        map.insert("kind".into(), Dynamic::from(self.kind().to_string()));
        match self {
            InputEvent::KeyPressed { key } | InputEvent::KeyReleased { key } => {
                map.insert("key".into(), Dynamic::from(key.clone()));
            }
            InputEvent::PointerMoved { x, y } => {
                map.insert("x".into(), Dynamic::from_float(*x as FLOAT));
                map.insert("y".into(), Dynamic::from_float(*y as FLOAT));
            }
            InputEvent::PointerPressed { button, x, y } => {
                map.insert("button".into(), Dynamic::from_int(*button as INT));
                map.insert("x".into(), Dynamic::from_float(*x as FLOAT));
                map.insert("y".into(), Dynamic::from_float(*y as FLOAT));
            }
        }
        Dynamic::from_map(map)
    }
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputEvent::KeyPressed { key } => write!(f, "KeyPressed key={key}"),
            InputEvent::KeyReleased { key } => write!(f, "KeyReleased key={key}"),
            InputEvent::PointerMoved { x, y } => write!(f, "PointerMoved x={x:.1} y={y:.1}"),
            InputEvent::PointerPressed { button, x, y } => {
                write!(f, "PointerPressed button={button} x={x:.1} y={y:.1}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPhase {
    Started,
    Ended,
}

impl CollisionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CollisionPhase::Started => "started",
            CollisionPhase::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionEvent {
    pub a: Entity,
    pub b: Entity,
    pub phase: CollisionPhase,
    pub force: f32,
}

impl CollisionEvent {
    fn ordered_pair(a: Entity, b: Entity) -> (Entity, Entity) {
        if a.index() <= b.index() {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn started(a: Entity, b: Entity) -> Self {
        let (a, b) = Self::ordered_pair(a, b);
        Self { a, b, phase: CollisionPhase::Started, force: 0.0 }
    }

    pub fn ended(a: Entity, b: Entity) -> Self {
        let (a, b) = Self::ordered_pair(a, b);
        Self { a, b, phase: CollisionPhase::Ended, force: 0.0 }
    }

    pub fn with_force(mut self, force: f32) -> Self {
        self.force = force;
        self
    }

    pub fn involves(&self, entity: Entity) -> bool {
        self.a == entity || self.b == entity
    }

    pub fn other(&self, entity: Entity) -> Option<Entity> {
        if self.a == entity {
            Some(self.b)
        } else if self.b == entity {
            Some(self.a)
        } else {
            None
        }
    }

    /// The event as seen from `entity`: `#{ other: <entity bits>, phase: "started", force: 0.0 }`.
    pub fn to_dynamic_for(&self, entity: Entity) -> Dynamic {
        let other = self.other(entity).unwrap_or(entity);
        let mut map = Map::new();
        map.insert("other".into(), Dynamic::from_int(other.to_bits() as INT));
        map.insert("phase".into(), Dynamic::from(self.phase.as_str().to_string()));
        map.insert("force".into(), Dynamic::from_float(self.force as FLOAT));
        Dynamic::from_map(map)
    }
}

impl fmt::Display for CollisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Collision{:?} a={} b={} force={:.3}", self.phase, self.a.index(), self.b.index(), self.force)
    }
}

/// Input state visible to scripts for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    pub held: BTreeSet<String>,
    pub events: Vec<InputEvent>,
}

impl FrameInput {
    pub fn is_down(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    pub fn press(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.held.insert(key.clone());
        self.events.push(InputEvent::KeyPressed { key });
    }

    pub fn release(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.held.remove(&key);
        self.events.push(InputEvent::KeyReleased { key });
    }

    /// Keeps the held keys, drops the per-frame events.
    pub fn carry_over(&self) -> Self {
        Self { held: self.held.clone(), events: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_pairs_are_ordered_and_viewed_per_entity() {
        let a = Entity::from_raw(7);
        let b = Entity::from_raw(2);
        let event = CollisionEvent::started(a, b).with_force(3.5);
        assert_eq!(event.a, b);
        assert_eq!(event.other(a), Some(b));
        assert_eq!(event.other(Entity::from_raw(9)), None);
        let seen = event.to_dynamic_for(a).cast::<Map>();
        assert_eq!(seen["other"].as_int().expect("int"), b.to_bits() as INT);
        assert_eq!(seen["phase"].clone().into_string().expect("string"), "started");
    }

    #[test]
    fn frame_input_tracks_held_keys() {
        let mut input = FrameInput::default();
        input.press("Space");
        assert!(input.is_down("Space"));
        input.release("Space");
        assert!(!input.is_down("Space"));
        assert_eq!(input.events.len(), 2);
        assert!(input.carry_over().events.is_empty());
    }
}
