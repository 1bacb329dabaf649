use std::collections::VecDeque;

use crate::behaviour::{Behaviour, EntityId, Hook, HookError, HookHost};
use crate::config::ReloadConfig;
use crate::events::{CollisionEvent, InputEvent};
use crate::registry::TypeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// Waiting for the next tick to be instantiated.
    Pending,
    Live,
    /// A hook failed; the instance gets no callbacks until the next reload.
    Faulted,
    /// The type was missing from the registry; retried on the next successful reload.
    Failed,
}

/// One entity bound to one named behaviour type. The instance is owned here, never by
/// the entity.
pub struct Attachment {
    owner: EntityId,
    type_name: String,
    state: AttachmentState,
    instance: Option<Box<dyn Behaviour>>,
}

impl Attachment {
    pub fn owner(&self) -> EntityId {
        self.owner
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn state(&self) -> AttachmentState {
        self.state
    }

    pub fn instance(&self) -> Option<&dyn Behaviour> {
        self.instance.as_deref()
    }

    pub fn instance_mut(&mut self) -> Option<&mut (dyn Behaviour + 'static)> {
        self.instance.as_deref_mut()
    }

    fn is_receiving(&self) -> bool {
        self.state == AttachmentState::Live && self.instance.is_some()
    }

    fn matches(&self, owner: EntityId, type_name: &str) -> bool {
        self.owner == owner && self.type_name == type_name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedError {
    pub entity: EntityId,
    pub error: HookError,
}

/// Bounded, oldest entries dropped first.
struct ErrorLog {
    entries: VecDeque<RecordedError>,
    capacity: usize,
}

impl ErrorLog {
    fn record(&mut self, entity: EntityId, error: HookError) {
        tracing::error!(
            entity = ?entity,
            type_name = %error.type_name,
            hook = error.hook.name(),
            location = ?error.location,
            "behaviour hook failed: {}",
            error.message
        );
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RecordedError { entity, error });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReboundSummary {
    pub rebound: usize,
    pub failed: usize,
}

pub struct LifecycleManager {
    attachments: Vec<Attachment>,
    errors: ErrorLog,
    call_destroy_on_reload: bool,
}

impl LifecycleManager {
    pub fn new(config: &ReloadConfig) -> Self {
        Self {
            attachments: Vec::new(),
            errors: ErrorLog { entries: VecDeque::new(), capacity: config.max_recorded_errors },
            call_destroy_on_reload: config.call_destroy_on_reload,
        }
    }

    /// Returns false when the pair is already attached.
    pub fn attach(&mut self, owner: EntityId, type_name: impl Into<String>) -> bool {
        let type_name = type_name.into();
        if self.attachments.iter().any(|a| a.matches(owner, &type_name)) {
            tracing::warn!(entity = ?owner, type_name = %type_name, "behaviour already attached; ignoring");
            return false;
        }
        tracing::debug!(entity = ?owner, type_name = %type_name, "behaviour attached");
        self.attachments.push(Attachment { owner, type_name, state: AttachmentState::Pending, instance: None });
        true
    }

    pub fn detach(&mut self, owner: EntityId, type_name: &str, host: &HookHost<'_>) -> bool {
        let Some(index) = self.attachments.iter().position(|a| a.matches(owner, type_name)) else {
            return false;
        };
        let mut attachment = self.attachments.remove(index);
        self.destroy(&mut attachment, host);
        tracing::debug!(entity = ?owner, type_name, "behaviour detached");
        true
    }

    /// Detaches everything owned by `owner`, e.g. when the entity is despawned.
    pub fn detach_entity(&mut self, owner: EntityId, host: &HookHost<'_>) -> usize {
        let mut removed = 0;
        let mut index = 0;
        while index < self.attachments.len() {
            if self.attachments[index].owner == owner {
                let mut attachment = self.attachments.remove(index);
                self.destroy(&mut attachment, host);
                removed += 1;
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Faulted instances still get `on_destroy`; only attachments without an instance skip it.
    fn destroy(&mut self, attachment: &mut Attachment, host: &HookHost<'_>) {
        if let Some(instance) = attachment.instance.as_mut() {
            if let Err(err) = instance.on_destroy(host) {
                self.errors.record(attachment.owner, err);
            }
        }
    }

    /// Instantiates pending attachments, then updates every live instance.
    pub fn tick(&mut self, registry: &TypeRegistry, host: &HookHost<'_>, dt: f32) {
        let Self { attachments, errors, .. } = self;
        if registry.unit_id().is_some() {
            for attachment in attachments.iter_mut().filter(|a| a.state == AttachmentState::Pending) {
                instantiate(attachment, registry, host, errors);
            }
        }
        for attachment in attachments.iter_mut().filter(|a| a.is_receiving()) {
            run_hook(attachment, errors, |instance| instance.update(host, dt));
        }
    }

    /// Replaces every instance with a fresh one from `registry`. Field values are not carried over.
    pub fn on_reload_succeeded(&mut self, registry: &TypeRegistry, host: &HookHost<'_>) -> ReboundSummary {
        let call_destroy = self.call_destroy_on_reload;
        let Self { attachments, errors, .. } = self;
        let mut summary = ReboundSummary::default();
        for attachment in attachments.iter_mut() {
            if call_destroy {
                run_hook(attachment, errors, |instance| instance.on_destroy(host));
            }
            attachment.instance = None;
            attachment.state = AttachmentState::Pending;
            if instantiate(attachment, registry, host, errors) {
                summary.rebound += 1;
            } else {
                summary.failed += 1;
            }
        }
        summary
    }

    pub fn dispatch_input(&mut self, host: &HookHost<'_>, event: &InputEvent) {
        let Self { attachments, errors, .. } = self;
        for attachment in attachments.iter_mut().filter(|a| a.is_receiving()) {
            run_hook(attachment, errors, |instance| instance.on_input(host, event));
        }
    }

    pub fn dispatch_collision(&mut self, host: &HookHost<'_>, event: &CollisionEvent) {
        let Self { attachments, errors, .. } = self;
        for attachment in attachments.iter_mut().filter(|a| a.is_receiving() && event.involves(a.owner)) {
            run_hook(attachment, errors, |instance| instance.on_collision(host, event));
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn find(&self, owner: EntityId, type_name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.matches(owner, type_name))
    }

    pub fn find_mut(&mut self, owner: EntityId, type_name: &str) -> Option<&mut Attachment> {
        self.attachments.iter_mut().find(|a| a.matches(owner, type_name))
    }

    pub fn errors(&self) -> impl Iterator<Item = &RecordedError> {
        self.errors.entries.iter()
    }

    pub fn take_errors(&mut self) -> Vec<RecordedError> {
        self.errors.entries.drain(..).collect()
    }
}

/// Returns true when the attachment ends up with an instance (live or faulted in `on_create`).
fn instantiate(attachment: &mut Attachment, registry: &TypeRegistry, host: &HookHost<'_>, errors: &mut ErrorLog) -> bool {
    let Some(instance) = registry.instantiate(&attachment.type_name, attachment.owner) else {
        if attachment.state != AttachmentState::Failed {
            tracing::warn!(
                entity = ?attachment.owner,
                type_name = %attachment.type_name,
                "behaviour type is not in the active unit; attachment marked failed"
            );
        }
        attachment.state = AttachmentState::Failed;
        return false;
    };
    attachment.instance = Some(instance);
    attachment.state = AttachmentState::Live;
    run_hook(attachment, errors, |instance| instance.on_create(host));
    true
}

fn run_hook(
    attachment: &mut Attachment,
    errors: &mut ErrorLog,
    call: impl FnOnce(&mut dyn Behaviour) -> Result<(), HookError>,
) {
    let Some(instance) = attachment.instance.as_deref_mut() else { return };
    if let Err(err) = call(instance) {
        if err.hook != Hook::Destroy {
            attachment.state = AttachmentState::Faulted;
        }
        errors.record(attachment.owner, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{build_engine, CommandSink};
    use crate::compiler::references::ReferenceSet;
    use crate::compiler::tests::compile_source;
    use crate::config::LimitsConfig;
    use crate::events::FrameInput;
    use rhai::Engine;
    use std::rc::Rc;

    struct Fixture {
        engine: Engine,
        sink: CommandSink,
        input: Rc<FrameInput>,
    }

    impl Fixture {
        fn with_input(input: FrameInput) -> Self {
            let sink = CommandSink::default();
            let engine = build_engine(&ReferenceSet::standard(), &LimitsConfig::default(), &sink);
            Self { engine, sink, input: Rc::new(input) }
        }

        fn new() -> Self {
            Self::with_input(FrameInput::default())
        }

        fn host(&self) -> HookHost<'_> {
            HookHost { engine: &self.engine, sink: &self.sink, input: &self.input }
        }
    }

    const TRACKER: &str = r#"
use input;

type Tracker : Behaviour {
    pub ticks: int;
    fn on_create(ctx) {
        if input::is_down(ctx, `poison-${ctx.entity}`) { throw "refusing to start"; }
        ctx.log("created");
    }
    fn update(ctx, dt) { this.ticks += 1; }
    fn on_destroy(ctx) { ctx.log("destroyed"); }
    fn on_collision(ctx, other) { ctx.log(`hit ${other.phase}`); }
}
"#;

    fn registry(source: &str) -> TypeRegistry {
        let unit = compile_source("tracker.ks", source);
        assert!(unit.passed(), "{:?}", unit.diagnostics);
        TypeRegistry::build(&unit)
    }

    fn ticks(manager: &LifecycleManager, owner: EntityId) -> Option<i64> {
        manager.find(owner, "Tracker")?.instance()?.read_field("ticks")?.as_int().ok()
    }

    #[test]
    fn tick_creates_then_updates_in_attach_order() {
        let fixture = Fixture::new();
        let registry = registry(TRACKER);
        let mut manager = LifecycleManager::new(&ReloadConfig::default());
        let (a, b) = (EntityId::from_raw(1), EntityId::from_raw(2));
        assert!(manager.attach(a, "Tracker"));
        assert!(manager.attach(b, "Tracker"));
        assert!(!manager.attach(a, "Tracker"));
        manager.tick(&registry, &fixture.host(), 0.016);
        manager.tick(&registry, &fixture.host(), 0.016);
        assert_eq!(ticks(&manager, a), Some(2));
        assert_eq!(ticks(&manager, b), Some(2));
        assert_eq!(fixture.sink.take_logs().len(), 2);
    }

    #[test]
    fn attachments_stay_pending_without_an_active_unit() {
        let fixture = Fixture::new();
        let mut manager = LifecycleManager::new(&ReloadConfig::default());
        manager.attach(EntityId::from_raw(1), "Tracker");
        manager.tick(&TypeRegistry::default(), &fixture.host(), 0.1);
        assert_eq!(manager.attachments()[0].state(), AttachmentState::Pending);
    }

    #[test]
    fn a_failing_create_hook_only_faults_its_own_instance() {
        let owners = [EntityId::from_raw(1), EntityId::from_raw(2), EntityId::from_raw(3)];
        let mut input = FrameInput::default();
        input.held.insert(format!("poison-{}", owners[1].to_bits()));
        let fixture = Fixture::with_input(input);
        let registry = registry(TRACKER);
        let mut manager = LifecycleManager::new(&ReloadConfig::default());
        for owner in owners {
            manager.attach(owner, "Tracker");
        }
        manager.tick(&registry, &fixture.host(), 0.0);

        let states: Vec<_> = manager.attachments().iter().map(Attachment::state).collect();
        assert_eq!(states, vec![AttachmentState::Live, AttachmentState::Faulted, AttachmentState::Live]);
        assert_eq!(fixture.sink.take_logs().len(), 2);
        assert_eq!(ticks(&manager, owners[0]), Some(1));
        assert_eq!(ticks(&manager, owners[1]), Some(0));
        assert_eq!(ticks(&manager, owners[2]), Some(1));

        let errors = manager.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].entity, owners[1]);
        assert_eq!(errors[0].error.hook, Hook::Create);
        assert!(errors[0].error.message.contains("refusing to start"));
        assert_eq!(errors[0].error.location.as_ref().map(|l| l.line), Some(7));
    }

    #[test]
    fn reload_resets_state_and_marks_missing_types_failed() {
        let fixture = Fixture::new();
        let mut manager = LifecycleManager::new(&ReloadConfig::default());
        let owner = EntityId::from_raw(5);
        manager.attach(owner, "Tracker");
        manager.attach(owner, "Ghost");
        let first = registry(TRACKER);
        manager.tick(&first, &fixture.host(), 0.1);
        manager.tick(&first, &fixture.host(), 0.1);
        assert_eq!(ticks(&manager, owner), Some(2));
        assert_eq!(manager.find(owner, "Ghost").map(Attachment::state), Some(AttachmentState::Failed));

        let second = registry(TRACKER);
        let summary = manager.on_reload_succeeded(&second, &fixture.host());
        assert_eq!(summary, ReboundSummary { rebound: 1, failed: 1 });
        assert_eq!(ticks(&manager, owner), Some(0));
        assert_eq!(manager.find(owner, "Tracker").map(Attachment::owner), Some(owner));

        manager.tick(&second, &fixture.host(), 0.1);
        assert_eq!(manager.find(owner, "Ghost").map(Attachment::state), Some(AttachmentState::Failed));
    }

    #[test]
    fn destroy_on_reload_follows_config() {
        let fixture = Fixture::new();
        let registry = registry(TRACKER);
        let config = ReloadConfig { call_destroy_on_reload: true, ..ReloadConfig::default() };
        let mut manager = LifecycleManager::new(&config);
        manager.attach(EntityId::from_raw(1), "Tracker");
        manager.tick(&registry, &fixture.host(), 0.0);
        fixture.sink.take_logs();
        manager.on_reload_succeeded(&registry, &fixture.host());
        let logs = fixture.sink.take_logs();
        assert!(logs[0].ends_with("destroyed"), "{logs:?}");
        assert!(logs[1].ends_with("created"), "{logs:?}");
    }

    #[test]
    fn detach_runs_destroy_and_collisions_reach_both_owners() {
        let fixture = Fixture::new();
        let registry = registry(TRACKER);
        let mut manager = LifecycleManager::new(&ReloadConfig::default());
        let (a, b, c) = (EntityId::from_raw(1), EntityId::from_raw(2), EntityId::from_raw(3));
        for owner in [a, b, c] {
            manager.attach(owner, "Tracker");
        }
        manager.tick(&registry, &fixture.host(), 0.0);
        fixture.sink.take_logs();

        manager.dispatch_collision(&fixture.host(), &CollisionEvent::started(a, b));
        let logs = fixture.sink.take_logs();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|line| line.ends_with("hit started")));

        assert!(manager.detach(b, "Tracker", &fixture.host()));
        assert!(!manager.detach(b, "Tracker", &fixture.host()));
        let logs = fixture.sink.take_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ends_with("destroyed"));
        assert_eq!(manager.detach_entity(c, &fixture.host()), 1);
        assert_eq!(manager.attachments().len(), 1);
    }

    #[test]
    fn detaching_a_faulted_instance_still_runs_destroy() {
        let owner = EntityId::from_raw(4);
        let mut input = FrameInput::default();
        input.held.insert(format!("poison-{}", owner.to_bits()));
        let fixture = Fixture::with_input(input);
        let registry = registry(TRACKER);
        let mut manager = LifecycleManager::new(&ReloadConfig::default());
        manager.attach(owner, "Tracker");
        manager.tick(&registry, &fixture.host(), 0.0);
        assert_eq!(manager.find(owner, "Tracker").map(Attachment::state), Some(AttachmentState::Faulted));
        fixture.sink.take_logs();

        assert!(manager.detach(owner, "Tracker", &fixture.host()));
        let logs = fixture.sink.take_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ends_with("destroyed"), "{logs:?}");
    }
}
