//! The frame loop: scheduling, transitions, chain evaluation, and the
//! host-facing control surface.

use core::time::Duration;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use slotmap::SlotMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::animatable::Animatable;
use crate::chain::{ErasedChain, StageRef};
use crate::collection::ChainCollection;
use crate::instance::{AnimationInstance, InstanceKey, InstanceState};
use crate::property::{ErasedHandle, PropertyHandle, PropertyRegistry};
use crate::timeline::Timeline;
use crate::transition::{ActiveTransition, Fade, Handoff, Transition, TransitionState};
use crate::{AnimationError, TargetId};

/// Tuning knobs for the frame loop.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerSettings {
    /// Minimum number of items in a parallel step before the loop actually
    /// forks; below this everything runs on the calling thread.
    pub parallel_threshold: usize,
    /// Maximum number of recycled instance trees kept for reuse.
    pub pool_capacity: usize,
    /// Weights within this distance of 0 or 1 snap to the cheap paths.
    pub weight_epsilon: f32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            parallel_threshold: 8,
            pool_capacity: 32,
            weight_epsilon: 1e-4,
        }
    }
}

/// What a starting animation binds to.
#[derive(Clone, Debug)]
pub enum BindTarget {
    /// Every assignable leaf binds to this one property.
    Property(ErasedHandle),
    /// Leaves resolve their own property by name under this object, via
    /// their timeline's name hints.
    Object(String),
}

impl BindTarget {
    pub fn object(name: impl Into<String>) -> Self {
        BindTarget::Object(name.into())
    }
}

impl From<ErasedHandle> for BindTarget {
    fn from(handle: ErasedHandle) -> Self {
        BindTarget::Property(handle)
    }
}

impl<T: Animatable> From<PropertyHandle<T>> for BindTarget {
    fn from(handle: PropertyHandle<T>) -> Self {
        BindTarget::Property(handle.erase())
    }
}

/// Copy-cheap handle for interactive control of one scheduled instance.
///
/// A controller captures the instance's recycle generation at creation;
/// once the instance is returned to the pool the controller goes stale:
/// queries return sentinel values and mutations are silently ignored, so
/// fire-and-forget animations never turn into error storms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Controller {
    pub(crate) key: InstanceKey,
    pub(crate) run_count: u32,
}

type CompletionHandler = Box<dyn FnMut(&mut AnimationManager, Controller) + Send + 'static>;

struct CompletionEvent {
    key: InstanceKey,
    run_count: u32,
}

/// The animation runtime: registry of scheduled instance trees and their
/// composition chains, and the owner of the per-frame loop.
///
/// The manager owns no clock; the host calls [`update`](Self::update) with a
/// time delta and then [`apply`](Self::apply), passing its
/// [`PropertyRegistry`] into both:
///
/// - `update` advances every scheduled tree (in parallel when the
///   `parallel` feature is on), steps transitions, prunes stopped trees,
///   and composes every chain — all immediate (weight) chains strictly
///   before any ordinary chain.
/// - `apply` writes the composed values to the host's properties, fires
///   deferred completion handlers, and recycles finished trees.
pub struct AnimationManager {
    instances: SlotMap<InstanceKey, AnimationInstance>,
    /// Scheduled roots, in start order.
    roots: Vec<InstanceKey>,
    transitions: Vec<ActiveTransition>,
    chains: ChainCollection,
    handlers: FnvHashMap<InstanceKey, CompletionHandler>,
    /// Completion candidates gathered by the (possibly parallel) advance
    /// step; drained, sorted, into `completions` at the join.
    completion_inbox: Mutex<Vec<CompletionEvent>>,
    /// Deferred completions, fired during `apply`.
    completions: Vec<CompletionEvent>,
    /// Trees unscheduled this frame; recycling candidates at `apply`.
    retired: Vec<InstanceKey>,
    pool: Vec<InstanceKey>,
    cleanup_cursor: usize,
    settings: ManagerSettings,
    scratch_keys: Vec<InstanceKey>,
}

impl Default for AnimationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimationManager {
    pub fn new() -> Self {
        Self::with_settings(ManagerSettings::default())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        Self {
            instances: SlotMap::with_key(),
            roots: Vec::new(),
            transitions: Vec::new(),
            chains: ChainCollection::default(),
            handlers: FnvHashMap::default(),
            completion_inbox: Mutex::new(Vec::new()),
            completions: Vec::new(),
            retired: Vec::new(),
            pool: Vec::new(),
            cleanup_cursor: 0,
            settings,
            scratch_keys: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Starting and stopping

    /// Materializes an instance tree for a timeline and binds its leaves to
    /// the target. The tree is not scheduled until
    /// [`start_controller`](Self::start_controller). Controllers created
    /// this way are not auto-recycled; pair with
    /// [`recycle`](Self::recycle) or [`set_auto_recycle`](Self::set_auto_recycle).
    pub fn create_controller(
        &mut self,
        timeline: Arc<dyn Timeline>,
        target: &BindTarget,
        registry: &PropertyRegistry,
    ) -> Result<Controller, AnimationError> {
        let key = self.acquire_tree(&timeline);
        if self.bind_tree(key, target, registry) == 0 {
            self.instances.remove(key);
            return Err(AnimationError::InvalidArgument(
                "no leaf of the timeline is assignable to the target",
            ));
        }
        let run_count = self.instances[key].run_count;
        Ok(Controller { key, run_count })
    }

    /// Starts a timeline on a target with the default
    /// [`SnapshotAndReplace`](Handoff::SnapshotAndReplace) handoff. The
    /// returned controller is auto-recycled when playback stops.
    pub fn start(
        &mut self,
        timeline: Arc<dyn Timeline>,
        target: impl Into<BindTarget>,
        registry: &PropertyRegistry,
    ) -> Result<Controller, AnimationError> {
        self.start_with(timeline, target, Transition::default(), registry)
    }

    /// [`start`](Self::start) with an explicit transition.
    pub fn start_with(
        &mut self,
        timeline: Arc<dyn Timeline>,
        target: impl Into<BindTarget>,
        transition: Transition,
        registry: &PropertyRegistry,
    ) -> Result<Controller, AnimationError> {
        let controller = self.create_controller(timeline, &target.into(), registry)?;
        self.set_auto_recycle(controller, true);
        self.start_controller(controller, transition)?;
        Ok(controller)
    }

    /// Schedules a created instance and queues its transition. Errors if
    /// the controller is stale ([`Recycled`](AnimationError::Recycled)) or
    /// the instance is not at rest
    /// ([`AlreadyRunning`](AnimationError::AlreadyRunning)).
    pub fn start_controller(
        &mut self,
        controller: Controller,
        transition: Transition,
    ) -> Result<(), AnimationError> {
        let anchor = transition
            .anchor
            .and_then(|anchor| self.check(anchor).map(|_| anchor.key));

        let Some(tree) = self.check_mut(controller) else {
            return Err(AnimationError::Recycled);
        };
        if tree.state() != InstanceState::Stopped {
            return Err(AnimationError::AlreadyRunning);
        }
        if tree.nodes.is_empty() || tree.nodes[0].parent.is_some() {
            debug_assert!(false, "instance root has a parent");
            return Err(AnimationError::NotRoot);
        }

        tree.seek(0.0);
        let fade = transition.fade_in.map(|duration| Fade::In {
            duration,
            target_weight: tree.nodes[0].weight,
        });
        if !tree.scheduled {
            tree.scheduled = true;
            self.roots.push(controller.key);
        }
        self.transitions.push(ActiveTransition::new(
            controller.key,
            controller.run_count,
            Some((transition.handoff, anchor)),
            fade,
        ));
        trace!(instance = ?controller.key, "animation scheduled");
        Ok(())
    }

    /// Stops playback immediately. Stale controllers are silently ignored.
    pub fn stop_controller(&mut self, controller: Controller) {
        if self.check(controller).is_none() {
            trace!("stop on a stale controller ignored");
            return;
        }
        self.stop_key(controller.key);
    }

    /// Fades the instance's weight to zero over `duration`, then removes
    /// it. Stale controllers are silently ignored.
    pub fn stop_controller_with_fade(&mut self, controller: Controller, duration: Duration) {
        let Some(tree) = self.check(controller) else {
            trace!("fade-out on a stale controller ignored");
            return;
        };
        let initial_weight = tree.nodes[0].weight;
        self.transitions.push(ActiveTransition::new(
            controller.key,
            controller.run_count,
            None,
            Some(Fade::Out {
                duration: duration.as_secs_f32(),
                initial_weight,
            }),
        ));
    }

    /// Stops every instance with a leaf bound to the given property.
    pub fn stop_property(&mut self, property: ErasedHandle) {
        let keys: Vec<InstanceKey> = self.roots.clone();
        for key in keys {
            let touches = self
                .instances
                .get(key)
                .is_some_and(|tree| tree.assigned_leaves().any(|(_, h)| h == property));
            if touches {
                self.stop_key(key);
            }
        }
    }

    /// Stops every instance bound by name to a property of the given host
    /// object.
    pub fn stop_object(&mut self, object: &str, registry: &PropertyRegistry) {
        let keys: Vec<InstanceKey> = self.roots.clone();
        for key in keys {
            let Some(tree) = self.instances.get(key) else {
                continue;
            };
            let touches = tree.nodes.iter().any(|node| {
                node.assignment.is_some()
                    && node.timeline.target_object().unwrap_or(object) == object
                    && node.timeline.target_property().is_some_and(|prop| {
                        registry.resolve_erased(TargetId::from_names([object, prop]))
                            == node.assignment
                    })
            });
            if touches {
                self.stop_key(key);
            }
        }
    }

    /// Stops every scheduled instance.
    pub fn stop_all(&mut self) {
        let keys: Vec<InstanceKey> = self.roots.clone();
        for key in keys {
            self.stop_key(key);
        }
    }

    fn stop_key(&mut self, key: InstanceKey) {
        self.remove_from_chains(key);
        if let Some(tree) = self.instances.get_mut(key) {
            tree.mark_stopped();
        }
        self.queue_completion_if_due(key);
        self.unschedule(key);
    }

    // ------------------------------------------------------------------
    // Controller surface

    /// Whether the controller still refers to a live, un-recycled instance.
    pub fn is_valid(&self, controller: Controller) -> bool {
        self.check(controller).is_some()
    }

    /// Playback state; stale controllers read as
    /// [`Stopped`](InstanceState::Stopped).
    pub fn state(&self, controller: Controller) -> InstanceState {
        self.check(controller).map(|t| t.state()).unwrap_or_default()
    }

    /// The root's local time in seconds, `None` at rest or when stale.
    pub fn time(&self, controller: Controller) -> Option<f32> {
        self.check(controller)?.nodes.first()?.time
    }

    /// Playback speed; `NaN` when stale.
    pub fn speed(&self, controller: Controller) -> f32 {
        self.check(controller)
            .map(|t| t.root().speed)
            .unwrap_or(f32::NAN)
    }

    pub fn is_paused(&self, controller: Controller) -> bool {
        self.check(controller).is_some_and(|t| t.root().paused)
    }

    pub fn pause(&mut self, controller: Controller) {
        if let Some(tree) = self.check_mut(controller) {
            tree.root_mut().paused = true;
        }
    }

    pub fn resume(&mut self, controller: Controller) {
        if let Some(tree) = self.check_mut(controller) {
            tree.root_mut().paused = false;
        }
    }

    pub fn set_speed(&mut self, controller: Controller, speed: f32) {
        if let Some(tree) = self.check_mut(controller) {
            tree.root_mut().speed = speed;
        }
    }

    pub fn set_weight(&mut self, controller: Controller, weight: f32) {
        if let Some(tree) = self.check_mut(controller) {
            tree.root_mut().weight = weight;
        }
    }

    /// Drives the instance's weight from an immediate `f32` property, so a
    /// weight animation resolved earlier in the same frame is observed by
    /// this instance's chains.
    pub fn set_weight_source(&mut self, controller: Controller, source: PropertyHandle<f32>) {
        if let Some(tree) = self.check_mut(controller) {
            tree.root_mut().weight_source = Some(source);
        }
    }

    /// Seeks the whole tree to a local time; negative times delay the
    /// start.
    pub fn seek(&mut self, controller: Controller, time: f32) {
        if let Some(tree) = self.check_mut(controller) {
            tree.seek(time);
        }
    }

    pub fn set_auto_recycle(&mut self, controller: Controller, auto_recycle: bool) {
        if let Some(tree) = self.check_mut(controller) {
            tree.auto_recycle = auto_recycle;
        }
    }

    /// Registers a completion handler, fired once per playback during
    /// `apply` when the instance finishes (enters `Stopped`, or starts
    /// filling). The manager holds the handler strongly; detach with
    /// [`clear_completion_handler`](Self::clear_completion_handler) if it
    /// captures things that must not outlive the host object.
    pub fn on_completed(
        &mut self,
        controller: Controller,
        handler: impl FnMut(&mut AnimationManager, Controller) + Send + 'static,
    ) {
        let Some(tree) = self.check_mut(controller) else {
            trace!("completion handler on a stale controller ignored");
            return;
        };
        tree.wants_completion = true;
        self.handlers.insert(controller.key, Box::new(handler));
    }

    pub fn clear_completion_handler(&mut self, controller: Controller) {
        if let Some(tree) = self.check_mut(controller) {
            tree.wants_completion = false;
            self.handlers.remove(&controller.key);
        }
    }

    /// Returns the instance to the pool. Every controller referring to it
    /// reports `is_valid() == false` afterwards. Stale controllers are
    /// silently ignored.
    pub fn recycle(&mut self, controller: Controller) {
        if self.check(controller).is_none() {
            return;
        }
        self.remove_from_chains(controller.key);
        self.unschedule(controller.key);
        self.recycle_tree(controller.key);
    }

    // ------------------------------------------------------------------
    // Queries and synchronous refresh

    /// Whether a non-empty composition chain currently drives the property.
    pub fn is_animated(&self, property: ErasedHandle, registry: &PropertyRegistry) -> bool {
        let Some(hash) = registry.hash_erased(property) else {
            return false;
        };
        match self.chains.find(property, hash) {
            Ok(index) => !self.chains.get(index).is_empty(),
            Err(_) => false,
        }
    }

    /// Synchronously re-composes and applies one property, outside the
    /// frame loop.
    pub fn update_and_apply_property(
        &mut self,
        property: ErasedHandle,
        registry: &mut PropertyRegistry,
    ) {
        let Some(hash) = registry.hash_erased(property) else {
            return;
        };
        let Ok(index) = self.chains.find(property, hash) else {
            return;
        };
        let removable = {
            let eps = self.settings.weight_epsilon;
            let chain = self.chains.get_mut(index);
            chain.update(&self.instances, registry, eps);
            chain.write_through(registry);
            chain.apply(registry)
        };
        if removable {
            self.chains.remove_at(index);
        }
    }

    /// Synchronously refreshes every name-bound property of a host object.
    pub fn update_and_apply_object(&mut self, object: &str, registry: &mut PropertyRegistry) {
        let keys: Vec<InstanceKey> = self.roots.clone();
        let mut targets: Vec<ErasedHandle> = Vec::new();
        for key in keys {
            let Some(tree) = self.instances.get(key) else {
                continue;
            };
            for node in &tree.nodes {
                if let Some(assignment) = node.assignment
                    && node.timeline.target_object().unwrap_or(object) == object
                    && node.timeline.target_property().is_some_and(|prop| {
                        registry.resolve_erased(TargetId::from_names([object, prop]))
                            == Some(assignment)
                    })
                {
                    targets.push(assignment);
                }
            }
        }
        targets.sort_unstable_by_key(|handle| handle.key);
        targets.dedup();
        for handle in targets {
            self.update_and_apply_property(handle, registry);
        }
    }

    /// Synchronously refreshes every property the instance is bound to.
    /// Unlike the silent controller mutators, a stale controller here is
    /// surfaced as [`Recycled`](AnimationError::Recycled).
    pub fn update_and_apply(
        &mut self,
        controller: Controller,
        registry: &mut PropertyRegistry,
    ) -> Result<(), AnimationError> {
        let Some(tree) = self.check(controller) else {
            return Err(AnimationError::Recycled);
        };
        let targets: SmallVec<[ErasedHandle; 4]> =
            tree.assigned_leaves().map(|(_, handle)| handle).collect();
        for handle in targets {
            self.update_and_apply_property(handle, registry);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frame loop

    /// Advances the whole population by `dt` seconds and composes every
    /// chain. Call once per frame, followed by [`apply`](Self::apply).
    pub fn update(&mut self, dt: f32, registry: &mut PropertyRegistry) {
        self.advance_instances(dt);
        self.step_transitions(dt, registry);
        self.sweep_stopped();
        self.cleanup_probe(registry);
        self.update_chains(registry);
        if cfg!(debug_assertions) {
            self.chains.validate();
        }
    }

    /// Writes composed values back to the host, fires deferred completion
    /// handlers, recycles finished auto-recycle instances, and retires
    /// chains that have finished resetting an abandoned property.
    pub fn apply(&mut self, registry: &mut PropertyRegistry) {
        let mut index = 0;
        while index < self.chains.len() {
            if self.chains.get_mut(index).apply(registry) {
                self.chains.remove_at(index);
            } else {
                index += 1;
            }
        }

        let events = std::mem::take(&mut self.completions);
        for event in events {
            self.fire_completion(event);
        }

        let retired = std::mem::take(&mut self.retired);
        for key in retired {
            let Some(tree) = self.instances.get(key) else {
                continue;
            };
            // A completion handler may have restarted it.
            if !tree.scheduled && tree.state() == InstanceState::Stopped && tree.auto_recycle {
                self.recycle_tree(key);
            }
        }
    }

    fn advance_instances(&mut self, dt: f32) {
        let inbox = &self.completion_inbox;
        let instances = &mut self.instances;
        let run = |(key, tree): (InstanceKey, &mut AnimationInstance)| {
            if !tree.scheduled {
                return;
            }
            tree.advance(dt);
            if tree.completion_due {
                tree.completion_due = false;
                inbox.lock().push(CompletionEvent {
                    key,
                    run_count: tree.run_count,
                });
            }
        };

        #[cfg(feature = "parallel")]
        if instances.len() >= self.settings.parallel_threshold {
            instances.iter_mut().par_bridge().for_each(run);
        } else {
            instances.iter_mut().for_each(run);
        }
        #[cfg(not(feature = "parallel"))]
        instances.iter_mut().for_each(run);

        // Join point: the gather order above is scheduling-dependent, so
        // restore a stable order before the events become observable.
        let inbox = self.completion_inbox.get_mut();
        inbox.sort_unstable_by_key(|event| event.key);
        self.completions.append(inbox);
    }

    fn step_transitions(&mut self, dt: f32, registry: &mut PropertyRegistry) {
        // Index loop re-reading the length: a step may not remove
        // transitions, but keeping the traversal reentrancy-safe is the
        // rule for every list the loop mutates.
        let mut index = 0;
        while index < self.transitions.len() {
            self.step_transition_at(index, dt, registry);
            index += 1;
        }
        self.transitions
            .retain(|transition| transition.state != TransitionState::Done);
    }

    fn step_transition_at(&mut self, index: usize, dt: f32, registry: &PropertyRegistry) {
        let (key, run_count) = {
            let transition = &self.transitions[index];
            (transition.instance, transition.run_count)
        };
        let alive = self
            .instances
            .get(key)
            .is_some_and(|tree| tree.run_count == run_count && !tree.nodes.is_empty());
        if !alive {
            self.transitions[index].state = TransitionState::Done;
            return;
        }

        if self.transitions[index].state == TransitionState::Scheduled {
            if let Some((handoff, anchor)) = self.transitions[index].inject.take() {
                self.inject_instance(key, handoff, anchor, registry);
            }
            match self.transitions[index].fade {
                Some(Fade::In { .. }) => {
                    self.instances[key].root_mut().weight = 0.0;
                    self.transitions[index].state = TransitionState::Active;
                }
                Some(Fade::Out { .. }) => {
                    self.transitions[index].state = TransitionState::Active;
                }
                None => {
                    self.transitions[index].state = TransitionState::Done;
                    return;
                }
            }
        }

        self.transitions[index].elapsed += dt;
        let elapsed = self.transitions[index].elapsed;
        match self.transitions[index].fade {
            Some(Fade::In {
                duration,
                target_weight,
            }) => {
                let progress = ActiveTransition::progress(elapsed, duration);
                self.instances[key].root_mut().weight = target_weight * progress;
                if progress >= 1.0 {
                    self.transitions[index].state = TransitionState::Done;
                }
            }
            Some(Fade::Out {
                duration,
                initial_weight,
            }) => {
                let progress = ActiveTransition::progress(elapsed, duration);
                self.instances[key].root_mut().weight = initial_weight * (1.0 - progress);
                if progress >= 1.0 {
                    self.stop_key(key);
                    self.transitions[index].state = TransitionState::Done;
                }
            }
            None => {
                debug_assert!(false, "transition without fade survived activation");
                self.transitions[index].state = TransitionState::Done;
            }
        }
    }

    /// Applies a handoff: binds the instance's leaves into their chains,
    /// creating chains on demand, and stops any tree the handoff fully
    /// displaced.
    fn inject_instance(
        &mut self,
        key: InstanceKey,
        handoff: Handoff,
        anchor: Option<InstanceKey>,
        registry: &PropertyRegistry,
    ) {
        let mut dropped = std::mem::take(&mut self.scratch_keys);
        dropped.clear();

        let leaves: SmallVec<[(usize, ErasedHandle); 4]> =
            self.instances[key].assigned_leaves().collect();
        for (node, handle) in leaves {
            let Some(hash) = registry.hash_erased(handle) else {
                trace!(?handle, "bound property no longer alive; leaf skipped");
                continue;
            };
            let index = match self.chains.find(handle, hash) {
                Ok(index) => index,
                Err(insert_at) => {
                    let chain = self.instances[key].nodes[node]
                        .evaluator()
                        .and_then(|evaluator| evaluator.create_chain(handle, registry));
                    let Some(chain) = chain else {
                        continue;
                    };
                    self.chains.insert(insert_at, chain)
                }
            };
            let chain = self.chains.get_mut(index);
            match handoff {
                Handoff::SnapshotAndReplace => {
                    chain.take_snapshot(registry);
                    chain.retain_tree(key, &mut dropped);
                }
                Handoff::Replace => chain.retain_tree(key, &mut dropped),
                Handoff::Compose => {}
            }
            chain.insert_stage(StageRef { instance: key, node }, anchor);
        }

        dropped.sort_unstable();
        dropped.dedup();
        for displaced in dropped.drain(..) {
            if displaced != key && !self.tree_in_any_chain(displaced) {
                debug!(instance = ?displaced, "instance fully displaced by handoff; stopping");
                if let Some(tree) = self.instances.get_mut(displaced) {
                    tree.mark_stopped();
                }
                self.queue_completion_if_due(displaced);
                self.unschedule(displaced);
            }
        }
        self.scratch_keys = dropped;
    }

    fn sweep_stopped(&mut self) {
        let mut index = 0;
        while index < self.roots.len() {
            let key = self.roots[index];
            let stopped = self
                .instances
                .get(key)
                .is_none_or(|tree| tree.state() == InstanceState::Stopped);
            if stopped {
                self.roots.remove(index);
                self.remove_from_chains(key);
                if let Some(tree) = self.instances.get_mut(key) {
                    tree.scheduled = false;
                }
                self.queue_completion_if_due(key);
                self.retired.push(key);
            } else {
                index += 1;
            }
        }
    }

    /// One step of incremental cleanup: probe a single root, round-robin,
    /// and prune it if every property it was bound to has been collected.
    /// O(1) per frame; a dead target is reclaimed within at most one full
    /// rotation of the schedule.
    fn cleanup_probe(&mut self, registry: &PropertyRegistry) {
        if self.roots.is_empty() {
            return;
        }
        self.cleanup_cursor %= self.roots.len();
        let key = self.roots[self.cleanup_cursor];
        self.cleanup_cursor += 1;

        let Some(tree) = self.instances.get(key) else {
            return;
        };
        let mut any = false;
        let mut all_dead = true;
        for (_, handle) in tree.assigned_leaves() {
            any = true;
            if registry.contains(handle) {
                all_dead = false;
                break;
            }
        }
        if any && all_dead {
            debug!(instance = ?key, "animation target collected; pruning instance");
            self.stop_key(key);
        }
    }

    fn update_chains(&mut self, registry: &mut PropertyRegistry) {
        let eps = self.settings.weight_epsilon;
        let threshold = self.settings.parallel_threshold;
        let instances = &self.instances;
        let (immediates, ordinary) = self.chains.split_mut();

        // Phase a: weight chains. Values are composed in parallel, then
        // written through serially at the join — the serialization point
        // that lets phase b read them.
        {
            let registry: &PropertyRegistry = registry;
            run_chains(immediates, threshold, |chain| {
                chain.update(instances, registry, eps);
            });
        }
        for chain in immediates.iter_mut() {
            chain.write_through(registry);
        }

        // Phase b: ordinary chains.
        {
            let registry: &PropertyRegistry = registry;
            run_chains(ordinary, threshold, |chain| {
                chain.update(instances, registry, eps);
            });
        }
    }

    fn fire_completion(&mut self, event: CompletionEvent) {
        let alive = self
            .instances
            .get(event.key)
            .is_some_and(|tree| tree.run_count == event.run_count);
        if !alive {
            return;
        }
        let Some(mut handler) = self.handlers.remove(&event.key) else {
            return;
        };
        let controller = Controller {
            key: event.key,
            run_count: event.run_count,
        };
        handler(self, controller);
        // Keep the handler for the next playback unless the callback
        // detached it or registered a replacement.
        let keep = self
            .instances
            .get(event.key)
            .is_some_and(|tree| tree.run_count == event.run_count && tree.wants_completion);
        if keep && !self.handlers.contains_key(&event.key) {
            self.handlers.insert(event.key, handler);
        }
    }

    // ------------------------------------------------------------------
    // Plumbing

    fn check(&self, controller: Controller) -> Option<&AnimationInstance> {
        self.instances
            .get(controller.key)
            .filter(|tree| tree.run_count == controller.run_count)
    }

    fn check_mut(&mut self, controller: Controller) -> Option<&mut AnimationInstance> {
        self.instances
            .get_mut(controller.key)
            .filter(|tree| tree.run_count == controller.run_count)
    }

    fn acquire_tree(&mut self, timeline: &Arc<dyn Timeline>) -> InstanceKey {
        match self.pool.pop() {
            Some(key) => {
                self.instances[key].rebuild(timeline);
                key
            }
            None => {
                let key = self.instances.insert(AnimationInstance::empty());
                self.instances[key].rebuild(timeline);
                key
            }
        }
    }

    /// Resolves leaf assignments; returns how many leaves were bound.
    fn bind_tree(
        &mut self,
        key: InstanceKey,
        target: &BindTarget,
        registry: &PropertyRegistry,
    ) -> usize {
        let tree = &mut self.instances[key];
        let mut bound = 0;
        for index in 0..tree.nodes.len() {
            if tree.nodes[index].evaluator().is_none() {
                continue;
            }
            let resolved = match target {
                BindTarget::Property(handle) => Some(*handle),
                BindTarget::Object(object) => {
                    let node = &tree.nodes[index];
                    let object = node.timeline.target_object().unwrap_or(object.as_str());
                    match node.timeline.target_property() {
                        Some(property) => {
                            registry.resolve_erased(TargetId::from_names([object, property]))
                        }
                        None => {
                            warn!("leaf timeline has no target property name; not bound");
                            None
                        }
                    }
                }
            };
            let Some(handle) = resolved else {
                trace!("animation target not found; leaf not bound");
                continue;
            };
            let node = &mut tree.nodes[index];
            if node.evaluator().is_some_and(|evaluator| evaluator.accepts(handle)) {
                node.assignment = Some(handle);
                bound += 1;
            } else {
                warn!("property value type does not match the animation; leaf not bound");
            }
        }
        bound
    }

    fn unschedule(&mut self, key: InstanceKey) {
        let Some(tree) = self.instances.get_mut(key) else {
            return;
        };
        if tree.scheduled {
            tree.scheduled = false;
            self.roots.retain(|k| *k != key);
            self.retired.push(key);
        }
    }

    fn queue_completion_if_due(&mut self, key: InstanceKey) {
        if let Some(tree) = self.instances.get_mut(key)
            && tree.completion_due
        {
            tree.completion_due = false;
            self.completions.push(CompletionEvent {
                key,
                run_count: tree.run_count,
            });
        }
    }

    fn remove_from_chains(&mut self, key: InstanceKey) {
        for chain in self.chains.iter_mut() {
            chain.remove_tree(key);
        }
    }

    fn tree_in_any_chain(&self, key: InstanceKey) -> bool {
        self.chains.iter().any(|chain| chain.contains_tree(key))
    }

    fn recycle_tree(&mut self, key: InstanceKey) {
        self.handlers.remove(&key);
        let Some(tree) = self.instances.get_mut(key) else {
            return;
        };
        if tree.poolable() && self.pool.len() < self.settings.pool_capacity {
            tree.recycle();
            self.pool.push(key);
        } else {
            self.instances.remove(key);
        }
    }
}

#[cfg(feature = "parallel")]
fn run_chains(
    chains: &mut [Box<dyn ErasedChain>],
    threshold: usize,
    op: impl Fn(&mut Box<dyn ErasedChain>) + Send + Sync,
) {
    if chains.len() >= threshold {
        chains.par_iter_mut().for_each(op);
    } else {
        chains.iter_mut().for_each(op);
    }
}

#[cfg(not(feature = "parallel"))]
fn run_chains(
    chains: &mut [Box<dyn ErasedChain>],
    _threshold: usize,
    op: impl Fn(&mut Box<dyn ErasedChain>),
) {
    chains.iter_mut().for_each(op);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::{ConstAnimation, FromToAnimation};
    use crate::property::SimpleProperty;
    use crate::timeline::{Animation, FillBehavior, NodeKind, TimelineGroup};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct World {
        manager: AnimationManager,
        registry: PropertyRegistry,
    }

    impl World {
        fn new() -> Self {
            Self {
                manager: AnimationManager::new(),
                registry: PropertyRegistry::new(),
            }
        }

        fn frame(&mut self, dt: f32) {
            self.manager.update(dt, &mut self.registry);
            self.manager.apply(&mut self.registry);
        }

        fn scalar(&mut self, base: f32) -> PropertyHandle<f32> {
            self.registry.register(SimpleProperty::new(base))
        }

        fn value(&self, handle: PropertyHandle<f32>) -> f32 {
            *self
                .registry
                .get(handle)
                .unwrap()
                .downcast_ref::<SimpleProperty<f32>>()
                .unwrap()
                .value()
        }
    }

    #[test]
    fn from_to_scalar_over_one_second() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let controller = world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();

        world.frame(0.25);
        assert_eq!(world.value(prop), 0.25);
        world.frame(0.25);
        assert_eq!(world.value(prop), 0.5);

        world.frame(1.0);
        assert_eq!(world.manager.state(controller), InstanceState::Filling);
        assert_eq!(world.value(prop), 1.0);
        assert!(world.manager.is_animated(prop.erase(), &world.registry));
    }

    #[test]
    fn snapshot_handoff_starts_from_the_visible_value() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.frame(0.5);
        assert_eq!(world.value(prop), 0.5);

        // Replacement with open endpoints: glides from the snapshot toward
        // the base value.
        world
            .manager
            .start(
                Arc::new(FromToAnimation::<f32>::partial(None, None, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.frame(0.0);
        assert_eq!(world.value(prop), 0.5);
    }

    #[test]
    fn weight_chains_resolve_before_value_chains() {
        let mut world = World::new();
        let weight = world.registry.register(SimpleProperty::immediate(0.0f32));
        let prop = world.scalar(0.0);

        world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                weight,
                &world.registry,
            )
            .unwrap();
        let value_controller = world
            .manager
            .start(Arc::new(ConstAnimation::new(10.0f32)), prop, &world.registry)
            .unwrap();
        world.manager.set_weight_source(value_controller, weight);

        world.frame(0.5);
        // The ordinary chain observed the weight written this very frame.
        assert_eq!(world.value(prop), 5.0);
        let weight_cell = world
            .registry
            .get(weight)
            .unwrap()
            .downcast_ref::<SimpleProperty<f32>>()
            .unwrap();
        assert_eq!(*weight_cell.value(), 0.5);
    }

    #[test]
    fn compose_anchor_preserves_tree_ordering() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let start_composed = |world: &mut World| {
            world
                .manager
                .start_with(
                    Arc::new(ConstAnimation::new(1.0f32)),
                    prop,
                    Transition::compose(),
                    &world.registry,
                )
                .unwrap()
        };
        let a = start_composed(&mut world);
        let b = start_composed(&mut world);
        let c = start_composed(&mut world);

        // One tree with two leaves, anchored after B.
        let pair: Arc<dyn Timeline> = Arc::new(
            TimelineGroup::new()
                .with_child(ConstAnimation::new(2.0f32))
                .with_child(ConstAnimation::new(3.0f32)),
        );
        let d = world
            .manager
            .start_with(pair, prop, Transition::compose_after(b), &world.registry)
            .unwrap();
        world.frame(0.0);

        let hash = world.registry.hash_erased(prop.erase()).unwrap();
        let index = world.manager.chains.find(prop.erase(), hash).unwrap();
        let mut order = Vec::new();
        world.manager.chains.get(index).collect_trees(&mut order);
        assert_eq!(order, vec![a.key, b.key, d.key, d.key, c.key]);
    }

    #[test]
    fn fade_out_decays_then_resets_the_property() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let controller = world
            .manager
            .start(Arc::new(ConstAnimation::new(1.0f32)), prop, &world.registry)
            .unwrap();
        world.frame(0.1);
        assert_eq!(world.value(prop), 1.0);

        world
            .manager
            .stop_controller_with_fade(controller, Duration::from_millis(500));
        world.frame(0.25);
        assert_eq!(world.value(prop), 0.5);

        world.frame(0.25);
        // Fade finished: instance removed, chain reset the property.
        assert_eq!(world.value(prop), 0.0);
        assert!(!world.manager.is_animated(prop.erase(), &world.registry));
        assert!(!world.manager.is_valid(controller));
    }

    #[test]
    fn collected_target_is_pruned_without_error() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let controller = world
            .manager
            .start(Arc::new(ConstAnimation::new(1.0f32)), prop, &world.registry)
            .unwrap();
        world.frame(0.1);

        assert!(world.registry.destroy(prop.erase()));
        // One probe per frame; a single root needs at most two frames.
        world.frame(0.1);
        world.frame(0.1);
        assert!(!world.manager.is_valid(controller));
        assert_eq!(world.manager.chains.len(), 0);
    }

    #[test]
    fn completion_fires_exactly_once_during_apply() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let controller = world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world
            .manager
            .on_completed(controller, move |_, _| {
                observed.fetch_add(1, Ordering::SeqCst);
            });

        world.frame(0.6);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        world.frame(0.6);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        world.frame(0.6);
        world.frame(0.6);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_fill_completes_and_auto_recycles() {
        let mut world = World::new();
        let prop = world.scalar(0.5);
        let controller = world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0).with_fill(FillBehavior::Stop)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.frame(1.5);
        assert!(!world.manager.is_valid(controller));
        // The abandoned chain restored the base value and retired.
        assert_eq!(world.value(prop), 0.5);
        assert!(!world.manager.is_animated(prop.erase(), &world.registry));
    }

    struct PassThrough;

    impl Timeline for PassThrough {
        fn duration(&self) -> Option<f32> {
            None
        }

        fn instantiate(self: Arc<Self>) -> NodeKind {
            NodeKind::leaf::<f32>(self)
        }
    }

    impl Animation<f32> for PassThrough {
        fn evaluate(&self, _time: f32, default_source: &f32, _default_target: &f32) -> f32 {
            *default_source
        }
    }

    #[test]
    fn identity_stages_do_not_change_the_composed_value() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.frame(0.25);
        let before = world.value(prop);

        for _ in 0..3 {
            world
                .manager
                .start_with(
                    Arc::new(PassThrough),
                    prop,
                    Transition::compose(),
                    &world.registry,
                )
                .unwrap();
        }
        world.frame(0.0);
        assert_eq!(world.value(prop), before);
    }

    #[test]
    fn recycled_controllers_go_stale_and_read_sentinels() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let timeline: Arc<dyn Timeline> = Arc::new(ConstAnimation::new(1.0f32));
        let controller = world
            .manager
            .create_controller(Arc::clone(&timeline), &prop.into(), &world.registry)
            .unwrap();
        world
            .manager
            .start_controller(controller, Transition::default())
            .unwrap();
        world.frame(0.1);
        assert!(world.manager.is_valid(controller));

        world.manager.recycle(controller);
        assert!(!world.manager.is_valid(controller));
        assert_eq!(world.manager.state(controller), InstanceState::Stopped);
        assert_eq!(world.manager.time(controller), None);
        assert!(world.manager.speed(controller).is_nan());
        assert_eq!(
            world
                .manager
                .update_and_apply(controller, &mut world.registry)
                .unwrap_err(),
            AnimationError::Recycled,
        );

        // The pooled tree comes back with a new generation; the stale
        // controller stays stale.
        let fresh = world
            .manager
            .create_controller(timeline, &prop.into(), &world.registry)
            .unwrap();
        assert!(world.manager.is_valid(fresh));
        assert!(!world.manager.is_valid(controller));
    }

    #[test]
    fn starting_a_running_instance_is_an_error() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let controller = world
            .manager
            .create_controller(
                Arc::new(ConstAnimation::new(1.0f32)),
                &prop.into(),
                &world.registry,
            )
            .unwrap();
        world
            .manager
            .start_controller(controller, Transition::default())
            .unwrap();
        assert_eq!(
            world
                .manager
                .start_controller(controller, Transition::default())
                .unwrap_err(),
            AnimationError::AlreadyRunning,
        );
    }

    #[test]
    fn type_mismatch_surfaces_invalid_argument() {
        let mut world = World::new();
        let prop = world.registry.register(SimpleProperty::new(0.0f64));
        let result = world.manager.start(
            Arc::new(ConstAnimation::new(1.0f32)),
            prop,
            &world.registry,
        );
        assert!(matches!(result, Err(AnimationError::InvalidArgument(_))));
    }

    #[test]
    fn name_hints_bind_through_the_registry() {
        let mut world = World::new();
        let target = TargetId::from_names(["ball", "radius"]);
        let prop = world
            .registry
            .register_named(target, SimpleProperty::new(0.0f32));

        world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 2.0, 1.0).targeting_property("radius")),
                BindTarget::object("ball"),
                &world.registry,
            )
            .unwrap();
        world.frame(0.5);
        assert_eq!(world.value(prop), 1.0);
    }

    #[test]
    fn update_and_apply_refreshes_out_of_band() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let controller = world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.frame(0.25);

        world.manager.seek(controller, 0.75);
        world
            .manager
            .update_and_apply(controller, &mut world.registry)
            .unwrap();
        assert_eq!(world.value(prop), 0.75);
    }

    #[test]
    fn delayed_instances_contribute_nothing_until_time_zero() {
        let mut world = World::new();
        let prop = world.scalar(2.0);
        let controller = world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.manager.seek(controller, -0.5);

        world.frame(0.25);
        assert_eq!(world.manager.state(controller), InstanceState::Delayed);
        // The chain is live but the delayed stage passes the base through.
        assert_eq!(world.value(prop), 2.0);

        world.frame(0.5);
        assert_eq!(world.manager.state(controller), InstanceState::Playing);
        assert_eq!(world.value(prop), 0.25);
    }

    #[test]
    fn pause_holds_the_composed_value() {
        let mut world = World::new();
        let prop = world.scalar(0.0);
        let controller = world
            .manager
            .start(
                Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                prop,
                &world.registry,
            )
            .unwrap();
        world.frame(0.25);
        world.manager.pause(controller);
        world.frame(0.5);
        assert!(world.manager.is_paused(controller));
        assert_eq!(world.value(prop), 0.25);

        world.manager.resume(controller);
        world.frame(0.25);
        assert_eq!(world.value(prop), 0.5);
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let run = || {
            let mut world = World::new();
            let prop = world.scalar(0.0);
            let weight = world.registry.register(SimpleProperty::immediate(0.0f32));
            world
                .manager
                .start(
                    Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)),
                    weight,
                    &world.registry,
                )
                .unwrap();
            let value = world
                .manager
                .start(Arc::new(ConstAnimation::new(8.0f32)), prop, &world.registry)
                .unwrap();
            world.manager.set_weight_source(value, weight);

            let mut trace = Vec::new();
            for _ in 0..16 {
                world.frame(0.05);
                trace.push(world.value(prop).to_bits());
            }
            trace
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn stop_property_removes_every_touching_instance() {
        let mut world = World::new();
        let prop = world.scalar(1.5);
        for _ in 0..3 {
            world
                .manager
                .start_with(
                    Arc::new(ConstAnimation::new(9.0f32)),
                    prop,
                    Transition::compose(),
                    &world.registry,
                )
                .unwrap();
        }
        world.frame(0.1);
        assert_eq!(world.value(prop), 9.0);

        world.manager.stop_property(prop.erase());
        world.frame(0.1);
        assert_eq!(world.value(prop), 1.5);
        assert!(!world.manager.is_animated(prop.erase(), &world.registry));
    }
}
