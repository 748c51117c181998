//! Composition chains: the ordered per-property blend stacks.

use downcast_rs::{Downcast, impl_downcast};
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::animatable::Animatable;
use crate::instance::{AnimationInstance, InstanceKey, InstanceState};
use crate::property::{ErasedHandle, PropertyHandle, PropertyRegistry};
use crate::timeline::AnimatableEvaluator;

/// One stage of a chain: a bound leaf node of a scheduled instance tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StageRef {
    pub(crate) instance: InstanceKey,
    pub(crate) node: usize,
}

/// The value-type-erased face of a [`CompositionChain`], so chains of mixed
/// value types can live in one collection. All ordering and membership
/// operations are type-independent; only `update`/`apply` touch values, and
/// they do so behind the monomorphic implementation.
pub(crate) trait ErasedChain: Downcast + Send + Sync {
    fn identity(&self) -> ErasedHandle;
    fn property_hash(&self) -> u64;
    fn is_immediate(&self) -> bool;
    fn is_empty(&self) -> bool;

    /// Composes the chain's pending value for this frame. Read-only with
    /// respect to everything shared, so chains can be updated in parallel.
    fn update(
        &mut self,
        instances: &SlotMap<InstanceKey, AnimationInstance>,
        registry: &PropertyRegistry,
        weight_epsilon: f32,
    );

    /// Immediate chains write their pending value during `update`, at the
    /// serialization point between the immediate and ordinary phases.
    fn write_through(&mut self, registry: &mut PropertyRegistry);

    /// Writes the pending value (ordinary chains) and maintains the
    /// property's `is_animated` mirror. Returns `true` when the chain has
    /// finished resetting an abandoned property, or lost its property
    /// altogether, and should be dropped from the collection.
    fn apply(&mut self, registry: &mut PropertyRegistry) -> bool;

    /// Freezes the currently visible composed value so a replacement
    /// animation can start from it.
    fn take_snapshot(&mut self, registry: &PropertyRegistry);

    /// Inserts a stage, ordering it after the anchor tree's stages and
    /// after any stages of its own tree already present.
    fn insert_stage(&mut self, stage: StageRef, anchor: Option<InstanceKey>);

    /// Drops every stage not belonging to `keep`, recording the trees that
    /// lost stages.
    fn retain_tree(&mut self, keep: InstanceKey, dropped: &mut Vec<InstanceKey>);

    /// Drops every stage of the given tree.
    fn remove_tree(&mut self, instance: InstanceKey);

    fn contains_tree(&self, instance: InstanceKey) -> bool;

    /// Appends the tree of every stage, in stage order.
    fn collect_trees(&self, out: &mut Vec<InstanceKey>);
}
impl_downcast!(ErasedChain);

/// The ordered stack of animation stages applying to one property.
///
/// Stages compose in insertion order: each stage sees the output of the
/// stages below it as its `default_source`, so a full-weight stage replaces
/// everything beneath it while fractional weights and additive animations
/// blend with it. The chain holds the property weakly; once the host drops
/// the property the chain reports itself removable.
pub(crate) struct CompositionChain<T: Animatable> {
    property: PropertyHandle<T>,
    erased: ErasedHandle,
    hash: u64,
    immediate: bool,
    stages: SmallVec<[StageRef; 2]>,
    /// Captured composed value consumed as the first stage's source by the
    /// next update.
    snapshot: Option<T>,
    /// The value composed by the most recent update; what `apply` writes
    /// and what the next snapshot freezes.
    composed: Option<T>,
    property_dead: bool,
}

impl<T: Animatable> CompositionChain<T> {
    pub(crate) fn new(property: PropertyHandle<T>, hash: u64, immediate: bool) -> Self {
        Self {
            property,
            erased: property.erase(),
            hash,
            immediate,
            stages: SmallVec::new(),
            snapshot: None,
            composed: None,
            property_dead: false,
        }
    }

    fn stage_value(
        stage: &StageRef,
        instances: &SlotMap<InstanceKey, AnimationInstance>,
        registry: &PropertyRegistry,
        source: T,
        target: &T,
        weight_epsilon: f32,
    ) -> T {
        let Some(tree) = instances.get(stage.instance) else {
            return source;
        };
        let Some(node) = tree.nodes.get(stage.node) else {
            return source;
        };
        if matches!(node.state, InstanceState::Delayed | InstanceState::Stopped) {
            return source;
        }
        let Some(evaluator) = node
            .evaluator()
            .and_then(|e| e.downcast_ref::<AnimatableEvaluator<T>>())
        else {
            return source;
        };

        let weight = tree.effective_weight(stage.node, registry);
        if weight.abs() <= weight_epsilon {
            return source;
        }
        let time = node.eval_time();
        if (weight - 1.0).abs() <= weight_epsilon {
            evaluator.animation.evaluate(time, &source, target)
        } else {
            let value = evaluator.animation.evaluate(time, &source, target);
            T::interpolate(&source, &value, weight)
        }
    }
}

impl<T: Animatable> ErasedChain for CompositionChain<T> {
    fn identity(&self) -> ErasedHandle {
        self.erased
    }

    fn property_hash(&self) -> u64 {
        self.hash
    }

    fn is_immediate(&self) -> bool {
        self.immediate
    }

    fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn update(
        &mut self,
        instances: &SlotMap<InstanceKey, AnimationInstance>,
        registry: &PropertyRegistry,
        weight_epsilon: f32,
    ) {
        let Some(property) = registry.get(self.property) else {
            self.property_dead = true;
            self.snapshot = None;
            self.composed = None;
            return;
        };
        if self.stages.is_empty() {
            self.snapshot = None;
            self.composed = None;
            return;
        }

        let base = property.base_value();
        let target = base.clone().unwrap_or_else(T::identity);
        let mut source = match self.snapshot.take() {
            Some(snapshot) => snapshot,
            None => base.unwrap_or_else(T::identity),
        };
        for stage in &self.stages {
            source = Self::stage_value(stage, instances, registry, source, &target, weight_epsilon);
        }
        self.composed = Some(source);
    }

    fn write_through(&mut self, registry: &mut PropertyRegistry) {
        if !self.immediate {
            return;
        }
        if let Some(value) = self.composed.clone()
            && let Some(property) = registry.get_mut(self.property)
        {
            property.set_animated_value(value);
            property.set_is_animated(true);
        }
    }

    fn apply(&mut self, registry: &mut PropertyRegistry) -> bool {
        if self.property_dead {
            return true;
        }
        let Some(property) = registry.get_mut(self.property) else {
            return true;
        };
        if self.stages.is_empty() {
            // One reset write, then the chain retires.
            if let Some(base) = property.base_value() {
                property.set_animated_value(base);
            }
            property.set_is_animated(false);
            return true;
        }
        if !self.immediate {
            if let Some(value) = self.composed.clone() {
                property.set_animated_value(value);
            }
            property.set_is_animated(true);
        }
        false
    }

    fn take_snapshot(&mut self, registry: &PropertyRegistry) {
        let current = self
            .composed
            .clone()
            .or_else(|| registry.get(self.property).and_then(|p| p.base_value()));
        self.snapshot = Some(current.unwrap_or_else(T::identity));
    }

    fn insert_stage(&mut self, stage: StageRef, anchor: Option<InstanceKey>) {
        if self.stages.contains(&stage) {
            return;
        }
        let insert_at = self
            .stages
            .iter()
            .rposition(|s| Some(s.instance) == anchor || s.instance == stage.instance)
            .map(|i| i + 1)
            .unwrap_or(self.stages.len());
        self.stages.insert(insert_at, stage);
    }

    fn retain_tree(&mut self, keep: InstanceKey, dropped: &mut Vec<InstanceKey>) {
        self.stages.retain(|stage| {
            if stage.instance == keep {
                true
            } else {
                dropped.push(stage.instance);
                false
            }
        });
    }

    fn remove_tree(&mut self, instance: InstanceKey) {
        self.stages.retain(|stage| stage.instance != instance);
    }

    fn contains_tree(&self, instance: InstanceKey) -> bool {
        self.stages.iter().any(|stage| stage.instance == instance)
    }

    fn collect_trees(&self, out: &mut Vec<InstanceKey>) {
        out.extend(self.stages.iter().map(|stage| stage.instance));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::{ConstAnimation, FromToAnimation};
    use crate::property::SimpleProperty;
    use crate::timeline::Timeline;
    use std::sync::Arc;

    struct Rig {
        instances: SlotMap<InstanceKey, AnimationInstance>,
        registry: PropertyRegistry,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                instances: SlotMap::with_key(),
                registry: PropertyRegistry::new(),
            }
        }

        fn spawn(&mut self, timeline: Arc<dyn Timeline>, time: f32) -> InstanceKey {
            let mut tree = AnimationInstance::empty();
            tree.rebuild(&timeline);
            tree.seek(time);
            self.instances.insert(tree)
        }

        fn chain_for(&mut self, base: f32) -> (CompositionChain<f32>, PropertyHandle<f32>) {
            let handle = self.registry.register(SimpleProperty::new(base));
            let (hash, immediate) = self.registry.chain_meta(handle).unwrap();
            (CompositionChain::new(handle, hash, immediate), handle)
        }

        fn value_of(&self, handle: PropertyHandle<f32>) -> f32 {
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
    fn single_stage_composes_from_the_base() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(0.0);
        let key = rig.spawn(Arc::new(FromToAnimation::new(0.0f32, 1.0, 1.0)), 0.25);
        chain.insert_stage(StageRef { instance: key, node: 0 }, None);

        chain.update(&rig.instances, &rig.registry, 1e-4);
        assert!(!chain.apply(&mut rig.registry));
        assert_eq!(rig.value_of(handle), 0.25);
    }

    #[test]
    fn later_stages_see_earlier_output() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(0.0);
        let lower = rig.spawn(Arc::new(ConstAnimation::new(2.0f32)), 0.0);
        // Open endpoints: starts from the lower stage's output.
        let upper = rig.spawn(
            Arc::new(FromToAnimation::<f32>::partial(None, Some(10.0), 1.0)),
            0.5,
        );
        chain.insert_stage(StageRef { instance: lower, node: 0 }, None);
        chain.insert_stage(StageRef { instance: upper, node: 0 }, None);

        chain.update(&rig.instances, &rig.registry, 1e-4);
        chain.apply(&mut rig.registry);
        assert_eq!(rig.value_of(handle), 6.0);
    }

    #[test]
    fn fractional_weight_blends_with_the_source() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(0.0);
        let key = rig.spawn(Arc::new(ConstAnimation::new(10.0f32)), 0.0);
        rig.instances[key].root_mut().weight = 0.5;
        chain.insert_stage(StageRef { instance: key, node: 0 }, None);

        chain.update(&rig.instances, &rig.registry, 1e-4);
        chain.apply(&mut rig.registry);
        assert_eq!(rig.value_of(handle), 5.0);
    }

    #[test]
    fn zero_weight_and_stopped_stages_pass_the_source_through() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(3.0);
        let muted = rig.spawn(Arc::new(ConstAnimation::new(10.0f32)), 0.0);
        rig.instances[muted].root_mut().weight = 0.0;
        let stopped = rig.spawn(Arc::new(ConstAnimation::new(20.0f32)), 0.0);
        rig.instances[stopped].mark_stopped();
        chain.insert_stage(StageRef { instance: muted, node: 0 }, None);
        chain.insert_stage(StageRef { instance: stopped, node: 0 }, None);

        chain.update(&rig.instances, &rig.registry, 1e-4);
        chain.apply(&mut rig.registry);
        assert_eq!(rig.value_of(handle), 3.0);
    }

    #[test]
    fn snapshot_feeds_the_first_stage_once() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(0.0);
        let first = rig.spawn(Arc::new(ConstAnimation::new(0.5f32)), 0.0);
        chain.insert_stage(StageRef { instance: first, node: 0 }, None);
        chain.update(&rig.instances, &rig.registry, 1e-4);

        chain.take_snapshot(&rig.registry);
        let mut dropped = Vec::new();
        let replacement = rig.spawn(
            Arc::new(FromToAnimation::<f32>::partial(None, None, 1.0)),
            0.0,
        );
        chain.retain_tree(replacement, &mut dropped);
        assert_eq!(dropped, vec![first]);
        chain.insert_stage(StageRef { instance: replacement, node: 0 }, None);

        chain.update(&rig.instances, &rig.registry, 1e-4);
        chain.apply(&mut rig.registry);
        // The replacement starts from the snapshot, not from the base.
        assert_eq!(rig.value_of(handle), 0.5);
    }

    #[test]
    fn compose_anchoring_orders_stages() {
        let mut rig = Rig::new();
        let (mut chain, _) = rig.chain_for(0.0);
        let anim = || -> Arc<dyn Timeline> { Arc::new(ConstAnimation::new(0.0f32)) };
        let two_leaves: Arc<dyn Timeline> = Arc::new(
            crate::timeline::TimelineGroup::new()
                .with_child(ConstAnimation::new(0.0f32))
                .with_child(ConstAnimation::new(0.0f32)),
        );
        let (a, b, c) = (rig.spawn(anim(), 0.0), rig.spawn(anim(), 0.0), rig.spawn(anim(), 0.0));
        let d = rig.spawn(two_leaves, 0.0);
        for key in [a, b, c] {
            chain.insert_stage(StageRef { instance: key, node: 0 }, None);
        }

        // D composed after B lands between B and C.
        chain.insert_stage(StageRef { instance: d, node: 1 }, Some(b));
        // A second leaf of D's tree, same anchor, preserves tree ordering.
        chain.insert_stage(StageRef { instance: d, node: 2 }, Some(b));

        let mut order = Vec::new();
        chain.collect_trees(&mut order);
        assert_eq!(order, vec![a, b, d, d, c]);
    }

    #[test]
    fn empty_chain_resets_the_property_once() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(7.0);
        let key = rig.spawn(Arc::new(ConstAnimation::new(1.0f32)), 0.0);
        chain.insert_stage(StageRef { instance: key, node: 0 }, None);
        chain.update(&rig.instances, &rig.registry, 1e-4);
        chain.apply(&mut rig.registry);
        assert!(rig.registry.get(handle).unwrap().downcast_ref::<SimpleProperty<f32>>().unwrap().is_animated());

        chain.remove_tree(key);
        chain.update(&rig.instances, &rig.registry, 1e-4);
        assert!(chain.apply(&mut rig.registry));
        let cell = rig
            .registry
            .get(handle)
            .unwrap()
            .downcast_ref::<SimpleProperty<f32>>()
            .unwrap();
        assert!(!cell.is_animated());
        assert_eq!(*cell.value(), 7.0);
    }

    #[test]
    fn dead_property_retires_the_chain() {
        let mut rig = Rig::new();
        let (mut chain, handle) = rig.chain_for(0.0);
        let key = rig.spawn(Arc::new(ConstAnimation::new(1.0f32)), 0.0);
        chain.insert_stage(StageRef { instance: key, node: 0 }, None);

        rig.registry.remove(handle);
        chain.update(&rig.instances, &rig.registry, 1e-4);
        assert!(chain.apply(&mut rig.registry));
    }
}
