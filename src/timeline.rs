//! The timing and value-producing contracts the scheduler consumes.

use core::any::TypeId;
use std::sync::{Arc, OnceLock};

use downcast_rs::{Downcast, impl_downcast};

use crate::animatable::Animatable;
use crate::chain::{CompositionChain, ErasedChain};
use crate::property::{ErasedHandle, PropertyRegistry};

/// What an animation contributes once its local time passes its duration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FillBehavior {
    /// Keep contributing the final value.
    #[default]
    Hold,
    /// Stop and drop out of the composition chain.
    Stop,
}

/// A description of timing: how long a playback runs, what happens at the
/// end, and optional name hints used to bind instances to properties.
///
/// Timelines are shared, immutable descriptions; per-playback state lives in
/// the instances the manager materializes from them. A timeline may be
/// composite, in which case [`children`](Self::children) is non-empty and
/// the node it instantiates carries no value of its own.
pub trait Timeline: Downcast + Send + Sync {
    /// Total duration in seconds. `None` means the timeline never ends on
    /// its own.
    fn duration(&self) -> Option<f32>;

    fn fill_behavior(&self) -> FillBehavior {
        FillBehavior::Hold
    }

    /// Name of the host object this timeline wants to animate, if it cares.
    fn target_object(&self) -> Option<&str> {
        None
    }

    /// Name of the property on the target object this timeline animates.
    fn target_property(&self) -> Option<&str> {
        None
    }

    /// Child timelines of a composite timeline.
    fn children(&self) -> &[Arc<dyn Timeline>] {
        &[]
    }

    /// Produces the per-playback node payload. Value-producing timelines
    /// return [`NodeKind::leaf`]; composites return [`NodeKind::group`].
    fn instantiate(self: Arc<Self>) -> NodeKind;
}
impl_downcast!(Timeline);

/// A [`Timeline`] that yields values of type `T`.
pub trait Animation<T: Animatable>: Timeline {
    /// Evaluates the animation at a local time in seconds.
    ///
    /// `default_source` is the value composed by the stages below this one
    /// in the chain (the snapshot or base value for the first stage);
    /// `default_target` is the property's base value. Implementations fall
    /// back to these when they have no explicit from/to value of their own,
    /// and additive animations add their contribution onto
    /// `default_source`. Must not allocate in the steady state.
    fn evaluate(&self, time: f32, default_source: &T, default_target: &T) -> T;

    /// Additive animations are composed onto the output of the stages below
    /// them rather than replacing it.
    fn is_additive(&self) -> bool {
        false
    }
}

/// The payload of one instantiated timeline node.
///
/// Opaque on purpose: the only thing an implementor of [`Timeline`] can do
/// with it is construct one of the two variants.
pub struct NodeKind(pub(crate) NodeKindInner);

pub(crate) enum NodeKindInner {
    Group,
    Leaf(Box<dyn AnimationEvaluator>),
}

impl NodeKind {
    /// Payload of a composite node; it blends nothing itself.
    pub fn group() -> Self {
        NodeKind(NodeKindInner::Group)
    }

    /// Payload of a value-producing node.
    pub fn leaf<T: Animatable>(animation: Arc<dyn Animation<T>>) -> Self {
        NodeKind(NodeKindInner::Leaf(Box::new(AnimatableEvaluator { animation })))
    }
}

/// Type-erased access to a leaf's animation, so instance trees of mixed
/// value types can live in one arena. The typed half is
/// [`AnimatableEvaluator`], recovered by downcast inside the composition
/// chain of the matching value type.
pub(crate) trait AnimationEvaluator: Downcast + Send + Sync {
    fn value_type(&self) -> TypeId;

    /// Whether this leaf can be assigned to the given property.
    fn accepts(&self, handle: ErasedHandle) -> bool {
        handle.type_id == self.value_type()
    }

    /// Builds the composition chain for a property of this leaf's value
    /// type. `None` if the property is no longer alive.
    fn create_chain(
        &self,
        handle: ErasedHandle,
        registry: &PropertyRegistry,
    ) -> Option<Box<dyn ErasedChain>>;
}
impl_downcast!(AnimationEvaluator);

pub(crate) struct AnimatableEvaluator<T: Animatable> {
    pub(crate) animation: Arc<dyn Animation<T>>,
}

impl<T: Animatable> AnimationEvaluator for AnimatableEvaluator<T> {
    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn create_chain(
        &self,
        handle: ErasedHandle,
        registry: &PropertyRegistry,
    ) -> Option<Box<dyn ErasedChain>> {
        let typed = handle.typed::<T>()?;
        let (hash, immediate) = registry.chain_meta(typed)?;
        Some(Box::new(CompositionChain::<T>::new(typed, hash, immediate)))
    }
}

/// A composite timeline: a set of child timelines played together as a
/// unit, the way a clip drives several channels at once.
#[derive(Default)]
pub struct TimelineGroup {
    children: Vec<Arc<dyn Timeline>>,
    // Computed from the children on first use and published once; readers on
    // other worker threads see either nothing or the finished value.
    duration: OnceLock<Option<f32>>,
}

impl TimelineGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style child registration. Children must be in place before
    /// the group is first scheduled; the computed duration is cached.
    pub fn with_child(mut self, child: impl Timeline) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    /// Adds an already-shared child timeline.
    pub fn with_shared_child(mut self, child: Arc<dyn Timeline>) -> Self {
        self.children.push(child);
        self
    }
}

impl Timeline for TimelineGroup {
    /// The longest child duration, or `None` if any child is unbounded.
    fn duration(&self) -> Option<f32> {
        *self.duration.get_or_init(|| {
            self.children
                .iter()
                .try_fold(0.0f32, |max, child| child.duration().map(|d| max.max(d)))
        })
    }

    fn children(&self) -> &[Arc<dyn Timeline>] {
        &self.children
    }

    fn instantiate(self: Arc<Self>) -> NodeKind {
        NodeKind::group()
    }
}
