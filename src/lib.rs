#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A general-purpose animation scheduling and blending runtime.
//!
//! The runtime is agnostic of *what* is animated — scalars, vectors,
//! rotations, colors, skeletal poses — because all value arithmetic goes
//! through the [`Animatable`](animatable::Animatable) capability trait.
//! What it owns is the hard
//! part in the middle: advancing a population of concurrent animation
//! trees, handing playback over between animations (replace, snapshot,
//! compose, fade), blending the ordered stack of animations on each
//! property into one value per frame, and cleaning up after targets the
//! host has dropped.
//!
//! The host drives the loop and owns both the clock and the properties:
//!
//! ```
//! use std::sync::Arc;
//! use mica_animation::prelude::*;
//!
//! let mut registry = PropertyRegistry::new();
//! let mut manager = AnimationManager::new();
//!
//! let radius = registry.register(SimpleProperty::new(1.0f32));
//! manager
//!     .start(
//!         Arc::new(FromToAnimation::new(1.0f32, 3.0, 1.0)),
//!         radius,
//!         &registry,
//!     )
//!     .unwrap();
//!
//! manager.update(0.5, &mut registry);
//! manager.apply(&mut registry);
//!
//! let cell = registry
//!     .get(radius)
//!     .unwrap()
//!     .downcast_ref::<SimpleProperty<f32>>()
//!     .unwrap();
//! assert_eq!(*cell.value(), 2.0);
//! ```
//!
//! Per frame, [`update`](manager::AnimationManager::update) advances every
//! scheduled instance tree (in parallel with the `parallel` feature),
//! steps transitions, prunes finished trees, and composes every
//! [composition chain] — all weight-controlling (immediate) chains
//! strictly before any ordinary chain, so a weight animated this frame is
//! observed this frame. [`apply`](manager::AnimationManager::apply) then
//! writes the results to the host's properties and fires completion
//! handlers.
//!
//! [composition chain]: crate::manager::AnimationManager

use core::hash::{Hash, Hasher};
use core::iter;

use thiserror::Error;
use uuid::Uuid;

pub mod animatable;
pub mod basic;
pub mod manager;
pub mod property;
pub mod timeline;
pub mod transition;
pub mod util;

mod chain;
mod collection;
mod instance;

pub use instance::InstanceState;

/// The most common types, re-exported for convenience.
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        AnimationError, InstanceState, TargetId,
        animatable::Animatable,
        basic::{ConstAnimation, EasingFn, FromToAnimation},
        manager::{AnimationManager, BindTarget, Controller, ManagerSettings},
        property::{
            AnimatableProperty, ErasedHandle, PropertyHandle, PropertyRegistry, SimpleProperty,
        },
        timeline::{Animation, FillBehavior, NodeKind, Timeline, TimelineGroup},
        transition::{Handoff, Transition},
        util::LoopBehavior,
    };
}

/// The UUID namespace animation target ids are derived in.
pub static TARGET_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8a6f1c025d4e4b8b9c4732e006b1d95a);

/// A stable identifier for a named animation target (an object property,
/// a bone, a channel).
///
/// Ids are derived by hashing the name path from the host object to the
/// property, so any host that registers a property under the same path
/// produces the same id — which is what lets a timeline authored against
/// one object retarget onto another with matching names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetId(pub Uuid);

impl TargetId {
    /// Derives an id from a name path, e.g. `["ball", "radius"]`.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TARGET_ID_NAMESPACE.as_bytes());
        for name in names {
            hasher.update(name.as_bytes());
        }
        let hash = hasher.finalize().as_bytes()[0..16]
            .try_into()
            .expect("blake3 output is at least 16 bytes");
        Self(*uuid::Builder::from_sha1_bytes(hash).as_uuid())
    }

    /// Derives an id from a single name.
    pub fn from_name(name: &str) -> Self {
        Self::from_names(iter::once(name))
    }

    /// The 64-bit hash the chain collection orders chains by.
    pub(crate) fn stable_hash(&self) -> u64 {
        let (hi, lo) = self.0.as_u64_pair();
        hi ^ lo
    }
}

impl Hash for TargetId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.stable_hash());
    }
}

/// Why the runtime refused an operation.
///
/// Only first-time operations surface errors (`create_controller`,
/// `start`, an explicit `update_and_apply`). Routine controls on a stale
/// controller — pause, stop, set speed — are silently ignored and read
/// back as sentinel values instead, so fire-and-forget animations don't
/// turn into error storms.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AnimationError {
    /// `start` was invoked on an instance that is not stopped.
    #[error("the animation instance is already running")]
    AlreadyRunning,
    /// The controller's instance has been returned to the pool.
    #[error("the controller refers to a recycled animation instance")]
    Recycled,
    /// Internal invariant violation: a non-root instance was scheduled as
    /// a root.
    #[error("the instance is not a root of the animation forest")]
    NotRoot,
    /// A required property or argument was missing or unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
