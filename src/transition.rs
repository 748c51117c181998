//! Handoff strategies: how a new animation enters (or leaves) the
//! composition chains of its properties.

use core::time::Duration;

use crate::instance::InstanceKey;
use crate::manager::Controller;

/// How a starting animation treats whatever is already applied to its
/// properties.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Handoff {
    /// Drop the previous animations; start from the property's base value.
    Replace,
    /// Drop the previous animations, but first freeze their composed value
    /// so the new animation starts from what was visible.
    #[default]
    SnapshotAndReplace,
    /// Keep the previous animations and compose on top of them.
    Compose,
}

/// Describes how an instance is injected into its composition chains,
/// possibly over time. Built with the constructors below and passed to the
/// manager's start calls; the default is [`Transition::snapshot_and_replace`].
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub(crate) handoff: Handoff,
    pub(crate) anchor: Option<Controller>,
    pub(crate) fade_in: Option<f32>,
}

impl Default for Transition {
    fn default() -> Self {
        Self::snapshot_and_replace()
    }
}

impl Transition {
    /// Replace the chain contents; the new animation starts from the base
    /// value.
    pub fn replace() -> Self {
        Self {
            handoff: Handoff::Replace,
            anchor: None,
            fade_in: None,
        }
    }

    /// Replace the chain contents, starting from a snapshot of the value
    /// they last composed.
    pub fn snapshot_and_replace() -> Self {
        Self {
            handoff: Handoff::SnapshotAndReplace,
            anchor: None,
            fade_in: None,
        }
    }

    /// Compose on top of the existing animations.
    pub fn compose() -> Self {
        Self {
            handoff: Handoff::Compose,
            anchor: None,
            fade_in: None,
        }
    }

    /// Compose, inserting directly after the given instance's stages
    /// instead of at the top of the chain.
    pub fn compose_after(anchor: Controller) -> Self {
        Self {
            handoff: Handoff::Compose,
            anchor: Some(anchor),
            fade_in: None,
        }
    }

    /// Ramp the instance's weight from zero to its configured weight over
    /// `duration`. Composes unless combined with a replace handoff.
    pub fn with_fade_in(mut self, duration: Duration) -> Self {
        self.fade_in = Some(duration.as_secs_f32());
        self
    }

    /// A plain composing fade-in.
    pub fn fade_in(duration: Duration) -> Self {
        Self::compose().with_fade_in(duration)
    }
}

/// Lifecycle of a scheduled transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransitionState {
    Scheduled,
    Active,
    Done,
}

/// A weight ramp a transition drives after activation.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Fade {
    In { duration: f32, target_weight: f32 },
    Out { duration: f32, initial_weight: f32 },
}

/// A transition the manager is currently driving. Stepped serially in the
/// frame loop, between advancing instances and updating chains, because
/// activation mutates chain contents.
pub(crate) struct ActiveTransition {
    pub(crate) instance: InstanceKey,
    pub(crate) run_count: u32,
    /// Chain injection performed on activation, consumed afterwards.
    pub(crate) inject: Option<(Handoff, Option<InstanceKey>)>,
    pub(crate) fade: Option<Fade>,
    pub(crate) state: TransitionState,
    pub(crate) elapsed: f32,
}

impl ActiveTransition {
    pub(crate) fn new(
        instance: InstanceKey,
        run_count: u32,
        inject: Option<(Handoff, Option<InstanceKey>)>,
        fade: Option<Fade>,
    ) -> Self {
        Self {
            instance,
            run_count,
            inject,
            fade,
            state: TransitionState::Scheduled,
            elapsed: 0.0,
        }
    }

    /// Normalized fade progress after `elapsed` seconds. Zero-length fades
    /// complete immediately.
    pub(crate) fn progress(elapsed: f32, duration: f32) -> f32 {
        if duration <= 0.0 {
            1.0
        } else {
            (elapsed / duration).clamp(0.0, 1.0)
        }
    }
}
