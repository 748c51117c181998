//! Minimal built-in animations.
//!
//! Key-frame curves, paths, and easing libraries live outside the runtime;
//! these two shapes exist so a host can drive properties without pulling any
//! of that in, and they double as the reference implementations of the
//! [`Animation`] contract.

use std::sync::Arc;

use crate::animatable::Animatable;
use crate::timeline::{Animation, FillBehavior, NodeKind, Timeline};
use crate::util::{LoopBehavior, loop_time};

/// A plain easing function over the normalized progress `[0, 1]`.
pub type EasingFn = fn(f32) -> f32;

/// Linearly animates from one value to another over a fixed duration.
///
/// Either endpoint may be left open: an open `from` starts at whatever the
/// stages below this one composed (or the snapshot a handoff captured), and
/// an open `to` ends at the property's base value. This is what makes
/// snapshot handoffs seamless — the incoming animation picks up exactly
/// where the outgoing one left the property.
pub struct FromToAnimation<T: Animatable> {
    from: Option<T>,
    to: Option<T>,
    duration: f32,
    easing: Option<EasingFn>,
    fill: FillBehavior,
    looping: LoopBehavior,
    additive: bool,
    target_object: Option<String>,
    target_property: Option<String>,
}

impl<T: Animatable> FromToAnimation<T> {
    /// Animates `from` → `to` over `duration` seconds.
    pub fn new(from: T, to: T, duration: f32) -> Self {
        Self::partial(Some(from), Some(to), duration)
    }

    /// Like [`new`](Self::new), but either endpoint may defer to the
    /// composition defaults.
    pub fn partial(from: Option<T>, to: Option<T>, duration: f32) -> Self {
        Self {
            from,
            to,
            duration,
            easing: None,
            fill: FillBehavior::default(),
            looping: LoopBehavior::default(),
            additive: false,
            target_object: None,
            target_property: None,
        }
    }

    pub fn with_easing(mut self, easing: EasingFn) -> Self {
        self.easing = Some(easing);
        self
    }

    pub fn with_fill(mut self, fill: FillBehavior) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_loop(mut self, looping: LoopBehavior) -> Self {
        self.looping = looping;
        self
    }

    /// Marks the animation additive: its value is added onto the output of
    /// the stages below it instead of replacing them.
    pub fn additive(mut self) -> Self {
        self.additive = true;
        self
    }

    /// Name hints used when the instance is bound to a host object rather
    /// than directly to a property.
    pub fn targeting(
        mut self,
        object: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        self.target_object = Some(object.into());
        self.target_property = Some(property.into());
        self
    }

    /// Property name hint only; the object comes from the start call.
    pub fn targeting_property(mut self, property: impl Into<String>) -> Self {
        self.target_property = Some(property.into());
        self
    }
}

impl<T: Animatable> Timeline for FromToAnimation<T> {
    fn duration(&self) -> Option<f32> {
        match self.looping {
            LoopBehavior::Once => Some(self.duration),
            _ => None,
        }
    }

    fn fill_behavior(&self) -> FillBehavior {
        self.fill
    }

    fn target_object(&self) -> Option<&str> {
        self.target_object.as_deref()
    }

    fn target_property(&self) -> Option<&str> {
        self.target_property.as_deref()
    }

    fn instantiate(self: Arc<Self>) -> NodeKind {
        NodeKind::leaf::<T>(self)
    }
}

impl<T: Animatable> Animation<T> for FromToAnimation<T> {
    fn evaluate(&self, time: f32, default_source: &T, default_target: &T) -> T {
        let (local, cycles) = loop_time(time, self.duration, self.looping);
        let progress = if self.duration <= 0.0 {
            1.0
        } else {
            local / self.duration
        };
        let progress = match self.easing {
            Some(ease) => ease(progress),
            None => progress,
        };

        let from = self.from.as_ref().unwrap_or(default_source);
        let to = self.to.as_ref().unwrap_or(default_target);
        let mut value = T::interpolate(from, to, progress);

        if self.looping == LoopBehavior::CycleOffset && cycles != 0 {
            // Shift by the net change of every completed cycle.
            let delta = T::add(&T::invert(from), to);
            value = T::add(&value, &T::repeat(&delta, cycles));
        }
        if self.additive {
            value = T::add(default_source, &value);
        }
        value
    }

    fn is_additive(&self) -> bool {
        self.additive
    }
}

/// Holds a single value for its whole (possibly unbounded) duration.
pub struct ConstAnimation<T: Animatable> {
    value: T,
    duration: Option<f32>,
    target_object: Option<String>,
    target_property: Option<String>,
}

impl<T: Animatable> ConstAnimation<T> {
    /// Holds `value` forever (until stopped or replaced).
    pub fn new(value: T) -> Self {
        Self {
            value,
            duration: None,
            target_object: None,
            target_property: None,
        }
    }

    pub fn with_duration(mut self, duration: f32) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn targeting(
        mut self,
        object: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        self.target_object = Some(object.into());
        self.target_property = Some(property.into());
        self
    }

    pub fn targeting_property(mut self, property: impl Into<String>) -> Self {
        self.target_property = Some(property.into());
        self
    }
}

impl<T: Animatable> Timeline for ConstAnimation<T> {
    fn duration(&self) -> Option<f32> {
        self.duration
    }

    fn target_object(&self) -> Option<&str> {
        self.target_object.as_deref()
    }

    fn target_property(&self) -> Option<&str> {
        self.target_property.as_deref()
    }

    fn instantiate(self: Arc<Self>) -> NodeKind {
        NodeKind::leaf::<T>(self)
    }
}

impl<T: Animatable> Animation<T> for ConstAnimation<T> {
    fn evaluate(&self, _time: f32, _default_source: &T, _default_target: &T) -> T {
        self.value.clone()
    }
}
