//! The value-type capability bundle the blender is generic over.

use crate::util;

/// An animatable value type.
///
/// The runtime never does arithmetic on animated values itself; everything it
/// needs — the neutral element, linear blending, and the group operations
/// used for additive animations and cycle offsets — comes through this trait.
/// Implementations must be pure and must not allocate or block: they are
/// called from the hot per-frame blend loop, potentially from several worker
/// threads at once.
pub trait Animatable: Clone + Send + Sync + 'static {
    /// The neutral element for additive composition.
    fn identity() -> Self;

    /// Interpolates between `a` and `b` with an interpolation factor of `t`.
    ///
    /// The `t` parameter here may not be clamped to the range `[0.0, 1.0]`.
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self;

    /// Combines `a` and `b`, applying `b` on top of `a`.
    fn add(a: &Self, b: &Self) -> Self;

    /// The inverse element, such that `add(a, invert(a))` is the identity.
    fn invert(a: &Self) -> Self;

    /// Applies `a` onto itself `count` times. Negative counts apply the
    /// inverse. This is what accumulates per-cycle offsets when a looping
    /// animation is configured with [`LoopBehavior::CycleOffset`].
    ///
    /// [`LoopBehavior::CycleOffset`]: crate::util::LoopBehavior::CycleOffset
    fn repeat(a: &Self, count: i32) -> Self;

    /// Whether this value is the neutral element. Purely an optimization
    /// hint; the default conservatively says no.
    fn is_identity(&self) -> bool {
        false
    }
}

macro_rules! impl_float_animatable {
    ($ty: ty, $base: ty) => {
        impl Animatable for $ty {
            #[inline]
            fn identity() -> Self {
                0.0
            }

            #[inline]
            fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
                let t = <$base>::from(t);
                (*a) * (1.0 - t) + (*b) * t
            }

            #[inline]
            fn add(a: &Self, b: &Self) -> Self {
                a + b
            }

            #[inline]
            fn invert(a: &Self) -> Self {
                -a
            }

            #[inline]
            fn repeat(a: &Self, count: i32) -> Self {
                a * count as $base
            }

            #[inline]
            fn is_identity(&self) -> bool {
                *self == 0.0
            }
        }
    };
}

impl_float_animatable!(f32, f32);
impl_float_animatable!(f64, f64);

// Booleans form the xor group; interpolation is a step select.
impl Animatable for bool {
    #[inline]
    fn identity() -> Self {
        false
    }

    #[inline]
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
        util::step_unclamped(*a, *b, t)
    }

    #[inline]
    fn add(a: &Self, b: &Self) -> Self {
        a ^ b
    }

    #[inline]
    fn invert(a: &Self) -> Self {
        *a
    }

    #[inline]
    fn repeat(a: &Self, count: i32) -> Self {
        *a && count % 2 != 0
    }

    #[inline]
    fn is_identity(&self) -> bool {
        !*self
    }
}

#[cfg(feature = "glam")]
mod glam_impls {
    use super::Animatable;
    use glam::{Quat, Vec2, Vec3, Vec4};

    macro_rules! impl_vec_animatable {
        ($ty: ident) => {
            impl Animatable for $ty {
                #[inline]
                fn identity() -> Self {
                    $ty::ZERO
                }

                #[inline]
                fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
                    (*a) * (1.0 - t) + (*b) * t
                }

                #[inline]
                fn add(a: &Self, b: &Self) -> Self {
                    *a + *b
                }

                #[inline]
                fn invert(a: &Self) -> Self {
                    -*a
                }

                #[inline]
                fn repeat(a: &Self, count: i32) -> Self {
                    *a * count as f32
                }

                #[inline]
                fn is_identity(&self) -> bool {
                    *self == $ty::ZERO
                }
            }
        };
    }

    impl_vec_animatable!(Vec2);
    impl_vec_animatable!(Vec3);
    impl_vec_animatable!(Vec4);

    impl Animatable for Quat {
        #[inline]
        fn identity() -> Self {
            Quat::IDENTITY
        }

        /// Performs a slerp to smoothly interpolate between quaternions.
        #[inline]
        fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
            a.slerp(*b, t)
        }

        /// Rotation composition: `b` applied after `a`.
        #[inline]
        fn add(a: &Self, b: &Self) -> Self {
            *b * *a
        }

        #[inline]
        fn invert(a: &Self) -> Self {
            a.inverse()
        }

        fn repeat(a: &Self, count: i32) -> Self {
            let (axis, angle) = a.to_axis_angle();
            Quat::from_axis_angle(axis, angle * count as f32)
        }

        #[inline]
        fn is_identity(&self) -> bool {
            *self == Quat::IDENTITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_interpolation() {
        assert_eq!(f32::interpolate(&0.0, &10.0, 0.25), 2.5);
        assert_eq!(f64::interpolate(&-1.0, &1.0, 0.5), 0.0);
    }

    #[test]
    fn float_group_ops() {
        assert_eq!(f32::add(&2.0, &f32::invert(&2.0)), f32::identity());
        assert_eq!(f32::repeat(&1.5, 4), 6.0);
        assert_eq!(f32::repeat(&1.5, -2), -3.0);
        assert!(f32::identity().is_identity());
    }

    #[test]
    fn bool_steps_at_one() {
        assert!(!bool::interpolate(&false, &true, 0.99));
        assert!(bool::interpolate(&false, &true, 1.0));
    }

    #[test]
    fn bool_group_ops() {
        assert_eq!(bool::add(&true, &true), false);
        assert_eq!(bool::repeat(&true, 3), true);
        assert_eq!(bool::repeat(&true, 2), false);
    }
}
