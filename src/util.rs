//! Time math shared by timelines and the scheduler.

/// What a timeline does with local times past its duration when it is
/// configured to keep running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum LoopBehavior {
    /// Play once and clamp at the final value.
    #[default]
    Once,
    /// Wrap around to the start of the cycle.
    Cycle,
    /// Wrap around, shifting each cycle by the net change of the previous
    /// one. Requires the value type's group operations.
    CycleOffset,
    /// Play forward, then backward, alternating every cycle.
    Oscillate,
}

/// Maps an absolute local time onto a time inside the cycle `[0, duration]`,
/// returning the wrapped time and the number of whole cycles completed.
///
/// The completed-cycle count is what [`CycleOffset`] feeds into
/// [`Animatable::repeat`] to accumulate the per-cycle delta.
///
/// [`CycleOffset`]: LoopBehavior::CycleOffset
/// [`Animatable::repeat`]: crate::animatable::Animatable::repeat
pub fn loop_time(time: f32, duration: f32, behavior: LoopBehavior) -> (f32, i32) {
    if duration <= 0.0 {
        return (0.0, 0);
    }
    if behavior == LoopBehavior::Once {
        return (time.clamp(0.0, duration), 0);
    }
    let time = time.max(0.0);
    let mut cycles = (time / duration).floor();
    let mut local = time - cycles * duration;
    // Landing exactly on a cycle boundary reads as the end of the previous
    // cycle, not the start of the next, so the final key frame is observed.
    if local == 0.0 && cycles > 0.0 {
        cycles -= 1.0;
        local = duration;
    }
    let cycles = cycles as i32;
    match behavior {
        LoopBehavior::Oscillate if cycles % 2 != 0 => (duration - local, cycles),
        _ => (local, cycles),
    }
}

/// Steps from `a` to `b` when `t` reaches 1.0, without clamping `t`.
pub(crate) fn step_unclamped<T>(a: T, b: T, t: f32) -> T {
    if t >= 1.0 { b } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_clamps() {
        assert_eq!(loop_time(0.25, 1.0, LoopBehavior::Once), (0.25, 0));
        assert_eq!(loop_time(2.5, 1.0, LoopBehavior::Once), (1.0, 0));
        assert_eq!(loop_time(-0.5, 1.0, LoopBehavior::Once), (0.0, 0));
    }

    #[test]
    fn cycle_wraps_and_counts() {
        assert_eq!(loop_time(2.25, 1.0, LoopBehavior::Cycle), (0.25, 2));
        assert_eq!(loop_time(0.75, 1.0, LoopBehavior::CycleOffset), (0.75, 0));
        assert_eq!(loop_time(1.75, 1.0, LoopBehavior::CycleOffset), (0.75, 1));
    }

    #[test]
    fn cycle_boundary_holds_the_end() {
        // Exactly two cycles in reads as the end of cycle one.
        assert_eq!(loop_time(2.0, 1.0, LoopBehavior::Cycle), (1.0, 1));
        assert_eq!(loop_time(0.0, 1.0, LoopBehavior::Cycle), (0.0, 0));
    }

    #[test]
    fn oscillate_reverses_odd_cycles() {
        assert_eq!(loop_time(0.25, 1.0, LoopBehavior::Oscillate), (0.25, 0));
        assert_eq!(loop_time(1.25, 1.0, LoopBehavior::Oscillate), (0.75, 1));
        assert_eq!(loop_time(2.25, 1.0, LoopBehavior::Oscillate), (0.25, 2));
    }

    #[test]
    fn zero_duration_is_inert() {
        assert_eq!(loop_time(3.0, 0.0, LoopBehavior::Cycle), (0.0, 0));
    }
}
