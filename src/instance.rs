//! Per-playback state: the instance trees the manager schedules.

use std::sync::Arc;

use slotmap::new_key_type;

use crate::property::{ErasedHandle, PropertyHandle, PropertyRegistry};
use crate::timeline::{AnimationEvaluator, FillBehavior, NodeKindInner, Timeline};

new_key_type! {
    /// Key of a scheduled instance tree inside the manager's arena.
    pub struct InstanceKey;
}

/// Playback state of an instance node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum InstanceState {
    /// Local time is still negative; the node contributes nothing yet.
    Delayed,
    Playing,
    /// Past its duration with [`FillBehavior::Hold`]: the node keeps
    /// contributing its final value.
    Filling,
    /// Not running. At rest this is equivalent to having no local time.
    #[default]
    Stopped,
}

/// One node of an instance tree: the mutable playback state for a single
/// timeline. Composite timelines produce a group node plus one node per
/// child, in parent-first order, so a plain index walk visits parents
/// before children.
pub(crate) struct InstanceNode {
    pub(crate) timeline: Arc<dyn Timeline>,
    pub(crate) kind: NodeKindInner,
    pub(crate) parent: Option<usize>,
    /// The property this node's value is applied to, for leaves that have
    /// been bound.
    pub(crate) assignment: Option<ErasedHandle>,
    pub(crate) time: Option<f32>,
    pub(crate) state: InstanceState,
    pub(crate) speed: f32,
    pub(crate) paused: bool,
    pub(crate) weight: f32,
    /// Optional immediate property driving this node's weight; read after
    /// the immediate chains have written, within the same frame.
    pub(crate) weight_source: Option<PropertyHandle<f32>>,
    // Cascaded down the tree each advance.
    effective_speed: f32,
    effective_paused: bool,
}

impl InstanceNode {
    fn new(timeline: Arc<dyn Timeline>, parent: Option<usize>) -> Self {
        let kind = Arc::clone(&timeline).instantiate().0;
        Self {
            timeline,
            kind,
            parent,
            assignment: None,
            time: None,
            state: InstanceState::Stopped,
            speed: 1.0,
            paused: false,
            weight: 1.0,
            weight_source: None,
            effective_speed: 1.0,
            effective_paused: false,
        }
    }

    /// Assigns a local time and recomputes the state, honoring duration and
    /// fill behavior. `None` stops the node.
    pub(crate) fn set_time(&mut self, time: Option<f32>) {
        let Some(t) = time else {
            self.time = None;
            self.state = InstanceState::Stopped;
            return;
        };
        if t < 0.0 {
            self.time = Some(t);
            self.state = InstanceState::Delayed;
            return;
        }
        match self.timeline.duration() {
            Some(duration) if t >= duration => match self.timeline.fill_behavior() {
                FillBehavior::Hold => {
                    self.time = Some(t);
                    self.state = InstanceState::Filling;
                }
                FillBehavior::Stop => {
                    self.time = None;
                    self.state = InstanceState::Stopped;
                }
            },
            _ => {
                self.time = Some(t);
                self.state = InstanceState::Playing;
            }
        }
    }

    /// The time the animation is evaluated at: the local time clamped into
    /// the timeline's duration while filling.
    pub(crate) fn eval_time(&self) -> f32 {
        let t = self.time.unwrap_or(0.0);
        match self.timeline.duration() {
            Some(duration) => t.clamp(0.0, duration),
            None => t.max(0.0),
        }
    }

    pub(crate) fn evaluator(&self) -> Option<&dyn AnimationEvaluator> {
        match &self.kind {
            NodeKindInner::Leaf(evaluator) => Some(evaluator.as_ref()),
            NodeKindInner::Group => None,
        }
    }
}

/// A materialized playback of a timeline: the tree of nodes the manager
/// advances as a unit. The root node is index 0 and has no parent.
pub(crate) struct AnimationInstance {
    pub(crate) nodes: Vec<InstanceNode>,
    /// Incremented every time the tree is recycled; controllers capture the
    /// value they were created against and go stale on mismatch.
    pub(crate) run_count: u32,
    pub(crate) auto_recycle: bool,
    /// Whether the tree is currently in the manager's root schedule.
    pub(crate) scheduled: bool,
    /// A completion handler is registered for this tree.
    pub(crate) wants_completion: bool,
    /// Set when the root entered `Stopped` or `Filling` this frame; drained
    /// into the manager's deferred completion list.
    pub(crate) completion_due: bool,
}

impl AnimationInstance {
    pub(crate) fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            run_count: 0,
            auto_recycle: false,
            scheduled: false,
            wants_completion: false,
            completion_due: false,
        }
    }

    /// (Re)builds the node tree for a timeline, reusing the node storage of
    /// a pooled tree.
    pub(crate) fn rebuild(&mut self, timeline: &Arc<dyn Timeline>) {
        self.nodes.clear();
        self.auto_recycle = false;
        self.scheduled = false;
        self.wants_completion = false;
        self.completion_due = false;
        Self::push_tree(&mut self.nodes, timeline, None);
    }

    fn push_tree(
        nodes: &mut Vec<InstanceNode>,
        timeline: &Arc<dyn Timeline>,
        parent: Option<usize>,
    ) {
        let index = nodes.len();
        nodes.push(InstanceNode::new(Arc::clone(timeline), parent));
        let timeline = Arc::clone(&nodes[index].timeline);
        for child in timeline.children() {
            Self::push_tree(nodes, child, Some(index));
        }
    }

    pub(crate) fn root(&self) -> &InstanceNode {
        &self.nodes[0]
    }

    pub(crate) fn root_mut(&mut self) -> &mut InstanceNode {
        &mut self.nodes[0]
    }

    pub(crate) fn state(&self) -> InstanceState {
        self.nodes.first().map(|n| n.state).unwrap_or_default()
    }

    /// Advances every node by `dt`, cascading speed and pause down the
    /// tree, and records whether the root's transition requires a deferred
    /// completion event.
    pub(crate) fn advance(&mut self, dt: f32) {
        let previous = self.state();
        for i in 0..self.nodes.len() {
            let (inherited_speed, inherited_paused) = match self.nodes[i].parent {
                Some(p) => (self.nodes[p].effective_speed, self.nodes[p].effective_paused),
                None => (1.0, false),
            };
            let node = &mut self.nodes[i];
            node.effective_speed = inherited_speed * node.speed;
            node.effective_paused = inherited_paused || node.paused;
            if node.effective_paused {
                continue;
            }
            if let Some(t) = node.time {
                node.set_time(Some(t + dt * node.effective_speed));
            }
        }
        self.note_root_transition(previous);
    }

    /// Starts or seeks the whole tree at a common local time. Negative
    /// times delay the start.
    pub(crate) fn seek(&mut self, time: f32) {
        let previous = self.state();
        for node in &mut self.nodes {
            node.set_time(Some(time));
        }
        self.note_root_transition(previous);
    }

    /// Stops the whole tree, queuing a completion if the root was running.
    pub(crate) fn mark_stopped(&mut self) {
        let previous = self.state();
        for node in &mut self.nodes {
            node.set_time(None);
        }
        self.note_root_transition(previous);
    }

    fn note_root_transition(&mut self, previous: InstanceState) {
        let current = self.state();
        let completed = (current == InstanceState::Stopped && previous != InstanceState::Stopped)
            || (current == InstanceState::Filling && previous != InstanceState::Filling);
        if completed && self.wants_completion {
            self.completion_due = true;
        }
    }

    /// The node's weight multiplied up through its ancestors, including any
    /// weight-source properties along the path.
    pub(crate) fn effective_weight(&self, node: usize, registry: &PropertyRegistry) -> f32 {
        let mut weight = 1.0;
        let mut current = Some(node);
        while let Some(index) = current {
            let n = &self.nodes[index];
            weight *= n.weight;
            if let Some(source) = n.weight_source
                && let Some(value) = registry.current_value(source)
            {
                weight *= value;
            }
            current = n.parent;
        }
        weight
    }

    /// Indices of the bound leaf nodes, in tree order.
    pub(crate) fn assigned_leaves(&self) -> impl Iterator<Item = (usize, ErasedHandle)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.assignment.map(|a| (i, a)))
    }

    /// Resets playback state for the pool. The node storage is kept so a
    /// later rebuild does not reallocate.
    pub(crate) fn recycle(&mut self) {
        self.nodes.clear();
        self.run_count += 1;
        self.auto_recycle = false;
        self.scheduled = false;
        self.wants_completion = false;
        self.completion_due = false;
    }

    pub(crate) fn poolable(&self) -> bool {
        self.run_count < u32::MAX
    }
}
