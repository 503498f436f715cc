//! Workflow phase state machine
//!
//! ```text
//! requested → designing → design_completed → coding → testing ⇄ refining
//!                                                        ↓
//!                                   completed ← assembling
//! ```
//!
//! `failed` and `cancelled` are terminal sinks reachable from every
//! non-terminal phase. Module loops report phase-level events concurrently
//! and out of order, so [`plan_transition`] classifies a requested move
//! instead of just accepting or rejecting it.

use crate::error::WorkflowError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Workflow phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Submitted, nothing started
    Requested,
    /// Design generator running
    Designing,
    /// Design stored, modules created
    DesignCompleted,
    /// Module code generation in progress
    Coding,
    /// Test design or execution in progress
    Testing,
    /// At least one module is being refined
    Refining,
    /// Every module passed; assembler running
    Assembling,
    /// Artifact assembled
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl Phase {
    /// Every phase, in DAG order
    pub const ALL: [Phase; 10] = [
        Phase::Requested,
        Phase::Designing,
        Phase::DesignCompleted,
        Phase::Coding,
        Phase::Testing,
        Phase::Refining,
        Phase::Assembling,
        Phase::Completed,
        Phase::Failed,
        Phase::Cancelled,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Requested => "requested",
            Phase::Designing => "designing",
            Phase::DesignCompleted => "design_completed",
            Phase::Coding => "coding",
            Phase::Testing => "testing",
            Phase::Refining => "refining",
            Phase::Assembling => "assembling",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    /// No transition leaves this phase
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Progress percentage shown to users
    #[must_use]
    pub const fn progress(self) -> u8 {
        match self {
            Phase::Requested => 5,
            Phase::Designing => 15,
            Phase::DesignCompleted => 20,
            Phase::Coding => 40,
            Phase::Testing => 60,
            Phase::Refining => 75,
            Phase::Assembling => 90,
            Phase::Completed => 100,
            Phase::Failed | Phase::Cancelled => 0,
        }
    }

    // Position along the forward path. Testing and refining share a rank
    // because either may follow the other.
    const fn rank(self) -> u8 {
        match self {
            Phase::Requested => 0,
            Phase::Designing => 1,
            Phase::DesignCompleted => 2,
            Phase::Coding => 3,
            Phase::Testing | Phase::Refining => 4,
            Phase::Assembling => 5,
            Phase::Completed | Phase::Failed | Phase::Cancelled => 6,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direct successors of a phase
#[must_use]
pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        Requested => vec![Designing, Failed, Cancelled],
        Designing => vec![DesignCompleted, Failed, Cancelled],
        DesignCompleted => vec![Coding, Failed, Cancelled],
        Coding => vec![Testing, Failed, Cancelled],
        Testing => vec![Refining, Assembling, Failed, Cancelled],
        Refining => vec![Testing, Failed, Cancelled],
        Assembling => vec![Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => vec![],
    }
}

fn allowed(from: Phase, to: Phase) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Validate a single edge
///
/// # Errors
///
/// [`WorkflowError::Terminal`] when `from` is terminal,
/// [`WorkflowError::IllegalTransition`] when the edge is not in the DAG.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), WorkflowError> {
    if from.is_terminal() {
        return Err(WorkflowError::Terminal(from));
    }
    if allowed(from, to) {
        Ok(())
    } else {
        Err(WorkflowError::IllegalTransition { from, to })
    }
}

/// How a requested phase change should be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhasePlan {
    /// Already there
    Stay,
    /// Target is behind the current phase; ignore the event
    Stale,
    /// Walk these edges in order; the last element is the target
    Steps(Vec<Phase>),
}

/// Classify a move from `from` to `to`
///
/// Once the design is stored, module events may arrive ahead of the events
/// that would have moved the workflow through the intermediate phases. A
/// forward target is then reached by walking the shortest chain of DAG
/// edges, so `design_completed → testing` records `coding` first and
/// `refining → assembling` steps through `testing`.
///
/// # Errors
///
/// [`WorkflowError::Terminal`] for any move out of a terminal phase and
/// [`WorkflowError::IllegalTransition`] for forward moves with no path,
/// including any move that would skip design.
pub fn plan_transition(from: Phase, to: Phase) -> Result<PhasePlan, WorkflowError> {
    if from == to {
        return Ok(PhasePlan::Stay);
    }
    if from.is_terminal() {
        return Err(WorkflowError::Terminal(from));
    }
    if allowed(from, to) {
        return Ok(PhasePlan::Steps(vec![to]));
    }
    if to.rank() < from.rank() {
        return Ok(PhasePlan::Stale);
    }
    if from.rank() >= Phase::DesignCompleted.rank() && !to.is_terminal() {
        if let Some(path) = shortest_path(from, to) {
            return Ok(PhasePlan::Steps(path));
        }
    }
    Err(WorkflowError::IllegalTransition { from, to })
}

// Breadth-first over non-terminal edges; excludes `from`, ends with `to`.
fn shortest_path(from: Phase, to: Phase) -> Option<Vec<Phase>> {
    let mut previous: Vec<(Phase, Phase)> = Vec::new();
    let mut queue = VecDeque::from([from]);
    while let Some(at) = queue.pop_front() {
        for next in allowed_transitions(at) {
            if next.is_terminal() || next == from || previous.iter().any(|(p, _)| *p == next) {
                continue;
            }
            previous.push((next, at));
            if next == to {
                let mut path = vec![to];
                let mut cursor = at;
                while cursor != from {
                    path.push(cursor);
                    cursor = previous.iter().find(|(p, _)| *p == cursor)?.1;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn progress_table() {
        let table: Vec<(Phase, u8)> = Phase::ALL.iter().map(|p| (*p, p.progress())).collect();
        assert_eq!(
            table,
            vec![
                (Phase::Requested, 5),
                (Phase::Designing, 15),
                (Phase::DesignCompleted, 20),
                (Phase::Coding, 40),
                (Phase::Testing, 60),
                (Phase::Refining, 75),
                (Phase::Assembling, 90),
                (Phase::Completed, 100),
                (Phase::Failed, 0),
                (Phase::Cancelled, 0),
            ]
        );
    }

    #[test]
    fn terminal_phases_have_no_successors() {
        for phase in [Phase::Completed, Phase::Failed, Phase::Cancelled] {
            assert!(allowed_transitions(phase).is_empty());
            assert!(matches!(
                validate_transition(phase, Phase::Requested),
                Err(WorkflowError::Terminal(_))
            ));
        }
    }

    #[test]
    fn only_back_edge_is_refining_to_testing() {
        for from in Phase::ALL {
            for to in allowed_transitions(from) {
                if to.is_terminal() {
                    continue;
                }
                let backwards = Phase::ALL.iter().position(|p| *p == to)
                    < Phase::ALL.iter().position(|p| *p == from);
                assert_eq!(backwards, from == Phase::Refining && to == Phase::Testing);
            }
        }
    }

    #[test]
    fn late_events_are_stale() {
        assert_eq!(plan_transition(Phase::Testing, Phase::Coding).unwrap(), PhasePlan::Stale);
        assert_eq!(plan_transition(Phase::Assembling, Phase::Refining).unwrap(), PhasePlan::Stale);
        assert_eq!(plan_transition(Phase::Coding, Phase::Coding).unwrap(), PhasePlan::Stay);
    }

    #[test]
    fn steps_through_testing() {
        assert_eq!(
            plan_transition(Phase::Refining, Phase::Assembling).unwrap(),
            PhasePlan::Steps(vec![Phase::Testing, Phase::Assembling])
        );
        assert_eq!(
            plan_transition(Phase::Coding, Phase::Refining).unwrap(),
            PhasePlan::Steps(vec![Phase::Testing, Phase::Refining])
        );
    }

    #[test]
    fn module_events_catch_up_after_design() {
        assert_eq!(
            plan_transition(Phase::DesignCompleted, Phase::Testing).unwrap(),
            PhasePlan::Steps(vec![Phase::Coding, Phase::Testing])
        );
        assert_eq!(
            plan_transition(Phase::DesignCompleted, Phase::Assembling).unwrap(),
            PhasePlan::Steps(vec![Phase::Coding, Phase::Testing, Phase::Assembling])
        );
    }

    #[test]
    fn skipping_design_is_illegal() {
        assert!(matches!(
            plan_transition(Phase::Requested, Phase::Coding),
            Err(WorkflowError::IllegalTransition { .. })
        ));
        assert!(matches!(
            plan_transition(Phase::Failed, Phase::Coding),
            Err(WorkflowError::Terminal(Phase::Failed))
        ));
    }

    fn any_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Requested),
            Just(Phase::Designing),
            Just(Phase::DesignCompleted),
            Just(Phase::Coding),
            Just(Phase::Testing),
            Just(Phase::Refining),
            Just(Phase::Assembling),
            Just(Phase::Completed),
            Just(Phase::Failed),
            Just(Phase::Cancelled),
        ]
    }

    proptest! {
        #[test]
        fn planned_steps_are_dag_edges(targets in proptest::collection::vec(any_phase(), 1..40)) {
            let mut current = Phase::Requested;
            for target in targets {
                match plan_transition(current, target) {
                    Ok(PhasePlan::Steps(steps)) => {
                        for step in steps {
                            prop_assert!(validate_transition(current, step).is_ok());
                            current = step;
                        }
                        prop_assert_eq!(current, target);
                    }
                    Ok(PhasePlan::Stay | PhasePlan::Stale) | Err(_) => {}
                }
            }
        }

        #[test]
        fn terminal_is_absorbing(from in any_phase(), to in any_phase()) {
            if from.is_terminal() && from != to {
                prop_assert!(plan_transition(from, to).is_err());
            }
        }
    }
}
