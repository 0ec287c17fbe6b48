//! Exception unwinding.
//!
//! Reaching an exceptional node (a `throw`) walks the current thread's call
//! stack towards the nearest active handler. Every frame popped on the way
//! discharges its member's `exceptional` clause. With no handler left, the
//! exception propagates out of the root frame and the thread terminates
//! cleanly.

use crate::exec::{Discharged, TStep};
use crate::state::ExecutionState;
use crate::{Engine, EngineError, EngineResult};
use oox_syntax::{Expression, Span};

impl<'a> Engine<'a> {
    /// Unwind the current thread to the nearest matching handler.
    pub(crate) fn exec_exceptional(&mut self, state: ExecutionState) -> EngineResult<TStep> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let thread = state
            .threads
            .get(&tid)
            .ok_or(EngineError::CannotGetCurrentThread)?;

        // Handler in the current frame: jump straight there. The handler
        // entry is popped by the CatchEntry node itself.
        if let Some((handler_node, 0)) = thread.handler_stack.last().copied() {
            let mut state = state;
            let thread = state.threads.get_mut(&tid).expect("thread looked up above");
            thread.pc = handler_node;
            return Ok(TStep::Successors(vec![state]));
        }

        // Otherwise this frame is unwound: discharge its exceptional clause
        // first, then pop and recurse (or finish at the root frame).
        let in_try = thread.handler_stack.last().is_some();
        let at_root = thread.call_stack.len() <= 1;

        let branches = match self.exceptional_clause(&state)? {
            Some((clause, span)) => match self.discharge_branches(state, &clause, Some(span))? {
                Discharged::Halt(verdict) => return Ok(TStep::Halt(verdict)),
                Discharged::Branches(branches) => branches,
            },
            None => vec![state],
        };

        let mut successors = Vec::new();
        for mut branch in branches {
            if at_root && !in_try {
                // The exception escapes the entry frame: the thread
                // terminates and the program exits cleanly.
                branch.despawn(tid);
                successors.push(branch);
                continue;
            }
            let thread = branch.threads.get_mut(&tid).expect("thread looked up above");
            thread.call_stack.pop();
            if let Some((_, pops)) = thread.handler_stack.last_mut() {
                *pops -= 1;
            }
            match self.exec_exceptional(branch)? {
                TStep::Halt(verdict) => return Ok(TStep::Halt(verdict)),
                TStep::Successors(states) => successors.extend(states),
            }
        }
        Ok(TStep::Successors(successors))
    }

    /// The `exceptional` clause of the member owning the current frame, if
    /// any and if exceptional checking is enabled.
    fn exceptional_clause(
        &self,
        state: &ExecutionState,
    ) -> EngineResult<Option<(Expression, Span)>> {
        if !self.config.verify_exceptional {
            return Ok(None);
        }
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let member = &state
            .threads
            .get(&tid)
            .and_then(|t| t.top_frame())
            .ok_or(EngineError::CannotGetCurrentThread)?
            .member;
        let Some(info) = self.symbols.lookup(&member.class_name, &member.member_name) else {
            return Ok(None);
        };
        Ok(info
            .decl
            .specification()
            .and_then(|spec| spec.exceptional.clone())
            .map(|clause| (clause, info.decl.span())))
    }
}
