//! Function call frames and the aggregate support API.
//!
//! Transition, combine, final, serialize and deserialize functions all share
//! one calling convention: arguments in, one result out, with an optional
//! aggregate call context attached by the operator. The context is how a
//! function distinguishes being driven by the aggregate operator from being
//! called as a plain function, and how it reaches the arena that owns its
//! per-group working state.

pub mod aggregate;

use std::sync::Arc;

use quern_error::{QuernError, Result};
use smallvec::SmallVec;

use crate::arrays::datum::Datum;
use crate::plan::Aggref;
use crate::runtime::arena::{ArenaId, MemoryContexts};

/// Identifies a function in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// All aggregate support functions share this shape.
pub type AggregateFn = fn(&mut AggCallFrame) -> Result<()>;

/// What kind of caller invoked the current function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Plain function call, no aggregation in progress.
    None,
    Aggregate,
    /// Window invocation. Window functions are outside this engine; the
    /// variant exists so callees can exhaustively match the contract.
    Window,
}

/// Per-call context attached when the aggregate operator drives a function.
#[derive(Debug)]
pub struct AggContext<'a> {
    pub contexts: &'a mut MemoryContexts,
    /// Arena owning transition state for the current grouping set. Working
    /// state that must persist across rows of the same group belongs here.
    pub set_arena: ArenaId,
    /// Short-lived arena a final function may use and reset.
    pub temp_arena: ArenaId,
    pub aggref: Option<Arc<Aggref>>,
}

#[derive(Debug)]
pub enum CallContext<'a> {
    Plain,
    Aggregate(AggContext<'a>),
}

pub type FrameArgs = SmallVec<[Datum; 4]>;

/// A function call frame.
///
/// For transition and combine calls, argument 0 holds the current transition
/// value and the remaining slots hold the row's evaluated inputs. The
/// function reads arguments, writes `result`, and never sees strictness;
/// strict-function semantics are enforced by the drivers.
#[derive(Debug)]
pub struct AggCallFrame<'a> {
    pub args: FrameArgs,
    pub result: Datum,
    pub context: CallContext<'a>,
}

impl<'a> AggCallFrame<'a> {
    pub fn plain(args: FrameArgs) -> Self {
        AggCallFrame {
            args,
            result: Datum::Null,
            context: CallContext::Plain,
        }
    }

    pub fn with_context(args: FrameArgs, context: CallContext<'a>) -> Self {
        AggCallFrame {
            args,
            result: Datum::Null,
            context,
        }
    }

    pub fn arg(&self, idx: usize) -> Result<&Datum> {
        self.args
            .get(idx)
            .ok_or_else(|| QuernError::new(format!("Missing function argument {idx}")))
    }

    /// Move an argument out of the frame, leaving a null.
    pub fn take_arg(&mut self, idx: usize) -> Result<Datum> {
        let slot = self
            .args
            .get_mut(idx)
            .ok_or_else(|| QuernError::new(format!("Missing function argument {idx}")))?;
        Ok(std::mem::replace(slot, Datum::Null))
    }

    pub fn set_result(&mut self, datum: Datum) {
        self.result = datum;
    }

    /// Report whether this call is being driven by the aggregate operator,
    /// optionally yielding the arena for cross-row working state.
    pub fn check_call_context(&self) -> (CallKind, Option<ArenaId>) {
        match &self.context {
            CallContext::Plain => (CallKind::None, None),
            CallContext::Aggregate(ctx) => (CallKind::Aggregate, Some(ctx.set_arena)),
        }
    }

    /// The aggregate call expression currently being evaluated, if any.
    pub fn aggref(&self) -> Option<&Aggref> {
        match &self.context {
            CallContext::Aggregate(ctx) => ctx.aggref.as_deref(),
            CallContext::Plain => None,
        }
    }

    /// Short-lived arena safe for final functions to reset.
    pub fn temp_memory_context(&self) -> Result<ArenaId> {
        match &self.context {
            CallContext::Aggregate(ctx) => Ok(ctx.temp_arena),
            CallContext::Plain => Err(QuernError::new(
                "Temporary aggregate context requested outside aggregation",
            )),
        }
    }

    /// Register a shutdown hook on the current grouping-set arena. The hook
    /// runs when the arena is reset at a group boundary or operator rescan,
    /// never on error unwind.
    pub fn register_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match &mut self.context {
            CallContext::Aggregate(ctx) => ctx.contexts.register_callback(ctx.set_arena, callback),
            CallContext::Plain => Err(QuernError::new(
                "Aggregate shutdown callback registered outside aggregation",
            )),
        }
    }

    pub fn agg_context_mut(&mut self) -> Result<&mut AggContext<'a>> {
        match &mut self.context {
            CallContext::Aggregate(ctx) => Ok(ctx),
            CallContext::Plain => Err(QuernError::new(
                "Function requires an aggregate call context",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn plain_frame_reports_no_context() {
        let frame = AggCallFrame::plain(smallvec![Datum::Int64(1)]);
        let (kind, arena) = frame.check_call_context();
        assert_eq!(CallKind::None, kind);
        assert!(arena.is_none());
        assert!(frame.aggref().is_none());
    }

    #[test]
    fn aggregate_frame_exposes_arena() {
        let (mut contexts, root) = MemoryContexts::new();
        let frame = AggCallFrame::with_context(
            smallvec![],
            CallContext::Aggregate(AggContext {
                contexts: &mut contexts,
                set_arena: root,
                temp_arena: root,
                aggref: None,
            }),
        );
        let (kind, arena) = frame.check_call_context();
        assert_eq!(CallKind::Aggregate, kind);
        assert_eq!(Some(root), arena);
    }

    #[test]
    fn take_arg_leaves_null() {
        let mut frame = AggCallFrame::plain(smallvec![Datum::Int64(9)]);
        assert_eq!(Datum::Int64(9), frame.take_arg(0).unwrap());
        assert!(frame.arg(0).unwrap().is_null());
    }

    #[test]
    fn registered_callback_runs_on_arena_reset() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (mut contexts, root) = MemoryContexts::new();
        let arena = contexts.create_child(root, "group").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            let mut frame = AggCallFrame::with_context(
                smallvec![],
                CallContext::Aggregate(AggContext {
                    contexts: &mut contexts,
                    set_arena: arena,
                    temp_arena: root,
                    aggref: None,
                }),
            );
            frame
                .register_callback(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert_eq!(0, fired.load(Ordering::SeqCst));
        contexts.reset(arena).unwrap();
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }
}
