//! Task context for the upcall layer
//!
//! A task is one cooperatively scheduled unit of execution: it owns a box
//! allocator, an origin table, and the segment chain backing its growable
//! stack. Scheduling and teardown live in the external scheduler; this
//! module provides the query/command surface the upcalls drive and the
//! stack bookkeeping that makes switching possible.
//!
//! The current task is a thread-local installed by the worker that runs
//! the task, scoped by [`Task::enter`]'s RAII guard. Workers install it
//! when they pick a task up and the guard removes it when they put the
//! task down; nothing else writes the slot.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::arch;
use super::boxed::BoxAllocator;
use super::origin::{self, OriginTable};
use super::stack::{SegmentChain, StackConfig, StackSegment};
use super::switch;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// What a failed task reported on its way down.
#[derive(Clone, Debug)]
pub struct FailureInfo {
    pub expr: String,
    pub file: String,
    pub line: usize,
}

/// Panic payload carrying a failed task into teardown. Raised on the
/// managed stack after the failure has been recorded on the native stack;
/// the scheduler's task harness catches it and runs teardown.
#[derive(Debug)]
pub struct TaskFailed {
    pub task_id: u64,
}

/// One cooperatively scheduled unit of execution.
///
/// A task is run by at most one worker thread at a time (scheduler
/// invariant), so its interior state is unsynchronized.
pub struct Task {
    id: u64,
    name: String,
    boxed: BoxAllocator,
    origins: OriginTable,
    config: StackConfig,
    stack: RefCell<SegmentChain>,
    cached_segment: RefCell<Option<Box<StackSegment>>>,
    stack_limit: Cell<usize>,
    /// Landing point for the next switch to the native stack; zero until
    /// this task first leaves it.
    next_native_sp: Cell<usize>,
    /// Landing point for the next switch to the managed stack; zero when
    /// no switched-out managed frame is waiting.
    next_managed_sp: Cell<usize>,
    switches: Cell<usize>,
    failure: RefCell<Option<FailureInfo>>,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_config(name, StackConfig::default(), origin::tracking_enabled())
    }

    pub fn with_config(
        name: impl Into<String>,
        config: StackConfig,
        track_origins: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            boxed: BoxAllocator::new(),
            origins: OriginTable::new(track_origins),
            config,
            stack: RefCell::new(SegmentChain::new()),
            cached_segment: RefCell::new(None),
            stack_limit: Cell::new(0),
            next_native_sp: Cell::new(0),
            next_managed_sp: Cell::new(0),
            switches: Cell::new(0),
            failure: RefCell::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn boxed(&self) -> &BoxAllocator {
        &self.boxed
    }

    pub fn origins(&self) -> &OriginTable {
        &self.origins
    }

    /// Stack switches this task has performed.
    pub fn switch_count(&self) -> usize {
        self.switches.get()
    }

    // =========================================================================
    // Current-task lifecycle
    // =========================================================================

    /// Installs this task as the thread's current task for the guard's
    /// lifetime. The previous occupant is restored on drop.
    pub fn enter(self: &Arc<Self>) -> TaskGuard {
        TaskGuard {
            prev: CURRENT.with(|c| c.replace(Some(self.clone()))),
        }
    }

    /// The task installed on this thread, if any.
    pub fn try_current() -> Option<Arc<Task>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// The task installed on this thread. Upcalls that compiled code can
    /// only reach from task context use this form; a missing task there
    /// means the code generator and runtime disagree, and continuing
    /// would corrupt arbitrary state.
    pub fn current() -> Arc<Task> {
        match Self::try_current() {
            Some(task) => task,
            None => {
                eprintln!("sable runtime: upcall requires a current task, none installed");
                std::process::abort();
            }
        }
    }

    // =========================================================================
    // Stack queries and switching
    // =========================================================================

    /// Whether the caller's stack pointer lies within this task's segment
    /// chain.
    pub fn on_managed_stack(&self) -> bool {
        let sp = arch::current_stack_pointer();
        self.stack.borrow().contains(sp)
    }

    /// Runs `f(args)` on the native stack. Switches if the caller is on
    /// the managed stack, otherwise calls in place; either way a panic in
    /// `f` is fatal at this boundary.
    pub(crate) unsafe fn call_on_native_stack_raw(
        &self,
        args: *mut c_void,
        f: extern "C" fn(*mut c_void),
    ) {
        if !self.on_managed_stack() {
            switch::guarded_call(args, f);
            return;
        }
        let target = self.next_native_sp.get();
        debug_assert!(target != 0, "on managed stack without a native landing point");
        let prev_managed = self.next_managed_sp.replace(arch::current_stack_pointer());
        self.switches.set(self.switches.get() + 1);
        unsafe { switch::switched_call(args, f, switch::landing_from(target)) };
        self.next_managed_sp.set(prev_managed);
    }

    /// Runs `f(args)` on the managed stack: the switched-out managed
    /// frame if one is waiting, else the top of the newest segment. Falls
    /// back to calling in place when the task has no managed stack yet or
    /// the caller is already on it.
    pub(crate) unsafe fn call_on_managed_stack_raw(
        &self,
        args: *mut c_void,
        f: extern "C" fn(*mut c_void),
    ) {
        if self.on_managed_stack() {
            switch::guarded_call(args, f);
            return;
        }
        let mut target = self.next_managed_sp.get();
        if target == 0 {
            target = self.stack.borrow().head().map_or(0, |seg| seg.top());
        }
        if target == 0 {
            // No managed stack exists yet; run in place.
            switch::guarded_call(args, f);
            return;
        }
        let prev_native = self.next_native_sp.replace(arch::current_stack_pointer());
        self.switches.set(self.switches.get() + 1);
        unsafe { switch::switched_call(args, f, switch::landing_from(target)) };
        self.next_native_sp.set(prev_native);
    }

    /// Typed form of [`call_on_native_stack_raw`]: marshals `input` and a
    /// return slot into one argument block, applies `apply` on the native
    /// stack, and hands the result back on the calling stack.
    pub(crate) fn call_on_native_stack<I, R>(&self, input: I, apply: fn(&Task, &mut I) -> R) -> R {
        #[repr(C)]
        struct Block<I, R> {
            task: *const Task,
            input: I,
            ret: MaybeUninit<R>,
            apply: fn(&Task, &mut I) -> R,
        }

        extern "C" fn invoke<I, R>(p: *mut c_void) {
            let block = unsafe { &mut *(p as *mut Block<I, R>) };
            let task = unsafe { &*block.task };
            let ret = (block.apply)(task, &mut block.input);
            block.ret.write(ret);
        }

        let mut block = Block {
            task: self as *const Task,
            input,
            ret: MaybeUninit::uninit(),
            apply,
        };
        unsafe {
            self.call_on_native_stack_raw(&mut block as *mut Block<I, R> as *mut c_void, invoke::<I, R>);
            block.ret.assume_init()
        }
    }

    // =========================================================================
    // Stack growth, shrink, limit reset
    // =========================================================================

    /// Pushes a new segment of at least `requested` usable bytes, copies
    /// the argument block to its top, and returns the stack pointer
    /// compiled code should continue on. Hot path: stays on the calling
    /// stack and must not switch or log.
    pub fn new_stack(&self, requested: usize, args: *const c_void, args_size: usize) -> *mut u8 {
        let needed = requested + self.config.guard_margin + args_size;
        let seg = match self.take_cached(needed) {
            Some(seg) => seg,
            None => {
                let usable = needed.max(self.config.default_segment_size);
                match StackSegment::new(usable, &self.config) {
                    Ok(seg) => seg,
                    // Segment exhaustion policy is the allocator's: no
                    // retry, no recovery.
                    Err(_) => std::process::abort(),
                }
            }
        };

        let new_sp = (seg.top() - args_size) & !(switch::SWITCH_ALIGN - 1);
        if args_size > 0 && !args.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(args as *const u8, new_sp as *mut u8, args_size);
            }
        }

        self.stack_limit.set(seg.limit(self.config.guard_margin));
        self.stack.borrow_mut().push(seg);
        new_sp as *mut u8
    }

    /// Pops the newest segment and restores the previous one as head.
    /// Hot path, same constraints as [`new_stack`].
    pub fn prev_stack(&self) {
        let seg = match self.stack.borrow_mut().pop() {
            Some(seg) => seg,
            None => return,
        };
        if !seg.canary_ok() {
            // Stack corruption; nothing below this frame can be trusted.
            std::process::abort();
        }
        self.stack_limit.set(match self.stack.borrow().head() {
            Some(head) => head.limit(self.config.guard_margin),
            None => 0,
        });

        let mut cached = self.cached_segment.borrow_mut();
        if cached.is_none() {
            *cached = Some(seg);
        }
    }

    fn take_cached(&self, needed: usize) -> Option<Box<StackSegment>> {
        let mut cached = self.cached_segment.borrow_mut();
        if cached.as_ref().is_some_and(|seg| seg.usable_len() >= needed) {
            cached.take()
        } else {
            None
        }
    }

    /// Reinstalls the overflow-guard limit from the caller's live stack
    /// pointer. Landing pads call this after unwinding onto a segment
    /// whose recorded limit may be stale. Must run on the stack it is
    /// resetting for, which is why the stack pointer is read here and not
    /// taken as an argument.
    pub fn reset_stack_limit(&self) {
        self.reset_stack_limit_from(arch::current_stack_pointer());
    }

    pub(crate) fn reset_stack_limit_from(&self, sp: usize) {
        let limit = match self.stack.borrow().segment_for(sp) {
            Some(seg) => seg.limit(self.config.guard_margin),
            None => sp.saturating_sub(self.config.guard_margin),
        };
        self.stack_limit.set(limit);
    }

    /// The installed guard limit; zero when no segment has been pushed.
    pub fn stack_limit(&self) -> usize {
        self.stack_limit.get()
    }

    /// The compiled prologue's probe: does `sp` clear the guard limit?
    pub fn stack_in_bounds(&self, sp: usize) -> bool {
        sp >= self.stack_limit.get()
    }

    /// Segments currently in the chain.
    pub fn segment_count(&self) -> usize {
        self.stack.borrow().depth()
    }

    pub(crate) fn head_segment_base(&self) -> Option<usize> {
        self.stack.borrow().head().map(|seg| seg.usable_base())
    }

    // =========================================================================
    // Failure
    // =========================================================================

    /// Records the failure that is taking this task down. Runs on the
    /// native stack; the non-local transfer into teardown happens back on
    /// the managed stack, never across a switch.
    pub fn begin_failure(&self, expr: &str, file: &str, line: usize) {
        debug!(
            task = self.id,
            task_name = %self.name,
            expr,
            file,
            line,
            "task failure recorded"
        );
        *self.failure.borrow_mut() = Some(FailureInfo {
            expr: expr.to_string(),
            file: file.to_string(),
            line,
        });
    }

    pub fn is_failing(&self) -> bool {
        self.failure.borrow().is_some()
    }

    pub fn failure(&self) -> Option<FailureInfo> {
        self.failure.borrow().clone()
    }
}

/// Scope guard returned by [`Task::enter`].
pub struct TaskGuard {
    prev: Option<Arc<Task>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| {
            *c.borrow_mut() = prev;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_installs_and_restores() {
        assert!(Task::try_current().is_none());
        let task = Task::new("t-enter");
        {
            let _guard = task.enter();
            assert_eq!(Task::try_current().map(|t| t.id()), Some(task.id()));
        }
        assert!(Task::try_current().is_none());
    }

    #[test]
    fn test_enter_nests() {
        let outer = Task::new("t-outer");
        let inner = Task::new("t-inner");
        let _outer_guard = outer.enter();
        {
            let _inner_guard = inner.enter();
            assert_eq!(Task::try_current().map(|t| t.id()), Some(inner.id()));
        }
        assert_eq!(Task::try_current().map(|t| t.id()), Some(outer.id()));
    }

    #[test]
    fn test_ids_unique() {
        let a = Task::new("t-a");
        let b = Task::new("t-b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_grow_shrink_balanced() {
        let task = Task::new("t-stack");
        assert_eq!(task.segment_count(), 0);

        let sp = task.new_stack(8 * 1024, std::ptr::null(), 0);
        assert!(!sp.is_null());
        assert_eq!(task.segment_count(), 1);
        let first_base = task.head_segment_base();

        task.new_stack(8 * 1024, std::ptr::null(), 0);
        assert_eq!(task.segment_count(), 2);
        task.prev_stack();

        assert_eq!(task.segment_count(), 1);
        assert_eq!(task.head_segment_base(), first_base);
    }

    #[test]
    fn test_grow_copies_argument_block() {
        let task = Task::new("t-args");
        let args: [u8; 24] = [7; 24];
        let sp = task.new_stack(4 * 1024, args.as_ptr() as *const c_void, args.len());
        let copied = unsafe { std::slice::from_raw_parts(sp as *const u8, args.len()) };
        assert_eq!(copied, &args[..]);
        task.prev_stack();
    }

    #[test]
    fn test_shrunk_segment_is_cached_and_reused() {
        let task = Task::new("t-cache");
        task.new_stack(4 * 1024, std::ptr::null(), 0);
        let base = task.head_segment_base();
        task.prev_stack();

        task.new_stack(4 * 1024, std::ptr::null(), 0);
        assert_eq!(task.head_segment_base(), base);
        task.prev_stack();
    }

    #[test]
    fn test_limit_tracks_head_segment() {
        let task = Task::new("t-limit");
        assert_eq!(task.stack_limit(), 0);

        task.new_stack(4 * 1024, std::ptr::null(), 0);
        let limit = task.stack_limit();
        assert!(limit > 0);
        assert!(task.stack_in_bounds(limit));
        assert!(!task.stack_in_bounds(limit - 1));

        task.prev_stack();
        assert_eq!(task.stack_limit(), 0);
    }

    #[test]
    fn test_on_managed_stack_false_on_native() {
        let task = Task::new("t-native");
        task.new_stack(4 * 1024, std::ptr::null(), 0);
        assert!(!task.on_managed_stack());
        task.prev_stack();
    }

    #[test]
    fn test_begin_failure_records() {
        let task = Task::new("t-fail");
        assert!(!task.is_failing());
        task.begin_failure("x > 0", "lib.sbl", 12);
        assert!(task.is_failing());
        let info = task.failure().unwrap();
        assert_eq!(info.expr, "x > 0");
        assert_eq!(info.file, "lib.sbl");
        assert_eq!(info.line, 12);
    }
}
