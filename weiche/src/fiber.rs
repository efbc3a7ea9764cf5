use std::{
    mem,
    ptr::{self, NonNull},
};

use libc::{getcontext, makecontext, setcontext, swapcontext, ucontext_t};

use crate::{DispatchError, map_memory, unmap_memory};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberState {
    Created,
    Running,
    Suspended,
    Completed,
}

/// Saved machine execution state. Opaque; only ever filled and consumed by
/// the switch primitives below.
pub struct ExecutionPoint {
    inner: Box<ucontext_t>,
}

impl ExecutionPoint {
    fn zeroed() -> Self {
        // SAFETY: ucontext_t is plain data and getcontext rewrites it
        // before any jump targets it
        let inner = unsafe { Box::new(mem::zeroed()) };
        Self { inner }
    }

    fn as_mut_ptr(&mut self) -> *mut ucontext_t {
        &mut *self.inner
    }
}

/// Dedicated, fixed-size stack for one fiber, mapped outside the Rust
/// stack and released when the fiber goes away.
struct StackMemory {
    base: NonNull<u8>,
    size: usize,
}

impl StackMemory {
    fn map(size: usize) -> Result<Self, DispatchError> {
        let base = map_memory(size).ok_or(DispatchError::StackAllocation { size })?;
        Ok(Self { base, size })
    }

    fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        // SAFETY: mapped in map() with the same size; the fiber owning us
        // is gone, so nothing can run on this stack anymore
        unsafe { unmap_memory(self.base, self.size) };
    }
}

/// One suspendable foreign execution: an entry function bound to its own
/// stack plus the saved state pair needed to jump in and out. This is the
/// only place in the crate that touches machine execution state; everything
/// above it deals in the {created, running, suspended, completed} states.
pub struct Fiber {
    state: FiberState,
    stack: StackMemory,
    resume_point: ExecutionPoint,
    driver_point: ExecutionPoint,
}

impl Fiber {
    /// Creates a fiber that will run `entry` on a freshly mapped stack of
    /// `stack_size` bytes. The entry function must leave through
    /// `switch_out`/`finish`; returning from it would end the thread.
    pub fn new(entry: extern "C" fn(), stack_size: usize) -> Result<Self, DispatchError> {
        let stack = StackMemory::map(stack_size)?;
        let mut fiber = Self {
            state: FiberState::Created,
            stack,
            resume_point: ExecutionPoint::zeroed(),
            driver_point: ExecutionPoint::zeroed(),
        };

        // SAFETY: the point is owned, the stack lives as long as the fiber
        unsafe {
            let resume = fiber.resume_point.as_mut_ptr();
            getcontext(resume);
            (*resume).uc_link = ptr::null_mut();
            (*resume).uc_stack.ss_sp = fiber.stack.base().cast();
            (*resume).uc_stack.ss_size = fiber.stack.len();
            (*resume).uc_stack.ss_flags = 0;
            makecontext(resume, entry, 0);
        }

        Ok(fiber)
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Dispatch side: transfer control into the fiber. This is a true
    /// stack switch, not a call; it returns only once the fiber switches
    /// out or finishes.
    pub fn switch_in(&mut self) {
        debug_assert!(
            matches!(self.state, FiberState::Created | FiberState::Suspended),
            "switch_in on a {:?} fiber",
            self.state
        );
        self.state = FiberState::Running;
        let driver = self.driver_point.as_mut_ptr();
        let resume = self.resume_point.as_mut_ptr();
        // SAFETY: both points are owned; the resume point targets this
        // fiber's mapped stack
        unsafe {
            swapcontext(driver, resume);
        }
    }

    /// Fiber side: save this fiber's state and hand control back to the
    /// dispatch side. Execution continues right here on the next
    /// `switch_in`.
    pub fn switch_out(&mut self) {
        debug_assert_eq!(self.state, FiberState::Running);
        self.state = FiberState::Suspended;
        let resume = self.resume_point.as_mut_ptr();
        let driver = self.driver_point.as_mut_ptr();
        // SAFETY: saving into owned memory, jumping to the state saved by
        // switch_in
        unsafe {
            swapcontext(resume, driver);
        }
    }

    /// Fiber side: mark this fiber completed and leave for good.
    pub fn finish(&mut self) -> ! {
        debug_assert_eq!(self.state, FiberState::Running);
        self.state = FiberState::Completed;
        let driver = self.driver_point.as_mut_ptr();
        // SAFETY: the dispatch-side state was saved by switch_in
        unsafe {
            setcontext(driver);
        }
        unreachable!("setcontext returned")
    }
}
