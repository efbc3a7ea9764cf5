use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    ptr,
};

use log::error;

use crate::{
    Activation, DispatchError, Fiber, FiberState, Handle, Message, Symbol, Value,
};

/// 64 KiB: the fixed stack handed to every foreign call.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Control-flow request recorded on a context. Program flow here is
/// unusual: the context explicitly carries the action the dispatch loop
/// should perform for this particular call after each switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallAction {
    Undefined,
    OriginalCall,
    CallFromNative,
    ReturnFromNative,
}

/// A foreign method body: takes the call frame view, produces the result.
pub type NativeEntryPoint = fn(&mut ForeignFrame<'_>) -> Value;

/// One in-flight foreign method invocation: the message, the interpreter
/// context that initiated the call, the entry point, and the saved
/// execution-state pair with its dedicated stack (owned by the fiber,
/// released when the context goes away).
pub struct NativeCallContext {
    action: CallAction,
    entry: NativeEntryPoint,
    message: Handle<Message>,
    caller: Handle<Activation>,
    result: Value,
    pending: Option<Handle<Message>>,
    reentry_result: Value,
    fiber: Fiber,
}

thread_local! {
    static CURRENT: Cell<*mut NativeCallContext> = const { Cell::new(ptr::null_mut()) };
}

/// Records `context` as this task's active one. Set immediately before
/// every switch; the trampoline has no other way to find its frame.
pub fn current_context_is(context: *mut NativeCallContext) {
    CURRENT.set(context);
}

/// The context the trampoline should service.
pub fn current_context() -> *mut NativeCallContext {
    CURRENT.get()
}

impl NativeCallContext {
    /// Brand new context for a brand new call.
    pub fn create(
        message: Handle<Message>,
        caller: Handle<Activation>,
        entry: NativeEntryPoint,
    ) -> Result<Box<Self>, DispatchError> {
        let fiber = Fiber::new(perform_call, DEFAULT_STACK_SIZE)?;
        Ok(Box::new(Self {
            action: CallAction::OriginalCall,
            entry,
            message,
            caller,
            result: Value::nil(),
            pending: None,
            reentry_result: Value::nil(),
            fiber,
        }))
    }

    #[inline]
    pub fn action(&self) -> CallAction {
        self.action
    }

    #[inline]
    pub fn message(&self) -> Handle<Message> {
        self.message
    }

    #[inline]
    pub fn caller(&self) -> Handle<Activation> {
        self.caller
    }
}

/// Interpreter seam. Re-entrant calls requested by foreign code come back
/// through here and run on the dispatch-side stack, where they may perform
/// further table lookups or nested dispatches.
pub trait Interpreter {
    fn send(&mut self, message: Handle<Message>) -> Value;
}

/// Drives a foreign call to completion. Switches into the context's fiber
/// and services its requests: a call-from-native runs the requested message
/// through `interpreter` on this (the original interpreter) stack, then
/// resumes the foreign body with the result; fiber completion yields the
/// foreign result.
pub fn executor<I: Interpreter>(context: &mut NativeCallContext, interpreter: &mut I) -> Value {
    loop {
        current_context_is(&mut *context);
        context.fiber.switch_in();

        match context.action {
            CallAction::CallFromNative => {
                let message = context
                    .pending
                    .take()
                    .expect("call-from-native without a pending message");
                context.reentry_result = interpreter.send(message);
                context.action = CallAction::ReturnFromNative;
            }
            _ => {
                debug_assert_eq!(
                    context.fiber.state(),
                    FiberState::Completed,
                    "foreign context suspended without a request"
                );
                return context.result;
            }
        }
    }
}

/// Trampoline entered on the foreign stack. Grabs the active context,
/// invokes the foreign entry with the frame view, stores the result, and
/// transfers control back to the dispatch point. It cannot simply return,
/// since this code runs on a different stack from the dispatch loop, and a
/// panic must not unwind across the switch, so one is fatal.
extern "C" fn perform_call() {
    let raw = current_context();
    debug_assert!(!raw.is_null(), "no active context behind the switch");

    let outcome = {
        // SAFETY: the executor set the pointer immediately before switching
        let context = unsafe { &mut *raw };
        let entry = context.entry;
        let mut frame = ForeignFrame { context };
        panic::catch_unwind(AssertUnwindSafe(|| entry(&mut frame)))
    };

    // SAFETY: the context outlives the whole call
    let context = unsafe { &mut *raw };
    match outcome {
        Ok(value) => context.result = value,
        Err(_) => {
            error!("foreign method panicked across a stack switch, aborting the task");
            std::process::abort();
        }
    }
    context.fiber.finish();
}

/// The foreign calling convention: what a native method body gets to see.
/// The message parts, plus the re-entry door back into the interpreter.
pub struct ForeignFrame<'a> {
    context: &'a mut NativeCallContext,
}

impl ForeignFrame<'_> {
    #[inline]
    pub fn message(&self) -> Handle<Message> {
        self.context.message
    }

    #[inline]
    pub fn selector(&self) -> Symbol {
        self.context.message.selector
    }

    #[inline]
    pub fn receiver(&self) -> Value {
        self.context.message.receiver
    }

    pub fn arguments(&self) -> &[Value] {
        self.context.message.arguments.fields()
    }

    /// Re-enters the interpreter with `message`: suspends this foreign
    /// body, lets the dispatch side perform the call on the original
    /// interpreter stack, and resumes with its result. One
    /// call-from-native/return-from-native transition pair per invocation.
    pub fn call_interpreter(&mut self, message: Handle<Message>) -> Value {
        let context = &mut *self.context;
        context.pending = Some(message);
        context.action = CallAction::CallFromNative;
        current_context_is(&mut *context);
        context.fiber.switch_out();

        debug_assert_eq!(context.action, CallAction::ReturnFromNative);
        context.reentry_result
    }
}
