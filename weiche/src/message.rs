use std::{alloc::Layout, mem};

use crate::{Handle, Header, HeaderFlags, HeapObject, ObjectType, Symbol, Value};

/// Fixed-size value array with an inline payload.
#[repr(C)]
#[derive(Debug)]
pub struct Array {
    pub header: Header,
    size: usize,
    fields: [Value; 0],
}

impl Array {
    pub fn required_layout(size: usize) -> Layout {
        let bytes = mem::size_of::<Self>() + size * mem::size_of::<Value>();
        Layout::from_size_align(bytes, mem::align_of::<Self>()).expect("array layout")
    }

    /// # Safety
    /// `self` must have been allocated through `required_layout(data.len())`.
    pub unsafe fn init(&mut self, data: &[Value]) {
        self.header = Header::encode(ObjectType::Array, 0, HeaderFlags::empty(), 0);
        self.size = data.len();
        // SAFETY: the allocation covers `size` trailing values
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.fields.as_mut_ptr(), data.len());
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn fields(&self) -> &[Value] {
        // SAFETY: init wrote `size` values behind the struct
        unsafe { std::slice::from_raw_parts(self.fields.as_ptr(), self.size) }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.fields().get(index).copied()
    }
}

impl HeapObject for Array {}

/// Call descriptor handed to a dispatch: who is called, on what, with which
/// arguments.
#[repr(C)]
#[derive(Debug)]
pub struct Message {
    pub header: Header,
    pub selector: Symbol,
    pub receiver: Value,
    pub arguments: Handle<Array>,
}

impl Message {
    pub(crate) unsafe fn init(&mut self, selector: Symbol, receiver: Value, arguments: Handle<Array>) {
        self.header = Header::encode(ObjectType::Message, 0, HeaderFlags::empty(), 0);
        self.selector = selector;
        self.receiver = receiver;
        self.arguments = arguments;
    }
}

impl HeapObject for Message {}

/// Minimal stand-in for the interpreter-side context that initiated a
/// dispatch. The real activation record lives with the interpreter; the
/// bridge only carries a back-reference.
#[repr(C)]
#[derive(Debug)]
pub struct Activation {
    pub header: Header,
    pub receiver: Value,
}

impl Activation {
    pub(crate) unsafe fn init(&mut self, receiver: Value) {
        self.header = Header::encode(ObjectType::Activation, 0, HeaderFlags::empty(), 0);
        self.receiver = receiver;
    }
}

impl HeapObject for Activation {}
