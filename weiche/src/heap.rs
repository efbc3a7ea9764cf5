use std::{alloc::Layout, ptr::NonNull};

use parking_lot::Mutex;

use crate::{
    Activation, Alias, Array, BinArray, Bucket, Executable, Handle, HeapObject, Message, Method,
    Module, NativeEntryPoint, Symbol, Value, Visibility, map_memory, unmap_memory,
};

#[derive(Debug, Default)]
pub struct HeapCreateInfo {
    pub size: usize,
}

/// Bump arena backing every VM object in this crate. Stands in for the
/// external allocator/collector: addresses are stable for the arena's whole
/// lifetime and the region is released in one piece on drop. That stability
/// is what lock-free table readers rely on: an unlinked bucket or a
/// replaced bin array stays readable until the arena goes away.
#[derive(Debug)]
pub struct Heap {
    start: NonNull<u8>,
    size: usize,
    bump: Mutex<usize>,
}

// SAFETY: allocation is guarded by the bump lock, object memory is plain
unsafe impl Send for Heap {}
// SAFETY: see above
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(info: HeapCreateInfo) -> Self {
        let size = info.size.max(crate::PAGE_SIZE);
        let start = map_memory(size).expect("allocate memory for heap");
        Self {
            start,
            size,
            bump: Mutex::new(0),
        }
    }

    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        let mut bump = self.bump.lock();
        let offset = bump.next_multiple_of(layout.align());
        let next = offset + layout.size();
        if next > self.size {
            panic!("VM out of memory");
        }
        *bump = next;
        // SAFETY: offset stays inside the mapped region
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(offset)) }
    }

    /// Allocate a new object and return it as a typed handle.
    /// # Safety
    /// The caller must initialize the object before the handle is read.
    pub unsafe fn allocate_handle<T: HeapObject>(&self, layout: Layout) -> Handle<T> {
        let raw = self.allocate(layout);
        // SAFETY: by contract initialized right after
        unsafe { Handle::from_ptr(raw.cast().as_ptr()) }
    }

    pub fn allocate_array(&self, data: &[Value]) -> Handle<Array> {
        let layout = Array::required_layout(data.len());
        // SAFETY: init is called immediately
        let array = unsafe { self.allocate_handle::<Array>(layout) };
        // SAFETY: allocated through required_layout(data.len())
        unsafe { (*array.as_ptr()).init(data) };
        array
    }

    pub fn allocate_message(
        &self,
        selector: Symbol,
        receiver: Value,
        arguments: Handle<Array>,
    ) -> Handle<Message> {
        let layout = Layout::new::<Message>();
        // SAFETY: init is called immediately
        let message = unsafe { self.allocate_handle::<Message>(layout) };
        // SAFETY: freshly allocated
        unsafe { (*message.as_ptr()).init(selector, receiver, arguments) };
        message
    }

    pub fn allocate_activation(&self, receiver: Value) -> Handle<Activation> {
        let layout = Layout::new::<Activation>();
        // SAFETY: init is called immediately
        let activation = unsafe { self.allocate_handle::<Activation>(layout) };
        // SAFETY: freshly allocated
        unsafe { (*activation.as_ptr()).init(receiver) };
        activation
    }

    pub fn allocate_bytecode_executable(&self, code: Value) -> Handle<Executable> {
        let layout = Layout::new::<Executable>();
        // SAFETY: init is called immediately
        let exec = unsafe { self.allocate_handle::<Executable>(layout) };
        // SAFETY: freshly allocated
        unsafe { Executable::init_bytecode(exec.as_ptr(), code) };
        exec
    }

    pub fn allocate_native_executable(&self, entry: NativeEntryPoint) -> Handle<Executable> {
        let layout = Layout::new::<Executable>();
        // SAFETY: init is called immediately
        let exec = unsafe { self.allocate_handle::<Executable>(layout) };
        // SAFETY: freshly allocated
        unsafe { Executable::init_native(exec.as_ptr(), entry) };
        exec
    }

    pub fn allocate_alias(
        &self,
        original_name: Symbol,
        original_module: Handle<Module>,
        original_executable: Option<Handle<Executable>>,
    ) -> Handle<Alias> {
        let layout = Layout::new::<Alias>();
        // SAFETY: init is called immediately
        let alias = unsafe { self.allocate_handle::<Alias>(layout) };
        // SAFETY: freshly allocated
        unsafe {
            Alias::init(
                alias.as_ptr(),
                original_name,
                original_module,
                original_executable,
            )
        };
        alias
    }

    pub fn allocate_module(&self, name: Symbol) -> Handle<Module> {
        let layout = Layout::new::<Module>();
        // SAFETY: init is called immediately
        let module = unsafe { self.allocate_handle::<Module>(layout) };
        // SAFETY: freshly allocated
        unsafe { Module::init(module.as_ptr(), name) };
        module
    }

    pub(crate) fn allocate_bucket(
        &self,
        name: Symbol,
        method: Method,
        visibility: Visibility,
    ) -> Handle<Bucket> {
        let layout = Layout::new::<Bucket>();
        // SAFETY: init is called immediately
        let bucket = unsafe { self.allocate_handle::<Bucket>(layout) };
        // SAFETY: freshly allocated
        unsafe { Bucket::init(bucket.as_ptr(), name, method, visibility) };
        bucket
    }

    pub(crate) fn allocate_bin_array(&self, bins: usize) -> Handle<BinArray> {
        let layout = BinArray::required_layout(bins);
        // SAFETY: init is called immediately
        let array = unsafe { self.allocate_handle::<BinArray>(layout) };
        // SAFETY: allocated through required_layout(bins)
        unsafe { BinArray::init(array.as_ptr(), bins) };
        array
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: mapped in new() with the same size, no handles may
        // outlive the arena
        unsafe { unmap_memory(self.start, self.size) };
    }
}
