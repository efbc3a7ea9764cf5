use std::{
    alloc::Layout,
    fmt, mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    DispatchError, Handle, Header, HeaderFlags, Heap, HeapObject, NativeEntryPoint, ObjectType,
    Symbol, VALUE_TAG_MASK, Value,
};

pub const METHOD_TABLE_MIN_SIZE: usize = 8;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Visibility {
    Public = 0,
    Private = 1,
    Protected = 2,
    Undefined = 3,
}

impl Visibility {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Visibility::Public,
            1 => Visibility::Private,
            2 => Visibility::Protected,
            _ => Visibility::Undefined,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutableKind {
    Bytecode,
    Native,
}

/// Executable method body. Either an opaque interpreted payload (the
/// bytecode format is the interpreter's concern) or a foreign entry point.
#[repr(C)]
#[derive(Debug)]
pub struct Executable {
    pub header: Header,
    kind: ExecutableKind,
    entry: Option<NativeEntryPoint>,
    code: Value,
}

impl Executable {
    pub(crate) unsafe fn init_bytecode(me: *mut Self, code: Value) {
        // SAFETY: caller hands us a fresh allocation
        unsafe {
            (*me).header = Header::encode(ObjectType::Executable, 0, HeaderFlags::empty(), 0);
            (*me).kind = ExecutableKind::Bytecode;
            (*me).entry = None;
            (*me).code = code;
        }
    }

    pub(crate) unsafe fn init_native(me: *mut Self, entry: NativeEntryPoint) {
        // SAFETY: caller hands us a fresh allocation
        unsafe {
            (*me).header = Header::encode(ObjectType::Executable, 0, HeaderFlags::empty(), 0);
            (*me).kind = ExecutableKind::Native;
            (*me).entry = Some(entry);
            (*me).code = Value::nil();
        }
    }

    #[inline]
    pub fn kind(&self) -> ExecutableKind {
        self.kind
    }

    #[inline]
    pub fn native_entry(&self) -> Option<NativeEntryPoint> {
        self.entry
    }

    #[inline]
    pub fn code(&self) -> Value {
        self.code
    }
}

impl HeapObject for Executable {}

/// Flattened alias record: a binding that indirects to another name in
/// another owning scope. Always one hop deep; the original executable is
/// resolved at creation, never chased at dispatch.
#[repr(C)]
#[derive(Debug)]
pub struct Alias {
    pub header: Header,
    original_name: Symbol,
    original_module: Handle<Module>,
    original_executable: Option<Handle<Executable>>,
}

impl Alias {
    pub(crate) unsafe fn init(
        me: *mut Self,
        original_name: Symbol,
        original_module: Handle<Module>,
        original_executable: Option<Handle<Executable>>,
    ) {
        // SAFETY: caller hands us a fresh allocation
        unsafe {
            (*me).header = Header::encode(ObjectType::Alias, 0, HeaderFlags::empty(), 0);
            (*me).original_name = original_name;
            (*me).original_module = original_module;
            (*me).original_executable = original_executable;
        }
    }

    #[inline]
    pub fn original_name(&self) -> Symbol {
        self.original_name
    }

    #[inline]
    pub fn original_module(&self) -> Handle<Module> {
        self.original_module
    }

    #[inline]
    pub fn original_executable(&self) -> Option<Handle<Executable>> {
        self.original_executable
    }
}

impl HeapObject for Alias {}

/// Owning scope of a method table. Created once per class/module; the
/// table's `owner` points back here.
#[repr(C)]
#[derive(Debug)]
pub struct Module {
    pub header: Header,
    name: Symbol,
    table: AtomicPtr<MethodTable>,
}

impl Module {
    pub(crate) unsafe fn init(me: *mut Self, name: Symbol) {
        // SAFETY: caller hands us a fresh allocation
        unsafe {
            (*me).header = Header::encode(ObjectType::Module, 0, HeaderFlags::empty(), 0);
            (*me).name = name;
            (*me).table = AtomicPtr::new(ptr::null_mut());
        }
    }

    pub fn create(heap: &Heap, name: Symbol) -> Handle<Module> {
        let module = heap.allocate_module(name);
        let table = MethodTable::create(heap, METHOD_TABLE_MIN_SIZE);
        table.set_owner(module);
        module.table.store(table.as_ptr(), Ordering::Release);
        module
    }

    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    pub fn table(&self) -> Handle<MethodTable> {
        let raw = self.table.load(Ordering::Acquire);
        debug_assert!(!raw.is_null(), "module created without a table");
        // SAFETY: set once in create() and never cleared
        unsafe { Handle::from_ptr(raw) }
    }
}

impl HeapObject for Module {}

const METHOD_ABSENT: u64 = 0;
const METHOD_ALIAS_TAG: u64 = 0b1;

/// A method slot value: absent, a direct executable, or a flattened alias
/// record. Anything else is unrepresentable; `from_value` is the checked
/// entry for untyped values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Absent,
    Resolved(Handle<Executable>),
    Aliased(Handle<Alias>),
}

impl Method {
    #[inline]
    fn encode(self) -> u64 {
        match self {
            Method::Absent => METHOD_ABSENT,
            Method::Resolved(exec) => exec.as_ptr() as u64,
            Method::Aliased(alias) => alias.as_ptr() as u64 | METHOD_ALIAS_TAG,
        }
    }

    /// # Safety
    /// `word` must come from `encode` on handles into a live arena.
    #[inline]
    unsafe fn decode(word: u64) -> Self {
        if word == METHOD_ABSENT {
            return Method::Absent;
        }
        if word & METHOD_ALIAS_TAG != 0 {
            // SAFETY: encoded from a live alias handle
            Method::Aliased(unsafe { Handle::from_ptr((word & !METHOD_ALIAS_TAG) as *mut Alias) })
        } else {
            // SAFETY: encoded from a live executable handle
            Method::Resolved(unsafe { Handle::from_ptr(word as *mut Executable) })
        }
    }

    /// Checked conversion from an untyped value. Nil maps to absent; a
    /// reference must be an executable or an alias record, anything else is
    /// a caller-contract violation.
    pub fn from_value(value: Value) -> Result<Method, DispatchError> {
        if value.is_nil() {
            return Ok(Method::Absent);
        }
        if !value.is_reference() {
            return Err(DispatchError::NotExecutable);
        }
        let base = (value.raw() & !VALUE_TAG_MASK) as *const Header;
        // SAFETY: reference values point at arena objects, which all start
        // with a header word
        let header = unsafe { *base };
        match header.object_type() {
            // SAFETY: type tag checked against the header
            ObjectType::Executable => Ok(Method::Resolved(unsafe { value.as_handle_unchecked() })),
            // SAFETY: type tag checked against the header
            ObjectType::Alias => Ok(Method::Aliased(unsafe { value.as_handle_unchecked() })),
            _ => Err(DispatchError::NotExecutable),
        }
    }

    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, Method::Absent)
    }
}

/// One name→method binding, chained for collision resolution. Chain order
/// is insertion order within a bin, oldest first. Fields are atomics so
/// unlocked readers never observe a torn binding; all writes happen under
/// the owning table's mutation lock.
#[repr(C)]
#[derive(Debug)]
pub struct Bucket {
    pub header: Header,
    name: Symbol,
    method: AtomicU64,
    visibility: AtomicU8,
    next: AtomicPtr<Bucket>,
}

impl Bucket {
    pub(crate) unsafe fn init(me: *mut Self, name: Symbol, method: Method, visibility: Visibility) {
        // SAFETY: caller hands us a fresh allocation
        unsafe {
            (*me).header = Header::encode(ObjectType::Bucket, 0, HeaderFlags::empty(), 0);
            (*me).name = name;
            (*me).method = AtomicU64::new(method.encode());
            (*me).visibility = AtomicU8::new(visibility as u8);
            (*me).next = AtomicPtr::new(ptr::null_mut());
        }
    }

    #[inline]
    pub fn name(&self) -> Symbol {
        self.name
    }

    #[inline]
    pub fn method(&self) -> Method {
        // SAFETY: the slot only ever holds encoded method words
        unsafe { Method::decode(self.method.load(Ordering::Acquire)) }
    }

    #[inline]
    pub fn visibility(&self) -> Visibility {
        Visibility::from_u8(self.visibility.load(Ordering::Acquire))
    }

    pub fn next(&self) -> Option<Handle<Bucket>> {
        let raw = self.next.load(Ordering::Acquire);
        // SAFETY: chain links always point at live arena buckets
        NonNull::new(raw).map(|ptr| Handle::from_nonnull(ptr))
    }

    #[inline]
    pub fn is_public(&self) -> bool {
        self.visibility() == Visibility::Public
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.visibility() == Visibility::Private
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.visibility() == Visibility::Protected
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.visibility() == Visibility::Undefined
    }

    /// Walks to the end of this chain and links `tail` after the last
    /// node. Only called under the table lock, during inserts and
    /// redistribution; never reorders existing links.
    pub(crate) fn append(&self, tail: NonNull<Bucket>) {
        let mut last = self as *const Bucket;
        loop {
            // SAFETY: chain nodes are live arena buckets
            let next = unsafe { (*last).next.load(Ordering::Relaxed) };
            if next.is_null() {
                break;
            }
            last = next;
        }
        // SAFETY: `last` is the live tail of the chain
        unsafe { (*last).next.store(tail.as_ptr(), Ordering::Release) };
    }
}

impl HeapObject for Bucket {}

/// Bin-head array. Readers take the bin count from here, not from the
/// table, so a storage pointer and its length can never be observed torn.
#[repr(C)]
#[derive(Debug)]
pub struct BinArray {
    pub header: Header,
    size: usize,
    bins: [AtomicPtr<Bucket>; 0],
}

impl BinArray {
    pub(crate) fn required_layout(size: usize) -> Layout {
        let bytes = mem::size_of::<Self>() + size * mem::size_of::<AtomicPtr<Bucket>>();
        Layout::from_size_align(bytes, mem::align_of::<Self>()).expect("bin array layout")
    }

    pub(crate) unsafe fn init(me: *mut Self, size: usize) {
        // SAFETY: caller allocated through required_layout(size)
        unsafe {
            (*me).header = Header::encode(ObjectType::BinArray, 0, HeaderFlags::empty(), 0);
            (*me).size = size;
            let bins = (*me).bins.as_mut_ptr();
            for i in 0..size {
                bins.add(i).write(AtomicPtr::new(ptr::null_mut()));
            }
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
    fn bins(&self) -> &[AtomicPtr<Bucket>] {
        // SAFETY: init wrote `size` slots behind the struct
        unsafe { std::slice::from_raw_parts(self.bins.as_ptr(), self.size) }
    }
}

impl HeapObject for BinArray {}

#[inline]
fn bin_for(name: Symbol, bins: usize) -> usize {
    (name.raw() as usize) & (bins - 1)
}

/// Open-hashed, chained map from name token to method binding. Mutations
/// serialize on the table lock; lookups are lock-free and may observe the
/// table as it was just before or just after a racing mutation, never a
/// torn chain.
#[repr(C)]
pub struct MethodTable {
    pub header: Header,
    storage: AtomicPtr<BinArray>,
    bin_count: AtomicUsize,
    entry_count: AtomicUsize,
    owner: AtomicPtr<Module>,
    lock: Mutex<()>,
}

impl MethodTable {
    /// Allocates a table with `initial_size` bins, rounded up to the next
    /// power of two and never below the fixed minimum.
    pub fn create(heap: &Heap, initial_size: usize) -> Handle<MethodTable> {
        let bins = initial_size.max(METHOD_TABLE_MIN_SIZE).next_power_of_two();
        let storage = heap.allocate_bin_array(bins);
        let layout = Layout::new::<MethodTable>();
        // SAFETY: written immediately below
        let table = unsafe { heap.allocate_handle::<MethodTable>(layout) };
        // SAFETY: fresh allocation, fully written before the handle escapes
        unsafe {
            table.as_ptr().write(MethodTable {
                header: Header::encode(ObjectType::MethodTable, 0, HeaderFlags::empty(), 0),
                storage: AtomicPtr::new(storage.as_ptr()),
                bin_count: AtomicUsize::new(bins),
                entry_count: AtomicUsize::new(0),
                owner: AtomicPtr::new(ptr::null_mut()),
                lock: Mutex::new(()),
            });
        }
        table
    }

    #[inline]
    pub fn bin_count(&self) -> usize {
        self.bin_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<Handle<Module>> {
        let raw = self.owner.load(Ordering::Acquire);
        // SAFETY: only ever set from live module handles
        NonNull::new(raw).map(|ptr| Handle::from_nonnull(ptr))
    }

    /// Rebinds the owning scope; used after `duplicate` to hand the copy
    /// to a subclass.
    pub fn set_owner(&self, owner: Handle<Module>) {
        self.owner.store(owner.as_ptr(), Ordering::Release);
    }

    /// Upsert. An existing name is overwritten in place, keeping its chain
    /// position; a new name is appended at its bin's chain tail. Grows and
    /// rehashes first when the insert would push the density to 0.75 or
    /// beyond. Returns the stored name.
    pub fn store(&self, heap: &Heap, name: Symbol, method: Method, visibility: Visibility) -> Symbol {
        let _guard = self.lock.lock();
        self.insert_locked(heap, name, method, visibility)
    }

    /// Upsert of an alias binding. The original method is flattened one
    /// hop: aliasing an alias re-roots at the original's name, scope, and
    /// executable, so no stored binding is ever two hops deep.
    pub fn alias(
        &self,
        heap: &Heap,
        name: Symbol,
        visibility: Visibility,
        original_name: Symbol,
        original_method: Method,
        original_module: Handle<Module>,
    ) -> Symbol {
        let _guard = self.lock.lock();
        let (root_name, root_module, root_exec) = match original_method {
            Method::Aliased(alias) => (
                alias.original_name(),
                alias.original_module(),
                alias.original_executable(),
            ),
            Method::Resolved(exec) => (original_name, original_module, Some(exec)),
            Method::Absent => (original_name, original_module, None),
        };
        let record = heap.allocate_alias(root_name, root_module, root_exec);
        self.insert_locked(heap, name, Method::Aliased(record), visibility)
    }

    fn insert_locked(
        &self,
        heap: &Heap,
        name: Symbol,
        method: Method,
        visibility: Visibility,
    ) -> Symbol {
        let entries = self.entry_count.load(Ordering::Relaxed);
        let bins = self.bin_count.load(Ordering::Relaxed);

        if entries >= bins * 3 / 4 {
            self.redistribute(heap, bins << 1);
        }

        // SAFETY: storage always points at a live bin array
        let storage = unsafe { &*self.storage.load(Ordering::Relaxed) };
        let bin = bin_for(name, storage.len());
        let head = &storage.bins()[bin];

        let mut entry = head.load(Ordering::Relaxed);
        let mut last: *mut Bucket = ptr::null_mut();

        while !entry.is_null() {
            // SAFETY: chain nodes are live arena buckets
            let bucket = unsafe { &*entry };
            if bucket.name == name {
                bucket.method.store(method.encode(), Ordering::Release);
                bucket.visibility.store(visibility as u8, Ordering::Release);
                return name;
            }
            last = entry;
            entry = bucket.next.load(Ordering::Relaxed);
        }

        let bucket = heap.allocate_bucket(name, method, visibility);
        if last.is_null() {
            head.store(bucket.as_ptr(), Ordering::Release);
        } else {
            // SAFETY: `last` is the live tail of this chain
            unsafe { (*last).next.store(bucket.as_ptr(), Ordering::Release) };
        }
        self.entry_count.store(entries + 1, Ordering::Relaxed);
        trace!("bound name {:#x} in bin {}", name.raw(), bin);
        name
    }

    /// Lock-free lookup by name identity. A lookup racing a mutation sees
    /// the table as it was before or after that mutation; read-after-write
    /// visibility across tasks is whatever the memory model gives us, by
    /// decision not strengthened here.
    pub fn find_entry(&self, name: Symbol) -> Option<Handle<Bucket>> {
        // SAFETY: storage always points at a live bin array; replaced
        // arrays stay readable until the arena is dropped
        let storage = unsafe { &*self.storage.load(Ordering::Acquire) };
        let bin = bin_for(name, storage.len());

        let mut entry = storage.bins()[bin].load(Ordering::Acquire);
        while !entry.is_null() {
            // SAFETY: chain nodes are live arena buckets
            let bucket = unsafe { &*entry };
            if bucket.name == name {
                // SAFETY: non-null, checked above
                return Some(unsafe { Handle::from_ptr(entry) });
            }
            entry = bucket.next.load(Ordering::Acquire);
        }
        None
    }

    pub fn lookup(&self, name: Symbol) -> Option<Handle<Bucket>> {
        self.find_entry(name)
    }

    pub fn has_name(&self, name: Symbol) -> bool {
        self.find_entry(name).is_some()
    }

    /// Removes the binding for `name`, returning the removed method or
    /// absent. Shrinks and rehashes first when the density has fallen
    /// under 0.3 and halving stays at or above the minimum bin count.
    pub fn remove(&self, heap: &Heap, name: Symbol) -> Method {
        let _guard = self.lock.lock();

        let entries = self.entry_count.load(Ordering::Relaxed);
        let bins = self.bin_count.load(Ordering::Relaxed);

        // halve if the remove would leave the table under the minimum
        // density and halving stays at or above the minimum bin count
        let projected = entries.saturating_sub(1);
        if projected * 10 < bins * 3 && (bins >> 1) >= METHOD_TABLE_MIN_SIZE {
            self.redistribute(heap, bins >> 1);
        }

        // SAFETY: storage always points at a live bin array
        let storage = unsafe { &*self.storage.load(Ordering::Relaxed) };
        let bin = bin_for(name, storage.len());
        let head = &storage.bins()[bin];

        let mut entry = head.load(Ordering::Relaxed);
        let mut last: *mut Bucket = ptr::null_mut();

        while !entry.is_null() {
            // SAFETY: chain nodes are live arena buckets
            let bucket = unsafe { &*entry };
            if bucket.name == name {
                let method = bucket.method();
                let next = bucket.next.load(Ordering::Relaxed);
                if last.is_null() {
                    head.store(next, Ordering::Release);
                } else {
                    // SAFETY: `last` is the live predecessor
                    unsafe { (*last).next.store(next, Ordering::Release) };
                }
                self.entry_count.store(entries - 1, Ordering::Relaxed);
                trace!("removed name {:#x} from bin {}", name.raw(), bin);
                return method;
            }
            last = entry;
            entry = bucket.next.load(Ordering::Relaxed);
        }

        Method::Absent
    }

    /// Deep copy for subclassing: every binding is re-stored into a fresh
    /// table of the same bin count, preserving per-bin chain order. The
    /// caller rebinds the owner to the new scope.
    pub fn duplicate(&self, heap: &Heap) -> Handle<MethodTable> {
        let bins = self.bin_count.load(Ordering::Acquire);
        let dup = MethodTable::create(heap, bins);
        if let Some(owner) = self.owner() {
            dup.set_owner(owner);
        }

        // SAFETY: storage always points at a live bin array
        let storage = unsafe { &*self.storage.load(Ordering::Acquire) };
        for slot in storage.bins() {
            let mut entry = slot.load(Ordering::Acquire);
            while !entry.is_null() {
                // SAFETY: chain nodes are live arena buckets
                let bucket = unsafe { &*entry };
                dup.store(heap, bucket.name(), bucket.method(), bucket.visibility());
                entry = bucket.next.load(Ordering::Acquire);
            }
        }
        dup
    }

    /// Rehashes every bucket into a freshly sized bin array by relinking
    /// the existing buckets; bucket identities and stored data are never
    /// touched. Runs under the mutation lock. The new array is allocated
    /// up front so an allocation failure leaves `storage` and `bin_count`
    /// unchanged.
    fn redistribute(&self, heap: &Heap, new_size: usize) {
        // SAFETY: storage always points at a live bin array
        let old = unsafe { &*self.storage.load(Ordering::Relaxed) };
        let fresh = heap.allocate_bin_array(new_size);

        for slot in old.bins() {
            let mut entry = slot.load(Ordering::Relaxed);
            while !entry.is_null() {
                // SAFETY: chain nodes are live arena buckets
                let bucket = unsafe { &*entry };
                let link = bucket.next.load(Ordering::Relaxed);
                bucket.next.store(ptr::null_mut(), Ordering::Release);

                let bin = bin_for(bucket.name, new_size);
                let head = &fresh.bins()[bin];
                let first = head.load(Ordering::Relaxed);
                if first.is_null() {
                    head.store(entry, Ordering::Release);
                } else {
                    // SAFETY: `first` is a live bucket, head of the new chain
                    unsafe { (*first).append(NonNull::new_unchecked(entry)) };
                }

                entry = link;
            }
        }

        self.storage.store(fresh.as_ptr(), Ordering::Release);
        self.bin_count.store(new_size, Ordering::Release);
        debug!(
            "redistributed method table to {} bins ({} entries)",
            new_size,
            self.entry_count.load(Ordering::Relaxed)
        );
    }
}

impl HeapObject for MethodTable {}

// SAFETY: all mutation goes through atomics under the table lock
unsafe impl Send for MethodTable {}
// SAFETY: see above
unsafe impl Sync for MethodTable {}

impl fmt::Debug for MethodTable {
    // bin-ordered listing of the bound names
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: storage always points at a live bin array
        let storage = unsafe { &*self.storage.load(Ordering::Acquire) };
        let mut names = Vec::new();
        for slot in storage.bins() {
            let mut entry = slot.load(Ordering::Acquire);
            while !entry.is_null() {
                // SAFETY: chain nodes are live arena buckets
                let bucket = unsafe { &*entry };
                names.push(bucket.name().raw());
                entry = bucket.next.load(Ordering::Acquire);
            }
        }
        f.debug_struct("MethodTable")
            .field("bins", &storage.len())
            .field("entries", &self.entry_count())
            .field("names", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapCreateInfo, SymbolTable};
    use std::sync::atomic::AtomicBool;

    fn mk_heap() -> Heap {
        Heap::new(HeapCreateInfo { size: 4 * 1024 * 1024 })
    }

    fn mk_exec(heap: &Heap, tag: i64) -> Handle<Executable> {
        heap.allocate_bytecode_executable(Value::from_fixnum(tag))
    }

    /// Walks bins in order, collecting every binding. Mirrors the chain
    /// order duplicate() and Debug see.
    fn collect(table: &MethodTable) -> Vec<(Symbol, Method, Visibility)> {
        let storage = unsafe { &*table.storage.load(Ordering::Acquire) };
        let mut out = Vec::new();
        for slot in storage.bins() {
            let mut entry = slot.load(Ordering::Acquire);
            while !entry.is_null() {
                let bucket = unsafe { &*entry };
                out.push((bucket.name(), bucket.method(), bucket.visibility()));
                entry = bucket.next.load(Ordering::Acquire);
            }
        }
        out
    }

    fn assert_density_invariants(table: &MethodTable) {
        let entries = table.entry_count();
        let bins = table.bin_count();
        assert!(bins.is_power_of_two(), "bin count {} not a power of two", bins);
        assert!(bins >= METHOD_TABLE_MIN_SIZE);
        assert!(
            entries * 4 <= bins * 3,
            "density invariant violated: {} entries in {} bins",
            entries,
            bins
        );
        assert!(
            entries * 10 >= bins * 3 || bins == METHOD_TABLE_MIN_SIZE,
            "table too sparse: {} entries in {} bins",
            entries,
            bins
        );
    }

    #[test]
    fn create_rounds_bin_count_up() {
        let heap = mk_heap();
        assert_eq!(MethodTable::create(&heap, 0).bin_count(), 8);
        assert_eq!(MethodTable::create(&heap, 5).bin_count(), 8);
        assert_eq!(MethodTable::create(&heap, 9).bin_count(), 16);
        assert_eq!(MethodTable::create(&heap, 32).bin_count(), 32);
    }

    #[test]
    fn store_then_lookup_returns_binding() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let name = symbols.intern("join");
        let exec = mk_exec(&heap, 1);
        let stored = table.store(&heap, name, Method::Resolved(exec), Visibility::Public);
        assert_eq!(stored, name);

        let bucket = table.lookup(name).expect("stored name must resolve");
        assert_eq!(bucket.name(), name);
        assert_eq!(bucket.method(), Method::Resolved(exec));
        assert_eq!(bucket.visibility(), Visibility::Public);
        assert!(bucket.is_public());
        assert!(!bucket.is_private());

        assert!(table.lookup(symbols.intern("missing")).is_none());
        assert!(table.has_name(name));
    }

    #[test]
    fn store_overwrites_in_place_and_keeps_order() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let names: Vec<Symbol> = ["a", "b", "c", "d"]
            .iter()
            .map(|s| symbols.intern(s))
            .collect();
        for (i, &name) in names.iter().enumerate() {
            table.store(
                &heap,
                name,
                Method::Resolved(mk_exec(&heap, i as i64)),
                Visibility::Public,
            );
        }
        let before: Vec<Symbol> = collect(&table).iter().map(|(n, _, _)| *n).collect();

        let replacement = mk_exec(&heap, 99);
        table.store(&heap, names[1], Method::Resolved(replacement), Visibility::Private);

        assert_eq!(table.entry_count(), 4, "overwrite must not add an entry");
        let after: Vec<Symbol> = collect(&table).iter().map(|(n, _, _)| *n).collect();
        assert_eq!(before, after, "overwrite must keep chain positions");

        let bucket = table.lookup(names[1]).unwrap();
        assert_eq!(bucket.method(), Method::Resolved(replacement));
        assert_eq!(bucket.visibility(), Visibility::Private);
    }

    #[test]
    fn entry_count_tracks_stores_and_removes() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let names: Vec<Symbol> = (0..20).map(|i| symbols.intern(&format!("m{i}"))).collect();
        for (i, &name) in names.iter().enumerate() {
            table.store(
                &heap,
                name,
                Method::Resolved(mk_exec(&heap, i as i64)),
                Visibility::Public,
            );
            assert_eq!(table.entry_count(), i + 1);
            assert_density_invariants(&table);
        }

        let mut live = names.len();
        for &name in &names[..15] {
            let removed = table.remove(&heap, name);
            assert!(!removed.is_absent(), "removing a live name yields its method");
            live -= 1;
            assert_eq!(table.entry_count(), live);
            assert_density_invariants(&table);
        }

        assert!(table.remove(&heap, symbols.intern("never-stored")).is_absent());
        assert_eq!(table.entry_count(), live);
    }

    #[test]
    fn grow_boundary_is_before_the_seventh_store() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        for (i, name) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            table.store(
                &heap,
                symbols.intern(name),
                Method::Resolved(mk_exec(&heap, i as i64)),
                Visibility::Public,
            );
        }
        assert_eq!(table.bin_count(), 8, "six entries in eight bins must not resize");
        assert_eq!(table.entry_count(), 6);

        table.store(
            &heap,
            symbols.intern("g"),
            Method::Resolved(mk_exec(&heap, 6)),
            Visibility::Public,
        );
        assert_eq!(table.bin_count(), 16, "the seventh store crosses the density bound");
        assert_eq!(table.entry_count(), 7);
    }

    #[test]
    fn removes_shrink_back_toward_minimum() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let names: Vec<Symbol> = (0..13).map(|i| symbols.intern(&format!("n{i}"))).collect();
        for (i, &name) in names.iter().enumerate() {
            table.store(
                &heap,
                name,
                Method::Resolved(mk_exec(&heap, i as i64)),
                Visibility::Public,
            );
        }
        assert_eq!(table.bin_count(), 32);

        let mut shrunk = Vec::new();
        for &name in &names {
            let bins_before = table.bin_count();
            table.remove(&heap, name);
            let bins_after = table.bin_count();
            if bins_after != bins_before {
                shrunk.push((bins_before, bins_after));
            }
            assert_density_invariants(&table);
        }

        assert_eq!(table.bin_count(), METHOD_TABLE_MIN_SIZE);
        assert_eq!(table.entry_count(), 0);
        assert_eq!(
            shrunk,
            vec![(32, 16), (16, 8)],
            "halving steps back toward the minimum"
        );
    }

    #[test]
    fn redistribute_preserves_bindings_and_relative_order() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let names: Vec<Symbol> = (0..24).map(|i| symbols.intern(&format!("r{i}"))).collect();
        let mut order = std::collections::HashMap::new();
        for (i, &name) in names.iter().enumerate() {
            order.insert(name, i);
            table.store(
                &heap,
                name,
                Method::Resolved(mk_exec(&heap, i as i64)),
                Visibility::Protected,
            );
        }
        // 24 entries forced two grows; the multiset must have survived both
        assert_eq!(table.bin_count(), 32);

        let mut bindings = collect(&table);
        assert_eq!(bindings.len(), names.len());
        bindings.sort_by_key(|(n, _, _)| n.raw());
        let mut expected: Vec<Symbol> = names.clone();
        expected.sort_by_key(|n| n.raw());
        assert_eq!(
            bindings.iter().map(|(n, _, _)| *n).collect::<Vec<_>>(),
            expected
        );

        // within each bin, surviving co-residents keep insertion order
        let storage = unsafe { &*table.storage.load(Ordering::Acquire) };
        for slot in storage.bins() {
            let mut entry = slot.load(Ordering::Acquire);
            let mut previous = None;
            while !entry.is_null() {
                let bucket = unsafe { &*entry };
                let index = order[&bucket.name()];
                if let Some(prev) = previous {
                    assert!(prev < index, "chain order must follow insertion order");
                }
                previous = Some(index);
                entry = bucket.next.load(Ordering::Acquire);
            }
        }
    }

    #[test]
    fn duplicate_is_an_independent_snapshot() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let module = Module::create(&heap, symbols.intern("Base"));
        let table = module.table();

        let kept = symbols.intern("kept");
        let dropped = symbols.intern("dropped");
        table.store(&heap, kept, Method::Resolved(mk_exec(&heap, 1)), Visibility::Public);
        table.store(&heap, dropped, Method::Resolved(mk_exec(&heap, 2)), Visibility::Private);

        let dup = table.duplicate(&heap);
        assert_eq!(collect(&table), collect(&dup));
        assert_eq!(dup.bin_count(), table.bin_count());
        assert_eq!(dup.owner(), table.owner());

        let subclass = Module::create(&heap, symbols.intern("Derived"));
        dup.set_owner(subclass);
        assert_eq!(table.owner().unwrap().name(), symbols.intern("Base"));

        // mutations on either side stay invisible to the other
        table.remove(&heap, dropped);
        dup.store(
            &heap,
            symbols.intern("fresh"),
            Method::Resolved(mk_exec(&heap, 3)),
            Visibility::Public,
        );

        assert!(table.lookup(dropped).is_none());
        assert!(dup.has_name(dropped));
        assert!(!table.has_name(symbols.intern("fresh")));
        assert_eq!(table.entry_count(), 1);
        assert_eq!(dup.entry_count(), 3);
    }

    #[test]
    fn alias_of_alias_flattens_to_the_root() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let origin = Module::create(&heap, symbols.intern("Origin"));
        let table = origin.table();

        let root_name = symbols.intern("m");
        let root_exec = mk_exec(&heap, 7);
        table.store(&heap, root_name, Method::Resolved(root_exec), Visibility::Public);

        let b = symbols.intern("b");
        table.alias(
            &heap,
            b,
            Visibility::Public,
            root_name,
            Method::Resolved(root_exec),
            origin,
        );

        let first = match table.lookup(b).unwrap().method() {
            Method::Aliased(alias) => alias,
            other => panic!("alias binding expected, got {:?}", other),
        };
        assert_eq!(first.original_name(), root_name);
        assert_eq!(first.original_module(), origin);
        assert_eq!(first.original_executable(), Some(root_exec));

        // aliasing the alias re-roots at m, not at b
        let elsewhere = Module::create(&heap, symbols.intern("Elsewhere"));
        let c = symbols.intern("c");
        table.alias(
            &heap,
            c,
            Visibility::Public,
            b,
            Method::Aliased(first),
            elsewhere,
        );

        let second = match table.lookup(c).unwrap().method() {
            Method::Aliased(alias) => alias,
            other => panic!("alias binding expected, got {:?}", other),
        };
        assert_eq!(second.original_name(), root_name);
        assert_eq!(second.original_module(), origin);
        assert_eq!(second.original_executable(), Some(root_exec));
    }

    #[test]
    fn method_from_value_checks_the_contract() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let module = Module::create(&heap, symbols.intern("M"));

        assert_eq!(Method::from_value(Value::nil()).unwrap(), Method::Absent);

        let exec = mk_exec(&heap, 1);
        assert_eq!(
            Method::from_value(exec.as_value()).unwrap(),
            Method::Resolved(exec)
        );

        let alias = heap.allocate_alias(symbols.intern("m"), module, Some(exec));
        assert_eq!(
            Method::from_value(alias.as_value()).unwrap(),
            Method::Aliased(alias)
        );

        assert!(Method::from_value(Value::from_fixnum(3)).is_err());
        assert!(Method::from_value(module.as_value()).is_err());
    }

    #[test]
    fn removed_method_comes_back_and_misses_are_absent() {
        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let name = symbols.intern("gone");
        let exec = mk_exec(&heap, 5);
        table.store(&heap, name, Method::Resolved(exec), Visibility::Undefined);

        assert_eq!(table.remove(&heap, name), Method::Resolved(exec));
        assert!(table.lookup(name).is_none());
        assert_eq!(table.remove(&heap, name), Method::Absent);
    }

    #[test]
    fn concurrent_lookups_survive_stores_and_removes() {
        let _ = env_logger::builder().is_test(true).try_init();

        let heap = mk_heap();
        let symbols = SymbolTable::new();
        let table = MethodTable::create(&heap, 0);

        let names: Vec<Symbol> = (0..32).map(|i| symbols.intern(&format!("c{i}"))).collect();
        for (i, &name) in names.iter().enumerate() {
            table.store(
                &heap,
                name,
                Method::Resolved(mk_exec(&heap, i as i64)),
                Visibility::Public,
            );
        }

        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let table = &*table;
            let names = &names;
            let stop = &stop;

            for _ in 0..3 {
                scope.spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        for &name in names {
                            if let Some(bucket) = table.lookup(name) {
                                // a reader may miss a name mid-mutation but
                                // must never see a foreign or torn bucket
                                assert_eq!(bucket.name(), name);
                                let _ = bucket.method();
                                let _ = bucket.visibility();
                            }
                        }
                    }
                });
            }

            for round in 0..200 {
                for &name in names {
                    if round % 2 == 0 {
                        table.remove(&heap, name);
                    } else {
                        table.store(
                            &heap,
                            name,
                            Method::Resolved(mk_exec(&heap, round)),
                            Visibility::Private,
                        );
                    }
                }
            }
            stop.store(true, Ordering::Release);
        });

        assert_density_invariants(&table);
    }
}
