use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

/// Interned name token. Equality is identity; the raw id doubles as the
/// identity hash used by the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u64);

impl Symbol {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

pub struct SymbolTableImpl {
    table: HashMap<Symbol, Arc<str>>,
    mappings: HashMap<String, Symbol>,
}

pub struct SymbolTable(Arc<RwLock<SymbolTableImpl>>);

impl SymbolTableImpl {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
            mappings: HashMap::new(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> Symbol {
        if let Some(&sym) = self.mappings.get(value) {
            return sym;
        }
        use std::hash::Hasher;
        let mut hasher = ahash::AHasher::default();
        hasher.write(value.as_bytes());
        let sym = Symbol(hasher.finish());
        let owned = value.to_owned();
        let interned = Arc::<str>::from(owned.clone());
        self.mappings.insert(owned, sym);
        self.table.insert(sym, interned);
        sym
    }

    fn get(&self, sym: &Symbol) -> Option<Arc<str>> {
        self.table.get(sym).cloned()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(SymbolTableImpl::new())))
    }

    pub fn intern(&self, value: &str) -> Symbol {
        self.0.write().get_or_add(value)
    }

    pub fn get(&self, sym: &Symbol) -> Option<Arc<str>> {
        self.0.read().get(sym)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
