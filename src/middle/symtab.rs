//! The symbol table (§4.2 "Parser + code emitter"): one scope for global
//! variables and procedures, and a fresh scope per procedure body for
//! parameters and locals. Each entry's `address` field doubles as a fixup
//! chain head for forward references — see `back::codegen`.

use std::fmt;

use crate::common::{Id, Map};
use crate::front::ast::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Global,
    Local,
    Parameter,
    Procedure,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub ty: Type,
    pub kind: Kind,
    /// For globals: the data-segment offset. For locals/parameters: the
    /// frame-pointer-relative offset. For procedures: the code-segment
    /// address once defined, or the head of the forward-reference fixup
    /// chain (§4.2/§4.3) while still undefined — `0` means "no
    /// references yet and not yet defined".
    pub address: i64,
    pub defined: bool,
    pub line: u64,
}

/// A single lexical scope: global or one procedure's parameters+locals.
#[derive(Debug, Default)]
pub struct Scope {
    entries: Map<Id, Entry>,
}

impl Scope {
    pub fn declare(&mut self, name: Id, entry: Entry) -> Option<Entry> {
        self.entries.insert(name, entry)
    }

    pub fn get(&self, name: &Id) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &Id) -> Option<&mut Entry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &Id) -> bool {
        self.entries.contains_key(name)
    }
}

/// The two-level table the parser consults while building the TIR: a
/// permanent global scope (variables and procedure signatures) and a
/// transient local scope that is replaced at the start of each procedure
/// body (C* has no nested block scoping).
#[derive(Debug, Default)]
pub struct SymbolTable {
    pub global: Scope,
    pub local: Scope,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_procedure(&mut self) {
        self.local = Scope::default();
    }

    /// Locals shadow globals; library/global procedures are only ever
    /// found in the global scope.
    pub fn lookup(&self, name: &Id) -> Option<&Entry> {
        self.local.get(name).or_else(|| self.global.get(name))
    }

    pub fn lookup_mut(&mut self, name: &Id) -> Option<&mut Entry> {
        if self.local.contains(name) {
            self.local.get_mut(name)
        } else {
            self.global.get_mut(name)
        }
    }
}

/// One line per entry, for the `-v 4`/`-v 5` debug tracing levels (§6).
impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, entry) in &self.entries {
            writeln!(f, "{name}: {entry}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} @ {} (line {}{})", self.kind, self.ty, self.address, self.line, if self.defined { "" } else { ", undefined" })
    }
}

impl fmt::Display for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "global:")?;
        write!(f, "{}", self.global)?;
        writeln!(f, "local:")?;
        write!(f, "{}", self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locals_shadow_globals() {
        let mut table = SymbolTable::new();
        let x = Id::from("x".to_string());
        table.global.declare(
            x,
            Entry { ty: Type::Uint64, kind: Kind::Global, address: 0, defined: true, line: 1 },
        );
        table.enter_procedure();
        table.local.declare(
            x,
            Entry { ty: Type::Pointer, kind: Kind::Local, address: -8, defined: true, line: 2 },
        );
        assert_eq!(table.lookup(&x).unwrap().kind, Kind::Local);
    }

    #[test]
    fn locals_scope_resets_per_procedure() {
        let mut table = SymbolTable::new();
        let x = Id::from("x".to_string());
        table.enter_procedure();
        table.local.declare(
            x,
            Entry { ty: Type::Uint64, kind: Kind::Local, address: -8, defined: true, line: 1 },
        );
        assert!(table.lookup(&x).is_some());
        table.enter_procedure();
        assert!(table.lookup(&x).is_none());
    }
}
