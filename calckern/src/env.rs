//! Variable store and function registry.
//!
//! The [`Environment`] owns every mutable numeric value consulted during evaluation. Names are
//! resolved once to an [`Addr`]; from then on every component works with addresses only.
//!
//! Address allocation
//! - A fresh name is placed in the smallest freed slot, or appended when none is free.
//! - Deleting the last slot shrinks the store (together with any freed slots that become
//!   trailing); deleting any other slot fills it with NaN and marks it reusable.
//!
//! Example
//! ```
//! use calckern::env::{Addr, Environment};
//!
//! let mut env = Environment::new();
//! let x = env.resolve("x", false);
//! assert_eq!(env.resolve("x", true), x);
//! assert_eq!(env.resolve("y", true), Addr::NONE);
//! env.set("x", 2.0);
//! assert_eq!(env.get("x"), 2.0);
//! ```
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::trace;

use crate::expr::Expr;

/// Index into the variable store of an [`Environment`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u32);

impl Addr {
    /// Sentinel returned by explicit lookups of unknown names.
    pub const NONE: Addr = Addr(u32::MAX);

    pub fn is_none(&self) -> bool {
        *self == Addr::NONE
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Identifier of a function stored in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u32);

impl std::fmt::Display for FuncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A user-defined function: `argc` positional parameters referenced as `arg` nodes in `body`.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub argc: u32,
    pub body: Expr,
}

#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: Vec<f64>,
    names: BTreeMap<String, Addr>,
    labels: Vec<Option<String>>,
    free: BTreeSet<u32>,
    functions: Vec<Arc<Function>>,
    function_names: BTreeMap<String, FuncId>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `name` currently has an address.
    pub fn is_set(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Address of `name` without allocating.
    pub fn lookup(&self, name: &str) -> Option<Addr> {
        self.names.get(name).copied()
    }

    /// Resolve `name` to its address.
    ///
    /// In explicit mode an unknown name yields [`Addr::NONE`] and the environment is left
    /// untouched. Otherwise an unknown name is allocated a slot (reusing freed slots first),
    /// initialised to NaN.
    pub fn resolve(&mut self, name: &str, explicit: bool) -> Addr {
        if let Some(addr) = self.lookup(name) {
            return addr;
        }
        if explicit {
            return Addr::NONE;
        }

        let addr = match self.free.pop_first() {
            Some(slot) => {
                self.vars[slot as usize] = f64::NAN;
                self.labels[slot as usize] = Some(name.to_string());
                Addr(slot)
            }
            None => {
                self.vars.push(f64::NAN);
                self.labels.push(Some(name.to_string()));
                Addr((self.vars.len() - 1) as u32)
            }
        };

        trace!("allocated {addr} for variable `{name}`");
        self.names.insert(name.to_string(), addr);
        addr
    }

    /// Current value of `name`, NaN when the name has no address.
    pub fn get(&self, name: &str) -> f64 {
        self.lookup(name)
            .map(|addr| self.value(addr))
            .unwrap_or(f64::NAN)
    }

    /// Assign `value` to `name`, allocating an address if needed.
    pub fn set(&mut self, name: &str, value: f64) -> Addr {
        let addr = self.resolve(name, false);
        self.set_value(addr, value);
        addr
    }

    /// Release the address of `name`. Returns false if the name was unknown.
    pub fn delete(&mut self, name: &str) -> bool {
        let Some(addr) = self.names.remove(name) else {
            return false;
        };

        let slot = addr.index();
        self.labels[slot] = None;
        if slot + 1 == self.vars.len() {
            self.vars.pop();
            self.labels.pop();
            // Freed slots that are now trailing are dropped as well
            while let Some(&last) = self.free.last() {
                if last as usize + 1 != self.vars.len() {
                    break;
                }
                self.free.pop_last();
                self.vars.pop();
                self.labels.pop();
            }
        } else {
            self.vars[slot] = f64::NAN;
            self.free.insert(addr.0);
        }

        trace!("released {addr} of variable `{name}`");
        true
    }

    /// Value stored at `addr`, NaN when the address is out of range.
    #[inline]
    pub fn value(&self, addr: Addr) -> f64 {
        self.vars.get(addr.index()).copied().unwrap_or(f64::NAN)
    }

    /// Overwrite the value at `addr`. Writes outside the store are ignored.
    #[inline]
    pub fn set_value(&mut self, addr: Addr, value: f64) {
        if let Some(slot) = self.vars.get_mut(addr.index()) {
            *slot = value;
        }
    }

    /// Name bound to `addr`, if any.
    pub fn name_of(&self, addr: Addr) -> Option<&str> {
        self.labels.get(addr.index())?.as_deref()
    }

    /// Number of slots in the variable store, including freed ones.
    pub fn capacity(&self) -> usize {
        self.vars.len()
    }

    /// Temporarily bind `addr`; the previous value is restored when the guard is dropped.
    pub fn bind(&mut self, addr: Addr) -> ScopedBinding<'_> {
        let saved = self.value(addr);
        ScopedBinding {
            env: self,
            addr,
            saved,
        }
    }

    /// Register (or redefine) a function. Redefinition keeps the existing id.
    pub fn define_function(&mut self, name: &str, argc: u32, body: Expr) -> FuncId {
        let function = Arc::new(Function {
            name: name.to_string(),
            argc,
            body,
        });

        match self.function_names.get(name) {
            Some(&id) => {
                self.functions[id.0 as usize] = function;
                id
            }
            None => {
                let id = FuncId(self.functions.len() as u32);
                self.functions.push(function);
                self.function_names.insert(name.to_string(), id);
                id
            }
        }
    }

    pub fn function(&self, id: FuncId) -> Option<&Arc<Function>> {
        self.functions.get(id.0 as usize)
    }

    /// Number of function slots, removed ones included.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn function_id(&self, name: &str) -> Option<FuncId> {
        self.function_names.get(name).copied()
    }

    /// Unbind `name` from the registry. The slot is kept so other ids stay valid, but it is
    /// emptied and can no longer be looked up.
    pub fn remove_function(&mut self, name: &str) -> bool {
        let Some(id) = self.function_names.remove(name) else {
            return false;
        };
        self.functions[id.0 as usize] = Arc::new(Function {
            name: name.to_string(),
            argc: 0,
            body: Expr::null(),
        });
        true
    }
}

/// Guard returned by [`Environment::bind`].
///
/// Dereferences to the environment so evaluation can continue through it; dropping the guard
/// restores the value the address held before binding.
pub struct ScopedBinding<'e> {
    env: &'e mut Environment,
    addr: Addr,
    saved: f64,
}

impl ScopedBinding<'_> {
    #[inline]
    pub fn set(&mut self, value: f64) {
        self.env.set_value(self.addr, value);
    }
}

impl Deref for ScopedBinding<'_> {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        self.env
    }
}

impl DerefMut for ScopedBinding<'_> {
    fn deref_mut(&mut self) -> &mut Environment {
        self.env
    }
}

impl Drop for ScopedBinding<'_> {
    fn drop(&mut self) {
        self.env.set_value(self.addr, self.saved);
    }
}
