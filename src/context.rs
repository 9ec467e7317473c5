//! Read-only view of the module under validation.

use crate::types::{ElementSegment, Func, FuncType, Global, GlobalType, Module, TableType};
use crate::Error;

/// Lookup helpers over the module's index spaces.
///
/// Indices are resolved before validation, so a miss in the function, table
/// or element space is an internal error rather than a diagnostic; globals
/// and memories keep their dedicated error kinds because instructions refer
/// to them directly.
#[derive(Copy, Clone)]
pub(crate) struct ModuleContext<'a> {
    module: &'a Module,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(module: &'a Module) -> ModuleContext<'a> {
        ModuleContext { module }
    }

    pub(crate) fn require_function(&self, idx: u32) -> Result<&'a FuncType, Error> {
        self.module
            .funcs
            .get(idx as usize)
            .map(Func::ty)
            .ok_or(Error::Internal("function index out of bounds"))
    }

    pub(crate) fn require_global(&self, idx: u32) -> Result<&'a GlobalType, Error> {
        self.module
            .globals
            .get(idx as usize)
            .map(Global::ty)
            .ok_or(Error::UnknownGlobal)
    }

    /// The global at `idx`, required to be imported. Constant expressions may
    /// not read module-defined globals.
    pub(crate) fn require_imported_global(&self, idx: u32) -> Result<&'a GlobalType, Error> {
        match self.module.globals.get(idx as usize) {
            Some(Global::Imported(ty)) => Ok(ty),
            _ => Err(Error::UnknownGlobal),
        }
    }

    pub(crate) fn require_table(&self, idx: u32) -> Result<&'a TableType, Error> {
        self.module
            .tables
            .get(idx as usize)
            .ok_or(Error::Internal("table index out of bounds"))
    }

    pub(crate) fn require_element(&self, idx: u32) -> Result<&'a ElementSegment, Error> {
        self.module
            .elements
            .get(idx as usize)
            .ok_or(Error::Internal("element segment index out of bounds"))
    }

    pub(crate) fn require_memory(&self, idx: u32) -> Result<(), Error> {
        if (idx as usize) < self.module.memories.len() {
            Ok(())
        } else {
            Err(Error::UnknownMemory(idx))
        }
    }
}
