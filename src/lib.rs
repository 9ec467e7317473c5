//! Validation of decoded WebAssembly modules.
//!
//! Before a module can be instantiated it must be validated: every function
//! body, every constant initializer and every cross-entity reference is
//! checked against the WebAssembly type system, including the
//! reference-types, GC and tail-call extensions. Code following an
//! unconditional branch is checked under the usual polymorphic stack
//! discipline, so unreachable tails never cause spurious rejections.
//!
//! The validator neither decodes binaries nor executes code. It consumes the
//! typed [`Module`](types::Module) a decoder produces, does not mutate it,
//! and either accepts it or reports the first [`Error`] found. There are no
//! warnings and no partial acceptance.
//!
//! ```
//! use wasm_validation::types::{Func, FuncBody, FuncType, Instruction, Module, ValType};
//! use wasm_validation::validate_module;
//!
//! // (func (param i32) (result i32) local.get 0)
//! let mut module = Module::default();
//! module.funcs.push(Func::Local(FuncBody {
//!     ty: FuncType::new(vec![ValType::I32], vec![ValType::I32]),
//!     locals: vec![],
//!     code: vec![Instruction::LocalGet(0)],
//! }));
//! assert!(validate_module(&module).is_ok());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
#[macro_use]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std as alloc;

pub mod types;

mod context;
mod func;
mod stack;


use alloc::string::String;
use core::fmt;
#[cfg(feature = "std")]
use std::error;

#[cfg(feature = "std")]
use std::collections::HashSet;

#[cfg(not(feature = "std"))]
use hashbrown::HashSet;

use memory_units::Pages;

use crate::context::ModuleContext;
use crate::func::validate_function;
use crate::stack::{StackType, TypeStack};
use crate::types::{
    DataMode, ElementMode, FuncType, Global, HeapType, Instruction, Limits, MemoryType, Module,
    TableType,
};

/// Hard ceiling of a 32-bit linear memory.
const LINEAR_MEMORY_MAX_PAGES: Pages = Pages(65536);

/// Errors produced by module validation.
///
/// Kinds are stable; the strings carried by [`Error::TypeMismatch`] are
/// advisory context and not part of the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operand stack does not have the shape an instruction requires.
    TypeMismatch(String),
    /// A memory instruction was used in a module without that memory.
    UnknownMemory(u32),
    /// The alignment immediate of a load or store exceeds the natural width
    /// of the access.
    AlignmentTooLarge,
    /// A branch targets a label deeper than the enclosing block stack.
    UnknownLabel,
    /// A global index is unknown, or a constant expression reads a global
    /// that is not imported.
    UnknownGlobal,
    /// `ref.func` names a function that no constant expression or export
    /// declared referenceable.
    UndeclaredFunctionReference,
    /// A construct the validator cannot check yet, or a state the decoded
    /// module should have made impossible. Never a property of well-formed
    /// supported input.
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TypeMismatch(context) => write!(f, "type mismatch: {}", context),
            Error::UnknownMemory(idx) => write!(f, "unknown memory {}", idx),
            Error::AlignmentTooLarge => write!(f, "alignment larger than natural width"),
            Error::UnknownLabel => write!(f, "unknown label"),
            Error::UnknownGlobal => write!(f, "unknown global"),
            Error::UndeclaredFunctionReference => write!(f, "undeclared function reference"),
            Error::Internal(message) => write!(f, "internal: {}", message),
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for Error {}

/// Validates a module.
///
/// Constant expressions run first (globals, then element segments, then
/// data segments) because they declare the functions that `ref.func` may
/// name inside bodies; exported functions are declared referenceable as
/// well. Function bodies are checked last. The first error aborts
/// validation.
pub fn validate_module(module: &Module) -> Result<(), Error> {
    let context = ModuleContext::new(module);

    for table in &module.tables {
        validate_table_type(table)?;
    }
    for memory in &module.memories {
        validate_memory_type(memory)?;
    }
    if let Some(start) = module.start {
        validate_start(&context, start)?;
    }

    let mut refs: HashSet<u32> = HashSet::new();

    for global in &module.globals {
        if let Global::Local(entry) = global {
            let got = validate_const_expr(&context, &mut refs, &entry.init)?;
            let declared = StackType::from(entry.ty.content);
            if got != declared {
                return Err(Error::TypeMismatch(format!(
                    "global initializer has type {:?}, declared {:?}",
                    got, declared
                )));
            }
        }
    }

    for segment in &module.elements {
        for init in &segment.inits {
            let got = validate_const_expr(&context, &mut refs, init)?;
            if let StackType::Ref(heap) = got {
                if heap != segment.element.heap {
                    return Err(Error::TypeMismatch(String::from(
                        "element segment initializer",
                    )));
                }
            }
        }
        if let ElementMode::Active { table, offset } = &segment.mode {
            let table = table.ok_or(Error::Internal(
                "active element segment carries no table index",
            ))?;
            if context.require_table(table)?.element != segment.element {
                return Err(Error::TypeMismatch(String::from("element segment table")));
            }
            validate_const_expr(&context, &mut refs, offset)?;
        }
    }

    for segment in &module.datas {
        if let DataMode::Active { memory, offset } = &segment.mode {
            context.require_memory(*memory)?;
            validate_const_expr(&context, &mut refs, offset)?;
        }
    }

    for &idx in &module.exports.funcs {
        context.require_function(idx)?;
        refs.insert(idx);
    }

    for function in &module.funcs {
        if let types::Func::Local(body) = function {
            validate_function(context, &refs, body)?;
        }
    }

    Ok(())
}

/// Checks a constant expression and returns the type of its single result.
///
/// Functions named by `ref.func` become referenceable module-wide, which is
/// why the set is threaded mutably through every constant expression before
/// any body is checked.
fn validate_const_expr(
    context: &ModuleContext,
    refs: &mut HashSet<u32>,
    code: &[Instruction],
) -> Result<StackType, Error> {
    let mut stack = TypeStack::new();
    for instruction in code {
        validate_const_instruction(context, refs, &mut stack, instruction)?;
    }
    match stack.as_slice() {
        [ty] => Ok(*ty),
        _ => Err(Error::TypeMismatch(String::from(
            "constant expression must produce exactly one value",
        ))),
    }
}

fn validate_const_instruction(
    context: &ModuleContext,
    refs: &mut HashSet<u32>,
    stack: &mut TypeStack,
    instruction: &Instruction,
) -> Result<(), Error> {
    match instruction {
        Instruction::I32Const(_) => stack.push(StackType::I32),
        Instruction::I64Const(_) => stack.push(StackType::I64),
        Instruction::F32Const(_) => stack.push(StackType::F32),
        Instruction::F64Const(_) => stack.push(StackType::F64),
        Instruction::RefNull(heap) => stack.push(StackType::Ref(*heap)),
        Instruction::RefFunc(idx) => {
            context.require_function(*idx)?;
            refs.insert(*idx);
            stack.push(StackType::Ref(HeapType::Func));
        }
        Instruction::GlobalGet(idx) => {
            let ty = context.require_imported_global(*idx)?.content;
            stack.push(StackType::from(ty));
        }
        Instruction::IBinOp(size, _) => {
            let ty = StackType::int(*size);
            stack.pop(&[ty, ty], "constant operator")?;
            stack.push(ty);
        }
        Instruction::ArrayNew(ty) => {
            stack.pop(&[StackType::from(*ty), StackType::I32], "array.new")?;
            stack.push(StackType::Ref(HeapType::Array));
        }
        Instruction::RefI31 => {
            stack.pop(&[StackType::I32], "ref.i31")?;
            stack.push(StackType::Ref(HeapType::I31));
        }
        _ => {
            return Err(Error::Internal(
                "instruction not supported in constant expressions",
            ))
        }
    }
    Ok(())
}

fn validate_limits(limits: &Limits) -> Result<(), Error> {
    if let Some(maximum) = limits.maximum {
        if limits.initial > maximum {
            return Err(Error::TypeMismatch(format!(
                "maximum limit {} is less than initial {}",
                maximum, limits.initial
            )));
        }
    }
    Ok(())
}

fn validate_table_type(table: &TableType) -> Result<(), Error> {
    validate_limits(&table.limits)
}

fn validate_memory_type(memory: &MemoryType) -> Result<(), Error> {
    validate_limits(&memory.limits)?;
    let initial = Pages(memory.limits.initial as usize);
    let maximum = memory.limits.maximum.map(|max| Pages(max as usize));
    if initial > LINEAR_MEMORY_MAX_PAGES || maximum.map_or(false, |max| max > LINEAR_MEMORY_MAX_PAGES)
    {
        return Err(Error::TypeMismatch(format!(
            "memory size must be at most {} pages",
            LINEAR_MEMORY_MAX_PAGES.0
        )));
    }
    Ok(())
}

fn validate_start(context: &ModuleContext, start: u32) -> Result<(), Error> {
    let FuncType { params, results } = context.require_function(start)?;
    if !params.is_empty() || !results.is_empty() {
        return Err(Error::TypeMismatch(String::from(
            "start function expected to have type [] -> []",
        )));
    }
    Ok(())
}
