//! Abstract operand stack and the type lattice threaded through validation.
//!
//! Unreachable code leaves a polymorphic bottom (`Any`) on the stack which
//! stands for arbitrarily many values of arbitrary type; an unannotated
//! `select` over it produces the universal top (`Something`). Both are
//! ordinary lattice elements here, and every operation spells out how it
//! treats them.

use crate::types::{FuncType, HeapType, NumType, Size, ValType};
use crate::Error;
use alloc::string::String;
use alloc::vec::Vec;

/// Value type as tracked on the validation stack.
///
/// Nullability of references is erased: branching and joining never depend
/// on it, and erasing it keeps the lattice flat.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StackType {
    /// A concrete numeric type.
    Num(NumType),
    /// A reference with the given heap type.
    Ref(HeapType),
    /// Polymorphic bottom; produced only by unreachable code.
    Any,
    /// Universal top; produced by `select` over an unconstrained operand.
    Something,
}

impl StackType {
    pub(crate) const I32: StackType = StackType::Num(NumType::I32);
    pub(crate) const I64: StackType = StackType::Num(NumType::I64);
    pub(crate) const F32: StackType = StackType::Num(NumType::F32);
    pub(crate) const F64: StackType = StackType::Num(NumType::F64);

    /// The integer type of the given width.
    pub(crate) fn int(size: Size) -> StackType {
        match size {
            Size::S32 => StackType::I32,
            Size::S64 => StackType::I64,
        }
    }

    /// The float type of the given width.
    pub(crate) fn float(size: Size) -> StackType {
        match size {
            Size::S32 => StackType::F32,
            Size::S64 => StackType::F64,
        }
    }
}

impl From<ValType> for StackType {
    fn from(ty: ValType) -> StackType {
        match ty {
            ValType::Num(num) => StackType::Num(num),
            ValType::Ref(reference) => StackType::Ref(reference.heap),
        }
    }
}

/// Converts a declared type list into its stack form.
pub(crate) fn stack_types(types: &[ValType]) -> Vec<StackType> {
    types.iter().copied().map(StackType::from).collect()
}

/// Whether `got` is acceptable where `required` is expected.
pub(crate) fn match_types(required: StackType, got: StackType) -> bool {
    use StackType::{Num, Ref};
    match (required, got) {
        (StackType::Something, _) | (_, StackType::Something) => true,
        (StackType::Any, _) | (_, StackType::Any) => true,
        (Num(required), Num(got)) => required == got,
        (Ref(required), Ref(got)) => match_ref_type(required, got),
        (Num(_), Ref(_)) | (Ref(_), Num(_)) => false,
    }
}

/// Whether a reference to `got` is acceptable where `required` is expected.
///
/// `any` is the top of the internal hierarchy and accepts every reference;
/// below it the abstract heap types form three disjoint subtype chains.
pub(crate) fn match_ref_type(required: HeapType, got: HeapType) -> bool {
    required == HeapType::Any || heap_subtype(got, required)
}

fn heap_subtype(sub: HeapType, sup: HeapType) -> bool {
    sub == sup
        || matches!(
            (sub, sup),
            (HeapType::None, HeapType::Eq)
                | (HeapType::None, HeapType::I31)
                | (HeapType::None, HeapType::Struct)
                | (HeapType::None, HeapType::Array)
                | (HeapType::I31, HeapType::Eq)
                | (HeapType::Struct, HeapType::Eq)
                | (HeapType::Array, HeapType::Eq)
                | (HeapType::NoFunc, HeapType::Func)
                | (HeapType::NoExtern, HeapType::Extern)
        )
}

/// Equality of two stack shapes modulo the polymorphic bottom.
///
/// `Any` on either side may stand for zero, one or several elements of the
/// other; the comparison succeeds if any such assignment works.
pub(crate) fn equal(a: &[StackType], b: &[StackType]) -> bool {
    let (&a_top, a_below) = match a.split_last() {
        Some(split) => split,
        None => return b.iter().all(|ty| *ty == StackType::Any),
    };
    let (&b_top, b_below) = match b.split_last() {
        Some(split) => split,
        None => return a.iter().all(|ty| *ty == StackType::Any),
    };
    if a_top == StackType::Any {
        return equal(a_below, b) || equal(a_below, b_below) || equal(a, b_below);
    }
    if b_top == StackType::Any {
        return equal(a, b_below) || equal(a_below, b_below) || equal(a_below, b);
    }
    match_types(a_top, b_top) && equal(a_below, b_below)
}

/// Consumes `required` from the top of `stack`, both in declaration order
/// (last element is the top). Returns the length of the remaining stack.
///
/// A stack `Any` may stand in for the required element and keep standing in
/// for the ones below it, or be consumed outright; both options are tried.
fn consume(required: &[StackType], stack: &[StackType]) -> Option<usize> {
    let (&req, req_below) = match required.split_last() {
        Some(split) => split,
        None => return Some(stack.len()),
    };
    let (&top, below) = stack.split_last()?;
    if top == StackType::Any {
        return consume(req_below, stack).or_else(|| consume(req_below, below));
    }
    if match_types(req, top) {
        consume(req_below, below)
    } else {
        None
    }
}

/// Abstract operand stack. The top of the stack is the end of the vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TypeStack(pub(crate) Vec<StackType>);

impl TypeStack {
    pub(crate) fn new() -> TypeStack {
        TypeStack(Vec::new())
    }

    /// The stack left behind by a terminating instruction: a lone `Any`.
    pub(crate) fn polymorphic() -> TypeStack {
        TypeStack(vec![StackType::Any])
    }

    pub(crate) fn from_types(types: &[StackType]) -> TypeStack {
        TypeStack(types.to_vec())
    }

    pub(crate) fn as_slice(&self) -> &[StackType] {
        &self.0
    }

    pub(crate) fn push(&mut self, ty: StackType) {
        self.0.push(ty);
    }

    /// Pushes a declared type list; its last element becomes the new top.
    pub(crate) fn push_types(&mut self, types: &[StackType]) {
        self.0.extend_from_slice(types);
    }

    /// Pops `required` (declaration order) off the top of the stack.
    pub(crate) fn pop(&mut self, required: &[StackType], context: &str) -> Result<(), Error> {
        match consume(required, &self.0) {
            Some(remaining) => {
                self.0.truncate(remaining);
                Ok(())
            }
            None => Err(Error::TypeMismatch(String::from(context))),
        }
    }

    /// Whether `required` could be popped, without consuming anything.
    pub(crate) fn matches_prefix(&self, required: &[StackType]) -> bool {
        consume(required, &self.0).is_some()
    }

    /// Pops a block type: parameters off, results on.
    pub(crate) fn pop_push(&mut self, block_type: &FuncType, context: &str) -> Result<(), Error> {
        self.pop(&stack_types(&block_type.params), context)?;
        self.push_types(&stack_types(&block_type.results));
        Ok(())
    }

    /// Discards the top value. The polymorphic tail survives a drop.
    pub(crate) fn drop_top(&mut self) -> Result<(), Error> {
        match self.0.last() {
            None => Err(Error::TypeMismatch(String::from("drop"))),
            Some(StackType::Any) => {
                self.0.clear();
                self.0.push(StackType::Any);
                Ok(())
            }
            Some(_) => {
                self.0.pop();
                Ok(())
            }
        }
    }

    /// Pops a value that must be some reference. `Any` satisfies the pop
    /// without being consumed.
    pub(crate) fn pop_ref(&mut self, context: &str) -> Result<(), Error> {
        match self.0.last() {
            Some(StackType::Any) => Ok(()),
            Some(StackType::Ref(_)) | Some(StackType::Something) => {
                self.0.pop();
                Ok(())
            }
            Some(StackType::Num(_)) | None => Err(Error::TypeMismatch(String::from(context))),
        }
    }
}
