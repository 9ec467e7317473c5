//! Function-body checker.
//!
//! A symbolic interpreter threads an abstract [`TypeStack`] through every
//! instruction of a body. Structured instructions recurse: a block is checked
//! against a fresh stack holding its parameters, its result shape compared on
//! the way out, and the block as a whole then applied to the enclosing stack.

use crate::context::ModuleContext;
use crate::stack::{equal, match_ref_type, match_types, stack_types, StackType, TypeStack};
use crate::types::{FuncBody, FuncType, HeapType, Instruction, ValType};
use crate::Error;
use alloc::string::String;
use alloc::vec::Vec;

#[cfg(feature = "std")]
use std::collections::HashSet;

#[cfg(not(feature = "std"))]
use hashbrown::HashSet;

/// Checks one function body against its declared signature.
pub(crate) fn validate_function(
    module: ModuleContext<'_>,
    refs: &HashSet<u32>,
    body: &FuncBody,
) -> Result<(), Error> {
    let locals = body
        .ty
        .params
        .iter()
        .chain(body.locals.iter())
        .copied()
        .map(StackType::from)
        .collect();
    let mut context = FunctionValidationContext {
        module,
        locals,
        return_type: &body.ty.results,
        blocks: Vec::new(),
        refs,
    };
    // The body behaves like a block of type `[] -> results` entered on an
    // empty stack; parameters are reached through locals only.
    let block_type = FuncType::new(Vec::new(), body.ty.results.clone());
    context.check_block(&body.code, false, Some(&block_type), TypeStack::new())?;
    Ok(())
}

/// Per-function validation state.
struct FunctionValidationContext<'a> {
    module: ModuleContext<'a>,
    /// Parameters then declared locals, nullability erased.
    locals: Vec<StackType>,
    /// Declared results of the function.
    return_type: &'a [ValType],
    /// Jump types of enclosing blocks; label 0 is the last entry.
    blocks: Vec<Vec<StackType>>,
    /// Functions `ref.func` may name.
    refs: &'a HashSet<u32>,
}

impl<'a> FunctionValidationContext<'a> {
    /// Checks a block body and applies the block to `prev_stack`.
    ///
    /// A branch restarts a loop with the block parameters; for any other
    /// construct it jumps past the end with the results.
    fn check_block(
        &mut self,
        code: &[Instruction],
        is_loop: bool,
        block_type: Option<&FuncType>,
        prev_stack: TypeStack,
    ) -> Result<TypeStack, Error> {
        let unannotated = FuncType::default();
        let block_type = block_type.unwrap_or(&unannotated);
        let params = stack_types(&block_type.params);
        let results = stack_types(&block_type.results);

        let jump_type = if is_loop { params.clone() } else { results.clone() };
        self.blocks.push(jump_type);
        let mut stack = TypeStack::from_types(&params);
        for instruction in code {
            stack = self.check_instruction(stack, instruction)?;
        }
        self.blocks.pop();

        if !equal(stack.as_slice(), &results) {
            return Err(Error::TypeMismatch(format!(
                "block produces {:?}, expected {:?}",
                stack.as_slice(),
                results
            )));
        }

        let mut out = prev_stack;
        if !out.matches_prefix(&params) {
            return Err(Error::TypeMismatch(format!(
                "block expects {:?}, stack was {:?}",
                params,
                out.as_slice()
            )));
        }
        out.pop(&params, "block")?;
        out.push_types(&results);
        Ok(out)
    }

    fn check_instruction(
        &mut self,
        mut stack: TypeStack,
        instruction: &Instruction,
    ) -> Result<TypeStack, Error> {
        use crate::types::Instruction::*;

        match instruction {
            Nop => {}
            Unreachable => return Ok(TypeStack::polymorphic()),

            I32Const(_) => stack.push(StackType::I32),
            I64Const(_) => stack.push(StackType::I64),
            F32Const(_) => stack.push(StackType::F32),
            F64Const(_) => stack.push(StackType::F64),

            IUnOp(size, _) => self.validate_unop(&mut stack, StackType::int(*size))?,
            IBinOp(size, _) => self.validate_binop(&mut stack, StackType::int(*size))?,
            ITestOp(size) => self.validate_testop(&mut stack, StackType::int(*size))?,
            IRelOp(size, _) => self.validate_relop(&mut stack, StackType::int(*size))?,
            FUnOp(size, _) => self.validate_unop(&mut stack, StackType::float(*size))?,
            FBinOp(size, _) => self.validate_binop(&mut stack, StackType::float(*size))?,
            FRelOp(size, _) => self.validate_relop(&mut stack, StackType::float(*size))?,

            I32WrapI64 => self.validate_cvtop(&mut stack, StackType::I64, StackType::I32)?,
            I64ExtendI32(_) => self.validate_cvtop(&mut stack, StackType::I32, StackType::I64)?,
            IExtend8S(size) | IExtend16S(size) => {
                let ty = StackType::int(*size);
                self.validate_cvtop(&mut stack, ty, ty)?
            }
            I64Extend32S => self.validate_cvtop(&mut stack, StackType::I64, StackType::I64)?,
            ITruncF(int, float, _) | ITruncSatF(int, float, _) => {
                self.validate_cvtop(&mut stack, StackType::float(*float), StackType::int(*int))?
            }
            FConvertI(float, int, _) => {
                self.validate_cvtop(&mut stack, StackType::int(*int), StackType::float(*float))?
            }
            F32DemoteF64 => self.validate_cvtop(&mut stack, StackType::F64, StackType::F32)?,
            F64PromoteF32 => self.validate_cvtop(&mut stack, StackType::F32, StackType::F64)?,
            IReinterpretF(size) => {
                self.validate_cvtop(&mut stack, StackType::float(*size), StackType::int(*size))?
            }
            FReinterpretI(size) => {
                self.validate_cvtop(&mut stack, StackType::int(*size), StackType::float(*size))?
            }

            Drop => stack.drop_top()?,
            Select(Some(types)) => {
                stack.pop(&[StackType::I32], "select")?;
                let annotated = stack_types(types);
                stack.pop(&annotated, "select")?;
                stack.pop(&annotated, "select")?;
                stack.push_types(&annotated);
            }
            Select(None) => return self.validate_select_implicit(stack),

            LocalGet(idx) => {
                let ty = self.require_local(*idx)?;
                stack.push(ty);
            }
            LocalSet(idx) => {
                let ty = self.require_local(*idx)?;
                stack.pop(&[ty], "local.set")?;
            }
            LocalTee(idx) => {
                let ty = self.require_local(*idx)?;
                stack.pop(&[ty], "local.tee")?;
                stack.push(ty);
            }
            GlobalGet(idx) => {
                let ty = self.module.require_global(*idx)?.content;
                stack.push(StackType::from(ty));
            }
            GlobalSet(idx) => {
                // Mutability is the concern of a separate pass.
                let ty = self.module.require_global(*idx)?.content;
                stack.pop(&[StackType::from(ty)], "global.set")?;
            }

            ILoad(size, memarg) => self.validate_load(
                &mut stack,
                memarg.align,
                size.natural_width(),
                StackType::int(*size),
            )?,
            FLoad(size, memarg) => self.validate_load(
                &mut stack,
                memarg.align,
                size.natural_width(),
                StackType::float(*size),
            )?,
            ILoad8(size, _, memarg) => {
                self.validate_load(&mut stack, memarg.align, 1, StackType::int(*size))?
            }
            ILoad16(size, _, memarg) => {
                self.validate_load(&mut stack, memarg.align, 2, StackType::int(*size))?
            }
            I64Load32(_, memarg) => {
                self.validate_load(&mut stack, memarg.align, 4, StackType::I64)?
            }
            IStore(size, memarg) => self.validate_store(
                &mut stack,
                memarg.align,
                size.natural_width(),
                StackType::int(*size),
            )?,
            FStore(size, memarg) => self.validate_store(
                &mut stack,
                memarg.align,
                size.natural_width(),
                StackType::float(*size),
            )?,
            IStore8(size, memarg) => {
                self.validate_store(&mut stack, memarg.align, 1, StackType::int(*size))?
            }
            IStore16(size, memarg) => {
                self.validate_store(&mut stack, memarg.align, 2, StackType::int(*size))?
            }
            I64Store32(memarg) => {
                self.validate_store(&mut stack, memarg.align, 4, StackType::I64)?
            }

            MemorySize => {
                self.module.require_memory(0)?;
                stack.push(StackType::I32);
            }
            MemoryGrow => {
                self.module.require_memory(0)?;
                stack.pop(&[StackType::I32], "memory.grow")?;
                stack.push(StackType::I32);
            }
            MemoryFill => {
                self.module.require_memory(0)?;
                stack.pop(&[StackType::I32; 3], "memory.fill")?;
            }
            MemoryCopy => {
                self.module.require_memory(0)?;
                stack.pop(&[StackType::I32; 3], "memory.copy")?;
            }
            MemoryInit(_) => {
                self.module.require_memory(0)?;
                stack.pop(&[StackType::I32; 3], "memory.init")?;
            }

            Block(block_type, code) => {
                return self.check_block(code, false, block_type.as_ref(), stack)
            }
            Loop(block_type, code) => {
                return self.check_block(code, true, block_type.as_ref(), stack)
            }
            IfElse(block_type, then_code, else_code) => {
                stack.pop(&[StackType::I32], "if")?;
                let then_stack =
                    self.check_block(then_code, false, block_type.as_ref(), stack.clone())?;
                let else_stack = self.check_block(else_code, false, block_type.as_ref(), stack)?;
                if !equal(then_stack.as_slice(), else_stack.as_slice()) {
                    return Err(Error::TypeMismatch(format!(
                        "if arms produce {:?} and {:?}",
                        then_stack.as_slice(),
                        else_stack.as_slice()
                    )));
                }
                return Ok(then_stack);
            }

            Br(depth) => {
                let jump_type = self.jump_type(*depth)?;
                stack.pop(jump_type, "br")?;
                return Ok(TypeStack::polymorphic());
            }
            BrIf(depth) => {
                stack.pop(&[StackType::I32], "br_if")?;
                let jump_type = self.jump_type(*depth)?;
                stack.pop(jump_type, "br_if")?;
                stack.push_types(jump_type);
            }
            BrTable(labels, default) => {
                stack.pop(&[StackType::I32], "br_table")?;
                let default_types = self.jump_type(*default)?;
                stack.pop(default_types, "br_table")?;
                for label in labels {
                    let label_types = self.jump_type(*label)?;
                    if label_types.len() != default_types.len()
                        || !stack.matches_prefix(label_types)
                    {
                        return Err(Error::TypeMismatch(String::from("br_table")));
                    }
                }
                return Ok(TypeStack::polymorphic());
            }
            Return => {
                stack.pop(&stack_types(self.return_type), "return")?;
                return Ok(TypeStack::polymorphic());
            }

            Call(idx) => {
                let ty = self.module.require_function(*idx)?;
                stack.pop_push(ty, "call")?;
            }
            CallIndirect(_, ty) => {
                stack.pop(&[StackType::I32], "call_indirect")?;
                stack.pop_push(ty, "call_indirect")?;
            }
            CallRef(ty) => {
                stack.pop_ref("call_ref")?;
                stack.pop_push(ty, "call_ref")?;
            }
            ReturnCall(idx) => {
                let ty = self.module.require_function(*idx)?;
                self.check_tail_results(&ty.results)?;
                stack.pop(&stack_types(&ty.params), "return_call")?;
                return Ok(TypeStack::polymorphic());
            }
            ReturnCallIndirect(_, ty) => {
                self.check_tail_results(&ty.results)?;
                stack.pop(&[StackType::I32], "return_call_indirect")?;
                stack.pop(&stack_types(&ty.params), "return_call_indirect")?;
                return Ok(TypeStack::polymorphic());
            }
            ReturnCallRef(ty) => {
                self.check_tail_results(&ty.results)?;
                stack.pop_ref("return_call_ref")?;
                stack.pop(&stack_types(&ty.params), "return_call_ref")?;
                return Ok(TypeStack::polymorphic());
            }

            RefNull(heap) => stack.push(StackType::Ref(*heap)),
            RefIsNull => {
                stack.pop_ref("ref.is_null")?;
                stack.push(StackType::I32);
            }
            RefFunc(idx) => {
                if !self.refs.contains(idx) {
                    return Err(Error::UndeclaredFunctionReference);
                }
                stack.push(StackType::Ref(HeapType::Func));
            }
            RefI31 => {
                stack.pop(&[StackType::I32], "ref.i31")?;
                stack.push(StackType::Ref(HeapType::I31));
            }
            I31Get(_) => {
                stack.pop(&[StackType::Ref(HeapType::I31)], "i31.get")?;
                stack.push(StackType::I32);
            }
            ArrayLen => {
                // Placeholder rule: any single value passes for the array.
                stack.pop(&[StackType::Something], "array.len")?;
                stack.push(StackType::I32);
            }

            TableGet(idx) => {
                let table = self.module.require_table(*idx)?;
                stack.pop(&[StackType::I32], "table.get")?;
                stack.push(StackType::Ref(table.element.heap));
            }
            TableSet(idx) => {
                let element = StackType::Ref(self.module.require_table(*idx)?.element.heap);
                stack.pop(&[StackType::I32, element], "table.set")?;
            }
            TableSize(idx) => {
                self.module.require_table(*idx)?;
                stack.push(StackType::I32);
            }
            TableGrow(idx) => {
                let element = StackType::Ref(self.module.require_table(*idx)?.element.heap);
                stack.pop(&[element, StackType::I32], "table.grow")?;
                stack.push(StackType::I32);
            }
            TableFill(idx) => {
                let element = StackType::Ref(self.module.require_table(*idx)?.element.heap);
                stack.pop(&[StackType::I32, element, StackType::I32], "table.fill")?;
            }
            TableCopy(dst, src) => {
                let dst_table = self.module.require_table(*dst)?;
                let src_table = self.module.require_table(*src)?;
                if dst_table.element != src_table.element {
                    return Err(Error::TypeMismatch(String::from("table_copy")));
                }
                stack.pop(&[StackType::I32; 3], "table_copy")?;
            }
            TableInit(table_idx, elem_idx) => {
                let table = self.module.require_table(*table_idx)?;
                let segment = self.module.require_element(*elem_idx)?;
                if !match_ref_type(table.element.heap, segment.element.heap) {
                    return Err(Error::TypeMismatch(String::from("table_init")));
                }
                stack.pop(&[StackType::I32; 3], "table_init")?;
            }

            RefAsNonNull | RefEq | RefTest(_) | RefCast(_) | BrOnNull(_) | BrOnNonNull(_)
            | BrOnCast(..) | BrOnCastFail(..) | AnyConvertExtern | ExternConvertAny => {
                return Err(Error::Internal(
                    "cast and branch-on-cast instructions are not implemented",
                ))
            }
            ArrayNew(_) | ArrayNewDefault(_) | ArrayGet(_) | ArraySet(_) | StructNew(_)
            | StructNewDefault(_) | StructGet(..) | StructSet(..) => {
                return Err(Error::Internal(
                    "struct and array instructions are not implemented",
                ))
            }
        }
        Ok(stack)
    }

    /// `select` without a type annotation: the operands must be numeric or
    /// polymorphic, never a concrete reference.
    fn validate_select_implicit(&self, mut stack: TypeStack) -> Result<TypeStack, Error> {
        stack.pop(&[StackType::I32], "select")?;
        let first = match stack.0.last().copied() {
            Some(ty) => ty,
            None => return Err(Error::TypeMismatch(String::from("select"))),
        };
        match first {
            StackType::Any => Ok(TypeStack::from_types(&[
                StackType::Any,
                StackType::Something,
            ])),
            StackType::Ref(_) => Err(Error::TypeMismatch(String::from("select implicit"))),
            first => {
                let second = match stack
                    .0
                    .len()
                    .checked_sub(2)
                    .and_then(|idx| stack.0.get(idx))
                    .copied()
                {
                    Some(ty) => ty,
                    None => return Err(Error::TypeMismatch(String::from("select"))),
                };
                if second == StackType::Any {
                    Ok(TypeStack::from_types(&[StackType::Any, first]))
                } else if match_types(first, second) {
                    stack.0.pop();
                    stack.0.pop();
                    stack.push(first);
                    Ok(stack)
                } else {
                    Err(Error::TypeMismatch(String::from("select")))
                }
            }
        }
    }

    /// A tail call must produce exactly what the enclosing function returns.
    fn check_tail_results(&self, results: &[ValType]) -> Result<(), Error> {
        if !equal(&stack_types(results), &stack_types(self.return_type)) {
            return Err(Error::TypeMismatch(String::from("tail call result type")));
        }
        Ok(())
    }

    fn check_mem(&self, align: u32, width: u32) -> Result<(), Error> {
        self.module.require_memory(0)?;
        if align >= width {
            return Err(Error::AlignmentTooLarge);
        }
        Ok(())
    }

    fn require_local(&self, idx: u32) -> Result<StackType, Error> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or(Error::Internal("local index out of bounds"))
    }

    fn jump_type(&self, depth: u32) -> Result<&[StackType], Error> {
        let depth = depth as usize;
        if depth < self.blocks.len() {
            Ok(&self.blocks[self.blocks.len() - 1 - depth])
        } else {
            Err(Error::UnknownLabel)
        }
    }

    fn validate_unop(&self, stack: &mut TypeStack, ty: StackType) -> Result<(), Error> {
        stack.pop(&[ty], "unary operator")?;
        stack.push(ty);
        Ok(())
    }

    fn validate_binop(&self, stack: &mut TypeStack, ty: StackType) -> Result<(), Error> {
        stack.pop(&[ty, ty], "binary operator")?;
        stack.push(ty);
        Ok(())
    }

    fn validate_testop(&self, stack: &mut TypeStack, ty: StackType) -> Result<(), Error> {
        stack.pop(&[ty], "test operator")?;
        stack.push(StackType::I32);
        Ok(())
    }

    fn validate_relop(&self, stack: &mut TypeStack, ty: StackType) -> Result<(), Error> {
        stack.pop(&[ty, ty], "comparison operator")?;
        stack.push(StackType::I32);
        Ok(())
    }

    fn validate_cvtop(
        &self,
        stack: &mut TypeStack,
        from: StackType,
        to: StackType,
    ) -> Result<(), Error> {
        stack.pop(&[from], "conversion")?;
        stack.push(to);
        Ok(())
    }

    fn validate_load(
        &self,
        stack: &mut TypeStack,
        align: u32,
        width: u32,
        ty: StackType,
    ) -> Result<(), Error> {
        self.check_mem(align, width)?;
        stack.pop(&[StackType::I32], "load")?;
        stack.push(ty);
        Ok(())
    }

    fn validate_store(
        &self,
        stack: &mut TypeStack,
        align: u32,
        width: u32,
        ty: StackType,
    ) -> Result<(), Error> {
        self.check_mem(align, width)?;
        stack.pop(&[StackType::I32, ty], "store")?;
        Ok(())
    }
}
