//! The backend IR the lowerer emits.
//!
//! This is the boundary contract with the JIT backend: a small SSA IR with
//! basic blocks, typed instructions, atomic orderings, intrinsic calls
//! addressed by string name, and inline assembly. The builder's method
//! surface mirrors the IR builders the backend exposes, so the lowering
//! code reads the way backend translators do.

/// A scalar IR type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// A 1-bit condition value.
    I1,
    /// An 8-bit integer.
    I8,
    /// A 16-bit integer.
    I16,
    /// A 32-bit integer.
    I32,
    /// A 64-bit integer.
    I64,
    /// A 32-bit float.
    F32,
    /// A 64-bit float.
    F64,
}

/// An IR type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    /// A scalar value.
    Scalar(ScalarType),
    /// A vector of `lanes` elements of scalar type `elem`.
    Vector {
        /// The lane type.
        elem: ScalarType,
        /// The number of lanes.
        lanes: u8,
    },
    /// An untyped pointer; the pointee type travels on the cast that formed
    /// the pointer.
    Ptr,
    /// An aggregate of several values, as returned by cmpxchg and the
    /// multi-register target intrinsics.
    Tuple(Vec<IrType>),
}

impl IrType {
    /// The 1-bit condition type.
    pub const I1: Self = Self::Scalar(ScalarType::I1);
    /// The 8-bit integer type.
    pub const I8: Self = Self::Scalar(ScalarType::I8);
    /// The 16-bit integer type.
    pub const I16: Self = Self::Scalar(ScalarType::I16);
    /// The 32-bit integer type.
    pub const I32: Self = Self::Scalar(ScalarType::I32);
    /// The 64-bit integer type.
    pub const I64: Self = Self::Scalar(ScalarType::I64);
    /// The 32-bit float type.
    pub const F32: Self = Self::Scalar(ScalarType::F32);
    /// The 64-bit float type.
    pub const F64: Self = Self::Scalar(ScalarType::F64);

    /// A vector type.
    pub const fn vector(elem: ScalarType, lanes: u8) -> Self {
        Self::Vector { elem, lanes }
    }
}

/// A reference to an SSA value (the instruction that produces it).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueRef(pub u32);

/// A reference to a basic block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BasicBlockRef(pub u32);

/// Integer comparison predicates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntPredicate {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned less-than.
    Ult,
}

/// Atomic memory orderings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AtomicOrdering {
    /// Sequentially consistent: the only ordering Wasm atomics use.
    SequentiallyConsistent,
}

/// Atomic read-modify-write operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RmwOp {
    /// Exchange.
    Xchg,
    /// Add.
    Add,
    /// Subtract.
    Sub,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
}

/// One IR instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// An integer constant.
    ConstInt {
        /// The constant's type.
        ty: ScalarType,
        /// The constant's bits, zero-extended.
        bits: u64,
    },
    /// Zero-extend to a wider type.
    ZExt {
        /// The value to extend.
        value: ValueRef,
        /// The destination type.
        to: IrType,
    },
    /// Sign-extend to a wider type.
    SExt {
        /// The value to extend.
        value: ValueRef,
        /// The destination type.
        to: IrType,
    },
    /// Truncate to a narrower type.
    Trunc {
        /// The value to truncate.
        value: ValueRef,
        /// The destination type.
        to: IrType,
    },
    /// Reinterpret bits as another type of the same width.
    BitCast {
        /// The value to reinterpret.
        value: ValueRef,
        /// The destination type.
        to: IrType,
    },
    /// Integer addition.
    IntAdd {
        /// Left operand.
        lhs: ValueRef,
        /// Right operand.
        rhs: ValueRef,
    },
    /// Integer subtraction.
    IntSub {
        /// Left operand.
        lhs: ValueRef,
        /// Right operand.
        rhs: ValueRef,
    },
    /// Bitwise and.
    IntAnd {
        /// Left operand.
        lhs: ValueRef,
        /// Right operand.
        rhs: ValueRef,
    },
    /// Integer comparison producing an `i1`.
    ICmp {
        /// The predicate.
        predicate: IntPredicate,
        /// Left operand.
        lhs: ValueRef,
        /// Right operand.
        rhs: ValueRef,
    },
    /// A memory load.
    Load {
        /// The pointer to load through.
        pointer: ValueRef,
        /// The loaded type.
        ty: IrType,
        /// The access alignment in bytes.
        alignment: u32,
        /// Whether the access may not be elided or reordered.
        volatile: bool,
        /// The atomic ordering, if the load is atomic.
        ordering: Option<AtomicOrdering>,
    },
    /// A memory store.
    Store {
        /// The pointer to store through.
        pointer: ValueRef,
        /// The stored value.
        value: ValueRef,
        /// The access alignment in bytes.
        alignment: u32,
        /// Whether the access may not be elided or reordered.
        volatile: bool,
        /// The atomic ordering, if the store is atomic.
        ordering: Option<AtomicOrdering>,
    },
    /// Byte-granular pointer arithmetic that stays in bounds of the object
    /// the base points into.
    InBoundsGep {
        /// The base pointer.
        base: ValueRef,
        /// The byte offset.
        offset: ValueRef,
    },
    /// Cast a pointer to point at a different element type.
    PointerCast {
        /// The pointer to cast.
        value: ValueRef,
        /// The new pointee type.
        pointee: IrType,
    },
    /// A mutable slot the translator declared (e.g. a memory base-pointer
    /// variable); loaded on each use.
    Variable {
        /// The slot's pointee type.
        pointee: IrType,
        /// A debug name.
        name: String,
    },
    /// A phi node; incomings are added as predecessors are emitted.
    Phi {
        /// The phi's type.
        ty: IrType,
        /// `(value, predecessor)` incomings.
        incoming: Vec<(ValueRef, BasicBlockRef)>,
    },
    /// An unconditional branch.
    Branch {
        /// The destination block.
        dest: BasicBlockRef,
    },
    /// A conditional branch.
    CondBranch {
        /// The `i1` condition.
        condition: ValueRef,
        /// Destination when the condition is true.
        true_dest: BasicBlockRef,
        /// Destination when the condition is false.
        false_dest: BasicBlockRef,
    },
    /// Unreachable code marker terminating a trapping block.
    Unreachable,
    /// A memory fence.
    Fence {
        /// The fence's ordering.
        ordering: AtomicOrdering,
    },
    /// An atomic read-modify-write, producing the previous value.
    AtomicRmw {
        /// The operation.
        op: RmwOp,
        /// The pointer operated on.
        pointer: ValueRef,
        /// The operand.
        value: ValueRef,
        /// The atomic ordering.
        ordering: AtomicOrdering,
        /// Whether the access may not be elided or reordered.
        volatile: bool,
        /// The access alignment in bytes.
        alignment: u32,
    },
    /// An atomic compare-exchange, producing `(previous, succeeded)`.
    AtomicCmpXchg {
        /// The pointer operated on.
        pointer: ValueRef,
        /// The expected value.
        expected: ValueRef,
        /// The replacement value.
        replacement: ValueRef,
        /// Ordering on success.
        success_ordering: AtomicOrdering,
        /// Ordering on failure.
        failure_ordering: AtomicOrdering,
        /// Whether the access may not be elided or reordered.
        volatile: bool,
        /// The access alignment in bytes.
        alignment: u32,
    },
    /// Extract one member of an aggregate value.
    ExtractValue {
        /// The aggregate.
        aggregate: ValueRef,
        /// The member index.
        index: u32,
    },
    /// Extract one lane of a vector.
    ExtractElement {
        /// The vector.
        vector: ValueRef,
        /// The lane index.
        lane: u32,
    },
    /// Insert a value into one lane of a vector.
    InsertElement {
        /// The vector.
        vector: ValueRef,
        /// The inserted element.
        element: ValueRef,
        /// The lane index.
        lane: u32,
    },
    /// Broadcast a scalar to every lane of a vector.
    Splat {
        /// The scalar to broadcast.
        value: ValueRef,
        /// The resulting vector type.
        ty: IrType,
    },
    /// An undefined value of the given type.
    Undef {
        /// The value's type.
        ty: IrType,
    },
    /// A call to a runtime intrinsic, addressed by name.
    RuntimeIntrinsic {
        /// The intrinsic's name.
        name: &'static str,
        /// The call arguments.
        args: Vec<ValueRef>,
        /// The result type, if the intrinsic returns a value.
        result: Option<IrType>,
    },
    /// A call to a target-specific intrinsic, addressed by name.
    TargetIntrinsic {
        /// The intrinsic's name.
        name: String,
        /// The call arguments.
        args: Vec<ValueRef>,
        /// The result type, if the intrinsic returns a value.
        result: Option<IrType>,
    },
    /// An inline assembly block.
    InlineAsm {
        /// The assembly text.
        assembly: &'static str,
        /// The operand constraints and clobbers.
        constraints: &'static str,
        /// The call arguments.
        args: Vec<ValueRef>,
        /// Whether the block has side effects beyond its outputs.
        has_side_effects: bool,
    },
}

struct BasicBlock {
    name: String,
    instructions: Vec<ValueRef>,
}

/// An IR builder for one function, in the style of the backend's builders:
/// instructions are appended to the block the builder is positioned at.
pub struct FunctionBuilder {
    instructions: Vec<Instruction>,
    blocks: Vec<BasicBlock>,
    current_block: BasicBlockRef,
}

impl FunctionBuilder {
    /// Create a builder positioned at a fresh entry block.
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            blocks: vec![BasicBlock {
                name: "entry".to_string(),
                instructions: Vec::new(),
            }],
            current_block: BasicBlockRef(0),
        }
    }

    /// The entry block.
    pub fn entry_block(&self) -> BasicBlockRef {
        BasicBlockRef(0)
    }

    /// The block the builder is positioned at.
    pub fn current_block(&self) -> BasicBlockRef {
        self.current_block
    }

    /// Append a new basic block.
    pub fn append_basic_block(&mut self, name: &str) -> BasicBlockRef {
        let block = BasicBlockRef(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            name: name.to_string(),
            instructions: Vec::new(),
        });
        block
    }

    /// Position the builder at the end of `block`.
    pub fn position_at_end(&mut self, block: BasicBlockRef) {
        self.current_block = block;
    }

    fn push(&mut self, instruction: Instruction) -> ValueRef {
        let value = ValueRef(self.instructions.len() as u32);
        self.instructions.push(instruction);
        self.blocks[self.current_block.0 as usize]
            .instructions
            .push(value);
        value
    }

    /// The instruction producing `value`.
    pub fn instruction(&self, value: ValueRef) -> &Instruction {
        &self.instructions[value.0 as usize]
    }

    /// The name of `block`.
    pub fn block_name(&self, block: BasicBlockRef) -> &str {
        &self.blocks[block.0 as usize].name
    }

    /// The number of basic blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate `(value, instruction)` pairs of one block, in emission order.
    pub fn block_instructions(
        &self,
        block: BasicBlockRef,
    ) -> impl Iterator<Item = (ValueRef, &Instruction)> {
        self.blocks[block.0 as usize]
            .instructions
            .iter()
            .map(|value| (*value, &self.instructions[value.0 as usize]))
    }

    /// Iterate every `(value, instruction)` pair in emission order.
    pub fn all_instructions(&self) -> impl Iterator<Item = (ValueRef, &Instruction)> {
        self.instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (ValueRef(index as u32), instruction))
    }

    /// An integer constant.
    pub fn const_int(&mut self, ty: ScalarType, bits: u64) -> ValueRef {
        self.push(Instruction::ConstInt { ty, bits })
    }

    /// Declare a mutable slot in the entry block.
    pub fn build_variable(&mut self, name: &str, pointee: IrType) -> ValueRef {
        let saved = self.current_block;
        self.current_block = self.entry_block();
        let value = self.push(Instruction::Variable {
            pointee,
            name: name.to_string(),
        });
        self.current_block = saved;
        value
    }

    /// Zero-extend `value` to `to`.
    pub fn build_int_z_extend(&mut self, value: ValueRef, to: IrType) -> ValueRef {
        self.push(Instruction::ZExt { value, to })
    }

    /// Sign-extend `value` to `to`.
    pub fn build_int_s_extend(&mut self, value: ValueRef, to: IrType) -> ValueRef {
        self.push(Instruction::SExt { value, to })
    }

    /// Truncate `value` to `to`.
    pub fn build_int_truncate(&mut self, value: ValueRef, to: IrType) -> ValueRef {
        self.push(Instruction::Trunc { value, to })
    }

    /// Reinterpret `value` as `to`.
    pub fn build_bit_cast(&mut self, value: ValueRef, to: IrType) -> ValueRef {
        self.push(Instruction::BitCast { value, to })
    }

    /// Integer addition.
    pub fn build_int_add(&mut self, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.push(Instruction::IntAdd { lhs, rhs })
    }

    /// Integer subtraction.
    pub fn build_int_sub(&mut self, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.push(Instruction::IntSub { lhs, rhs })
    }

    /// Bitwise and.
    pub fn build_int_and(&mut self, lhs: ValueRef, rhs: ValueRef) -> ValueRef {
        self.push(Instruction::IntAnd { lhs, rhs })
    }

    /// Integer comparison.
    pub fn build_int_compare(
        &mut self,
        predicate: IntPredicate,
        lhs: ValueRef,
        rhs: ValueRef,
    ) -> ValueRef {
        self.push(Instruction::ICmp {
            predicate,
            lhs,
            rhs,
        })
    }

    /// A load of `ty` through `pointer`, with alignment 1 and no atomic
    /// ordering; adjust with the setters.
    pub fn build_load(&mut self, ty: IrType, pointer: ValueRef) -> ValueRef {
        self.push(Instruction::Load {
            pointer,
            ty,
            alignment: 1,
            volatile: false,
            ordering: None,
        })
    }

    /// A store of `value` through `pointer`, with alignment 1 and no atomic
    /// ordering; adjust with the setters.
    pub fn build_store(&mut self, value: ValueRef, pointer: ValueRef) -> ValueRef {
        self.push(Instruction::Store {
            pointer,
            value,
            alignment: 1,
            volatile: false,
            ordering: None,
        })
    }

    /// Set the alignment of a memory access.
    pub fn set_alignment(&mut self, value: ValueRef, new_alignment: u32) {
        match &mut self.instructions[value.0 as usize] {
            Instruction::Load { alignment, .. }
            | Instruction::Store { alignment, .. }
            | Instruction::AtomicRmw { alignment, .. }
            | Instruction::AtomicCmpXchg { alignment, .. } => *alignment = new_alignment,
            other => panic!("cannot set the alignment of {other:?}"),
        }
    }

    /// Mark a memory access volatile.
    pub fn set_volatile(&mut self, value: ValueRef, new_volatile: bool) {
        match &mut self.instructions[value.0 as usize] {
            Instruction::Load { volatile, .. }
            | Instruction::Store { volatile, .. }
            | Instruction::AtomicRmw { volatile, .. }
            | Instruction::AtomicCmpXchg { volatile, .. } => *volatile = new_volatile,
            other => panic!("cannot set the volatility of {other:?}"),
        }
    }

    /// Make a load or store atomic with the given ordering.
    pub fn set_atomic(&mut self, value: ValueRef, new_ordering: AtomicOrdering) {
        match &mut self.instructions[value.0 as usize] {
            Instruction::Load { ordering, .. } | Instruction::Store { ordering, .. } => {
                *ordering = Some(new_ordering)
            }
            other => panic!("cannot set the atomic ordering of {other:?}"),
        }
    }

    /// In-bounds pointer arithmetic by a byte offset.
    pub fn build_in_bounds_gep(&mut self, base: ValueRef, offset: ValueRef) -> ValueRef {
        self.push(Instruction::InBoundsGep { base, offset })
    }

    /// Cast a pointer to a different pointee type.
    pub fn build_pointer_cast(&mut self, value: ValueRef, pointee: IrType) -> ValueRef {
        self.push(Instruction::PointerCast { value, pointee })
    }

    /// A phi node.
    pub fn build_phi(&mut self, ty: IrType) -> ValueRef {
        self.push(Instruction::Phi {
            ty,
            incoming: Vec::new(),
        })
    }

    /// Add an incoming `(value, predecessor)` edge to a phi.
    pub fn add_incoming(&mut self, phi: ValueRef, value: ValueRef, block: BasicBlockRef) {
        match &mut self.instructions[phi.0 as usize] {
            Instruction::Phi { incoming, .. } => incoming.push((value, block)),
            other => panic!("cannot add an incoming edge to {other:?}"),
        }
    }

    /// An unconditional branch.
    pub fn build_branch(&mut self, dest: BasicBlockRef) -> ValueRef {
        self.push(Instruction::Branch { dest })
    }

    /// A conditional branch.
    pub fn build_conditional_branch(
        &mut self,
        condition: ValueRef,
        true_dest: BasicBlockRef,
        false_dest: BasicBlockRef,
    ) -> ValueRef {
        self.push(Instruction::CondBranch {
            condition,
            true_dest,
            false_dest,
        })
    }

    /// An unreachable terminator.
    pub fn build_unreachable(&mut self) -> ValueRef {
        self.push(Instruction::Unreachable)
    }

    /// A memory fence.
    pub fn build_fence(&mut self, ordering: AtomicOrdering) -> ValueRef {
        self.push(Instruction::Fence { ordering })
    }

    /// An atomic read-modify-write with alignment 1; adjust with the
    /// setters.
    pub fn build_atomic_rmw(
        &mut self,
        op: RmwOp,
        pointer: ValueRef,
        value: ValueRef,
        ordering: AtomicOrdering,
    ) -> ValueRef {
        self.push(Instruction::AtomicRmw {
            op,
            pointer,
            value,
            ordering,
            volatile: false,
            alignment: 1,
        })
    }

    /// An atomic compare-exchange with alignment 1; adjust with the
    /// setters.
    pub fn build_atomic_cmpxchg(
        &mut self,
        pointer: ValueRef,
        expected: ValueRef,
        replacement: ValueRef,
        success_ordering: AtomicOrdering,
        failure_ordering: AtomicOrdering,
    ) -> ValueRef {
        self.push(Instruction::AtomicCmpXchg {
            pointer,
            expected,
            replacement,
            success_ordering,
            failure_ordering,
            volatile: false,
            alignment: 1,
        })
    }

    /// Extract an aggregate member.
    pub fn build_extract_value(&mut self, aggregate: ValueRef, index: u32) -> ValueRef {
        self.push(Instruction::ExtractValue { aggregate, index })
    }

    /// Extract a vector lane.
    pub fn build_extract_element(&mut self, vector: ValueRef, lane: u32) -> ValueRef {
        self.push(Instruction::ExtractElement { vector, lane })
    }

    /// Insert into a vector lane.
    pub fn build_insert_element(
        &mut self,
        vector: ValueRef,
        element: ValueRef,
        lane: u32,
    ) -> ValueRef {
        self.push(Instruction::InsertElement {
            vector,
            element,
            lane,
        })
    }

    /// Broadcast a scalar to a vector.
    pub fn build_splat(&mut self, value: ValueRef, ty: IrType) -> ValueRef {
        self.push(Instruction::Splat { value, ty })
    }

    /// An undefined value.
    pub fn build_undef(&mut self, ty: IrType) -> ValueRef {
        self.push(Instruction::Undef { ty })
    }

    /// A runtime intrinsic call.
    pub fn build_runtime_intrinsic(
        &mut self,
        name: &'static str,
        args: Vec<ValueRef>,
        result: Option<IrType>,
    ) -> ValueRef {
        self.push(Instruction::RuntimeIntrinsic { name, args, result })
    }

    /// A target intrinsic call.
    pub fn build_target_intrinsic(
        &mut self,
        name: String,
        args: Vec<ValueRef>,
        result: Option<IrType>,
    ) -> ValueRef {
        self.push(Instruction::TargetIntrinsic { name, args, result })
    }

    /// An inline assembly block.
    pub fn build_inline_asm(
        &mut self,
        assembly: &'static str,
        constraints: &'static str,
        args: Vec<ValueRef>,
        has_side_effects: bool,
    ) -> ValueRef {
        self.push(Instruction::InlineAsm {
            assembly,
            constraints,
            args,
            has_side_effects,
        })
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_land_in_the_positioned_block() {
        let mut builder = FunctionBuilder::new();
        let a = builder.const_int(ScalarType::I32, 1);
        let other = builder.append_basic_block("other");
        builder.position_at_end(other);
        let b = builder.const_int(ScalarType::I32, 2);

        let entry: Vec<ValueRef> = builder
            .block_instructions(builder.entry_block())
            .map(|(value, _)| value)
            .collect();
        assert_eq!(entry, vec![a]);
        let other: Vec<ValueRef> = builder
            .block_instructions(other)
            .map(|(value, _)| value)
            .collect();
        assert_eq!(other, vec![b]);
    }

    #[test]
    fn setters_adjust_memory_accesses() {
        let mut builder = FunctionBuilder::new();
        let pointer = builder.build_variable("p", IrType::I32);
        let load = builder.build_load(IrType::I32, pointer);
        builder.set_alignment(load, 4);
        builder.set_volatile(load, true);
        builder.set_atomic(load, AtomicOrdering::SequentiallyConsistent);
        assert_eq!(
            builder.instruction(load),
            &Instruction::Load {
                pointer,
                ty: IrType::I32,
                alignment: 4,
                volatile: true,
                ordering: Some(AtomicOrdering::SequentiallyConsistent),
            }
        );
    }

    #[test]
    fn variables_are_declared_in_the_entry_block() {
        let mut builder = FunctionBuilder::new();
        let other = builder.append_basic_block("other");
        builder.position_at_end(other);
        let variable = builder.build_variable("v", IrType::Ptr);
        assert!(builder
            .block_instructions(builder.entry_block())
            .any(|(value, _)| value == variable));
    }
}
