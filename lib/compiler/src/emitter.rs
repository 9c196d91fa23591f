//! The memory-operator lowerer.
//!
//! Address formation relies on the sandbox invariant: every memory's
//! virtual reservation is at least `2^32 + 2^32` bytes with unmapped guard
//! pages beyond the committed size, so a zero-extended 32-bit address plus
//! zero-extended 32-bit offset always lands in mapped or guard-trapping
//! territory and no explicit bounds check is emitted.

use crate::ir::{
    AtomicOrdering, BasicBlockRef, FunctionBuilder, IntPredicate, IrType, RmwOp, ScalarType,
    ValueRef,
};
use crate::memory_ops::{
    AtomicAccessType, LoadConversion, LoadKind, MemArg, MemoryOperator, StoreConversion,
    StoreKind, VectorShape,
};
use smallvec::SmallVec;
use target_lexicon::{Architecture, Triple};
use thiserror::Error;

/// Errors the lowerer can report.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The translator handed the lowerer fewer operands than the operator
    /// consumes.
    #[error("the operand stack is empty")]
    OperandStackUnderflow,

    /// The operator names a memory the module does not declare.
    #[error("invalid memory index {0}")]
    InvalidMemoryIndex(u32),

    /// The interleave factor is outside {2, 3, 4}.
    #[error("invalid interleave factor {0}")]
    InvalidInterleaveFactor(u8),
}

/// Lowers memory operators into a [`FunctionBuilder`], using the operand
/// stack and per-memory base-pointer variables the enclosing function
/// translator owns.
pub struct FunctionEmitter {
    builder: FunctionBuilder,
    target: Triple,
    instance_id: u64,
    memory_ids: Vec<u64>,
    memory_base_pointer_variables: Vec<ValueRef>,
    stack: Vec<ValueRef>,
}

impl FunctionEmitter {
    /// Create an emitter for a function of a module with the given
    /// compartment-local memory ids, targeting `target`.
    pub fn new(target: Triple, instance_id: u64, memory_ids: &[u64]) -> Self {
        let mut builder = FunctionBuilder::new();
        let memory_base_pointer_variables = memory_ids
            .iter()
            .enumerate()
            .map(|(index, _)| builder.build_variable(&format!("memoryBasePtr{index}"), IrType::Ptr))
            .collect();
        Self {
            builder,
            target,
            instance_id,
            memory_ids: memory_ids.to_vec(),
            memory_base_pointer_variables,
            stack: Vec::new(),
        }
    }

    /// The IR built so far.
    pub fn builder(&self) -> &FunctionBuilder {
        &self.builder
    }

    /// The builder, for the enclosing translator to emit non-memory
    /// operators through.
    pub fn builder_mut(&mut self) -> &mut FunctionBuilder {
        &mut self.builder
    }

    /// Consume the emitter, returning the IR.
    pub fn into_builder(self) -> FunctionBuilder {
        self.builder
    }

    /// Push an operand, as the enclosing translator does between operators.
    pub fn push(&mut self, value: ValueRef) {
        self.stack.push(value);
    }

    /// Pop an operand.
    pub fn pop(&mut self) -> Result<ValueRef, CompileError> {
        self.stack.pop().ok_or(CompileError::OperandStackUnderflow)
    }

    /// The current operand-stack depth.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn is_x86(&self) -> bool {
        matches!(
            self.target.architecture,
            Architecture::X86_64 | Architecture::X86_32(_)
        )
    }

    fn is_aarch64(&self) -> bool {
        matches!(self.target.architecture, Architecture::Aarch64(_))
    }

    fn memory_id_literal(&mut self, memory_index: u32) -> Result<ValueRef, CompileError> {
        let id = *self
            .memory_ids
            .get(memory_index as usize)
            .ok_or(CompileError::InvalidMemoryIndex(memory_index))?;
        Ok(self.builder.const_int(ScalarType::I64, id))
    }

    // Bounds a sandboxed memory address + offset, returning an offset
    // relative to the memory base address that is guaranteed to be within
    // the virtual address space allocated for the linear memory object.
    fn get_offset_and_bounded_address(&mut self, address: ValueRef, offset: u32) -> ValueRef {
        // Zero-extend the 32-bit address to 64 bits. This is crucial for
        // security: pointer arithmetic would otherwise sign-extend it,
        // interpreting it as a signed offset and allowing access to memory
        // outside the sandboxed memory range.
        let mut address = self.builder.build_int_z_extend(address, IrType::I64);

        if offset != 0 {
            let offset_literal = self.builder.const_int(ScalarType::I32, offset as u64);
            let offset64 = self.builder.build_int_z_extend(offset_literal, IrType::I64);
            address = self.builder.build_int_add(address, offset64);
        }

        // The memory has enough virtual address space reserved to ensure
        // that any 32-bit byte index + 32-bit offset falls within it, so no
        // explicit bounds check is necessary.
        address
    }

    fn coerce_address_to_pointer(
        &mut self,
        bounded_address: ValueRef,
        pointee: IrType,
        memory_index: u32,
    ) -> Result<ValueRef, CompileError> {
        let variable = *self
            .memory_base_pointer_variables
            .get(memory_index as usize)
            .ok_or(CompileError::InvalidMemoryIndex(memory_index))?;
        let base_pointer = self.builder.build_load(IrType::Ptr, variable);
        let byte_pointer = self.builder.build_in_bounds_gep(base_pointer, bounded_address);
        Ok(self.builder.build_pointer_cast(byte_pointer, pointee))
    }

    fn emit_conditional_trap_intrinsic(
        &mut self,
        condition: ValueRef,
        name: &'static str,
        args: Vec<ValueRef>,
    ) {
        let trap_block = self.builder.append_basic_block(name);
        let continue_block = self.builder.append_basic_block("noTrap");
        self.builder
            .build_conditional_branch(condition, trap_block, continue_block);

        self.builder.position_at_end(trap_block);
        self.builder.build_runtime_intrinsic(name, args, None);
        self.builder.build_unreachable();

        self.builder.position_at_end(continue_block);
    }

    fn trap_if_misaligned_atomic(&mut self, bounded_address: ValueRef, alignment_log2: u8) {
        if alignment_log2 > 0 {
            let mask = self
                .builder
                .const_int(ScalarType::I64, (1u64 << alignment_log2) - 1);
            let low_bits = self.builder.build_int_and(bounded_address, mask);
            let zero = self.builder.const_int(ScalarType::I64, 0);
            let misaligned = self
                .builder
                .build_int_compare(IntPredicate::Ne, low_bits, zero);
            self.emit_conditional_trap_intrinsic(
                misaligned,
                "misalignedAtomicTrap",
                vec![bounded_address],
            );
        }
    }

    // Emits a [begin, end) loop with the index in a phi; `reverse` walks
    // end-1 down to begin.
    fn emit_loop(
        &mut self,
        outgoing_block: BasicBlockRef,
        begin_index: ValueRef,
        end_index: ValueRef,
        reverse: bool,
        mut emit_body: impl FnMut(&mut Self, ValueRef),
    ) {
        let incoming_block = self.builder.current_block();
        let head_block = self.builder.append_basic_block("loopHead");
        self.builder.build_branch(head_block);
        self.builder.position_at_end(head_block);

        let index_phi = self.builder.build_phi(IrType::I64);

        let body_block = self.builder.append_basic_block("loopBody");
        if reverse {
            self.builder.add_incoming(index_phi, end_index, incoming_block);
            let not_done = self
                .builder
                .build_int_compare(IntPredicate::Ne, index_phi, begin_index);
            self.builder
                .build_conditional_branch(not_done, body_block, outgoing_block);
        } else {
            self.builder
                .add_incoming(index_phi, begin_index, incoming_block);
            let not_done = self
                .builder
                .build_int_compare(IntPredicate::Ult, index_phi, end_index);
            self.builder
                .build_conditional_branch(not_done, body_block, outgoing_block);
        }

        self.builder.position_at_end(body_block);

        // Reverse loops step the index before the body so it walks
        // end-1, end-2, .., begin.
        let one = self.builder.const_int(ScalarType::I64, 1);
        let index = if reverse {
            self.builder.build_int_sub(index_phi, one)
        } else {
            index_phi
        };

        emit_body(self, index);

        let next_index = if reverse {
            index
        } else {
            self.builder.build_int_add(index_phi, one)
        };
        let latch_block = self.builder.current_block();
        self.builder.add_incoming(index_phi, next_index, latch_block);
        self.builder.build_branch(head_block);
    }

    fn emit_memory_copy_loop(
        &mut self,
        outgoing_block: BasicBlockRef,
        source_pointer: ValueRef,
        dest_pointer: ValueRef,
        num_bytes: ValueRef,
        reverse: bool,
    ) {
        let zero = self.builder.const_int(ScalarType::I64, 0);
        self.emit_loop(
            outgoing_block,
            zero,
            num_bytes,
            reverse,
            |emitter, index| {
                let source = emitter.builder.build_in_bounds_gep(source_pointer, index);
                let load = emitter.builder.build_load(IrType::I8, source);
                emitter.builder.set_alignment(load, 1);
                emitter.builder.set_volatile(load, true);

                let dest = emitter.builder.build_in_bounds_gep(dest_pointer, index);
                let store = emitter.builder.build_store(load, dest);
                emitter.builder.set_alignment(store, 1);
                emitter.builder.set_volatile(store, true);
            },
        );
    }

    fn emit_load(&mut self, kind: LoadKind, memarg: &MemArg) -> Result<(), CompileError> {
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, kind.memory_type(), memarg.memory_index)?;
        let load = self.builder.build_load(kind.memory_type(), pointer);
        // Don't trust the alignment hint provided by the WebAssembly code,
        // since the load can't trap if it's wrong.
        self.builder.set_alignment(load, 1);
        self.builder.set_volatile(load, true);

        let result = match kind.conversion() {
            LoadConversion::Identity => load,
            LoadConversion::SignExtend => self.builder.build_int_s_extend(load, kind.result_type()),
            LoadConversion::ZeroExtend => self.builder.build_int_z_extend(load, kind.result_type()),
            LoadConversion::Splat => self.builder.build_splat(load, kind.result_type()),
        };
        self.push(result);
        Ok(())
    }

    fn emit_store(&mut self, kind: StoreKind, memarg: &MemArg) -> Result<(), CompileError> {
        let value = self.pop()?;
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, kind.memory_type(), memarg.memory_index)?;
        let memory_value = match kind.conversion() {
            StoreConversion::Identity => value,
            StoreConversion::Truncate => self.builder.build_int_truncate(value, kind.memory_type()),
        };
        let store = self.builder.build_store(memory_value, pointer);
        self.builder.set_volatile(store, true);
        // Don't trust the alignment hint provided by the WebAssembly code,
        // since the store can't trap if it's wrong.
        self.builder.set_alignment(store, 1);
        Ok(())
    }

    fn emit_load_interleaved(
        &mut self,
        shape: VectorShape,
        num_vectors: u8,
        memarg: &MemArg,
    ) -> Result<(), CompileError> {
        if !(2..=4).contains(&num_vectors) {
            return Err(CompileError::InvalidInterleaveFactor(num_vectors));
        }
        let vector_type = shape.ir_type();
        let num_lanes = shape.num_lanes() as u32;

        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, vector_type.clone(), memarg.memory_index)?;

        if self.is_aarch64() {
            let result_type =
                IrType::Tuple(vec![vector_type.clone(); num_vectors as usize]);
            let results = self.builder.build_target_intrinsic(
                format!("aarch64.neon.ld{num_vectors}"),
                vec![pointer],
                Some(result_type),
            );
            for vector_index in 0..num_vectors as u32 {
                let vector = self.builder.build_extract_value(results, vector_index);
                self.push(vector);
            }
        } else {
            let mut loads: SmallVec<[ValueRef; 4]> = SmallVec::new();
            for vector_index in 0..num_vectors as u32 {
                let offset = self
                    .builder
                    .const_int(ScalarType::I64, (vector_index as u64) * 16);
                let element_pointer = self.builder.build_in_bounds_gep(pointer, offset);
                let load = self.builder.build_load(vector_type.clone(), element_pointer);
                // Don't trust the alignment hint provided by the WebAssembly
                // code, since the load can't trap if it's wrong.
                self.builder.set_alignment(load, 1);
                self.builder.set_volatile(load, true);
                loads.push(load);
            }

            // Deinterleave: the element at interleaved index
            // `lane * num_vectors + vector` lands in vector `vector` at
            // `lane`.
            for vector_index in 0..num_vectors as u32 {
                let mut deinterleaved = self.builder.build_undef(vector_type.clone());
                for lane_index in 0..num_lanes {
                    let interleaved_element_index = lane_index * num_vectors as u32 + vector_index;
                    let element = self.builder.build_extract_element(
                        loads[(interleaved_element_index / num_lanes) as usize],
                        interleaved_element_index % num_lanes,
                    );
                    deinterleaved =
                        self.builder
                            .build_insert_element(deinterleaved, element, lane_index);
                }
                self.push(deinterleaved);
            }
        }
        Ok(())
    }

    fn emit_store_interleaved(
        &mut self,
        shape: VectorShape,
        num_vectors: u8,
        memarg: &MemArg,
    ) -> Result<(), CompileError> {
        if !(2..=4).contains(&num_vectors) {
            return Err(CompileError::InvalidInterleaveFactor(num_vectors));
        }
        let vector_type = shape.ir_type();
        let num_lanes = shape.num_lanes() as u32;

        let mut values: SmallVec<[ValueRef; 4]> =
            SmallVec::from_elem(ValueRef(0), num_vectors as usize);
        for vector_index in 0..num_vectors as usize {
            let value = self.pop()?;
            values[num_vectors as usize - vector_index - 1] =
                self.builder.build_bit_cast(value, vector_type.clone());
        }
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, vector_type.clone(), memarg.memory_index)?;

        if self.is_aarch64() {
            let mut args: Vec<ValueRef> = values.to_vec();
            args.push(pointer);
            self.builder.build_target_intrinsic(
                format!("aarch64.neon.st{num_vectors}"),
                args,
                None,
            );
        } else {
            // Interleave (the inverse of the deinterleave rule) and emit
            // one 128-bit store per vector.
            for vector_index in 0..num_vectors as u32 {
                let mut interleaved = self.builder.build_undef(vector_type.clone());
                for lane_index in 0..num_lanes {
                    let interleaved_element_index = vector_index * num_lanes + lane_index;
                    let source_vector = interleaved_element_index % num_vectors as u32;
                    let source_lane = interleaved_element_index / num_vectors as u32;
                    let element = self
                        .builder
                        .build_extract_element(values[source_vector as usize], source_lane);
                    interleaved =
                        self.builder
                            .build_insert_element(interleaved, element, lane_index);
                }
                let offset = self
                    .builder
                    .const_int(ScalarType::I64, (vector_index as u64) * 16);
                let element_pointer = self.builder.build_in_bounds_gep(pointer, offset);
                let store = self.builder.build_store(interleaved, element_pointer);
                self.builder.set_volatile(store, true);
                self.builder.set_alignment(store, 1);
            }
        }
        Ok(())
    }

    fn emit_memory_copy(
        &mut self,
        dest_memory_index: u32,
        source_memory_index: u32,
    ) -> Result<(), CompileError> {
        let num_bytes = self.pop()?;
        let source_address = self.pop()?;
        let dest_address = self.pop()?;

        let source_bounded = self.get_offset_and_bounded_address(source_address, 0);
        let dest_bounded = self.get_offset_and_bounded_address(dest_address, 0);

        let source_pointer =
            self.coerce_address_to_pointer(source_bounded, IrType::I8, source_memory_index)?;
        let dest_pointer =
            self.coerce_address_to_pointer(dest_bounded, IrType::I8, dest_memory_index)?;

        let num_bytes64 = self.builder.build_int_z_extend(num_bytes, IrType::I64);

        // Branch on the order of the bounded addresses (disregarding that
        // they may address different memory objects): a forward copy with an
        // overlapping, lower source would overwrite source bytes before
        // reading them.
        let reverse_block = self.builder.append_basic_block("memoryCopyReverse");
        let forward_block = self.builder.append_basic_block("memoryCopyForward");
        let join_block = self.builder.append_basic_block("memoryCopyJoin");
        let source_is_below_dest =
            self.builder
                .build_int_compare(IntPredicate::Ult, source_bounded, dest_bounded);
        self.builder
            .build_conditional_branch(source_is_below_dest, reverse_block, forward_block);

        // The reverse case is a byte-wise copy loop walking downward.
        self.builder.position_at_end(reverse_block);
        self.emit_memory_copy_loop(join_block, source_pointer, dest_pointer, num_bytes64, true);

        self.builder.position_at_end(forward_block);
        if self.is_x86() {
            // On x86, use "rep movsb" to do forward copies.
            self.builder.build_inline_asm(
                "rep movsb",
                "={di},={si},={cx},0,1,2,~{memory},~{dirflag},~{fpsr},~{flags}",
                vec![dest_pointer, source_pointer, num_bytes64],
                true,
            );
            self.builder.build_branch(join_block);
        } else {
            self.emit_memory_copy_loop(
                join_block,
                source_pointer,
                dest_pointer,
                num_bytes64,
                false,
            );
        }

        self.builder.position_at_end(join_block);
        Ok(())
    }

    fn emit_memory_fill(&mut self, memory_index: u32) -> Result<(), CompileError> {
        let num_bytes = self.pop()?;
        let value = self.pop()?;
        let dest_address = self.pop()?;

        let dest_bounded = self.get_offset_and_bounded_address(dest_address, 0);
        let dest_pointer = self.coerce_address_to_pointer(dest_bounded, IrType::I8, memory_index)?;

        let num_bytes64 = self.builder.build_int_z_extend(num_bytes, IrType::I64);
        let value_i8 = self.builder.build_int_truncate(value, IrType::I8);

        if self.is_x86() {
            // On x86, use "rep stosb".
            self.builder.build_inline_asm(
                "rep stosb",
                "={di},={al},={cx},0,1,2,~{memory},~{dirflag},~{fpsr},~{flags}",
                vec![dest_pointer, value_i8, num_bytes64],
                true,
            );
        } else {
            // On other architectures, emit a byte-wise fill loop.
            let end_block = self.builder.append_basic_block("memoryFillEnd");
            let zero = self.builder.const_int(ScalarType::I64, 0);
            self.emit_loop(end_block, zero, num_bytes64, false, |emitter, index| {
                let dest = emitter.builder.build_in_bounds_gep(dest_pointer, index);
                let store = emitter.builder.build_store(value_i8, dest);
                emitter.builder.set_alignment(store, 1);
                emitter.builder.set_volatile(store, true);
            });
            self.builder.position_at_end(end_block);
        }
        Ok(())
    }

    fn extend_to_value_type(&mut self, value: ValueRef, ty: AtomicAccessType) -> ValueRef {
        if ty.is_extending() {
            self.builder.build_int_z_extend(value, ty.value_type())
        } else {
            value
        }
    }

    fn truncate_to_memory_type(&mut self, value: ValueRef, ty: AtomicAccessType) -> ValueRef {
        if ty.is_extending() {
            self.builder.build_int_truncate(value, ty.memory_type())
        } else {
            value
        }
    }

    fn emit_atomic_load(
        &mut self,
        ty: AtomicAccessType,
        memarg: &MemArg,
    ) -> Result<(), CompileError> {
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, ty.memory_type(), memarg.memory_index)?;
        let load = self.builder.build_load(ty.memory_type(), pointer);
        // Misaligned atomics trap, so the hint is trustworthy here.
        self.builder
            .set_alignment(load, 1 << memarg.alignment_log2);
        self.builder.set_volatile(load, true);
        self.builder
            .set_atomic(load, AtomicOrdering::SequentiallyConsistent);
        let result = self.extend_to_value_type(load, ty);
        self.push(result);
        Ok(())
    }

    fn emit_atomic_store(
        &mut self,
        ty: AtomicAccessType,
        memarg: &MemArg,
    ) -> Result<(), CompileError> {
        let value = self.pop()?;
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, ty.memory_type(), memarg.memory_index)?;
        let memory_value = self.truncate_to_memory_type(value, ty);
        let store = self.builder.build_store(memory_value, pointer);
        self.builder.set_volatile(store, true);
        self.builder
            .set_alignment(store, 1 << memarg.alignment_log2);
        self.builder
            .set_atomic(store, AtomicOrdering::SequentiallyConsistent);
        Ok(())
    }

    fn emit_atomic_rmw(
        &mut self,
        op: RmwOp,
        ty: AtomicAccessType,
        memarg: &MemArg,
    ) -> Result<(), CompileError> {
        let value = self.pop()?;
        let value = self.truncate_to_memory_type(value, ty);
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, ty.memory_type(), memarg.memory_index)?;
        let rmw = self.builder.build_atomic_rmw(
            op,
            pointer,
            value,
            AtomicOrdering::SequentiallyConsistent,
        );
        self.builder.set_volatile(rmw, true);
        self.builder.set_alignment(rmw, 1 << memarg.alignment_log2);
        let result = self.extend_to_value_type(rmw, ty);
        self.push(result);
        Ok(())
    }

    fn emit_atomic_cmpxchg(
        &mut self,
        ty: AtomicAccessType,
        memarg: &MemArg,
    ) -> Result<(), CompileError> {
        let replacement = self.pop()?;
        let replacement = self.truncate_to_memory_type(replacement, ty);
        let expected = self.pop()?;
        let expected = self.truncate_to_memory_type(expected, ty);
        let address = self.pop()?;
        let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
        self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
        let pointer =
            self.coerce_address_to_pointer(bounded_address, ty.memory_type(), memarg.memory_index)?;
        let cmpxchg = self.builder.build_atomic_cmpxchg(
            pointer,
            expected,
            replacement,
            AtomicOrdering::SequentiallyConsistent,
            AtomicOrdering::SequentiallyConsistent,
        );
        self.builder.set_volatile(cmpxchg, true);
        self.builder
            .set_alignment(cmpxchg, 1 << memarg.alignment_log2);
        let previous = self.builder.build_extract_value(cmpxchg, 0);
        let result = self.extend_to_value_type(previous, ty);
        self.push(result);
        Ok(())
    }

    /// Lower one memory operator.
    pub fn emit(&mut self, operator: &MemoryOperator) -> Result<(), CompileError> {
        match operator {
            MemoryOperator::Load { kind, memarg } => self.emit_load(*kind, memarg),
            MemoryOperator::Store { kind, memarg } => self.emit_store(*kind, memarg),
            MemoryOperator::LoadInterleaved {
                shape,
                num_vectors,
                memarg,
            } => self.emit_load_interleaved(*shape, *num_vectors, memarg),
            MemoryOperator::StoreInterleaved {
                shape,
                num_vectors,
                memarg,
            } => self.emit_store_interleaved(*shape, *num_vectors, memarg),

            MemoryOperator::MemorySize { memory_index } => {
                let memory_id = self.memory_id_literal(*memory_index)?;
                let num_pages = self.builder.build_runtime_intrinsic(
                    "memory.size",
                    vec![memory_id],
                    Some(IrType::I32),
                );
                self.push(num_pages);
                Ok(())
            }
            MemoryOperator::MemoryGrow { memory_index } => {
                let delta_num_pages = self.pop()?;
                let memory_id = self.memory_id_literal(*memory_index)?;
                let previous_num_pages = self.builder.build_runtime_intrinsic(
                    "memory.grow",
                    vec![delta_num_pages, memory_id],
                    Some(IrType::I32),
                );
                self.push(previous_num_pages);
                Ok(())
            }
            MemoryOperator::MemoryInit {
                data_segment_index,
                memory_index,
            } => {
                let num_bytes = self.pop()?;
                let source_offset = self.pop()?;
                let dest_address = self.pop()?;
                let instance_id = self.builder.const_int(ScalarType::I64, self.instance_id);
                let memory_id = self.memory_id_literal(*memory_index)?;
                let segment_index = self
                    .builder
                    .const_int(ScalarType::I64, *data_segment_index as u64);
                self.builder.build_runtime_intrinsic(
                    "memory.init",
                    vec![
                        dest_address,
                        source_offset,
                        num_bytes,
                        instance_id,
                        memory_id,
                        segment_index,
                    ],
                    None,
                );
                Ok(())
            }
            MemoryOperator::DataDrop { data_segment_index } => {
                let instance_id = self.builder.const_int(ScalarType::I64, self.instance_id);
                let segment_index = self
                    .builder
                    .const_int(ScalarType::I64, *data_segment_index as u64);
                self.builder.build_runtime_intrinsic(
                    "data.drop",
                    vec![instance_id, segment_index],
                    None,
                );
                Ok(())
            }
            MemoryOperator::MemoryCopy {
                dest_memory_index,
                source_memory_index,
            } => self.emit_memory_copy(*dest_memory_index, *source_memory_index),
            MemoryOperator::MemoryFill { memory_index } => self.emit_memory_fill(*memory_index),

            MemoryOperator::AtomicFence => {
                self.builder
                    .build_fence(AtomicOrdering::SequentiallyConsistent);
                Ok(())
            }
            MemoryOperator::AtomicNotify { memarg } => {
                let num_waiters = self.pop()?;
                let address = self.pop()?;
                let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
                self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
                let memory_id = self.memory_id_literal(memarg.memory_index)?;
                let result = self.builder.build_runtime_intrinsic(
                    "atomic_notify",
                    vec![address, num_waiters, memory_id],
                    Some(IrType::I32),
                );
                self.push(result);
                Ok(())
            }
            MemoryOperator::I32AtomicWait { memarg } => {
                let timeout = self.pop()?;
                let expected_value = self.pop()?;
                let address = self.pop()?;
                let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
                self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
                let memory_id = self.memory_id_literal(memarg.memory_index)?;
                let result = self.builder.build_runtime_intrinsic(
                    "atomic_wait_i32",
                    vec![address, expected_value, timeout, memory_id],
                    Some(IrType::I32),
                );
                self.push(result);
                Ok(())
            }
            MemoryOperator::I64AtomicWait { memarg } => {
                let timeout = self.pop()?;
                let expected_value = self.pop()?;
                let address = self.pop()?;
                let bounded_address = self.get_offset_and_bounded_address(address, memarg.offset);
                self.trap_if_misaligned_atomic(bounded_address, memarg.alignment_log2);
                let memory_id = self.memory_id_literal(memarg.memory_index)?;
                let result = self.builder.build_runtime_intrinsic(
                    "atomic_wait_i64",
                    vec![address, expected_value, timeout, memory_id],
                    Some(IrType::I32),
                );
                self.push(result);
                Ok(())
            }

            MemoryOperator::AtomicLoad { ty, memarg } => self.emit_atomic_load(*ty, memarg),
            MemoryOperator::AtomicStore { ty, memarg } => self.emit_atomic_store(*ty, memarg),
            MemoryOperator::AtomicRmw { op, ty, memarg } => self.emit_atomic_rmw(*op, *ty, memarg),
            MemoryOperator::AtomicCmpxchg { ty, memarg } => self.emit_atomic_cmpxchg(*ty, memarg),
        }
    }
}
