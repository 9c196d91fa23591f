//! Properties of the IR emitted for memory operators.

use breakwater_compiler::{
    AtomicAccessType, AtomicOrdering, FunctionEmitter, Instruction, IntPredicate, IrType,
    LoadKind, MemArg, MemoryOperator, RmwOp, ScalarType, StoreKind, ValueRef, VectorShape,
};
use std::str::FromStr;
use target_lexicon::Triple;

fn x86_64() -> Triple {
    Triple::from_str("x86_64-unknown-linux-gnu").unwrap()
}

fn aarch64() -> Triple {
    Triple::from_str("aarch64-unknown-linux-gnu").unwrap()
}

fn emitter(target: Triple) -> FunctionEmitter {
    FunctionEmitter::new(target, 7, &[11, 12])
}

/// Collects the instructions emitted by one operator, in emission order.
fn emit_and_collect(
    emitter: &mut FunctionEmitter,
    operands: &[u64],
    operator: MemoryOperator,
) -> Vec<(ValueRef, Instruction)> {
    for operand in operands {
        let value = emitter
            .builder_mut()
            .const_int(ScalarType::I32, *operand);
        emitter.push(value);
    }
    let watermark = emitter.builder().all_instructions().count();
    emitter.emit(&operator).unwrap();
    emitter
        .builder()
        .all_instructions()
        .skip(watermark)
        .map(|(value, instruction)| (value, instruction.clone()))
        .collect()
}

fn position_of(
    instructions: &[(ValueRef, Instruction)],
    predicate: impl Fn(&Instruction) -> bool,
) -> Option<usize> {
    instructions
        .iter()
        .position(|(_, instruction)| predicate(instruction))
}

#[test]
fn every_load_zexts_the_address_before_pointer_formation() {
    for kind in LoadKind::ALL {
        let mut emitter = emitter(x86_64());
        let memarg = MemArg {
            alignment_log2: 0,
            offset: 16,
            memory_index: 0,
        };
        let emitted = emit_and_collect(&mut emitter, &[100], MemoryOperator::Load { kind, memarg });

        let zext = position_of(&emitted, |i| {
            matches!(i, Instruction::ZExt { to, .. } if *to == IrType::I64)
        });
        let gep = position_of(&emitted, |i| matches!(i, Instruction::InBoundsGep { .. }));
        assert!(zext.is_some(), "{kind:?} emitted no address zext");
        assert!(gep.is_some(), "{kind:?} emitted no pointer formation");
        assert!(
            zext.unwrap() < gep.unwrap(),
            "{kind:?} formed a pointer before bounding the address"
        );
    }
}

#[test]
fn every_store_zexts_the_address_before_pointer_formation() {
    for kind in StoreKind::ALL {
        let mut emitter = emitter(x86_64());
        let memarg = MemArg {
            alignment_log2: 0,
            offset: 0,
            memory_index: 0,
        };
        let emitted =
            emit_and_collect(&mut emitter, &[100, 42], MemoryOperator::Store { kind, memarg });

        let zext = position_of(&emitted, |i| {
            matches!(i, Instruction::ZExt { to, .. } if *to == IrType::I64)
        });
        let gep = position_of(&emitted, |i| matches!(i, Instruction::InBoundsGep { .. }));
        assert!(zext.unwrap() < gep.unwrap(), "{kind:?} skipped the zext");
    }
}

#[test]
fn nonzero_offsets_are_zero_extended_too() {
    let mut emitter = emitter(x86_64());
    let memarg = MemArg {
        alignment_log2: 2,
        offset: 0x1000,
        memory_index: 0,
    };
    let emitted = emit_and_collect(
        &mut emitter,
        &[1],
        MemoryOperator::Load {
            kind: LoadKind::I32Load,
            memarg,
        },
    );

    let zext_count = emitted
        .iter()
        .filter(|(_, i)| matches!(i, Instruction::ZExt { to, .. } if *to == IrType::I64))
        .count();
    assert_eq!(zext_count, 2, "both address and offset must be zext'ed");
    assert!(position_of(&emitted, |i| matches!(i, Instruction::IntAdd { .. })).is_some());
}

#[test]
fn plain_accesses_distrust_the_alignment_hint() {
    let mut emitter = emitter(x86_64());
    let memarg = MemArg {
        alignment_log2: 3,
        offset: 0,
        memory_index: 0,
    };
    let emitted = emit_and_collect(
        &mut emitter,
        &[8],
        MemoryOperator::Load {
            kind: LoadKind::I64Load,
            memarg,
        },
    );
    let load = emitted
        .iter()
        .find_map(|(_, i)| match i {
            Instruction::Load {
                alignment,
                volatile,
                ordering,
                ..
            } => Some((*alignment, *volatile, *ordering)),
            _ => None,
        })
        .unwrap();
    assert_eq!(load, (1, true, None));
}

#[test]
fn atomic_accesses_trust_the_alignment_hint_and_are_seq_cst() {
    for ty in AtomicAccessType::ALL {
        let mut emitter = emitter(x86_64());
        let memarg = MemArg {
            alignment_log2: ty.natural_alignment_log2(),
            offset: 0,
            memory_index: 0,
        };
        let emitted =
            emit_and_collect(&mut emitter, &[4], MemoryOperator::AtomicLoad { ty, memarg });

        let load = emitted
            .iter()
            .find_map(|(_, i)| match i {
                Instruction::Load {
                    alignment,
                    volatile,
                    ordering,
                    ..
                } => Some((*alignment, *volatile, *ordering)),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            load,
            (
                1 << memarg.alignment_log2,
                true,
                Some(AtomicOrdering::SequentiallyConsistent)
            ),
            "{ty:?}"
        );
    }
}

#[test]
fn atomics_with_alignment_emit_a_misalignment_check_before_the_access() {
    for ty in AtomicAccessType::ALL {
        let mut emitter = emitter(x86_64());
        let memarg = MemArg {
            alignment_log2: ty.natural_alignment_log2(),
            offset: 0,
            memory_index: 0,
        };
        let emitted =
            emit_and_collect(&mut emitter, &[4], MemoryOperator::AtomicLoad { ty, memarg });

        let check = position_of(&emitted, |i| {
            matches!(
                i,
                Instruction::ICmp {
                    predicate: IntPredicate::Ne,
                    ..
                }
            )
        });
        let trap = position_of(&emitted, |i| {
            matches!(i, Instruction::RuntimeIntrinsic { name, .. } if *name == "misalignedAtomicTrap")
        });
        let access = position_of(&emitted, |i| matches!(i, Instruction::Load { .. }));

        if memarg.alignment_log2 > 0 {
            assert!(check.unwrap() < access.unwrap(), "{ty:?}");
            assert!(trap.unwrap() < access.unwrap(), "{ty:?}");
        } else {
            // Byte-wide atomics cannot be misaligned.
            assert_eq!(check, None, "{ty:?}");
            assert_eq!(trap, None, "{ty:?}");
        }
    }
}

#[test]
fn rmw_grid_is_volatile_seq_cst() {
    let ops = [
        RmwOp::Xchg,
        RmwOp::Add,
        RmwOp::Sub,
        RmwOp::And,
        RmwOp::Or,
        RmwOp::Xor,
    ];
    for op in ops {
        for ty in AtomicAccessType::ALL {
            let mut emitter = emitter(x86_64());
            let memarg = MemArg {
                alignment_log2: ty.natural_alignment_log2(),
                offset: 0,
                memory_index: 0,
            };
            let emitted = emit_and_collect(
                &mut emitter,
                &[0, 1],
                MemoryOperator::AtomicRmw { op, ty, memarg },
            );
            let rmw = emitted
                .iter()
                .find_map(|(_, i)| match i {
                    Instruction::AtomicRmw {
                        op: emitted_op,
                        ordering,
                        volatile,
                        alignment,
                        ..
                    } => Some((*emitted_op, *ordering, *volatile, *alignment)),
                    _ => None,
                })
                .unwrap();
            assert_eq!(
                rmw,
                (
                    op,
                    AtomicOrdering::SequentiallyConsistent,
                    true,
                    1u32 << memarg.alignment_log2
                )
            );
            assert_eq!(emitter.stack_depth(), 1, "rmw pushes the previous value");
        }
    }
}

#[test]
fn cmpxchg_extracts_the_previous_value() {
    let mut emitter = emitter(x86_64());
    let memarg = MemArg {
        alignment_log2: 2,
        offset: 0,
        memory_index: 0,
    };
    let emitted = emit_and_collect(
        &mut emitter,
        &[0, 1, 2],
        MemoryOperator::AtomicCmpxchg {
            ty: AtomicAccessType::I32,
            memarg,
        },
    );
    let cmpxchg = position_of(&emitted, |i| {
        matches!(
            i,
            Instruction::AtomicCmpXchg {
                success_ordering: AtomicOrdering::SequentiallyConsistent,
                failure_ordering: AtomicOrdering::SequentiallyConsistent,
                volatile: true,
                ..
            }
        )
    });
    let extract = position_of(&emitted, |i| {
        matches!(i, Instruction::ExtractValue { index: 0, .. })
    });
    assert!(cmpxchg.unwrap() < extract.unwrap());
    assert_eq!(emitter.stack_depth(), 1);
}

#[test]
fn fence_is_sequentially_consistent() {
    let mut emitter = emitter(x86_64());
    let emitted = emit_and_collect(&mut emitter, &[], MemoryOperator::AtomicFence);
    assert_eq!(
        emitted
            .iter()
            .filter(|(_, i)| matches!(
                i,
                Instruction::Fence {
                    ordering: AtomicOrdering::SequentiallyConsistent
                }
            ))
            .count(),
        1
    );
}

#[test]
fn memory_copy_orders_on_bounded_addresses_and_uses_rep_movsb_on_x86() {
    let mut emitter = emitter(x86_64());
    let emitted = emit_and_collect(
        &mut emitter,
        &[0, 16, 8],
        MemoryOperator::MemoryCopy {
            dest_memory_index: 0,
            source_memory_index: 1,
        },
    );

    assert!(position_of(&emitted, |i| matches!(
        i,
        Instruction::ICmp {
            predicate: IntPredicate::Ult,
            ..
        }
    ))
    .is_some());

    // The reverse path is a byte loop: a phi plus a decrement.
    assert!(position_of(&emitted, |i| matches!(i, Instruction::Phi { .. })).is_some());
    assert!(position_of(&emitted, |i| matches!(i, Instruction::IntSub { .. })).is_some());

    // The forward path on x86 is rep movsb.
    let asm = emitted
        .iter()
        .find_map(|(_, i)| match i {
            Instruction::InlineAsm {
                assembly,
                constraints,
                has_side_effects,
                ..
            } => Some((*assembly, *constraints, *has_side_effects)),
            _ => None,
        })
        .unwrap();
    assert_eq!(asm.0, "rep movsb");
    assert!(asm.1.contains("~{memory},~{dirflag},~{fpsr},~{flags}"));
    assert!(asm.2);
}

#[test]
fn memory_copy_on_aarch64_uses_two_byte_loops() {
    let mut emitter = emitter(aarch64());
    let emitted = emit_and_collect(
        &mut emitter,
        &[0, 16, 8],
        MemoryOperator::MemoryCopy {
            dest_memory_index: 0,
            source_memory_index: 0,
        },
    );
    assert!(!emitted
        .iter()
        .any(|(_, i)| matches!(i, Instruction::InlineAsm { .. })));
    let phis = emitted
        .iter()
        .filter(|(_, i)| matches!(i, Instruction::Phi { .. }))
        .count();
    assert_eq!(phis, 2, "one loop for each copy direction");
}

#[test]
fn memory_fill_uses_rep_stosb_on_x86_and_a_loop_elsewhere() {
    let mut emitter = emitter(x86_64());
    let emitted = emit_and_collect(
        &mut emitter,
        &[0, 0xff, 64],
        MemoryOperator::MemoryFill { memory_index: 0 },
    );
    let asm = emitted
        .iter()
        .find_map(|(_, i)| match i {
            Instruction::InlineAsm { assembly, .. } => Some(*assembly),
            _ => None,
        })
        .unwrap();
    assert_eq!(asm, "rep stosb");

    let mut emitter = emitter_for_fill_loop();
    let emitted = emit_and_collect(
        &mut emitter,
        &[0, 0xff, 64],
        MemoryOperator::MemoryFill { memory_index: 0 },
    );
    assert!(!emitted
        .iter()
        .any(|(_, i)| matches!(i, Instruction::InlineAsm { .. })));
    let store = emitted
        .iter()
        .find_map(|(_, i)| match i {
            Instruction::Store {
                alignment, volatile, ..
            } => Some((*alignment, *volatile)),
            _ => None,
        })
        .unwrap();
    assert_eq!(store, (1, true));
}

fn emitter_for_fill_loop() -> FunctionEmitter {
    emitter(aarch64())
}

#[test]
fn interleaved_load_uses_neon_on_aarch64() {
    let mut emitter = emitter(aarch64());
    let memarg = MemArg {
        alignment_log2: 4,
        offset: 0,
        memory_index: 0,
    };
    let emitted = emit_and_collect(
        &mut emitter,
        &[0],
        MemoryOperator::LoadInterleaved {
            shape: VectorShape::I32x4,
            num_vectors: 3,
            memarg,
        },
    );
    let intrinsic = emitted
        .iter()
        .find_map(|(_, i)| match i {
            Instruction::TargetIntrinsic { name, result, .. } => Some((name.clone(), result.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(intrinsic.0, "aarch64.neon.ld3");
    assert!(matches!(intrinsic.1, Some(IrType::Tuple(members)) if members.len() == 3));
    assert_eq!(emitter.stack_depth(), 3);
}

#[test]
fn interleaved_store_uses_neon_on_aarch64() {
    let mut emitter = emitter(aarch64());
    let memarg = MemArg {
        alignment_log2: 4,
        offset: 0,
        memory_index: 0,
    };
    let emitted = emit_and_collect(
        &mut emitter,
        &[0, 1, 2],
        MemoryOperator::StoreInterleaved {
            shape: VectorShape::I16x8,
            num_vectors: 2,
            memarg,
        },
    );
    let name = emitted
        .iter()
        .find_map(|(_, i)| match i {
            Instruction::TargetIntrinsic { name, args, .. } => {
                assert_eq!(args.len(), 3, "two vectors plus the pointer");
                Some(name.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(name, "aarch64.neon.st2");
}

#[test]
fn generic_deinterleave_respects_the_lane_rule() {
    // i = lane * K + v goes to vector v, lane `lane`.
    let shape = VectorShape::I32x4;
    let num_vectors = 2u32;
    let num_lanes = shape.num_lanes() as u32;

    let mut emitter = emitter(x86_64());
    let memarg = MemArg {
        alignment_log2: 4,
        offset: 0,
        memory_index: 0,
    };
    let emitted = emit_and_collect(
        &mut emitter,
        &[0],
        MemoryOperator::LoadInterleaved {
            shape,
            num_vectors: num_vectors as u8,
            memarg,
        },
    );

    let loads: Vec<ValueRef> = emitted
        .iter()
        .filter_map(|(value, i)| {
            matches!(i, Instruction::Load { ty: IrType::Vector { .. }, .. }).then_some(*value)
        })
        .collect();
    assert_eq!(loads.len(), num_vectors as usize);

    // Walk the insert/extract chain and reconstruct the mapping.
    let mut mapping = Vec::new();
    for (_, instruction) in &emitted {
        if let Instruction::InsertElement { element, lane, .. } = instruction {
            if let Instruction::ExtractElement {
                vector,
                lane: source_lane,
            } = emitter.builder().instruction(*element)
            {
                let source_load = loads.iter().position(|l| l == vector).unwrap() as u32;
                mapping.push((source_load * num_lanes + source_lane, *lane));
            }
        }
    }
    assert_eq!(mapping.len(), (num_vectors * num_lanes) as usize);
    for (result_index, (interleaved_index, lane)) in mapping.iter().enumerate() {
        let vector = result_index as u32 / num_lanes;
        assert_eq!(interleaved_index % num_vectors, vector);
        assert_eq!(interleaved_index / num_vectors, *lane);
    }
}

#[test]
fn bulk_and_wait_intrinsics_use_their_contract_names() {
    let mut e = emitter(x86_64());
    let memarg = MemArg {
        alignment_log2: 2,
        offset: 0,
        memory_index: 0,
    };

    let grow = emit_and_collect(&mut e, &[1], MemoryOperator::MemoryGrow { memory_index: 0 });
    assert!(grow.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "memory.grow", args, result: Some(IrType::I32) }
            if args.len() == 2
    )));

    let size = emit_and_collect(&mut e, &[], MemoryOperator::MemorySize { memory_index: 0 });
    assert!(size.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "memory.size", args, .. } if args.len() == 1
    )));

    let init = emit_and_collect(
        &mut e,
        &[0, 0, 4],
        MemoryOperator::MemoryInit {
            data_segment_index: 3,
            memory_index: 0,
        },
    );
    assert!(init.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "memory.init", args, result: None } if args.len() == 6
    )));

    let drop = emit_and_collect(&mut e, &[], MemoryOperator::DataDrop { data_segment_index: 3 });
    assert!(drop.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "data.drop", args, .. } if args.len() == 2
    )));

    let notify = emit_and_collect(&mut e, &[0, 1], MemoryOperator::AtomicNotify { memarg });
    assert!(notify.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "atomic_notify", args, .. } if args.len() == 3
    )));

    let wait32 = emit_and_collect(&mut e, &[0, 1, 2], MemoryOperator::I32AtomicWait { memarg });
    assert!(wait32.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "atomic_wait_i32", args, result: Some(IrType::I32) }
            if args.len() == 4
    )));

    let wait64 = emit_and_collect(
        &mut e,
        &[0, 1, 2],
        MemoryOperator::I64AtomicWait {
            memarg: MemArg {
                alignment_log2: 3,
                ..memarg
            },
        },
    );
    assert!(wait64.iter().any(|(_, i)| matches!(
        i,
        Instruction::RuntimeIntrinsic { name: "atomic_wait_i64", .. }
    )));
}

#[test]
fn notify_passes_the_unbounded_address() {
    let mut e = emitter(x86_64());
    let address = e.builder_mut().const_int(ScalarType::I32, 0x40);
    e.push(address);
    let num_waiters = e.builder_mut().const_int(ScalarType::I32, 1);
    e.push(num_waiters);
    e.emit(&MemoryOperator::AtomicNotify {
        memarg: MemArg {
            alignment_log2: 2,
            offset: 0,
            memory_index: 0,
        },
    })
    .unwrap();

    let args = e
        .builder()
        .all_instructions()
        .find_map(|(_, i)| match i {
            Instruction::RuntimeIntrinsic {
                name: "atomic_notify",
                args,
                ..
            } => Some(args.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(args[0], address, "the wait map is keyed by the wasm address");
    assert_eq!(args[1], num_waiters);
}

#[test]
fn splat_and_widening_loads_convert_the_loaded_value() {
    let mut emitter = emitter(x86_64());
    let memarg = MemArg {
        alignment_log2: 0,
        offset: 0,
        memory_index: 0,
    };
    let splat = emit_and_collect(
        &mut emitter,
        &[0],
        MemoryOperator::Load {
            kind: LoadKind::V8x16LoadSplat,
            memarg,
        },
    );
    assert!(splat.iter().any(|(_, i)| matches!(
        i,
        Instruction::Splat {
            ty: IrType::Vector { lanes: 16, .. },
            ..
        }
    )));

    let widen = emit_and_collect(
        &mut emitter,
        &[0],
        MemoryOperator::Load {
            kind: LoadKind::I16x8Load8x8S,
            memarg: MemArg {
                alignment_log2: 3,
                ..memarg
            },
        },
    );
    assert!(widen.iter().any(|(_, i)| matches!(
        i,
        Instruction::SExt {
            to: IrType::Vector { lanes: 8, .. },
            ..
        }
    )));
}

#[test]
fn operand_underflow_is_reported() {
    let mut e = emitter(x86_64());
    let result = e.emit(&MemoryOperator::MemoryGrow { memory_index: 0 });
    assert!(result.is_err());
}

#[test]
fn unknown_memory_indices_are_reported() {
    let mut e = emitter(x86_64());
    let value = e.builder_mut().const_int(ScalarType::I32, 0);
    e.push(value);
    let result = e.emit(&MemoryOperator::Load {
        kind: LoadKind::I32Load,
        memarg: MemArg {
            alignment_log2: 2,
            offset: 0,
            memory_index: 9,
        },
    });
    assert!(result.is_err());
}
