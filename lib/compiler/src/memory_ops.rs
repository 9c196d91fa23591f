//! The memory, atomic and SIMD memory operators the lowerer accepts.

use crate::ir::{IrType, RmwOp, ScalarType};

/// The immediate of a memory access operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemArg {
    /// The log2 of the access's alignment hint.
    pub alignment_log2: u8,
    /// The static byte offset added to the address operand.
    pub offset: u32,
    /// The index of the memory accessed.
    pub memory_index: u32,
}

impl MemArg {
    /// A zero-offset, byte-aligned access of memory `memory_index`.
    pub fn unaligned(memory_index: u32) -> Self {
        Self {
            alignment_log2: 0,
            offset: 0,
            memory_index,
        }
    }
}

/// The shape of a 128-bit vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VectorShape {
    /// Sixteen 8-bit lanes.
    I8x16,
    /// Eight 16-bit lanes.
    I16x8,
    /// Four 32-bit lanes.
    I32x4,
    /// Two 64-bit lanes.
    I64x2,
}

impl VectorShape {
    /// The number of lanes.
    pub fn num_lanes(self) -> u8 {
        match self {
            Self::I8x16 => 16,
            Self::I16x8 => 8,
            Self::I32x4 => 4,
            Self::I64x2 => 2,
        }
    }

    /// The lane type.
    pub fn lane_type(self) -> ScalarType {
        match self {
            Self::I8x16 => ScalarType::I8,
            Self::I16x8 => ScalarType::I16,
            Self::I32x4 => ScalarType::I32,
            Self::I64x2 => ScalarType::I64,
        }
    }

    /// The full vector type.
    pub fn ir_type(self) -> IrType {
        IrType::vector(self.lane_type(), self.num_lanes())
    }
}

/// How a loaded memory value becomes the result value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadConversion {
    /// The loaded value is the result.
    Identity,
    /// Sign-extend to the result type.
    SignExtend,
    /// Zero-extend to the result type.
    ZeroExtend,
    /// Broadcast the loaded scalar to every result lane.
    Splat,
}

macro_rules! load_kinds {
    ($(($kind:ident, $memory_ty:expr, $result_ty:expr, $conversion:ident)),* $(,)?) => {
        /// A plain (non-atomic) load operator.
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum LoadKind {
            $(
                #[doc = concat!("The `", stringify!($kind), "` load.")]
                $kind,
            )*
        }

        impl LoadKind {
            /// The type read from memory.
            pub fn memory_type(self) -> IrType {
                match self {
                    $(Self::$kind => $memory_ty,)*
                }
            }

            /// The type pushed on the operand stack.
            pub fn result_type(self) -> IrType {
                match self {
                    $(Self::$kind => $result_ty,)*
                }
            }

            /// The conversion from memory type to result type.
            pub fn conversion(self) -> LoadConversion {
                match self {
                    $(Self::$kind => LoadConversion::$conversion,)*
                }
            }
        }
    };
}

load_kinds! {
    (I32Load8S, IrType::I8, IrType::I32, SignExtend),
    (I32Load8U, IrType::I8, IrType::I32, ZeroExtend),
    (I32Load16S, IrType::I16, IrType::I32, SignExtend),
    (I32Load16U, IrType::I16, IrType::I32, ZeroExtend),
    (I32Load, IrType::I32, IrType::I32, Identity),
    (I64Load8S, IrType::I8, IrType::I64, SignExtend),
    (I64Load8U, IrType::I8, IrType::I64, ZeroExtend),
    (I64Load16S, IrType::I16, IrType::I64, SignExtend),
    (I64Load16U, IrType::I16, IrType::I64, ZeroExtend),
    (I64Load32S, IrType::I32, IrType::I64, SignExtend),
    (I64Load32U, IrType::I32, IrType::I64, ZeroExtend),
    (I64Load, IrType::I64, IrType::I64, Identity),
    (F32Load, IrType::F32, IrType::F32, Identity),
    (F64Load, IrType::F64, IrType::F64, Identity),
    (V128Load, IrType::vector(ScalarType::I64, 2), IrType::vector(ScalarType::I64, 2), Identity),
    (V8x16LoadSplat, IrType::I8, IrType::vector(ScalarType::I8, 16), Splat),
    (V16x8LoadSplat, IrType::I16, IrType::vector(ScalarType::I16, 8), Splat),
    (V32x4LoadSplat, IrType::I32, IrType::vector(ScalarType::I32, 4), Splat),
    (V64x2LoadSplat, IrType::I64, IrType::vector(ScalarType::I64, 2), Splat),
    (I16x8Load8x8S, IrType::vector(ScalarType::I8, 8), IrType::vector(ScalarType::I16, 8), SignExtend),
    (I16x8Load8x8U, IrType::vector(ScalarType::I8, 8), IrType::vector(ScalarType::I16, 8), ZeroExtend),
    (I32x4Load16x4S, IrType::vector(ScalarType::I16, 4), IrType::vector(ScalarType::I32, 4), SignExtend),
    (I32x4Load16x4U, IrType::vector(ScalarType::I16, 4), IrType::vector(ScalarType::I32, 4), ZeroExtend),
    (I64x2Load32x2S, IrType::vector(ScalarType::I32, 2), IrType::vector(ScalarType::I64, 2), SignExtend),
    (I64x2Load32x2U, IrType::vector(ScalarType::I32, 2), IrType::vector(ScalarType::I64, 2), ZeroExtend),
}

impl LoadKind {
    /// Every load kind, for exhaustive property tests.
    pub const ALL: [Self; 25] = [
        Self::I32Load8S,
        Self::I32Load8U,
        Self::I32Load16S,
        Self::I32Load16U,
        Self::I32Load,
        Self::I64Load8S,
        Self::I64Load8U,
        Self::I64Load16S,
        Self::I64Load16U,
        Self::I64Load32S,
        Self::I64Load32U,
        Self::I64Load,
        Self::F32Load,
        Self::F64Load,
        Self::V128Load,
        Self::V8x16LoadSplat,
        Self::V16x8LoadSplat,
        Self::V32x4LoadSplat,
        Self::V64x2LoadSplat,
        Self::I16x8Load8x8S,
        Self::I16x8Load8x8U,
        Self::I32x4Load16x4S,
        Self::I32x4Load16x4U,
        Self::I64x2Load32x2S,
        Self::I64x2Load32x2U,
    ];
}

/// How a stack value becomes the stored memory value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreConversion {
    /// The value is stored as-is.
    Identity,
    /// Truncate to the memory type.
    Truncate,
}

macro_rules! store_kinds {
    ($(($kind:ident, $memory_ty:expr, $conversion:ident)),* $(,)?) => {
        /// A plain (non-atomic) store operator.
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum StoreKind {
            $(
                #[doc = concat!("The `", stringify!($kind), "` store.")]
                $kind,
            )*
        }

        impl StoreKind {
            /// The type written to memory.
            pub fn memory_type(self) -> IrType {
                match self {
                    $(Self::$kind => $memory_ty,)*
                }
            }

            /// The conversion from stack value to memory value.
            pub fn conversion(self) -> StoreConversion {
                match self {
                    $(Self::$kind => StoreConversion::$conversion,)*
                }
            }
        }
    };
}

store_kinds! {
    (I32Store8, IrType::I8, Truncate),
    (I32Store16, IrType::I16, Truncate),
    (I32Store, IrType::I32, Identity),
    (I64Store8, IrType::I8, Truncate),
    (I64Store16, IrType::I16, Truncate),
    (I64Store32, IrType::I32, Truncate),
    (I64Store, IrType::I64, Identity),
    (F32Store, IrType::F32, Identity),
    (F64Store, IrType::F64, Identity),
    (V128Store, IrType::vector(ScalarType::I64, 2), Identity),
}

impl StoreKind {
    /// Every store kind, for exhaustive property tests.
    pub const ALL: [Self; 10] = [
        Self::I32Store8,
        Self::I32Store16,
        Self::I32Store,
        Self::I64Store8,
        Self::I64Store16,
        Self::I64Store32,
        Self::I64Store,
        Self::F32Store,
        Self::F64Store,
        Self::V128Store,
    ];
}

/// The width/value-type combination of an atomic access: the memory type,
/// the stack value type, and whether a zero-extend/truncate pair wraps the
/// access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AtomicAccessType {
    /// 32-bit access as i32.
    I32,
    /// 8-bit access zero-extended to i32.
    I32U8,
    /// 16-bit access zero-extended to i32.
    I32U16,
    /// 64-bit access as i64.
    I64,
    /// 8-bit access zero-extended to i64.
    I64U8,
    /// 16-bit access zero-extended to i64.
    I64U16,
    /// 32-bit access zero-extended to i64.
    I64U32,
}

impl AtomicAccessType {
    /// The type read from or written to memory.
    pub fn memory_type(self) -> IrType {
        match self {
            Self::I32U8 | Self::I64U8 => IrType::I8,
            Self::I32U16 | Self::I64U16 => IrType::I16,
            Self::I32 | Self::I64U32 => IrType::I32,
            Self::I64 => IrType::I64,
        }
    }

    /// The value type on the operand stack.
    pub fn value_type(self) -> IrType {
        match self {
            Self::I32 | Self::I32U8 | Self::I32U16 => IrType::I32,
            Self::I64 | Self::I64U8 | Self::I64U16 | Self::I64U32 => IrType::I64,
        }
    }

    /// Whether the memory type is narrower than the value type.
    pub fn is_extending(self) -> bool {
        self.memory_type() != self.value_type()
    }

    /// The natural alignment of the access, as a log2 byte count.
    pub fn natural_alignment_log2(self) -> u8 {
        match self {
            Self::I32U8 | Self::I64U8 => 0,
            Self::I32U16 | Self::I64U16 => 1,
            Self::I32 | Self::I64U32 => 2,
            Self::I64 => 3,
        }
    }

    /// Every access type, for exhaustive property tests.
    pub const ALL: [Self; 7] = [
        Self::I32,
        Self::I32U8,
        Self::I32U16,
        Self::I64,
        Self::I64U8,
        Self::I64U16,
        Self::I64U32,
    ];
}

/// A memory, atomic or SIMD memory operator, as handed to the lowerer by
/// the JIT's function translator.
#[derive(Clone, Debug, PartialEq)]
pub enum MemoryOperator {
    /// A plain load.
    Load {
        /// The load kind.
        kind: LoadKind,
        /// The access immediate.
        memarg: MemArg,
    },
    /// A plain store.
    Store {
        /// The store kind.
        kind: StoreKind,
        /// The access immediate.
        memarg: MemArg,
    },
    /// An interleaved vector load of `num_vectors` vectors.
    LoadInterleaved {
        /// The vector shape.
        shape: VectorShape,
        /// The interleave factor (2, 3 or 4).
        num_vectors: u8,
        /// The access immediate.
        memarg: MemArg,
    },
    /// An interleaved vector store of `num_vectors` vectors.
    StoreInterleaved {
        /// The vector shape.
        shape: VectorShape,
        /// The interleave factor (2, 3 or 4).
        num_vectors: u8,
        /// The access immediate.
        memarg: MemArg,
    },
    /// `memory.size`.
    MemorySize {
        /// The memory queried.
        memory_index: u32,
    },
    /// `memory.grow`.
    MemoryGrow {
        /// The memory grown.
        memory_index: u32,
    },
    /// `memory.init`.
    MemoryInit {
        /// The data segment read.
        data_segment_index: u32,
        /// The memory written.
        memory_index: u32,
    },
    /// `data.drop`.
    DataDrop {
        /// The data segment dropped.
        data_segment_index: u32,
    },
    /// `memory.copy`.
    MemoryCopy {
        /// The memory written.
        dest_memory_index: u32,
        /// The memory read.
        source_memory_index: u32,
    },
    /// `memory.fill`.
    MemoryFill {
        /// The memory written.
        memory_index: u32,
    },
    /// `atomic.fence`.
    AtomicFence,
    /// `atomic.notify`.
    AtomicNotify {
        /// The access immediate.
        memarg: MemArg,
    },
    /// `i32.atomic.wait`.
    I32AtomicWait {
        /// The access immediate.
        memarg: MemArg,
    },
    /// `i64.atomic.wait`.
    I64AtomicWait {
        /// The access immediate.
        memarg: MemArg,
    },
    /// An atomic load.
    AtomicLoad {
        /// The access width and value type.
        ty: AtomicAccessType,
        /// The access immediate.
        memarg: MemArg,
    },
    /// An atomic store.
    AtomicStore {
        /// The access width and value type.
        ty: AtomicAccessType,
        /// The access immediate.
        memarg: MemArg,
    },
    /// An atomic read-modify-write.
    AtomicRmw {
        /// The operation.
        op: RmwOp,
        /// The access width and value type.
        ty: AtomicAccessType,
        /// The access immediate.
        memarg: MemArg,
    },
    /// An atomic compare-exchange.
    AtomicCmpxchg {
        /// The access width and value type.
        ty: AtomicAccessType,
        /// The access immediate.
        memarg: MemArg,
    },
}
