//! Binary module loading.
//!
//! Decoding and validation are two passes with distinct failure classes:
//! a module the decoder rejects is *malformed*, a module that decodes but
//! fails validation is *invalid*.

use breakwater_types::{
    DataSegmentIr, ElemSegmentIr, ExceptionTypeSig, Export, ExternKind, Features, FunctionDef,
    FunctionType, GlobalDef, GlobalType, Import, ImportDesc, MemoryType, ModuleIr, Mutability,
    Pages, SourceRange, TableType, Type, WASM_MAX_PAGES,
};
use thiserror::Error;
use wasmparser::{Parser, Payload, TypeRef, ValType, Validator, WasmFeatures};

/// Which stage rejected the module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The binary could not be decoded.
    Malformed,
    /// The binary decoded but failed validation.
    Invalid,
}

/// A binary-module loading error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LoadError {
    /// Which stage rejected the module.
    pub kind: LoadErrorKind,
    /// The loader's message.
    pub message: String,
}

fn wasm_features(features: &Features) -> WasmFeatures {
    let mut wasm_features = WasmFeatures::default();
    wasm_features.threads = features.threads;
    wasm_features.reference_types = features.reference_types;
    wasm_features.simd = features.simd;
    wasm_features.bulk_memory = features.bulk_memory;
    wasm_features.multi_value = features.multi_value;
    wasm_features.multi_memory = features.multi_memory;
    wasm_features.exceptions = features.exceptions;
    wasm_features
}

fn value_type(ty: ValType) -> Type {
    match ty {
        ValType::I32 => Type::I32,
        ValType::I64 => Type::I64,
        ValType::F32 => Type::F32,
        ValType::F64 => Type::F64,
        ValType::V128 => Type::V128,
        ValType::Ref(_) => Type::FuncRef,
    }
}

fn memory_type(ty: wasmparser::MemoryType) -> MemoryType {
    MemoryType::new(
        Pages(ty.initial.min(WASM_MAX_PAGES as u64) as u32),
        ty.maximum.map(|max| Pages(max.min(WASM_MAX_PAGES as u64) as u32)),
        ty.shared,
    )
}

fn global_type(ty: wasmparser::GlobalType) -> GlobalType {
    GlobalType::new(
        value_type(ty.content_type),
        if ty.mutable {
            Mutability::Var
        } else {
            Mutability::Const
        },
    )
}

fn malformed(error: &wasmparser::BinaryReaderError) -> LoadError {
    LoadError {
        kind: LoadErrorKind::Malformed,
        message: error.message().to_string(),
    }
}

/// Decode and validate a binary module, summarizing its sections.
pub fn load_binary_module(bytes: &[u8], features: &Features) -> Result<ModuleIr, LoadError> {
    let mut module = ModuleIr::new(features.clone());
    let mut next_code_index = 0usize;

    // Decode pass: any error here means the binary is malformed.
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(|e| malformed(&e))?;
        match payload {
            Payload::TypeSection(reader) => {
                for group in reader {
                    group.map_err(|e| malformed(&e))?;
                    // The signature details are not needed by the driver;
                    // only the index space has to line up.
                    module.types.push(FunctionType::default());
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| malformed(&e))?;
                    let desc = match import.ty {
                        TypeRef::Func(type_index) => ImportDesc::Function(type_index),
                        TypeRef::Memory(ty) => ImportDesc::Memory(memory_type(ty)),
                        TypeRef::Global(ty) => ImportDesc::Global(global_type(ty)),
                        TypeRef::Table(_) => {
                            ImportDesc::Table(TableType::new(Type::FuncRef, 0, None))
                        }
                        TypeRef::Tag(_) => ImportDesc::ExceptionType(ExceptionTypeSig::default()),
                    };
                    module.imports.push(Import {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                        desc,
                    });
                }
            }
            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    let type_index = type_index.map_err(|e| malformed(&e))?;
                    module.functions.push(FunctionDef {
                        type_index,
                        body: SourceRange::default(),
                    });
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    table.map_err(|e| malformed(&e))?;
                    module.tables.push(TableType::new(Type::FuncRef, 0, None));
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.map_err(|e| malformed(&e))?;
                    module.memories.push(memory_type(memory));
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.map_err(|e| malformed(&e))?;
                    module.globals.push(GlobalDef {
                        ty: global_type(global.ty),
                        init: None,
                    });
                }
            }
            Payload::TagSection(reader) => {
                for tag in reader {
                    tag.map_err(|e| malformed(&e))?;
                    module.exception_types.push(ExceptionTypeSig::default());
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| malformed(&e))?;
                    let kind = match export.kind {
                        wasmparser::ExternalKind::Func => ExternKind::Function,
                        wasmparser::ExternalKind::Table => ExternKind::Table,
                        wasmparser::ExternalKind::Memory => ExternKind::Memory,
                        wasmparser::ExternalKind::Global => ExternKind::Global,
                        wasmparser::ExternalKind::Tag => ExternKind::ExceptionType,
                    };
                    module.exports.push(Export {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }
            Payload::StartSection { func, .. } => {
                module.start_function = Some(func);
            }
            Payload::ElementSection(reader) => {
                for element in reader {
                    element.map_err(|e| malformed(&e))?;
                    module.elem_segments.push(ElemSegmentIr {
                        table_index: None,
                        offset: None,
                        functions: Vec::new(),
                    });
                }
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data.map_err(|e| malformed(&e))?;
                    let memory_index = match data.kind {
                        wasmparser::DataKind::Active { memory_index, .. } => Some(memory_index),
                        wasmparser::DataKind::Passive => None,
                    };
                    module.data_segments.push(DataSegmentIr {
                        memory_index,
                        offset: None,
                        data: data.data.to_vec(),
                    });
                }
            }
            Payload::CodeSectionEntry(body) => {
                let range = body.range();
                if let Some(function) = module.functions.get_mut(next_code_index) {
                    function.body = SourceRange {
                        begin: range.start as u32,
                        end: range.end as u32,
                    };
                }
                next_code_index += 1;
            }
            Payload::UnknownSection { id, .. } => {
                return Err(LoadError {
                    kind: LoadErrorKind::Malformed,
                    message: format!("unknown section id {id}"),
                });
            }
            _ => {}
        }
    }

    // Validation pass: any error here means the module is invalid.
    Validator::new_with_features(wasm_features(features))
        .validate_all(bytes)
        .map_err(|error| LoadError {
            kind: LoadErrorKind::Invalid,
            message: error.message().to_string(),
        })?;

    tracing::trace!(
        num_functions = module.functions.len(),
        num_memories = module.memories.len(),
        "loaded binary module"
    );
    Ok(module)
}
