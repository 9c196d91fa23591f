//! A summary of the sections of a decoded module.
//!
//! This is the shape both loaders (text and binary) produce: the entity
//! descriptions a runtime needs to instantiate the module, with function
//! bodies kept as ranges into the original source rather than decoded
//! instruction lists.

use crate::features::Features;
use crate::types::{ExceptionTypeSig, FunctionType, GlobalType, MemoryType, TableType};

/// A half-open byte range into the source a module was decoded from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceRange {
    /// The offset of the first byte of the range.
    pub begin: u32,
    /// The offset one past the last byte of the range.
    pub end: u32,
}

/// The kind of an imported or exported entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExternKind {
    /// A function.
    Function,
    /// A table.
    Table,
    /// A linear memory.
    Memory,
    /// A global.
    Global,
    /// An exception type.
    ExceptionType,
}

/// The description attached to an import.
#[derive(Clone, Debug, PartialEq)]
pub enum ImportDesc {
    /// A function import, with its type index.
    Function(u32),
    /// A table import.
    Table(TableType),
    /// A memory import.
    Memory(MemoryType),
    /// A global import.
    Global(GlobalType),
    /// An exception-type import.
    ExceptionType(ExceptionTypeSig),
}

impl ImportDesc {
    /// The extern kind this import introduces.
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Function(_) => ExternKind::Function,
            Self::Table(_) => ExternKind::Table,
            Self::Memory(_) => ExternKind::Memory,
            Self::Global(_) => ExternKind::Global,
            Self::ExceptionType(_) => ExternKind::ExceptionType,
        }
    }
}

/// One import entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Import {
    /// The module namespace the import is resolved in.
    pub module: String,
    /// The name of the entity within the namespace.
    pub name: String,
    /// What is being imported.
    pub desc: ImportDesc,
}

/// One export entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Export {
    /// The exported name.
    pub name: String,
    /// The kind of entity exported.
    pub kind: ExternKind,
    /// The index of the entity in its index space.
    pub index: u32,
}

/// A function defined inside the module.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    /// Index of the function's signature in the type section.
    pub type_index: u32,
    /// The undecoded body: a range of the text source or of the binary code
    /// section entry.
    pub body: SourceRange,
}

/// A constant initializer expression, restricted to the forms the Wasm spec
/// allows in segment offsets and global initializers.
#[derive(Clone, Debug, PartialEq)]
pub enum InitExpr {
    /// An `i32.const` literal.
    I32Const(i32),
    /// An `i64.const` literal.
    I64Const(i64),
    /// An `f32.const` literal (carried as bits).
    F32Const(u32),
    /// An `f64.const` literal (carried as bits).
    F64Const(u64),
    /// A `v128.const` literal.
    V128Const(u128),
    /// A `global.get` of an imported immutable global.
    GlobalGet(u32),
    /// A `ref.null`.
    RefNull,
    /// A `ref.func` of a function index.
    RefFunc(u32),
}

/// A global defined inside the module.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalDef {
    /// The global's type.
    pub ty: GlobalType,
    /// The initializer expression, when one was decoded.
    pub init: Option<InitExpr>,
}

/// A data segment.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSegmentIr {
    /// The memory the segment initializes; `None` for passive segments.
    pub memory_index: Option<u32>,
    /// The base offset for active segments.
    pub offset: Option<InitExpr>,
    /// The raw bytes of the segment.
    pub data: Vec<u8>,
}

impl DataSegmentIr {
    /// Whether the segment is passive (only usable through `memory.init`).
    pub fn is_passive(&self) -> bool {
        self.memory_index.is_none()
    }
}

/// An element segment.
#[derive(Clone, Debug, PartialEq)]
pub struct ElemSegmentIr {
    /// The table the segment initializes; `None` for passive segments.
    pub table_index: Option<u32>,
    /// The base offset for active segments.
    pub offset: Option<InitExpr>,
    /// The function indices the segment holds.
    pub functions: Vec<u32>,
}

impl ElemSegmentIr {
    /// Whether the segment is passive (only usable through `table.init`).
    pub fn is_passive(&self) -> bool {
        self.table_index.is_none()
    }
}

/// The section summary of a decoded module.
#[derive(Clone, Debug)]
pub struct ModuleIr {
    /// The feature set the module was decoded under.
    pub features: Features,
    /// Function signatures.
    pub types: Vec<FunctionType>,
    /// Imports, in declaration order.
    pub imports: Vec<Import>,
    /// Functions defined by the module.
    pub functions: Vec<FunctionDef>,
    /// Tables defined by the module.
    pub tables: Vec<TableType>,
    /// Memories defined by the module.
    pub memories: Vec<MemoryType>,
    /// Globals defined by the module.
    pub globals: Vec<GlobalDef>,
    /// Exception types defined by the module.
    pub exception_types: Vec<ExceptionTypeSig>,
    /// Exports, in declaration order.
    pub exports: Vec<Export>,
    /// The start function index, if the module declares one.
    pub start_function: Option<u32>,
    /// Data segments.
    pub data_segments: Vec<DataSegmentIr>,
    /// Element segments.
    pub elem_segments: Vec<ElemSegmentIr>,
}

impl ModuleIr {
    /// An empty module under the given feature set.
    pub fn new(features: Features) -> Self {
        Self {
            features,
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exception_types: Vec::new(),
            exports: Vec::new(),
            start_function: None,
            data_segments: Vec::new(),
            elem_segments: Vec::new(),
        }
    }

    /// Whether the module declares no sections at all (e.g. it was decoded
    /// from a bare binary header).
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.imports.is_empty()
            && self.functions.is_empty()
            && self.tables.is_empty()
            && self.memories.is_empty()
            && self.globals.is_empty()
            && self.exception_types.is_empty()
            && self.exports.is_empty()
            && self.start_function.is_none()
            && self.data_segments.is_empty()
            && self.elem_segments.is_empty()
    }

    /// The number of function imports, which is also the index of the first
    /// module-defined function in the function index space.
    pub fn num_imported_functions(&self) -> usize {
        self.imports
            .iter()
            .filter(|import| matches!(import.desc, ImportDesc::Function(_)))
            .count()
    }

    /// The total size of each entity index space (imports followed by
    /// definitions).
    pub fn index_space_size(&self, kind: ExternKind) -> usize {
        let imported = self
            .imports
            .iter()
            .filter(|import| import.desc.kind() == kind)
            .count();
        let defined = match kind {
            ExternKind::Function => self.functions.len(),
            ExternKind::Table => self.tables.len(),
            ExternKind::Memory => self.memories.len(),
            ExternKind::Global => self.globals.len(),
            ExternKind::ExceptionType => self.exception_types.len(),
        };
        imported + defined
    }

    /// Look up a function signature through the function index space.
    pub fn function_type(&self, function_index: u32) -> Option<&FunctionType> {
        let mut remaining = function_index as usize;
        for import in &self.imports {
            if let ImportDesc::Function(type_index) = import.desc {
                if remaining == 0 {
                    return self.types.get(type_index as usize);
                }
                remaining -= 1;
            }
        }
        let def = self.functions.get(remaining)?;
        self.types.get(def.type_index as usize)
    }
}

impl Default for ModuleIr {
    fn default() -> Self {
        Self::new(Features::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mutability, Type};

    #[test]
    fn empty_module_has_no_sections() {
        assert!(ModuleIr::default().is_empty());
    }

    #[test]
    fn index_spaces_count_imports() {
        let mut module = ModuleIr::default();
        module.types.push(FunctionType::new(vec![], vec![Type::I32]));
        module.imports.push(Import {
            module: "env".to_string(),
            name: "f".to_string(),
            desc: ImportDesc::Function(0),
        });
        module.imports.push(Import {
            module: "env".to_string(),
            name: "g".to_string(),
            desc: ImportDesc::Global(GlobalType::new(Type::I32, Mutability::Const)),
        });
        module.functions.push(FunctionDef {
            type_index: 0,
            body: SourceRange::default(),
        });

        assert_eq!(module.index_space_size(ExternKind::Function), 2);
        assert_eq!(module.index_space_size(ExternKind::Global), 1);
        assert_eq!(module.num_imported_functions(), 1);
        assert!(module.function_type(1).is_some());
        assert!(module.function_type(2).is_none());
    }
}
