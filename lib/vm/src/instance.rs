//! Module instances: realized modules with their own entity vectors.

use crate::compartment::{Compartment, CompartmentError};
use crate::exception::ExceptionType;
use crate::function::Function;
use crate::global::Global;
use crate::memory::Memory;
use crate::objects::{GcHeader, Object, ObjectKind};
use crate::quota::ResourceQuotaRef;
use crate::table::Table;
use crate::trap::Trap;
use breakwater_types::{ElemSegmentIr, ModuleIr, TrapCode};
use indexmap::IndexMap;
use std::sync::{Arc, RwLock};

/// A compiled module: the IR summary it was compiled from plus the object
/// code the JIT produced. Functions compare their JIT module by identity to
/// decide compartment membership.
pub struct JitModule {
    /// The module IR the code was compiled from.
    pub ir: ModuleIr,
    /// The generated object code.
    pub object_code: Vec<u8>,
}

impl JitModule {
    /// Pair a module IR with its generated code.
    pub fn new(ir: ModuleIr, object_code: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { ir, object_code })
    }
}

impl std::fmt::Debug for JitModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitModule")
            .field("object_code_len", &self.object_code.len())
            .finish_non_exhaustive()
    }
}

/// Everything an instance is built from. The runtime entities must already
/// be registered in the compartment the instance is created in.
pub struct InstanceInit {
    /// The instance's debug name.
    pub debug_name: String,
    /// Exported objects by name.
    pub export_map: IndexMap<String, Object>,
    /// Exported objects in declaration order.
    pub exports: Vec<Object>,
    /// The function index space (imports followed by definitions).
    pub functions: Vec<Arc<Function>>,
    /// The table index space.
    pub tables: Vec<Arc<Table>>,
    /// The memory index space.
    pub memories: Vec<Arc<Memory>>,
    /// The global index space.
    pub globals: Vec<Arc<Global>>,
    /// The exception-type index space.
    pub exception_types: Vec<Arc<ExceptionType>>,
    /// The start function, if the module declares one.
    pub start_function: Option<Arc<Function>>,
    /// Passive and active data segment contents.
    pub data_segments: Vec<Arc<Vec<u8>>>,
    /// Passive and active element segment contents.
    pub elem_segments: Vec<Arc<ElemSegmentIr>>,
    /// The JIT module holding the instance's code.
    pub jit_module: Arc<JitModule>,
    /// The quota charged by the instance's memories and tables.
    pub quota: ResourceQuotaRef,
}

/// An instance of a WebAssembly module.
pub struct Instance {
    header: GcHeader,
    id: usize,
    debug_name: String,

    export_map: IndexMap<String, Object>,
    exports: Vec<Object>,

    functions: Vec<Arc<Function>>,
    tables: Vec<Arc<Table>>,
    memories: Vec<Arc<Memory>>,
    globals: Vec<Arc<Global>>,
    exception_types: Vec<Arc<ExceptionType>>,

    start_function: Option<Arc<Function>>,

    // Written when a segment is dropped; read by the init intrinsics.
    data_segments: RwLock<Vec<Option<Arc<Vec<u8>>>>>,
    elem_segments: RwLock<Vec<Option<Arc<ElemSegmentIr>>>>,

    jit_module: Arc<JitModule>,

    quota: ResourceQuotaRef,
}

impl Instance {
    /// Create an instance in `compartment` and register it under a fresh id.
    pub fn new(
        compartment: &Arc<Compartment>,
        init: InstanceInit,
    ) -> Result<Arc<Self>, CompartmentError> {
        Self::create(compartment, init, None)
    }

    fn create(
        compartment: &Arc<Compartment>,
        init: InstanceInit,
        explicit_id: Option<usize>,
    ) -> Result<Arc<Self>, CompartmentError> {
        let mut maps = compartment.maps.write().unwrap();
        let id = match explicit_id {
            Some(id) => id,
            None => maps
                .instances
                .next_free_id()
                .ok_or(CompartmentError::IndexSpaceExhausted(ObjectKind::Instance))?,
        };

        let instance = Arc::new(Self {
            header: GcHeader::new(ObjectKind::Instance, compartment),
            id,
            debug_name: init.debug_name,
            export_map: init.export_map,
            exports: init.exports,
            functions: init.functions,
            tables: init.tables,
            memories: init.memories,
            globals: init.globals,
            exception_types: init.exception_types,
            start_function: init.start_function,
            data_segments: RwLock::new(init.data_segments.into_iter().map(Some).collect()),
            elem_segments: RwLock::new(init.elem_segments.into_iter().map(Some).collect()),
            jit_module: init.jit_module,
            quota: init.quota,
        });

        if !maps.instances.insert_at(id, instance.clone()) {
            return Err(CompartmentError::IndexSpaceExhausted(ObjectKind::Instance));
        }
        Ok(instance)
    }

    /// Clone this instance into another compartment, preserving its id.
    ///
    /// Entity references are remapped to the counterparts already cloned
    /// into the new compartment; functions and segment contents are shared.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Arc<Compartment>,
    ) -> Result<Arc<Self>, CompartmentError> {
        let remap = |object: &Object| -> Object {
            crate::compartment::remap_to_cloned_compartment(object, new_compartment)
        };

        let export_map = self
            .export_map
            .iter()
            .map(|(name, object)| (name.clone(), remap(object)))
            .collect();
        let exports = self.exports.iter().map(|o| remap(o)).collect();

        let tables = self
            .tables
            .iter()
            .map(|table| match remap(&Object::Table(table.clone())) {
                Object::Table(new_table) => new_table,
                _ => unreachable!(),
            })
            .collect();
        let memories = self
            .memories
            .iter()
            .map(|memory| match remap(&Object::Memory(memory.clone())) {
                Object::Memory(new_memory) => new_memory,
                _ => unreachable!(),
            })
            .collect();
        let globals = self
            .globals
            .iter()
            .map(|global| match remap(&Object::Global(global.clone())) {
                Object::Global(new_global) => new_global,
                _ => unreachable!(),
            })
            .collect();
        let exception_types = self
            .exception_types
            .iter()
            .map(
                |exception_type| match remap(&Object::ExceptionType(exception_type.clone())) {
                    Object::ExceptionType(new_exception_type) => new_exception_type,
                    _ => unreachable!(),
                },
            )
            .collect();

        // Segment contents are shared with the source instance. Dropped
        // slots must stay dropped (and keep their indices) in the clone.
        let data_segments: Vec<Option<Arc<Vec<u8>>>> =
            self.data_segments.read().unwrap().clone();
        let elem_segments: Vec<Option<Arc<ElemSegmentIr>>> =
            self.elem_segments.read().unwrap().clone();

        let init = InstanceInit {
            debug_name: self.debug_name.clone(),
            export_map,
            exports,
            functions: self.functions.clone(),
            tables,
            memories,
            globals,
            exception_types,
            start_function: self.start_function.clone(),
            data_segments: Vec::new(),
            elem_segments: Vec::new(),
            jit_module: self.jit_module.clone(),
            quota: self.quota.clone(),
        };
        let new_instance = Self::create(new_compartment, init, Some(self.id))?;
        *new_instance.data_segments.write().unwrap() = data_segments;
        *new_instance.elem_segments.write().unwrap() = elem_segments;
        Ok(new_instance)
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The instance's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The instance's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<&Object> {
        self.export_map.get(name)
    }

    /// Exported objects in declaration order.
    pub fn exports(&self) -> &[Object] {
        &self.exports
    }

    /// The instance's function index space.
    pub fn functions(&self) -> &[Arc<Function>] {
        &self.functions
    }

    /// The instance's table index space.
    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    /// The instance's memory index space.
    pub fn memories(&self) -> &[Arc<Memory>] {
        &self.memories
    }

    /// The instance's global index space.
    pub fn globals(&self) -> &[Arc<Global>] {
        &self.globals
    }

    /// The instance's exception-type index space.
    pub fn exception_types(&self) -> &[Arc<ExceptionType>] {
        &self.exception_types
    }

    /// The start function, if the module declares one.
    pub fn start_function(&self) -> Option<&Arc<Function>> {
        self.start_function.as_ref()
    }

    /// The JIT module holding the instance's code.
    pub fn jit_module(&self) -> &Arc<JitModule> {
        &self.jit_module
    }

    /// Drop a data segment, releasing its contents. Dropping a segment
    /// twice is an invalid argument, as is an out-of-range index.
    pub fn drop_data_segment(&self, index: u32) -> Result<(), Trap> {
        let mut segments = self.data_segments.write().unwrap();
        match segments.get_mut(index as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Trap::new(TrapCode::InvalidArgument)),
        }
    }

    /// Drop an element segment. Dropping a segment twice is an invalid
    /// argument, as is an out-of-range index.
    pub fn drop_elem_segment(&self, index: u32) -> Result<(), Trap> {
        let mut segments = self.elem_segments.write().unwrap();
        match segments.get_mut(index as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Trap::new(TrapCode::InvalidArgument)),
        }
    }

    /// Initialize a range of `memory` from a data segment, equivalent to
    /// executing a `memory.init` instruction.
    pub fn init_data_segment(
        &self,
        data_segment_index: u32,
        memory: &Memory,
        dest_address: usize,
        source_offset: usize,
        num_bytes: usize,
    ) -> Result<(), Trap> {
        let segments = self.data_segments.read().unwrap();
        let segment = segments
            .get(data_segment_index as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| Trap::new(TrapCode::InvalidArgument))?;

        let source_end = source_offset
            .checked_add(num_bytes)
            .ok_or_else(|| Trap::new(TrapCode::OutOfBoundsDataSegmentAccess))?;
        if source_end > segment.len() {
            return Err(Trap::new(TrapCode::OutOfBoundsDataSegmentAccess));
        }

        let memory_bytes = memory.num_pages().bytes().0;
        let dest_end = dest_address
            .checked_add(num_bytes)
            .ok_or_else(|| Trap::new(TrapCode::OutOfBoundsMemoryAccess))?;
        if dest_end > memory_bytes {
            return Err(Trap::new(TrapCode::OutOfBoundsMemoryAccess));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                segment.as_ptr().add(source_offset),
                memory.base_address().add(dest_address),
                num_bytes,
            );
        }
        Ok(())
    }

    /// Initialize a range of `table` from an element segment, equivalent to
    /// executing a `table.init` instruction.
    pub fn init_elem_segment(
        &self,
        elem_segment_index: u32,
        table: &Table,
        dest_offset: u32,
        source_offset: usize,
        num_elems: usize,
    ) -> Result<(), Trap> {
        let segments = self.elem_segments.read().unwrap();
        let segment = segments
            .get(elem_segment_index as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| Trap::new(TrapCode::InvalidArgument))?;

        let source_end = source_offset
            .checked_add(num_elems)
            .ok_or_else(|| Trap::new(TrapCode::OutOfBoundsElemSegmentAccess))?;
        if source_end > segment.functions.len() {
            return Err(Trap::new(TrapCode::OutOfBoundsElemSegmentAccess));
        }

        for i in 0..num_elems {
            let function_index = segment.functions[source_offset + i];
            let function = self
                .functions
                .get(function_index as usize)
                .ok_or_else(|| Trap::new(TrapCode::InvalidArgument))?;
            table.set(dest_offset + i as u32, function)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .field("exports", &self.export_map.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
