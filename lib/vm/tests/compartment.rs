//! Compartment lifecycle, cloning and remapping.

use breakwater_types::{
    ExceptionTypeSig, GlobalType, MemoryType, Mutability, Pages, TableType, Type,
};
use breakwater_vm::{
    clone_compartment, is_in_compartment, remap_to_cloned_compartment, Compartment, ExceptionType,
    Function, Global, Instance, InstanceInit, JitModule, Memory, Object, Table,
};
use indexmap::IndexMap;
use std::sync::Arc;

fn memory_type(minimum: u32) -> MemoryType {
    MemoryType::new(Pages(minimum), None, false)
}

fn table_type(minimum: u32) -> TableType {
    TableType::new(Type::FuncRef, minimum, Some(minimum + 16))
}

fn empty_instance(compartment: &Arc<Compartment>, jit_module: Arc<JitModule>) -> Arc<Instance> {
    Instance::new(
        compartment,
        InstanceInit {
            debug_name: "test".to_string(),
            export_map: IndexMap::new(),
            exports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exception_types: Vec::new(),
            start_function: None,
            data_segments: Vec::new(),
            elem_segments: Vec::new(),
            jit_module,
            quota: None,
        },
    )
    .unwrap()
}

#[test]
fn clone_preserves_ids_with_distinct_allocations() {
    let compartment = Compartment::new().unwrap();
    let memory0 = Memory::new(&compartment, &memory_type(1), "m0", None).unwrap();
    let memory1 = Memory::new(&compartment, &memory_type(2), "m1", None).unwrap();
    assert_eq!(memory0.id(), 0);
    assert_eq!(memory1.id(), 1);

    // Leave a recognizable byte in memory 1.
    unsafe { *memory1.base_address() = 0xbe };

    let cloned = clone_compartment(&compartment).unwrap();
    let cloned_memory0 = match cloned.lookup(breakwater_vm::ObjectKind::Memory, 0) {
        Some(Object::Memory(memory)) => memory,
        other => panic!("unexpected {other:?}"),
    };
    let cloned_memory1 = match cloned.lookup(breakwater_vm::ObjectKind::Memory, 1) {
        Some(Object::Memory(memory)) => memory,
        other => panic!("unexpected {other:?}"),
    };

    assert_eq!(cloned_memory0.id(), 0);
    assert_eq!(cloned_memory1.id(), 1);
    assert!(!Arc::ptr_eq(&memory0, &cloned_memory0));
    assert_ne!(memory0.base_address(), cloned_memory0.base_address());

    // The clone is a snapshot of the contents.
    assert_eq!(unsafe { *cloned_memory1.base_address() }, 0xbe);
    unsafe { *memory1.base_address() = 0x11 };
    assert_eq!(unsafe { *cloned_memory1.base_address() }, 0xbe);
}

#[test]
fn clone_preserves_mutable_global_indices() {
    let compartment = Compartment::new().unwrap();
    let global_a = Global::new(
        &compartment,
        GlobalType::new(Type::I32, Mutability::Var),
        "a",
    )
    .unwrap();
    let global_b = Global::new(
        &compartment,
        GlobalType::new(Type::I64, Mutability::Var),
        "b",
    )
    .unwrap();
    global_b.initialize(99).unwrap();

    let cloned = clone_compartment(&compartment).unwrap();
    for original in [&global_a, &global_b] {
        let counterpart =
            match remap_to_cloned_compartment(&Object::Global(Arc::clone(original)), &cloned) {
                Object::Global(global) => global,
                other => panic!("unexpected {other:?}"),
            };
        assert_eq!(counterpart.id(), original.id());
        assert_eq!(
            counterpart.mutable_global_index(),
            original.mutable_global_index()
        );
    }
}

#[test]
fn clone_preserves_table_elements() {
    let compartment = Compartment::new().unwrap();
    let table = Table::new(&compartment, &table_type(4), "t", None).unwrap();
    let function = Function::new_unowned("element");
    table.set(2, &function).unwrap();

    let cloned = clone_compartment(&compartment).unwrap();
    let cloned_table = match remap_to_cloned_compartment(&Object::Table(table.clone()), &cloned) {
        Object::Table(table) => table,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(cloned_table.get(2).unwrap(), Some(Arc::as_ptr(&function)));
    assert_eq!(cloned_table.get(0).unwrap(), None);
}

#[test]
fn remap_round_trips() {
    let compartment = Compartment::new().unwrap();
    let memory = Memory::new(&compartment, &memory_type(0), "m", None).unwrap();
    let table = Table::new(&compartment, &table_type(0), "t", None).unwrap();
    let exception_type =
        ExceptionType::new(&compartment, ExceptionTypeSig::default(), "e").unwrap();
    let jit_module = JitModule::new(Default::default(), Vec::new());
    let instance = empty_instance(&compartment, jit_module);

    let cloned = clone_compartment(&compartment).unwrap();
    for object in [
        Object::Memory(memory),
        Object::Table(table),
        Object::ExceptionType(exception_type),
        Object::Instance(instance),
    ] {
        let there = remap_to_cloned_compartment(&object, &cloned);
        assert!(!there.ptr_eq(&object));
        let back = remap_to_cloned_compartment(&there, &compartment);
        assert!(back.ptr_eq(&object), "{object:?} did not round-trip");
    }

    // Functions remap to themselves.
    let function = Object::Function(Function::new_unowned("f"));
    let remapped = remap_to_cloned_compartment(&function, &cloned);
    assert!(remapped.ptr_eq(&function));
}

#[test]
fn contexts_and_foreigns_are_not_cloned() {
    let compartment = Compartment::new().unwrap();
    let _context = breakwater_vm::Context::new(&compartment).unwrap();
    let _foreign = breakwater_vm::Foreign::new(&compartment).unwrap();

    let cloned = clone_compartment(&compartment).unwrap();
    assert!(cloned
        .lookup(breakwater_vm::ObjectKind::Context, 0)
        .is_none());
    assert!(cloned
        .lookup(breakwater_vm::ObjectKind::Foreign, 0)
        .is_none());
}

#[test]
fn function_membership_follows_the_jit_module() {
    let compartment = Compartment::new().unwrap();
    let jit_module = JitModule::new(Default::default(), Vec::new());
    let instance = empty_instance(&compartment, jit_module.clone());

    let function = Function::new(
        "f",
        instance.id(),
        breakwater_types::TypeEncoding(1),
        Some(jit_module.clone()),
    );
    let object = Object::Function(function);
    assert!(is_in_compartment(&object, &compartment));

    // A compartment whose instance of that id uses a different JIT module
    // does not contain the function.
    let other_compartment = Compartment::new().unwrap();
    let other_jit_module = JitModule::new(Default::default(), Vec::new());
    let _other_instance = empty_instance(&other_compartment, other_jit_module);
    assert!(!is_in_compartment(&object, &other_compartment));

    // But a clone of the original compartment shares the instance's JIT
    // module, so the function is in both.
    let cloned = clone_compartment(&compartment).unwrap();
    assert!(is_in_compartment(&object, &cloned));

    // Functions with no instance are in every compartment.
    let unowned = Object::Function(Function::new_unowned("host"));
    assert!(is_in_compartment(&unowned, &compartment));
    assert!(is_in_compartment(&unowned, &other_compartment));
}

#[test]
fn non_function_membership_is_identity() {
    let compartment = Compartment::new().unwrap();
    let other = Compartment::new().unwrap();
    let memory = Object::Memory(Memory::new(&compartment, &memory_type(0), "m", None).unwrap());
    assert!(is_in_compartment(&memory, &compartment));
    assert!(!is_in_compartment(&memory, &other));
}

#[test]
fn lookup_agrees_with_object_ids() {
    let compartment = Compartment::new().unwrap();
    let table = Table::new(&compartment, &table_type(1), "t", None).unwrap();
    let found = compartment
        .lookup(breakwater_vm::ObjectKind::Table, table.id())
        .unwrap();
    assert!(found.ptr_eq(&Object::Table(table)));
}

#[test]
fn removal_frees_the_id_for_reuse() {
    let compartment = Compartment::new().unwrap();
    let memory0 = Memory::new(&compartment, &memory_type(0), "m0", None).unwrap();
    let _memory1 = Memory::new(&compartment, &memory_type(0), "m1", None).unwrap();

    compartment.remove_object(&Object::Memory(memory0));
    let memory2 = Memory::new(&compartment, &memory_type(0), "m2", None).unwrap();
    assert_eq!(memory2.id(), 0);
}

#[test]
fn destroyability_requires_empty_maps() {
    let compartment = Compartment::new().unwrap();
    let memory = Memory::new(&compartment, &memory_type(0), "m", None).unwrap();
    assert!(compartment.assert_destroyable().is_err());
    compartment.remove_object(&Object::Memory(memory));
    assert!(compartment.assert_destroyable().is_ok());
}

#[test]
fn instances_clone_with_remapped_exports() {
    let compartment = Compartment::new().unwrap();
    let memory = Memory::new(&compartment, &memory_type(1), "m", None).unwrap();
    let jit_module = JitModule::new(Default::default(), Vec::new());

    let mut export_map = IndexMap::new();
    export_map.insert("mem".to_string(), Object::Memory(memory.clone()));
    let instance = Instance::new(
        &compartment,
        InstanceInit {
            debug_name: "inst".to_string(),
            export_map,
            exports: vec![Object::Memory(memory.clone())],
            functions: Vec::new(),
            tables: Vec::new(),
            memories: vec![memory.clone()],
            globals: Vec::new(),
            exception_types: Vec::new(),
            start_function: None,
            data_segments: vec![Arc::new(b"seed".to_vec())],
            elem_segments: Vec::new(),
            jit_module: jit_module.clone(),
            quota: None,
        },
    )
    .unwrap();

    let cloned = clone_compartment(&compartment).unwrap();
    let cloned_instance =
        match remap_to_cloned_compartment(&Object::Instance(instance.clone()), &cloned) {
            Object::Instance(instance) => instance,
            other => panic!("unexpected {other:?}"),
        };

    assert_eq!(cloned_instance.id(), instance.id());
    assert!(Arc::ptr_eq(cloned_instance.jit_module(), &jit_module));

    // The cloned instance's export points at the cloned memory, not the
    // original.
    let exported = match cloned_instance.export("mem") {
        Some(Object::Memory(memory)) => memory.clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(exported.id(), memory.id());
    assert!(!Arc::ptr_eq(&exported, &memory));
}

#[test]
fn segment_drops_are_sticky() {
    let compartment = Compartment::new().unwrap();
    let jit_module = JitModule::new(Default::default(), Vec::new());
    let instance = Instance::new(
        &compartment,
        InstanceInit {
            debug_name: "inst".to_string(),
            export_map: IndexMap::new(),
            exports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exception_types: Vec::new(),
            start_function: None,
            data_segments: vec![Arc::new(vec![1, 2, 3])],
            elem_segments: Vec::new(),
            jit_module,
            quota: None,
        },
    )
    .unwrap();

    instance.drop_data_segment(0).unwrap();
    assert!(instance.drop_data_segment(0).is_err());

    let memory = Memory::new(&compartment, &memory_type(1), "m", None).unwrap();
    assert!(instance.init_data_segment(0, &memory, 0, 0, 1).is_err());
}
