// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use cranelift_entity::{EntityRef, PrimaryMap};
use exec_alloc::AllocatorRegistry;
use parking_lot::Mutex;
use wasm_link::{
    DataSegment, ElementSegment, Engine, Error, Func, FuncIndex, FuncType, FunctionLoc,
    GlobalType, GlobalValType, Instance, Memory, MemoryIndex, MemoryType, Module,
    ModuleInfo, ModuleRecord, Mutability, RangeError, TableIndex, TableType, Trampoline, Trap,
    Val, ValType,
};

/// Records every call instead of running machine code, optionally trapping.
#[derive(Debug, Clone, Default)]
struct MockTrampoline {
    calls: Arc<Mutex<Vec<FuncIndex>>>,
    trap: Option<Trap>,
}

impl Trampoline for MockTrampoline {
    fn call(&self, func: &Func, _params: &[Val], results: &mut [Val]) -> Result<(), Trap> {
        self.calls.lock().push(func.index());
        if let Some(trap) = self.trap {
            return Err(trap);
        }
        for (slot, ty) in results.iter_mut().zip(func.ty().results()) {
            *slot = Val::default_for_ty(*ty);
        }
        Ok(())
    }
}

impl MockTrampoline {
    fn calls(&self) -> Vec<FuncIndex> {
        self.calls.lock().clone()
    }
}

fn engine(trampoline: &MockTrampoline) -> Engine {
    Engine::new(
        &AllocatorRegistry::with_memory_limit(None),
        trampoline.clone(),
    )
}

/// Publishes `info` with 16 bytes of code per defined function.
fn module(engine: &Engine, info: ModuleInfo) -> Module {
    let defined = info.num_defined_functions();
    let mut locs = PrimaryMap::new();
    for i in 0..defined {
        locs.push(FunctionLoc {
            start: u32::try_from(i * 16).unwrap(),
            length: 16,
        });
    }
    let text = vec![0; 16 * defined.max(1)];

    Module::new(engine, info, &text, locs).unwrap()
}

/// A module defining `n` functions of type `() -> ()`.
fn with_functions(n: usize) -> ModuleInfo {
    let mut info = ModuleInfo::default();
    let ty = info.push_type(FuncType::empty());
    for _ in 0..n {
        info.push_function(ty);
    }
    info
}

fn elements(offset: u32, functions: &[u32]) -> ElementSegment {
    ElementSegment {
        table_index: TableIndex::new(0),
        offset,
        functions: functions.iter().map(|i| FuncIndex::from_u32(*i)).collect(),
    }
}

fn data(offset: u32, bytes: &[u8]) -> DataSegment {
    DataSegment {
        memory_index: MemoryIndex::new(0),
        offset,
        data: bytes.into(),
    }
}

fn link(module: &Module) -> (ModuleRecord, Arc<Instance>) {
    let instance = Instance::new(module);
    let mut record = ModuleRecord::new("test", module);
    record.link(&instance);
    (record, instance)
}

#[test_log::test]
fn element_segment_out_of_bounds_writes_nothing() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(3);
    info.table = Some(TableType::new(4, None));
    info.elements.push(elements(2, &[0, 1, 2]));
    let module = module(&engine, info);

    let (mut record, instance) = link(&module);
    let err = record.evaluate().unwrap_err();

    assert!(err.is_range_error());
    assert!(matches!(
        err,
        Error::Range(RangeError::ElementOutOfBounds {
            offset: 2,
            len: 3,
            table_size: 4
        })
    ));

    let table = instance.table().unwrap();
    for i in 0..4 {
        assert!(table.get(i).unwrap().is_none());
    }
}

#[test]
fn element_segment_fills_consecutive_slots() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(2);
    info.table = Some(TableType::new(4, None));
    info.elements.push(elements(1, &[1, 0, 1]));
    let module = module(&engine, info);

    let (mut record, instance) = link(&module);
    record.evaluate().unwrap();

    let table = instance.table().unwrap();
    assert!(table.get(0).unwrap().is_none());
    let slots: Vec<Func> = (1..4).map(|i| table.get(i).unwrap().unwrap()).collect();
    assert_eq!(slots[0].index(), FuncIndex::new(1));
    assert_eq!(slots[1].index(), FuncIndex::new(0));
    assert!(Func::ptr_eq(&slots[0], &slots[2]));
    assert!(slots[0].name().is_none());
}

#[test]
fn earlier_segments_stay_applied() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(1);
    info.table = Some(TableType::new(2, None));
    info.elements.push(elements(0, &[0]));
    info.elements.push(elements(1, &[0, 0]));
    let module = module(&engine, info);

    let (mut record, instance) = link(&module);
    assert!(record.evaluate().unwrap_err().is_range_error());

    let table = instance.table().unwrap();
    assert!(table.get(0).unwrap().is_some());
    assert!(table.get(1).unwrap().is_none());
}

#[test]
fn table_init_with_import_is_a_range_error() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = ModuleInfo::default();
    let ty = info.push_type(FuncType::empty());
    info.push_import("env", "host", ty);
    info.push_function(ty);
    info.table = Some(TableType::new(2, None));
    info.elements.push(elements(0, &[1, 0]));
    let module = module(&engine, info);

    let (mut record, instance) = link(&module);
    let err = record.evaluate().unwrap_err();
    assert!(matches!(
        err,
        Error::Range(RangeError::TableInitWithImport { func_index }) if func_index == FuncIndex::new(0)
    ));

    let table = instance.table().unwrap();
    assert!(table.get(0).unwrap().is_none());
    assert!(table.get(1).unwrap().is_none());
}

#[test_log::test]
fn data_segment_bounds() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let evaluate = |segment: DataSegment| {
        let mut info = with_functions(0);
        info.memory = Some(MemoryType::new(0, None));
        info.data.push(segment);
        let module = module(&engine, info);

        let memory = Arc::new(Memory::with_byte_size(10));
        let instance = Instance::from_parts(&module, None, Some(memory.clone()));
        let mut record = ModuleRecord::new("data", &module);
        record.link(&instance);
        (record.evaluate(), memory)
    };

    let (res, memory) = evaluate(data(6, &[1; 5]));
    assert!(matches!(
        res,
        Err(Error::Range(RangeError::DataSegmentOutOfBounds {
            memory_size: 10,
            segment_size: 5,
            offset: 6
        }))
    ));
    assert!(memory.data().iter().all(|byte| *byte == 0));

    let (res, memory) = evaluate(data(5, &[1, 2, 3, 4, 5]));
    res.unwrap();
    assert_eq!(&*memory.data(), &[0, 0, 0, 0, 0, 1, 2, 3, 4, 5]);

    let (res, _) = evaluate(data(0, &[1; 11]));
    assert!(matches!(
        res,
        Err(Error::Range(RangeError::DataSegmentTooBig {
            memory_size: 10,
            segment_size: 11,
            offset: 0
        }))
    ));

    let (res, memory) = evaluate(data(u32::MAX, &[]));
    res.unwrap();
    assert!(memory.data().iter().all(|byte| *byte == 0));
}

#[test]
#[should_panic(expected = "has data segments but no memory")]
fn data_segments_without_memory() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(0);
    info.data.push(data(0, &[1]));
    let module = module(&engine, info);

    let (mut record, _instance) = link(&module);
    let _ = record.evaluate();
}

#[test]
fn exported_globals_are_snapshots() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(0);
    let answer = info.push_global(
        GlobalType::new(GlobalValType::I32, Mutability::Const),
        Val::I32(42),
    );
    let pi = info.push_global(
        GlobalType::new(GlobalValType::F64, Mutability::Const),
        Val::from(core::f64::consts::PI),
    );
    info.push_export("answer", answer);
    info.push_export("pi", pi);
    let module = module(&engine, info);

    let (record, instance) = link(&module);
    instance.store_global(answer, Val::I32(7));

    assert_eq!(instance.load_global(answer), Val::I32(7));
    assert_eq!(
        record.get_export("answer").unwrap().unwrap_global(),
        Val::I32(42)
    );
    assert_eq!(
        record.get_export("pi").unwrap().unwrap_global(),
        Val::from(core::f64::consts::PI)
    );
}

#[test]
#[should_panic(expected = "exporting mutable global")]
fn mutable_global_exports_are_rejected() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(0);
    let counter = info.push_global(
        GlobalType::new(GlobalValType::I32, Mutability::Var),
        Val::I32(0),
    );
    info.push_export("counter", counter);
    let module = module(&engine, info);

    link(&module);
}

#[test]
fn exports_table_and_memory() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(0);
    info.table = Some(TableType::new(1, None));
    info.memory = Some(MemoryType::new(1, None));
    info.push_export("table", TableIndex::new(0));
    info.push_export("memory", MemoryIndex::new(0));
    let module = module(&engine, info);

    let (record, instance) = link(&module);
    assert_eq!(record.exports().len(), 2);
    assert!(Arc::ptr_eq(
        record.get_export("table").unwrap().unwrap_table(),
        instance.table().unwrap()
    ));
    assert!(Arc::ptr_eq(
        record.get_export("memory").unwrap().unwrap_memory(),
        instance.memory().unwrap()
    ));
    assert!(record.get_export("missing").is_none());
}

#[test_log::test]
fn exported_start_function_is_shared() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(2);
    info.push_export("main", FuncIndex::new(1));
    info.start = Some(FuncIndex::new(1));
    let module = module(&engine, info);

    let mut record = ModuleRecord::new("app", &module);
    assert_eq!(record.export_entries(), &[Arc::<str>::from("main")]);
    assert!(!record.is_linked());
    assert!(record.start_function().is_none());

    let instance = Instance::new(&module);
    record.link(&instance);
    assert!(record.is_linked());

    let main = record.get_export("main").unwrap().unwrap_func();
    let start = record.start_function().unwrap();
    assert!(Func::ptr_eq(main, start));
    assert_eq!(start.name(), Some("main"));
    assert!(trampoline.calls().is_empty());

    record.evaluate().unwrap();
    assert_eq!(trampoline.calls(), vec![FuncIndex::new(1)]);
}

#[test]
fn unexported_start_function_is_resolved_at_link() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(1);
    info.start = Some(FuncIndex::new(0));
    let module = module(&engine, info);

    let (mut record, _instance) = link(&module);
    let start = record.start_function().unwrap();
    assert!(start.name().is_none());
    assert_eq!(start.index(), FuncIndex::new(0));

    record.evaluate().unwrap();
    assert_eq!(trampoline.calls().len(), 1);
}

#[test]
fn start_function_runs_after_segments() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(1);
    info.table = Some(TableType::new(1, None));
    info.elements.push(elements(1, &[0]));
    info.start = Some(FuncIndex::new(0));
    let module = module(&engine, info);

    let (mut record, _instance) = link(&module);
    assert!(record.evaluate().unwrap_err().is_range_error());
    assert!(trampoline.calls().is_empty());
}

#[test]
fn start_function_trap_propagates() {
    let trampoline = MockTrampoline {
        trap: Some(Trap::UnreachableCodeReached),
        ..MockTrampoline::default()
    };
    let engine = engine(&trampoline);

    let mut info = with_functions(1);
    info.start = Some(FuncIndex::new(0));
    let module = module(&engine, info);

    let (mut record, _instance) = link(&module);
    let err = record.evaluate().unwrap_err();
    assert!(!err.is_range_error());
    assert_eq!(err.as_trap(), Some(Trap::UnreachableCodeReached));
}

#[test]
fn exported_function_and_table_slot_share_a_wrapper() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(1);
    info.table = Some(TableType::new(2, None));
    info.elements.push(elements(1, &[0]));
    info.push_export("f", FuncIndex::new(0));
    let module = module(&engine, info);

    let (mut record, instance) = link(&module);
    record.evaluate().unwrap();

    let exported = record.get_export("f").unwrap().unwrap_func();
    let slot = instance.table().unwrap().get(1).unwrap().unwrap();
    assert!(Func::ptr_eq(exported, &slot));
    assert_eq!(slot.name(), Some("f"));
}

#[test]
fn calls_are_typechecked() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = ModuleInfo::default();
    let ty = info.push_type(FuncType::new([ValType::I32], [ValType::I64]));
    let add = info.push_function(ty);
    info.push_export("add", add);
    let module = module(&engine, info);

    let (record, instance) = link(&module);
    let add = record.get_export("add").unwrap().unwrap_func().clone();
    assert_eq!(add.param_count(), 1);

    let mut results = [Val::I32(0)];
    assert!(matches!(
        add.call(&[Val::I64(1)], &mut results),
        Err(Error::TypeMismatch(_))
    ));
    assert!(matches!(
        add.call(&[], &mut results),
        Err(Error::TypeMismatch(_))
    ));
    assert!(trampoline.calls().is_empty());

    add.call(&[Val::I32(1)], &mut results).unwrap();
    assert_eq!(results, [Val::I64(0)]);

    drop(record);
    drop(instance);
    assert!(matches!(
        add.call(&[Val::I32(1)], &mut results),
        Err(Error::InstanceDropped { .. })
    ));
}

#[test]
#[should_panic(expected = "already linked")]
fn linking_twice() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);
    let module = module(&engine, with_functions(0));

    let (mut record, instance) = link(&module);
    record.link(&instance);
}

#[test]
#[should_panic(expected = "must be linked before evaluation")]
fn evaluating_before_linking() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);
    let module = module(&engine, with_functions(0));

    let mut record = ModuleRecord::new("early", &module);
    let _ = record.evaluate();
}

#[test]
#[should_panic(expected = "already evaluated")]
fn evaluating_twice() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = with_functions(1);
    info.start = Some(FuncIndex::new(0));
    let module = module(&engine, info);

    let (mut record, _instance) = link(&module);
    record.evaluate().unwrap();
    let _ = record.evaluate();
}

#[test]
#[should_panic(expected = "re-exporting an import is not implemented")]
fn reexporting_an_import() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);

    let mut info = ModuleInfo::default();
    let ty = info.push_type(FuncType::empty());
    let host = info.push_import("env", "host", ty);
    info.push_export("host", host);
    let module = module(&engine, info);

    link(&module);
}

#[test]
#[should_panic(expected = "cannot be linked into the record of module")]
fn instance_of_another_module() {
    let trampoline = MockTrampoline::default();
    let engine = engine(&trampoline);
    let a = module(&engine, with_functions(0));
    let b = module(&engine, with_functions(0));

    let mut record = ModuleRecord::new("a", &a);
    record.link(&Instance::new(&b));
}
