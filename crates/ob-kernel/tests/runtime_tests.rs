//! Boot and linking scenarios on synthetic modules

use ob_core::Config;
use ob_kernel::sync::Queue;
use ob_kernel::{Object, ObjectKind, ObjectType, Runtime};
use ob_loader::testing::ImageBuilder;
use ob_loader::Module;
use std::path::Path;
use std::sync::Arc;

fn write_system_modules(dir: &Path) {
    ImageBuilder::new("libkernel").entry(0x10).write_to(dir).unwrap();
    ImageBuilder::new("libSceLibcInternal").write_to(dir).unwrap();
}

fn order_of(runtime: &Runtime, name: &str) -> u32 {
    let object = runtime.find_module_by_name(name).unwrap();
    object.as_module().map(Module::order).unwrap()
}

#[test]
fn test_boot_orders_modules() {
    let dir = tempfile::tempdir().unwrap();
    write_system_modules(dir.path());
    ImageBuilder::new("libbar").write_to(dir.path()).unwrap();
    ImageBuilder::new("libfoo").needed("libbar.prx").write_to(dir.path()).unwrap();
    let eboot = ImageBuilder::new("eboot")
        .executable()
        .needed("libfoo.prx")
        .write_to(dir.path())
        .unwrap();

    let runtime = Runtime::new(Config::default());
    runtime.load_executable(&eboot).unwrap();
    runtime.process_needed_and_relocate().unwrap();

    assert_eq!(order_of(&runtime, "libkernel.prx"), 1);
    assert_eq!(order_of(&runtime, "libSceLibcInternal.prx"), 2);
    assert_eq!(order_of(&runtime, "libbar.prx"), 3);
    assert!(order_of(&runtime, "libfoo.prx") > order_of(&runtime, "libbar.prx"));
    assert!(order_of(&runtime, "eboot.prx") > order_of(&runtime, "libfoo.prx"));

    let kernel = runtime.find_module_by_name("libkernel.prx").unwrap();
    assert_eq!(runtime.entry_point(), kernel.as_module().unwrap().entry_point());

    let names: Vec<String> = runtime
        .modules()
        .iter()
        .filter_map(|o| o.as_module().map(|m| m.name().to_string()))
        .collect();
    assert_eq!(names[..2], ["libkernel.prx".to_string(), "libSceLibcInternal.prx".to_string()]);
}

#[test]
fn test_missing_needed_module_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_system_modules(dir.path());
    let eboot = ImageBuilder::new("eboot")
        .executable()
        .needed("libmissing.prx")
        .write_to(dir.path())
        .unwrap();

    let runtime = Runtime::new(Config::default());
    runtime.load_executable(&eboot).unwrap();
    runtime.process_needed_and_relocate().unwrap();
    assert!(runtime.find_module_by_name("libmissing.prx").is_none());
    assert_eq!(runtime.modules().len(), 3);
}

#[test]
fn test_missing_system_module_fails_boot() {
    let dir = tempfile::tempdir().unwrap();
    ImageBuilder::new("libkernel").write_to(dir.path()).unwrap();
    let eboot = ImageBuilder::new("eboot").executable().write_to(dir.path()).unwrap();

    let runtime = Runtime::new(Config::default());
    assert!(runtime.load_executable(&eboot).is_err());
    assert!(runtime.boot_module().is_none());
    assert!(runtime.object_table().all_objects().is_empty());
}

#[test]
fn test_system_modules_found_in_system_dir() {
    let dir = tempfile::tempdir().unwrap();
    let system_dir = dir.path().join("uplift_sys");
    std::fs::create_dir(&system_dir).unwrap();
    write_system_modules(&system_dir);
    let eboot = ImageBuilder::new("eboot").executable().write_to(dir.path()).unwrap();

    let runtime = Runtime::new(Config::default());
    runtime.load_executable(&eboot).unwrap();
    assert!(runtime.find_module_by_name("libkernel.prx").is_some());
    assert_eq!(runtime.progname(), "eboot.prx");
}

#[test]
fn test_object_table_grows() {
    let runtime = Runtime::new(Config::default());
    let table = runtime.object_table();

    let handles: Vec<u32> = (0..20_000)
        .map(|_| table.add(Object::new(ObjectKind::Queue(Queue::new()))).unwrap())
        .collect();
    assert!(table.capacity() >= 32768);
    assert!(handles.iter().all(|&h| h != 0 && h & 3 == 0));

    for handle in handles.iter().step_by(2) {
        table.release(*handle).unwrap();
    }
    assert_eq!(table.objects_by_type(ObjectType::Queue).len(), 10_000);
    for handle in handles.iter().skip(1).step_by(2) {
        assert!(table.lookup(*handle).is_some());
    }

    let object: Arc<Object> = Object::new(ObjectKind::Queue(Queue::new()));
    let handle = table.add(object).unwrap();
    assert!(table.lookup(handle).is_some());
}

#[test]
fn test_module_fsbase_slot_is_shared_between_threads() {
    let dir = tempfile::tempdir().unwrap();
    write_system_modules(dir.path());
    let eboot = ImageBuilder::new("eboot").executable().write_to(dir.path()).unwrap();

    let runtime = Runtime::new(Config::default());
    runtime.load_executable(&eboot).unwrap();

    runtime.set_fsbase(0x1000);
    std::thread::scope(|s| s.spawn(|| runtime.set_fsbase(0x2000)).join().unwrap());

    assert_eq!(runtime.fsbase(), 0x1000);
    for object in runtime.modules() {
        assert_eq!(object.as_module().unwrap().fsbase(), 0x2000);
    }
}
