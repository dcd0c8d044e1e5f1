use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Module, ShaderStage};

use simple_ocr::ops::device::{Access, KernelSource};
use simple_ocr::ops::kernels::{LINEAR, OUTER_PRODUCT, SIGMOID, SIGMOID_BACKWARD, SOFTMAX};

const CATALOG: [&KernelSource; 5] = [&LINEAR, &SIGMOID, &SOFTMAX, &OUTER_PRODUCT, &SIGMOID_BACKWARD];

fn compile(kernel: &KernelSource) -> Module {
    let module = naga::front::wgsl::parse_str(kernel.wgsl)
        .unwrap_or_else(|e| panic!("{}: {}", kernel.name, e.emit_to_string(kernel.wgsl)));
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .unwrap_or_else(|e| panic!("{}: {e:?}", kernel.name));
    module
}

#[test]
fn test_every_kernel_compiles() {
    for kernel in CATALOG {
        compile(kernel);
    }
}

#[test]
fn test_entry_point_matches_declared_workgroup() {
    for kernel in CATALOG {
        let module = compile(kernel);
        let [entry] = module.entry_points.as_slice() else {
            panic!("{}: expected exactly one entry point", kernel.name);
        };
        assert_eq!(entry.name, "main", "{}", kernel.name);
        assert_eq!(entry.stage, ShaderStage::Compute, "{}", kernel.name);
        assert_eq!(entry.workgroup_size, [kernel.workgroup_size, 1, 1], "{}", kernel.name);
    }
}

#[test]
fn test_bindings_match_declared_slots() {
    for kernel in CATALOG {
        let module = compile(kernel);
        let mut bound: Vec<(u32, AddressSpace)> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref().map(|b| (b.group, b.binding, var.space)))
            .map(|(group, binding, space)| {
                assert_eq!(group, 0, "{}", kernel.name);
                (binding, space)
            })
            .collect();
        bound.sort_by_key(|&(binding, _)| binding);

        assert_eq!(bound.len(), kernel.slots.len() + 1, "{}", kernel.name);
        assert_eq!(bound[0], (0, AddressSpace::Uniform), "{}: params block", kernel.name);
        for (&(binding, space), (slot, access)) in bound[1..].iter().zip(kernel.slots.iter().enumerate()) {
            assert_eq!(binding as usize, slot + 1, "{}", kernel.name);
            let AddressSpace::Storage { access: storage } = space else {
                panic!("{}: binding {binding} is not a storage buffer", kernel.name);
            };
            let writable = storage.contains(naga::StorageAccess::STORE);
            assert_eq!(writable, *access == Access::Writable, "{}: binding {binding}", kernel.name);
        }
    }
}
