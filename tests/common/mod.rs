//! Shared test helpers for integration tests

use quicksilver_jit::bytecode::{BytecodeBuilder, FunctionId, Slot};
use quicksilver_jit::structure::{JsObject, StructureTable};
use quicksilver_jit::{JitOptions, JitRuntime};
use std::rc::Rc;

/// Options with small thresholds so a handful of calls walk every tier
#[allow(dead_code)]
pub fn eager_options() -> JitOptions {
    JitOptions {
        threshold_for_jit_after_warm_up: 4,
        threshold_for_optimize_after_warm_up: 20,
        minimum_optimization_delay: 0,
        maximum_optimization_delay: 1,
        desired_profile_liveness_rate: 0.0,
        desired_profile_fullness_rate: 0.0,
        osr_exit_count_for_reoptimization: 3,
        frequent_exit_site_threshold: 2,
        ..JitOptions::default()
    }
}

/// `function sum(o) { return o.x + o.y; }`
#[allow(dead_code)]
pub fn register_sum(runtime: &mut JitRuntime) -> FunctionId {
    let mut b = BytecodeBuilder::new("sum", 1);
    let object = b.param(0);
    let x = b.new_register();
    let y = b.new_register();
    b.get_by_id(x, object, "x");
    b.get_by_id(y, object, "y");
    b.add(x, x, y);
    b.ret(x);
    runtime.register(b.finish().unwrap())
}

/// Call `function` `times` times with `arg`, expecting a normal completion each time
#[allow(dead_code)]
pub fn call_n(runtime: &mut JitRuntime, function: FunctionId, arg: &Slot, times: usize) -> Slot {
    let mut last = Slot::Undefined;
    for _ in 0..times {
        let completion = runtime.call(function, std::slice::from_ref(arg)).unwrap();
        assert!(!completion.is_throw(), "unexpected throw: {:?}", completion);
        last = completion.value().clone();
    }
    last
}

/// An object whose structure is unique to `id` and which has an `x` property
#[allow(dead_code)]
pub fn shaped_object(table: &mut StructureTable, id: u32) -> Rc<JsObject> {
    let tag = format!("s{}", id);
    JsObject::new(table.create_with_properties(None, &[tag.as_str(), "x"]))
}
