use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tensorvm_core::{
    transformation::{GradKey, GradTransformation, ModuleTraceTransformation, Rest},
    CompNode, ComputingGraph, DType, ElemwiseMode, Error, HostTensor, LazyEvalTransformation,
    OpDef, Result, Runtime, Segment, SymbolTransformation, Transformation, TransformationManager, Value,
    ValueKind,
};

macro_rules! f32_value {
    ($shape:expr, $data:expr) => {
        Value::host(HostTensor::from_f32(&$shape, CompNode::cpu(0), &$data).unwrap())
    };
}

macro_rules! i32_value {
    ($shape:expr, $data:expr) => {
        Value::host(HostTensor::from_i32(&$shape, CompNode::cpu(0), &$data).unwrap())
    };
}

#[test]
fn missing_eval_layer_is_a_config_error() {
    let mgr = TransformationManager::new();
    let err = mgr
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([2], [1.0, 2.0])])
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
}

#[test]
fn symbol_layer_shadows_the_interpreter() {
    let rt = Runtime::new().unwrap();
    let graph = ComputingGraph::new();
    let layer: Arc<dyn Transformation> = Arc::new(SymbolTransformation::new(graph.clone()));
    rt.register(Segment::Eval, layer.clone()).unwrap();

    let x = f32_value!([2, 3], [1.0; 6]);
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Relu), &[x])
        .unwrap()
        .remove(0);
    assert_eq!(y.tag(), "Symbolic");
    assert_eq!(y.shape(), vec![2, 3]);
    assert!(matches!(rt.to_host(&y), Err(Error::GraphMismatch(_))));
    assert_eq!(rt.channel().stats().submitted, 0);

    // Shape errors surface while building.
    let err = rt
        .apply(&OpDef::matmul(false, false), &[y.clone(), y.clone()])
        .unwrap_err();
    assert!(matches!(err, Error::Shape(_)), "{err}");

    let dot = graph.to_dot();
    assert!(dot.contains("Elemwise(Relu)"), "{dot}");
    assert_eq!(graph.len(), 2);
    rt.unregister(&layer).unwrap();
}

#[test]
fn values_from_two_graphs_do_not_mix() {
    let rt = Runtime::new().unwrap();
    let first: Arc<dyn Transformation> = Arc::new(SymbolTransformation::new(ComputingGraph::new()));
    rt.register(Segment::Eval, first.clone()).unwrap();
    let a = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([2], [1.0, 2.0])])
        .unwrap()
        .remove(0);
    rt.unregister(&first).unwrap();

    let second: Arc<dyn Transformation> = Arc::new(SymbolTransformation::new(ComputingGraph::new()));
    rt.register(Segment::Eval, second.clone()).unwrap();
    let err = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Add), &[a, f32_value!([2], [1.0, 2.0])])
        .unwrap_err();
    assert!(matches!(err, Error::GraphMismatch(_)), "{err}");
    rt.unregister(&second).unwrap();
}

#[test]
fn lazy_eval_executes_on_exit() {
    let rt = Runtime::new().unwrap();
    let lazy = Arc::new(LazyEvalTransformation::new(rt.interpreter(), false));
    let layer: Arc<dyn Transformation> = lazy.clone();
    rt.register(Segment::Eval, layer.clone()).unwrap();

    let x = f32_value!([3], [1.0, -2.0, 3.0]);
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Relu), &[x.clone()])
        .unwrap()
        .remove(0);
    let z = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Add), &[y.clone(), x])
        .unwrap()
        .remove(0);
    assert_eq!(z.tag(), "Symbolic");
    assert_eq!(rt.channel().stats().kernels, 0);

    rt.unregister(&layer).unwrap();
    lazy.check_exception().unwrap();
    assert_eq!(rt.to_host(&y).unwrap().to_f32_vec(), vec![1.0, 0.0, 3.0]);
    assert_eq!(rt.to_host(&z).unwrap().to_f32_vec(), vec![2.0, -2.0, 6.0]);
}

/// An eval layer whose every execution fails.
struct Unavailable;

impl Transformation for Unavailable {
    fn name(&self) -> String {
        "unavailable".to_string()
    }

    fn try_handle(&self, op: &OpDef, _: &[Value], _: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        Err(Error::msg(format!("cannot execute {op}")))
    }
}

#[test]
fn lazy_eval_defers_execution_errors() {
    let rt = Runtime::new().unwrap();
    let lazy = Arc::new(LazyEvalTransformation::new(Arc::new(Unavailable), false));
    let layer: Arc<dyn Transformation> = lazy.clone();
    rt.register(Segment::Eval, layer.clone()).unwrap();
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([1], [1.0])])
        .unwrap()
        .remove(0);
    rt.unregister(&layer).unwrap();
    let err = lazy.check_exception().unwrap_err();
    assert!(err.to_string().contains("cannot execute"), "{err}");
    // Collected once.
    lazy.check_exception().unwrap();
    assert_eq!(y.tag(), "Symbolic");
}

#[test]
fn lazy_eval_without_execution() {
    let rt = Runtime::new().unwrap();
    let lazy = Arc::new(LazyEvalTransformation::new(rt.interpreter(), true));
    let layer: Arc<dyn Transformation> = lazy.clone();
    rt.register(Segment::Eval, layer.clone()).unwrap();
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([1], [1.0])])
        .unwrap()
        .remove(0);
    rt.unregister(&layer).unwrap();
    lazy.check_exception().unwrap();
    assert_eq!(y.tag(), "Symbolic");
    assert_eq!(lazy.graph().len(), 2);
}

#[test]
fn grad_records_a_tape() {
    let rt = Runtime::new().unwrap();
    let key = GradKey::new("w");
    let grad = Arc::new(GradTransformation::new(key.clone()));
    let layer: Arc<dyn Transformation> = grad.clone();
    rt.register(Segment::Grad, layer.clone()).unwrap();

    let w = grad.attach(&f32_value!([2], [2.0, 3.0]));
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Mul), &[w.clone(), w])
        .unwrap()
        .remove(0);
    assert_eq!(y.tag(), "Grad");

    let detached = rt
        .apply(&OpDef::detach_grad(), &[y.clone()])
        .unwrap()
        .remove(0);
    assert_ne!(detached.tag(), "Grad");
    rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[detached])
        .unwrap();
    // Untracked values are not recorded.
    rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([1], [1.0])])
        .unwrap();

    let tape = key.tape();
    assert_eq!(tape.len(), 1);
    assert_eq!(tape[0].op, OpDef::elemwise(ElemwiseMode::Mul));

    rt.unregister(&layer).unwrap();
    assert!(matches!(*y.kind(), ValueKind::Device(_)));
    assert_eq!(rt.to_host(&y).unwrap().to_f32_vec(), vec![4.0, 9.0]);
}

#[test]
fn module_hook_sees_every_apply() {
    let rt = Runtime::new().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let module = Arc::new(ModuleTraceTransformation::new(Box::new(
        move |op: &OpDef, inputs: &[Value], outputs: &[Value]| {
            assert!(!inputs.is_empty(), "{op}");
            assert_eq!(outputs.len(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )));
    let layer: Arc<dyn Transformation> = module.clone();
    rt.register(Segment::ModuleTrace, layer.clone()).unwrap();

    // The implicit cast below the hook is not reported separately.
    rt.apply(
        &OpDef::elemwise(ElemwiseMode::Add),
        &[i32_value!([2], [1, 2]), f32_value!([2], [0.5, 0.5])],
    )
    .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    module.disable();
    rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([1], [1.0])])
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    module.enable();
    rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[f32_value!([1], [1.0])])
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    rt.unregister(&layer).unwrap();
}

#[test]
fn scalars_never_reach_the_channel() {
    let rt = Runtime::new().unwrap();
    let a = Value::scalar(2.0, DType::F32);
    let b = Value::scalar(3.5, DType::F32);
    let c = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Mul), &[a, b])
        .unwrap()
        .remove(0);
    assert_eq!(c.as_scalar().unwrap().value, 7.0);

    let i = rt
        .apply(
            &OpDef::elemwise(ElemwiseMode::Add),
            &[Value::scalar(7.0, DType::I32), Value::scalar(2.0, DType::I32)],
        )
        .unwrap()
        .remove(0);
    let s = i.as_scalar().unwrap();
    assert_eq!((s.value, s.dtype), (9.0, DType::I32));
    assert_eq!(rt.channel().stats().submitted, 0);
}

#[test]
fn mixed_dtypes_promote() {
    let rt = Runtime::new().unwrap();
    let sum = rt
        .apply(
            &OpDef::elemwise(ElemwiseMode::Add),
            &[i32_value!([3], [1, 2, 3]), f32_value!([3], [0.5, 0.5, 0.5])],
        )
        .unwrap()
        .remove(0);
    assert_eq!(sum.dtype(), DType::F32);
    assert_eq!(rt.to_host(&sum).unwrap().to_f32_vec(), vec![1.5, 2.5, 3.5]);

    // A float scalar lifts an integral tensor to float32, not float64.
    let scaled = rt
        .apply(
            &OpDef::elemwise(ElemwiseMode::Mul),
            &[i32_value!([2], [1, 2]), Value::scalar(1.5, DType::F64)],
        )
        .unwrap()
        .remove(0);
    assert_eq!(scaled.dtype(), DType::F32);
    assert_eq!(rt.to_host(&scaled).unwrap().to_f32_vec(), vec![1.5, 3.0]);

    // An integral scalar never widens a tensor.
    let shifted = rt
        .apply(
            &OpDef::elemwise(ElemwiseMode::Add),
            &[f32_value!([2], [1.0, 2.0]), Value::scalar(1.0, DType::I32)],
        )
        .unwrap()
        .remove(0);
    assert_eq!(shifted.dtype(), DType::F32);
}

#[test]
fn wrappers_are_unwrapped_on_unregister() {
    let rt = Runtime::new().unwrap();
    let key = GradKey::new("tmp");
    let grad = Arc::new(GradTransformation::new(key));
    let layer: Arc<dyn Transformation> = grad.clone();
    rt.register(Segment::Grad, layer.clone()).unwrap();
    assert!(rt.register(Segment::Grad, layer.clone()).is_err());
    let x = grad.attach(&f32_value!([1], [1.0]));
    assert_eq!(x.tag(), "Grad");
    rt.unregister(&layer).unwrap();
    assert_eq!(x.tag(), "Host");
    assert!(rt.unregister(&layer).is_err());
}

#[test]
fn lazy_eval_leaves_passed_through_values_alone() {
    let rt = Runtime::new().unwrap();
    let lazy = Arc::new(LazyEvalTransformation::new(rt.interpreter(), false));
    let layer: Arc<dyn Transformation> = lazy.clone();
    rt.register(Segment::Eval, layer.clone()).unwrap();

    let x = f32_value!([3], [1.0, 2.0, 3.0]);
    let named = rt
        .apply(&OpDef::rename("x"), &[x.clone()])
        .unwrap()
        .remove(0);
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Add), &[named, x.clone()])
        .unwrap()
        .remove(0);
    rt.unregister(&layer).unwrap();
    lazy.check_exception().unwrap();

    assert_eq!(x.tag(), "Host");
    assert_eq!(rt.to_host(&x).unwrap().to_f32_vec(), vec![1.0, 2.0, 3.0]);
    assert_eq!(y.tag(), "Device");
    assert_eq!(rt.to_host(&y).unwrap().to_f32_vec(), vec![2.0, 4.0, 6.0]);
}
