use std::collections::HashMap;

use criterion::{criterion_group, criterion_main, Criterion};
use tensorvm_core::{
    CompNode, ConvParam, DType, ElemwiseMode, ExecutionPolicy, HostTensor, OpDef, Runtime,
    TensorLayout, Trace, Value,
};

fn bench_dispatch_elemwise(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let x = rt
        .put(HostTensor::zeros(TensorLayout::new([64], DType::F32, CompNode::cpu(0))))
        .unwrap();
    let op = OpDef::elemwise(ElemwiseMode::Add);
    c.bench_function("dispatch_add_64", |bencher| {
        bencher.iter(|| {
            let y = rt.apply(&op, &[x.clone(), x.clone()]).unwrap();
            rt.drop_value(&y[0]).unwrap();
        });
        rt.sync().unwrap();
    });
}

fn bench_dispatch_scalar(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let a = Value::scalar(2.0, DType::F32);
    let op = OpDef::elemwise(ElemwiseMode::Mul);
    c.bench_function("dispatch_scalar_mul", |bencher| {
        bencher.iter(|| rt.apply(&op, &[a.clone(), a.clone()]).unwrap());
    });
}

fn bench_conv_algorithm(c: &mut Criterion, algo: &str) {
    let rt = Runtime::new().unwrap();
    let dev = CompNode::cpu(0);
    let x = rt
        .put(HostTensor::zeros(TensorLayout::new([1, 16, 32, 32], DType::F32, dev)))
        .unwrap();
    let w = rt
        .put(HostTensor::zeros(TensorLayout::new([16, 16, 3, 3], DType::F32, dev)))
        .unwrap();
    let op = OpDef::conv(ConvParam::default().with_padding(1, 1)).with_policy(ExecutionPolicy {
        algo: Some(algo.to_string()),
        workspace_limit: None,
    });
    c.bench_function(&format!("conv_16x32x32_{}", algo.to_lowercase()), |bencher| {
        bencher.iter(|| {
            let y = rt.apply(&op, &[x.clone(), w.clone()]).unwrap();
            rt.sync().unwrap();
            rt.drop_value(&y[0]).unwrap();
        });
    });
}

fn bench_conv_direct(c: &mut Criterion) {
    bench_conv_algorithm(c, "DIRECT");
}

fn bench_conv_im2col(c: &mut Criterion) {
    bench_conv_algorithm(c, "IM2COL");
}

fn bench_trace_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dev = CompNode::cpu(0);
    let a = Value::host(HostTensor::zeros(TensorLayout::new([32, 32], DType::F32, dev)));
    let mut trace = Trace::new();
    trace.enter(&rt).unwrap();
    let x = trace.mark_input("a", &a).unwrap();
    let y = rt.apply(&OpDef::matmul(false, false), &[x.clone(), x]).unwrap();
    let z = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Relu), &y)
        .unwrap();
    trace.mark_output("z", &z[0]).unwrap();
    trace.exit(&rt).unwrap();

    let inputs = HashMap::from([("a".to_string(), a)]);
    c.bench_function("trace_run_matmul_relu_32", |bencher| {
        bencher.iter(|| {
            let out = trace.run(&rt, &inputs).unwrap();
            rt.to_host(&out["z"]).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_dispatch_elemwise,
    bench_dispatch_scalar,
    bench_conv_direct,
    bench_conv_im2col,
    bench_trace_replay
);
criterion_main!(benches);
