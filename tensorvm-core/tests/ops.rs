use tensorvm_core::{
    AlgoChooser, BlobManager, CompNode, CpuKernel, ConvParam, DType, ElemwiseMode, Error, ExecutionPolicy, HostTensor,
    OpDef, Runtime, TensorLayout, Value,
};

macro_rules! host_f32 {
    ($shape:expr, $data:expr) => {
        Value::host(HostTensor::from_f32(&$shape, CompNode::cpu(0), &$data).unwrap())
    };
}

macro_rules! generate_infer_test {
    ($name:ident, $op:expr, [$($shape:expr),*]) => {
        #[test]
        fn $name() {
            let rt = Runtime::new().unwrap();
            let inputs: Vec<Value> = vec![$(
                rt.put(HostTensor::zeros(TensorLayout::new($shape, DType::F32, CompNode::cpu(0))))
                    .unwrap()
            ),*];
            let layouts: Vec<TensorLayout> = inputs.iter().map(Value::layout).collect();
            let (expected, determined) = $op.infer_output_layouts(&layouts).unwrap();
            assert!(determined);
            let outputs = rt.apply(&$op, &inputs).unwrap();
            assert_eq!(outputs.len(), expected.len());
            for (out, exp) in outputs.iter().zip(&expected) {
                assert_eq!(rt.layout(out).unwrap(), *exp);
                assert_eq!(rt.to_host(out).unwrap().layout(), exp);
            }
        }
    };
}

generate_infer_test!(infer_conv, OpDef::conv(ConvParam::default()), [[1, 3, 8, 8], [4, 3, 3, 3]]);
generate_infer_test!(
    infer_conv_strided,
    OpDef::conv(ConvParam::default().with_stride(2, 2).with_padding(1, 1)),
    [[2, 3, 7, 7], [5, 3, 3, 3]]
);
generate_infer_test!(infer_matmul, OpDef::matmul(false, false), [[2, 3], [3, 4]]);
generate_infer_test!(infer_matmul_transposed, OpDef::matmul(true, true), [[3, 2], [4, 3]]);
generate_infer_test!(infer_add_broadcast, OpDef::elemwise(ElemwiseMode::Add), [[2, 1, 4], [3, 1]]);
generate_infer_test!(infer_relu, OpDef::elemwise(ElemwiseMode::Relu), [[5, 2]]);
generate_infer_test!(infer_reshape, OpDef::reshape([3, 4]), [[2, 6]]);

#[test]
fn conv_output_layout() {
    let rt = Runtime::new().unwrap();
    let x = host_f32!([1, 3, 8, 8], [0.5; 192]);
    let w = host_f32!([4, 3, 3, 3], [1.0; 108]);
    let y = rt.apply(&OpDef::conv(ConvParam::default()), &[x, w]).unwrap();
    assert_eq!(y[0].shape(), vec![1, 4, 6, 6]);
    let host = rt.to_host(&y[0]).unwrap();
    assert!(host.to_f32_vec().iter().all(|v| (*v - 13.5).abs() < 1e-5));
}

#[test]
fn conv_bad_filter_fails_before_allocation() {
    let dev = CompNode::cpu(11);
    let rt = Runtime::new().unwrap();
    let x = rt
        .put(HostTensor::zeros(TensorLayout::new([1, 3, 8, 8], DType::F32, dev)))
        .unwrap();
    let w = rt
        .put(HostTensor::zeros(TensorLayout::new([4, 2, 3, 3], DType::F32, dev)))
        .unwrap();
    rt.sync().unwrap();
    let before = BlobManager::inst().stats(dev);
    let kernels = rt.channel().stats().kernels;

    let err = rt
        .apply(&OpDef::conv(ConvParam::default()), &[x, w])
        .unwrap_err();
    assert!(matches!(err, Error::Shape(_)), "{err}");

    rt.sync().unwrap();
    let after = BlobManager::inst().stats(dev);
    assert_eq!(before.raw_allocs, after.raw_allocs);
    assert_eq!(before.free_list_hits, after.free_list_hits);
    assert_eq!(rt.channel().stats().kernels, kernels);
}

#[test]
fn conv_algorithms_agree() {
    let rt = Runtime::new().unwrap();
    let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let param = ConvParam::default().with_stride(2, 2).with_padding(1, 1);
    for algo in ["DIRECT", "IM2COL"] {
        let op = OpDef::conv(param.clone()).with_policy(ExecutionPolicy {
            algo: Some(algo.to_string()),
            workspace_limit: None,
        });
        let x = host_f32!([1, 1, 4, 4], data);
        let w = host_f32!([1, 1, 3, 3], [1.0; 9]);
        let y = rt.apply(&op, &[x, w]).unwrap();
        let host = rt.to_host(&y[0]).unwrap();
        assert_eq!(host.shape(), &[1, 1, 2, 2]);
        assert_eq!(host.to_f32_vec(), vec![10.0, 24.0, 51.0, 90.0], "{algo}");
    }
}

#[test]
fn group_conv() {
    let rt = Runtime::new().unwrap();
    // Two groups of one channel each; the second filter doubles.
    let x = host_f32!([1, 2, 2, 2], [1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    let w = host_f32!([2, 1, 1, 1, 1], [1.0, 2.0]);
    let y = rt.apply(&OpDef::conv(ConvParam::default().group()), &[x, w]).unwrap();
    let host = rt.to_host(&y[0]).unwrap();
    assert_eq!(host.shape(), &[1, 2, 2, 2]);
    assert_eq!(host.to_f32_vec(), vec![1.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 4.0]);
}

#[test]
fn matmul() {
    let rt = Runtime::new().unwrap();
    let a = host_f32!([2, 3], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = host_f32!([3, 2], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let c = rt.apply(&OpDef::matmul(false, false), &[a, b]).unwrap();
    assert_eq!(rt.to_host(&c[0]).unwrap().to_f32_vec(), vec![22.0, 28.0, 49.0, 64.0]);
}

#[test]
fn matmul_shape_mismatch() {
    let rt = Runtime::new().unwrap();
    let a = host_f32!([2, 3], [0.0; 6]);
    let b = host_f32!([2, 3], [0.0; 6]);
    let err = rt.apply(&OpDef::matmul(false, false), &[a, b]).unwrap_err();
    assert!(matches!(err, Error::Shape(_)), "{err}");
}

#[test]
fn elemwise_broadcast() {
    let rt = Runtime::new().unwrap();
    let a = host_f32!([2, 3], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = host_f32!([3], [10.0, 20.0, 30.0]);
    let c = rt.apply(&OpDef::elemwise(ElemwiseMode::Add), &[a, b]).unwrap();
    let host = rt.to_host(&c[0]).unwrap();
    assert_eq!(host.shape(), &[2, 3]);
    assert_eq!(host.to_f32_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
}

#[test]
fn one_hot_gathers() {
    let rt = Runtime::new().unwrap();
    let src = host_f32!([2, 3], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let index = Value::host(HostTensor::from_i32(&[2], CompNode::cpu(0), &[2, 0]).unwrap());
    let out = rt.apply(&OpDef::one_hot(1), &[src, index]).unwrap();
    let host = rt.to_host(&out[0]).unwrap();
    assert_eq!(host.shape(), &[2, 1]);
    assert_eq!(host.to_f32_vec(), vec![3.0, 4.0]);
}

#[test]
fn type_cvt_truncates() {
    let rt = Runtime::new().unwrap();
    let x = host_f32!([2], [1.7, -2.2]);
    let y = rt.apply(&OpDef::type_cvt(DType::I32), &[x]).unwrap();
    let host = rt.to_host(&y[0]).unwrap();
    assert_eq!(host.dtype(), DType::I32);
    assert_eq!(host.to_i32_vec(), vec![1, -2]);
}

#[test]
fn seeded_random_ops() {
    let rt = Runtime::new().unwrap();
    let dev = CompNode::cpu(0);
    let a = rt.apply(&OpDef::uniform([64], dev, 7), &[]).unwrap();
    let b = rt.apply(&OpDef::uniform([64], dev, 7), &[]).unwrap();
    let a = rt.to_host(&a[0]).unwrap().to_f32_vec();
    assert_eq!(a, rt.to_host(&b[0]).unwrap().to_f32_vec());
    assert!(a.iter().all(|v| (0.0..1.0).contains(v)));

    let g = rt.apply(&OpDef::gaussian([4096], dev, 3.0, 0.5, 1), &[]).unwrap();
    let g = rt.to_host(&g[0]).unwrap().to_f32_vec();
    let mean = g.iter().sum::<f32>() / g.len() as f32;
    assert!((mean - 3.0).abs() < 0.05, "mean {mean}");

    let err = rt
        .apply(&OpDef::gaussian([4], dev, 0.0, -1.0, 1), &[])
        .unwrap_err();
    assert!(!err.is_async());
}

#[test]
fn algorithm_choice_is_cached_per_policy() {
    let chooser = AlgoChooser::new();
    let dev = CompNode::cpu(0);
    let inputs = [
        TensorLayout::new([1, 3, 8, 8], DType::F32, dev),
        TensorLayout::new([4, 3, 3, 3], DType::F32, dev),
    ];
    let outputs = [TensorLayout::new([1, 4, 6, 6], DType::F32, dev)];
    let op = OpDef::conv(ConvParam::default());

    let first = chooser.select(&CpuKernel, &op, &inputs, &outputs).unwrap();
    assert_eq!(first.name, "IM2COL");
    assert_eq!(first.workspace_bytes, 3 * 3 * 3 * 6 * 6 * 4);
    let again = chooser.select(&CpuKernel, &op, &inputs, &outputs).unwrap();
    assert_eq!(again, first);
    assert_eq!((chooser.hits(), chooser.misses()), (1, 1));

    let limited = op.clone().with_policy(ExecutionPolicy {
        algo: None,
        workspace_limit: Some(0),
    });
    let direct = chooser.select(&CpuKernel, &limited, &inputs, &outputs).unwrap();
    assert_eq!(direct.name, "DIRECT");
    assert_eq!(chooser.len(), 2);

    chooser.reset();
    assert!(chooser.is_empty());
    chooser.select(&CpuKernel, &op, &inputs, &outputs).unwrap();
    assert_eq!(chooser.misses(), 3);
}
