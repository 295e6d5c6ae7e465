use std::sync::Arc;

use tensorvm_core::{
    AlgoInfo, BlobManager, Channel, ChannelOptions, CompNode, CpuKernel, ElemwiseMode, Error, HostTensor, Kernel,
    OpDef, OpKind, Result, Runtime, Value, ASYNC_LEVEL, ENABLE_AUTO_DROP, RECORD_INPUT_SHAPES,
};

/// Reference kernels, except that `Exp` always fails.
struct FaultyKernel;

impl Kernel for FaultyKernel {
    fn name(&self) -> &str {
        "faulty"
    }

    fn execute(
        &self,
        op: &OpDef,
        algo: &AlgoInfo,
        inputs: &[HostTensor],
        outputs: &mut [HostTensor],
        workspace: &mut [u8],
    ) -> Result<()> {
        if let OpKind::Elemwise(ElemwiseMode::Exp) = op.kind {
            return Err(Error::Kernel {
                kernel: "Exp".to_string(),
                msg: "injected failure".to_string(),
            });
        }
        CpuKernel.execute(op, algo, inputs, outputs, workspace)
    }
}

/// `Neg` panics inside the kernel.
struct PanickingKernel;

impl Kernel for PanickingKernel {
    fn name(&self) -> &str {
        "panicking"
    }

    fn execute(
        &self,
        op: &OpDef,
        algo: &AlgoInfo,
        inputs: &[HostTensor],
        outputs: &mut [HostTensor],
        workspace: &mut [u8],
    ) -> Result<()> {
        if let OpKind::Elemwise(ElemwiseMode::Neg) = op.kind {
            panic!("kernel bug");
        }
        CpuKernel.execute(op, algo, inputs, outputs, workspace)
    }
}

macro_rules! faulty_runtime {
    ($level:expr) => {{
        let options = ChannelOptions {
            async_level: $level,
            ..ChannelOptions::default()
        };
        Runtime::with_channel(Channel::with_kernel(Arc::new(FaultyKernel), options).unwrap()).unwrap()
    }};
}

fn ones(rt: &Runtime, n: usize) -> Value {
    rt.put(HostTensor::from_f32(&[n], CompNode::cpu(0), &vec![1.0; n]).unwrap())
        .unwrap()
}

#[test]
fn commands_run_in_submission_order() {
    let rt = Runtime::new().unwrap();
    let one = ones(&rt, 8);
    let mut acc = ones(&rt, 8);
    for _ in 0..50 {
        acc = rt
            .apply(&OpDef::elemwise(ElemwiseMode::Add), &[acc, one.clone()])
            .unwrap()
            .remove(0);
    }
    let doubled = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Mul), &[acc.clone(), acc])
        .unwrap()
        .remove(0);
    assert_eq!(rt.to_host(&doubled).unwrap().to_f32_vec(), vec![51.0 * 51.0; 8]);
    assert_eq!(rt.channel().stats().kernels, 51);
}

#[test]
fn producers_on_many_threads() {
    let rt = Arc::new(Runtime::new().unwrap());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let x = rt
                    .put(HostTensor::from_f32(&[3], CompNode::cpu(0), &[i as f32; 3]).unwrap())
                    .unwrap();
                let y = rt
                    .apply(&OpDef::elemwise(ElemwiseMode::Mul), &[x.clone(), x])
                    .unwrap()
                    .remove(0);
                rt.to_host(&y).unwrap().to_f32_vec()
            })
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        let sq = (i * i) as f32;
        assert_eq!(h.join().unwrap(), vec![sq; 3]);
    }
}

#[test]
fn async_error_is_observed_once_at_sync() {
    let rt = faulty_runtime!(2);
    let x = ones(&rt, 4);
    let bad = rt.apply(&OpDef::elemwise(ElemwiseMode::Exp), &[x.clone()]);
    assert!(bad.is_ok());
    for _ in 0..3 {
        match rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x.clone()]) {
            Ok(_) | Err(Error::ChannelPoisoned) => {}
            Err(e) => panic!("unexpected {e}"),
        }
    }

    let err = rt.sync().unwrap_err();
    assert!(err.is_async());
    assert!(matches!(err.root(), Error::Kernel { .. }));
    match &err {
        Error::Async {
            origin,
            observed_at,
            ..
        } => {
            assert_eq!(origin.op, "Elemwise");
            assert_eq!(*observed_at, "sync");
        }
        other => panic!("expected an async error, got {other}"),
    }
    assert!(err.to_string().contains("not where it happened"));

    // Reported exactly once.
    rt.sync().unwrap();
    rt.channel().check_available().unwrap();

    let err = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x.clone()])
        .unwrap_err();
    assert!(matches!(err, Error::ChannelPoisoned));

    rt.close().unwrap();
    let err = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x])
        .unwrap_err();
    assert!(matches!(err, Error::ChannelClosed));
    assert!(matches!(rt.sync(), Err(Error::ChannelClosed)));
}

#[test]
fn failed_output_is_invalid() {
    let rt = faulty_runtime!(2);
    let x = ones(&rt, 4);
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Exp), &[x])
        .unwrap()
        .remove(0);
    let err = rt.to_host(&y).unwrap_err();
    // The error box is drained by whichever sync point comes first.
    assert!(err.is_async() || matches!(err, Error::InvalidTensor { .. }), "{err}");
}

#[test]
fn async_level_zero_raises_directly() {
    let rt = faulty_runtime!(0);
    let x = ones(&rt, 4);
    let err = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Exp), &[x])
        .unwrap_err();
    assert!(!err.is_async());
    assert!(matches!(err, Error::Kernel { .. }));
    rt.sync().unwrap();
}

#[test]
fn async_level_one_raises_at_next_apply() {
    let rt = faulty_runtime!(1);
    let x = ones(&rt, 4);
    rt.apply(&OpDef::elemwise(ElemwiseMode::Exp), &[x.clone()])
        .unwrap();
    while !rt.channel().is_poisoned() {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    match rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x.clone()])
        .unwrap_err()
    {
        Error::Async { observed_at, .. } => assert_eq!(observed_at, "apply_op"),
        other => panic!("expected an async error, got {other}"),
    }
    let err = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x])
        .unwrap_err();
    assert!(matches!(err, Error::ChannelPoisoned));
    rt.sync().unwrap();
}

#[test]
fn kernel_panic_becomes_error() {
    let rt = Runtime::with_channel(
        Channel::with_kernel(Arc::new(PanickingKernel), ChannelOptions::default()).unwrap(),
    )
    .unwrap();
    let x = ones(&rt, 2);
    rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x]).unwrap();
    let err = rt.sync().unwrap_err();
    assert!(err.to_string().contains("kernel panicked"), "{err}");
}

#[test]
fn record_input_shapes_in_origin() {
    let rt = faulty_runtime!(2);
    rt.set_option(RECORD_INPUT_SHAPES, 1).unwrap();
    let x = ones(&rt, 3);
    rt.apply(&OpDef::elemwise(ElemwiseMode::Exp), &[x]).unwrap();
    match rt.sync().unwrap_err() {
        Error::Async { origin, .. } => assert_eq!(origin.input_shapes, Some(vec![vec![3]])),
        other => panic!("expected an async error, got {other}"),
    }
}

#[test]
fn options_by_name() {
    let rt = Runtime::new().unwrap();
    rt.set_option(ASYNC_LEVEL, 1).unwrap();
    assert_eq!(rt.get_option(ASYNC_LEVEL).unwrap(), 1);
    assert!(matches!(rt.set_option(ASYNC_LEVEL, 7), Err(Error::Config(_))));
    assert!(matches!(rt.set_option(ENABLE_AUTO_DROP, 2), Err(Error::Config(_))));
    assert!(matches!(rt.set_option("eviction_threshold", 1), Err(Error::Config(_))));
    assert!(matches!(rt.get_option("nope"), Err(Error::Config(_))));
    assert_eq!(rt.get_option(ASYNC_LEVEL).unwrap(), 1);
}

#[test]
fn dropped_tensor_is_invalid_without_auto_drop() {
    let rt = Runtime::new().unwrap();
    let x = ones(&rt, 4);
    rt.drop_value(&x).unwrap();
    let err = rt.to_host(&x).unwrap_err();
    assert!(matches!(err, Error::InvalidTensor { .. }), "{err}");
}

#[test]
fn auto_drop_regenerates() {
    let rt = Runtime::new().unwrap();
    rt.set_option(ENABLE_AUTO_DROP, 1).unwrap();
    let x = ones(&rt, 4);
    let y = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Add), &[x.clone(), x.clone()])
        .unwrap()
        .remove(0);
    let z = rt
        .apply(&OpDef::elemwise(ElemwiseMode::Mul), &[y.clone(), y.clone()])
        .unwrap()
        .remove(0);
    rt.drop_value(&x).unwrap();
    rt.drop_value(&y).unwrap();

    assert_eq!(rt.to_host(&z).unwrap().to_f32_vec(), vec![4.0; 4]);
    // Recomputing y also needs x back.
    assert_eq!(rt.to_host(&y).unwrap().to_f32_vec(), vec![2.0; 4]);
    assert_eq!(rt.channel().stats().regenerated, 2);
}

#[test]
fn tensors_from_other_channels_are_rejected() {
    let a = Runtime::new().unwrap();
    let b = Runtime::new().unwrap();
    let x = ones(&a, 2);
    let handle = x.as_device().unwrap();
    let err = b.channel().apply_op(&OpDef::elemwise(ElemwiseMode::Neg), &[handle]).unwrap_err();
    assert!(matches!(err, Error::InvalidTensor { .. }));
}

#[test]
fn close_is_idempotent() {
    let rt = Runtime::new().unwrap();
    let x = ones(&rt, 2);
    rt.apply(&OpDef::elemwise(ElemwiseMode::Neg), &[x.clone()]).unwrap();
    rt.close().unwrap();
    rt.close().unwrap();
    assert!(rt.channel().is_closed());
    assert!(matches!(rt.to_host(&x), Err(Error::ChannelClosed)));
}

#[test]
fn poisoned_channel_refuses_uploads() {
    let dev = CompNode::cpu(29);
    let rt = faulty_runtime!(2);
    let x = ones(&rt, 4);
    rt.apply(&OpDef::elemwise(ElemwiseMode::Exp), &[x]).unwrap();

    // Submitted before or after the worker failed: it never lands in memory.
    match rt.put(HostTensor::from_f32(&[16], dev, &[2.0; 16]).unwrap()) {
        Ok(late) => {
            let err = rt.to_host(&late).unwrap_err();
            assert!(err.is_async() || matches!(err, Error::InvalidTensor { .. }), "{err}");
        }
        Err(e) => assert!(matches!(e, Error::ChannelPoisoned), "{e}"),
    }
    let _ = rt.sync();

    let err = rt
        .put(HostTensor::from_f32(&[16], dev, &[2.0; 16]).unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::ChannelPoisoned), "{err}");
    assert_eq!(BlobManager::inst().stats(dev).live_bytes, 0);
    assert_eq!(BlobManager::inst().stats(dev).raw_allocs, 0);
}
