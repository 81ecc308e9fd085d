mod common;

use std::sync::Arc;

use common::{assert_close, avx2, check, evaluate, executor, run, Dense};
use snipjit::{
    compile, BinaryOp, CompileError, CompileOptions, Dim, ExecContext, ExecutorState, KernelExecutorCache,
    Precision, RegAllocError, RuntimeError, SnipjitError, Subgraph, SubgraphExecutor, Tensor, UnaryOp,
};

fn dims(shape: &[usize]) -> Vec<Dim> {
    shape.iter().map(|&n| Dim::Static(n)).collect()
}

fn add_relu(shape: &[Dim]) -> Subgraph {
    let mut g = Subgraph::new();
    let a = g.input(shape, Precision::F32);
    let b = g.input(shape, Precision::F32);
    let sum = g.add(a, b);
    let out = g.relu(sum);
    g.output(out);
    g
}

#[test]
fn test_static_add_relu() {
    let g = add_relu(&dims(&[2, 3, 8]));
    let mut exec = executor(&g, &CompileOptions::new(), 2);
    let inputs = [Dense::random(&[2, 3, 8], 1), Dense::random(&[2, 3, 8], 2)];
    check(&mut exec, &g, &inputs);
    assert_eq!(exec.state(), ExecutorState::Idle);
    assert_eq!(exec.stats().calls, 1);
}

#[test]
fn test_static_add_relu_with_tail() {
    let g = add_relu(&dims(&[3, 5, 13]));
    let mut exec = executor(&g, &CompileOptions::new().with_vector_lanes(4), 2);
    let inputs = [Dense::random(&[3, 5, 13], 3), Dense::random(&[3, 5, 13], 4)];
    check(&mut exec, &g, &inputs);
}

#[test]
fn test_dynamic_shapes_reconfigure() {
    let g = add_relu(&[Dim::Dynamic, Dim::Static(3), Dim::Dynamic]);
    let mut exec = executor(&g, &CompileOptions::new(), 2);
    assert_eq!(exec.config(), None);

    for (i, shape) in [[2, 3, 8], [4, 3, 8], [4, 3, 13], [2, 3, 8]].iter().enumerate() {
        let inputs = [Dense::random(shape, 10 + i as u64), Dense::random(shape, 20 + i as u64)];
        check(&mut exec, &g, &inputs);
        assert_eq!(exec.config().unwrap().master_shape[3..], shape[..]);
    }
    let stats = exec.stats();
    assert_eq!(stats.calls, 4);
    assert_eq!(stats.reconfigurations, 3);
    assert_eq!(stats.config_cache_hits, 1);
}

#[test]
fn test_dynamic_extent_below_vector_width() {
    let g = add_relu(&[Dim::Dynamic, Dim::Dynamic]);
    let mut exec = executor(&g, &CompileOptions::new(), 1);
    let inputs = [Dense::random(&[4, 3], 5), Dense::random(&[4, 3], 6)];
    check(&mut exec, &g, &inputs);
}

#[test]
fn test_thread_count_does_not_change_results() {
    let g = add_relu(&dims(&[5, 2, 7, 9]));
    let inputs = [Dense::random(&[5, 2, 7, 9], 7), Dense::random(&[5, 2, 7, 9], 8)];
    let results: Vec<Vec<Dense>> = [1, 2, 3, 8]
        .iter()
        .map(|&threads| {
            let mut exec = executor(&g, &CompileOptions::new(), threads);
            run(&mut exec, &g, &inputs)
        })
        .collect();
    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
}

#[test]
fn test_broadcast_and_scalar() {
    let mut g = Subgraph::new();
    let x = g.input(&dims(&[2, 3, 8]), Precision::F32);
    let bias = g.input(&dims(&[8]), Precision::F32);
    let half = g.scalar_f32(0.5);
    let scaled = g.mul(x, half);
    let shifted = g.add(scaled, bias);
    let out = g.binary(BinaryOp::Max, shifted, half);
    g.output(out);
    let mut exec = executor(&g, &CompileOptions::new(), 2);
    check(&mut exec, &g, &[Dense::random(&[2, 3, 8], 9), Dense::random(&[8], 10)]);
}

#[test]
fn test_unary_chain_and_two_outputs() {
    let mut g = Subgraph::new();
    let x = g.input(&dims(&[4, 10]), Precision::F32);
    let a = g.unary(UnaryOp::Abs, x);
    let root = g.unary(UnaryOp::Sqrt, a);
    let neg = g.unary(UnaryOp::Neg, x);
    let e = g.unary(UnaryOp::Exp, neg);
    g.output(root);
    g.output(e);
    let mut exec = executor(&g, &CompileOptions::new(), 2);
    check(&mut exec, &g, &[Dense::random(&[4, 10], 11)]);
}

#[test]
fn test_size_one_domain_is_bit_exact() {
    let mut g = Subgraph::new();
    let a = g.input(&dims(&[1, 1, 1]), Precision::F32);
    let b = g.input(&dims(&[1, 1, 1]), Precision::F32);
    let out = g.binary(BinaryOp::Div, a, b);
    g.output(out);
    let mut exec = executor(&g, &CompileOptions::new(), 4);
    let inputs = [Dense::new(&[1, 1, 1], vec![1.0]), Dense::new(&[1, 1, 1], vec![3.0])];
    let result = run(&mut exec, &g, &inputs);
    assert_eq!(result[0].data[0].to_bits(), (1.0f32 / 3.0).to_bits());
    assert_eq!(exec.config().unwrap().units, 1);
}

#[test]
fn test_i32_arithmetic_wraps() {
    let mut g = Subgraph::new();
    let a = g.input(&dims(&[2, 4]), Precision::I32);
    let b = g.input(&dims(&[2, 4]), Precision::I32);
    let prod = g.mul(a, b);
    let two = g.scalar_i32(2);
    let out = g.binary(BinaryOp::Sub, prod, two);
    g.output(out);
    let compiled = compile(&g, &avx2(), &CompileOptions::new()).unwrap();
    let mut exec = SubgraphExecutor::new(Arc::new(compiled), ExecContext::new(2).unwrap());

    let lhs = [i32::MAX, 3, -4, 5, 6, 7, 8, 9];
    let rhs = [2, 3, 4, 5, 6, 7, 8, 9];
    let inputs = [Tensor::from_i32(&[2, 4], &lhs).unwrap(), Tensor::from_i32(&[2, 4], &rhs).unwrap()];
    let mut outputs = vec![Tensor::zeros(&[2, 4], Precision::I32)];
    exec.execute(&inputs, &mut outputs).unwrap();
    let expected: Vec<i32> = lhs.iter().zip(&rhs).map(|(a, b)| a.wrapping_mul(*b).wrapping_sub(2)).collect();
    assert_eq!(outputs[0].to_i32_vec(), expected);
}

#[test]
fn test_matmul_plus_bias() {
    let mut g = Subgraph::new();
    let a = g.input(&dims(&[2, 4, 5]), Precision::F32);
    let b = g.input(&dims(&[2, 5, 3]), Precision::F32);
    let bias = g.input(&dims(&[3]), Precision::F32);
    let mm = g.matmul(a, b);
    let out = g.add(mm, bias);
    g.output(out);
    let mut exec = executor(&g, &CompileOptions::new(), 2);
    let inputs = [
        Dense::random(&[2, 4, 5], 12),
        Dense::random(&[2, 5, 3], 13),
        Dense::random(&[3], 14),
    ];
    check(&mut exec, &g, &inputs);
}

#[test]
fn test_dynamic_matmul_with_broadcast_batch() {
    let mut g = Subgraph::new();
    let a = g.input(&[Dim::Dynamic, Dim::Static(6), Dim::Static(4)], Precision::F32);
    let b = g.input(&[Dim::Static(1), Dim::Static(4), Dim::Static(9)], Precision::F32);
    let mm = g.matmul(a, b);
    let out = g.relu(mm);
    g.output(out);
    let mut exec = executor(&g, &CompileOptions::new(), 3);
    for batch in [1, 5] {
        let inputs = [Dense::random(&[batch, 6, 4], 15), Dense::random(&[1, 4, 9], 16)];
        check(&mut exec, &g, &inputs);
    }
}

#[test]
fn test_spilling_kernel_matches_reference() {
    let mut g = Subgraph::new();
    let inputs: Vec<_> = (0..8).map(|_| g.input(&dims(&[2, 16]), Precision::F32)).collect();
    let mut acc = g.add(inputs[0], inputs[1]);
    for &x in &inputs[2..] {
        acc = g.add(acc, x);
    }
    for &x in &inputs {
        acc = g.mul(acc, x);
    }
    g.output(acc);

    let target = avx2().with_register_budget(16, 6);
    let compiled = compile(&g, &target, &CompileOptions::new()).unwrap();
    assert!(compiled.kernel().spill_slots > 0);
    let mut exec = SubgraphExecutor::new(Arc::new(compiled), ExecContext::new(2).unwrap());
    let data: Vec<Dense> = (0..8).map(|i| Dense::random(&[2, 16], 30 + i)).collect();
    check(&mut exec, &g, &data);
}

#[test]
fn test_register_budget_exceeded() {
    let mut g = Subgraph::new();
    let x: Vec<_> = (0..4).map(|_| g.input(&dims(&[2, 8]), Precision::F32)).collect();
    let l = g.add(x[0], x[1]);
    let r = g.add(x[2], x[3]);
    let out = g.mul(l, r);
    g.output(out);
    let target = avx2().with_register_budget(16, 2);
    let err = compile(&g, &target, &CompileOptions::new()).unwrap_err();
    assert!(matches!(
        err,
        SnipjitError::Compile(CompileError::RegAlloc(RegAllocError::BudgetExceeded { .. }))
    ));
}

#[test]
fn test_too_many_ports() {
    let g = add_relu(&dims(&[2, 8]));
    let target = avx2().with_register_budget(5, 16);
    let err = compile(&g, &target, &CompileOptions::new()).unwrap_err();
    assert!(matches!(
        err,
        SnipjitError::Compile(CompileError::RegAlloc(RegAllocError::TooManyDataPointers { .. }))
    ));
}

#[test]
fn test_bf16_is_rejected() {
    let mut g = Subgraph::new();
    let x = g.input(&dims(&[2, 8]), Precision::Bf16);
    let out = g.relu(x);
    g.output(out);
    let err = compile(&g, &avx2(), &CompileOptions::new()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "compilation failed: unsupported operation `Load` at precision bf16"
    );
}

#[test]
fn test_static_kernel_rejects_other_shapes() {
    let g = add_relu(&dims(&[2, 8]));
    let mut exec = executor(&g, &CompileOptions::new(), 1);
    let inputs = [Dense::random(&[3, 8], 1).tensor(Default::default()), Dense::random(&[3, 8], 2).tensor(Default::default())];
    let mut outputs = vec![Tensor::zeros(&[3, 8], Precision::F32)];
    let err = exec.execute(&inputs, &mut outputs).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::ShapeMismatch {
            what: "input",
            index: 0,
            expected: vec![2, 8],
            found: vec![3, 8],
        }
    );
    assert!(exec.compiled().requires_recompilation(&[vec![3, 8], vec![3, 8]]));
}

#[test]
fn test_argument_validation() {
    let g = add_relu(&dims(&[2, 8]));
    let mut exec = executor(&g, &CompileOptions::new(), 1);
    let a = Tensor::zeros(&[2, 8], Precision::F32);
    let mut outputs = vec![Tensor::zeros(&[2, 8], Precision::F32)];

    let err = exec.execute(&[a.clone()], &mut outputs).unwrap_err();
    assert!(matches!(err, RuntimeError::ArityMismatch { what: "inputs", .. }));

    let wrong = Tensor::zeros(&[2, 8], Precision::I32);
    let err = exec.execute(&[a.clone(), wrong], &mut outputs).unwrap_err();
    assert!(matches!(err, RuntimeError::PrecisionMismatch { index: 1, .. }));

    let mut small = vec![Tensor::zeros(&[2, 4], Precision::F32)];
    let err = exec.execute(&[a.clone(), a], &mut small).unwrap_err();
    assert!(matches!(err, RuntimeError::ShapeMismatch { what: "output", .. }));
    assert_eq!(exec.stats().calls, 0);
}

#[test]
fn test_shared_executor_cache() {
    let mut g = Subgraph::new();
    let a = g.input(&dims(&[3, 4]), Precision::F32);
    let b = g.input(&dims(&[4, 2]), Precision::F32);
    let mm = g.matmul(a, b);
    g.output(mm);
    let compiled = Arc::new(compile(&g, &avx2(), &CompileOptions::new()).unwrap());
    let cache = Arc::new(KernelExecutorCache::new());

    let ctx = ExecContext::new(1).unwrap().with_cache(cache.clone());
    let mut first = SubgraphExecutor::new(compiled.clone(), ctx.clone());
    let _second = SubgraphExecutor::new(compiled, ctx);
    let stats = cache.stats();
    assert_eq!((stats.misses, stats.hits, stats.entries), (1, 1, 1));

    let inputs = [Dense::random(&[3, 4], 40), Dense::random(&[4, 2], 41)];
    let expected = evaluate(&g, &inputs);
    let actual = run(&mut first, &g, &inputs);
    assert_close(&actual[0], &expected[0], 1e-5);
}

#[test]
fn test_segfault_detector_does_not_change_results() {
    let g = add_relu(&dims(&[4, 8]));
    let compiled = Arc::new(compile(&g, &avx2(), &CompileOptions::new()).unwrap());
    let ctx = ExecContext::new(2).unwrap().with_segfault_detector(true);
    let mut exec = SubgraphExecutor::new(compiled, ctx);
    check(&mut exec, &g, &[Dense::random(&[4, 8], 50), Dense::random(&[4, 8], 51)]);
}
