//! Elementwise kernel on a 2D grid: `c = (2a + 3b) * a / b`

mod common;

use common::{assert_vec_close, init_logger, random_tensor, EPSILON};
use ndarray::{ArrayD, IxDyn};
use tilegrad::prelude::*;
use tilegrad::synth::ScatterDecision;

const M: usize = 10;
const N: usize = 40;
const GRID: Grid = [3, 5, 1];

fn elementwise_kernel() -> TileKernel {
    TileKernel::new(
        "elementwise",
        vec![
            Param::pointer("a"),
            Param::pointer("b"),
            Param::pointer("c"),
            Param::scalar("M"),
            Param::scalar("N"),
            Param::constexpr("BLOCK_M"),
            Param::constexpr("BLOCK_N"),
        ],
        |tl| {
            let (bm, bn) = (tl.constexpr("BLOCK_M"), tl.constexpr("BLOCK_N"));
            let rows = (tl.program_id(0) * bm + tl.arange(0, bm)).expand_dims(1).unwrap();
            let cols = (tl.program_id(1) * bn + tl.arange(0, bn)).expand_dims(0).unwrap();
            let offs = &rows * tl.scalar("N") + &cols;
            let mask = rows.lt(tl.scalar("M")) & cols.lt(tl.scalar("N"));

            let a = tl.load_masked(&(tl.pointer("a") + &offs), &mask, 0.0);
            let b = tl.load_masked(&(tl.pointer("b") + &offs), &mask, 1.0);
            let c = (2.0 * &a + 3.0 * &b) * &a / &b;
            tl.store_masked(&(tl.pointer("c") + &offs), &c, &mask);
        },
    )
}

fn decorated(config: DiffConfig, schedule: Schedule) -> DifferentiableKernel {
    decorate(&["a", "b"], &["c"])
        .with_config(config)
        .with_executor(CpuExecutor::new().with_schedule(schedule))
        .apply(elementwise_kernel())
        .unwrap()
}

struct Run {
    c: Vec<f64>,
    da: Vec<f64>,
    db: Vec<f64>,
}

fn run(kernel: &DifferentiableKernel, seed: u64) -> Run {
    let a = random_tensor(&[M, N], -1.0, 1.0, seed).requires_grad_(true);
    let b = random_tensor(&[M, N], 0.5, 1.5, seed + 1).requires_grad_(true);
    let c = Tensor::zeros(&[M, N], DType::F64);
    let outputs = kernel
        .call_with(
            GRID,
            vec![(&a).into(), (&b).into(), (&c).into(), M.into(), N.into()],
            &[("BLOCK_M", 4), ("BLOCK_N", 8)],
        )
        .unwrap();
    let upstream = random_tensor(&[M, N], -1.0, 1.0, seed + 2);
    outputs[0].backward_with(&upstream).unwrap();
    Run {
        c: outputs[0].to_vec(),
        da: a.grad().unwrap().to_vec(),
        db: b.grad().unwrap().to_vec(),
    }
}

#[test]
fn test_closed_form_partials() {
    init_logger();
    let kernel = decorated(DiffConfig::new(), Schedule::RowMajor);
    let result = run(&kernel, 7);

    let a = random_tensor(&[M, N], -1.0, 1.0, 7).to_vec();
    let b = random_tensor(&[M, N], 0.5, 1.5, 8).to_vec();
    let g = random_tensor(&[M, N], -1.0, 1.0, 9).to_vec();
    let c: Vec<f64> = a.iter().zip(&b).map(|(a, b)| (2.0 * a + 3.0 * b) * a / b).collect();
    let da: Vec<f64> = (0..a.len()).map(|i| g[i] * (4.0 * a[i] + 3.0 * b[i]) / b[i]).collect();
    let db: Vec<f64> = (0..a.len()).map(|i| -g[i] * 2.0 * a[i] * a[i] / (b[i] * b[i])).collect();

    assert_vec_close(&result.c, &c, EPSILON);
    assert_vec_close(&result.da, &da, EPSILON);
    assert_vec_close(&result.db, &db, EPSILON);
}

#[test]
fn test_guarded_writes_resolve_to_stores() {
    let kernel = decorated(DiffConfig::new(), Schedule::RowMajor);
    let compiled = kernel
        .specialize(&[("BLOCK_M", 4), ("BLOCK_N", 8)], &[("a", DType::F64), ("b", DType::F64), ("c", DType::F64)])
        .unwrap();
    let report = &compiled.backward.report;
    assert_eq!(report.guarded(), 2);
    assert_eq!(report.atomics(), 0);

    let scalars = |name: &str| match name {
        "M" => Some(M as i64),
        "N" => Some(N as i64),
        _ => None,
    };
    let (_, summary) = compiled.backward.body.resolve_writes(GRID, &scalars);
    assert_eq!(summary.atomics, 0);

    // Rows of 30 elements would overlap the 40-wide column blocks.
    let narrow = |name: &str| match name {
        "N" => Some(30),
        _ => scalars(name),
    };
    let (_, summary) = compiled.backward.body.resolve_writes(GRID, &narrow);
    assert_eq!(summary.stores, 0);
}

#[test]
fn test_shuffled_schedule_is_bit_identical() {
    let row_major = run(&decorated(DiffConfig::new(), Schedule::RowMajor), 11);
    for seed in [1, 2, 3] {
        let shuffled = run(&decorated(DiffConfig::new(), Schedule::Shuffled { seed }), 11);
        assert_eq!(shuffled.da, row_major.da);
        assert_eq!(shuffled.db, row_major.db);
    }
}

#[test]
fn test_forced_atomics_match_stores() {
    let auto = run(&decorated(DiffConfig::new(), Schedule::RowMajor), 21);
    let forced_config = DiffConfig::new().with_scatter(ScatterPolicy::ForceAtomic);
    let forced_kernel = decorated(forced_config, Schedule::RowMajor);
    let forced = run(&forced_kernel, 21);
    assert_eq!(forced.da, auto.da);
    assert_eq!(forced.db, auto.db);

    let compiled = forced_kernel.specialize(&[("BLOCK_M", 4), ("BLOCK_N", 8)], &[]).unwrap();
    assert!(compiled
        .backward
        .report
        .sites
        .iter()
        .all(|s| s.decision == ScatterDecision::AtomicAdd));
}

#[test]
fn test_masked_lanes_receive_no_gradient() {
    let kernel = decorated(DiffConfig::new(), Schedule::RowMajor);
    let a = random_tensor(&[M, N], -1.0, 1.0, 3);
    let b = random_tensor(&[M, N], 0.5, 1.5, 4);
    let c = Tensor::zeros(&[M, N], DType::F64);
    let (_, saved) = kernel
        .forward_with_context(
            GRID,
            vec![(&a).into(), (&b).into(), (&c).into(), M.into(), N.into()],
            &[("BLOCK_M", 4), ("BLOCK_N", 8)],
        )
        .unwrap();
    let seed = ArrayD::from_elem(IxDyn(&[M, N]), 1.0);
    let grads = kernel.backward(&saved, GRID, &[Some(seed)]).unwrap();
    // Program rows 10 and 11 are masked off; the buffers hold exactly M*N values.
    assert_eq!(grads[0].as_ref().unwrap().shape(), &[M, N]);
    assert_eq!(grads[1].as_ref().unwrap().shape(), &[M, N]);
    assert!(grads[2].is_none());
}

fn strided_kernel() -> TileKernel {
    TileKernel::new(
        "strided",
        vec![
            Param::pointer("a"),
            Param::scalar("a_stride_0"),
            Param::scalar("a_stride_1"),
            Param::pointer("b"),
            Param::scalar("b_stride_0"),
            Param::scalar("b_stride_1"),
            Param::pointer("c"),
            Param::scalar("c_stride_0"),
            Param::scalar("c_stride_1"),
        ],
        |tl| {
            let (i, j) = (tl.program_id(0), tl.program_id(1));
            let at = |name: &str| {
                tl.pointer(name)
                    + &i * tl.scalar(&format!("{name}_stride_0"))
                    + &j * tl.scalar(&format!("{name}_stride_1"))
            };
            let a = tl.load(&at("a"));
            let b = tl.load(&at("b"));
            let r = (&a * 2.0 + &b * 3.0) * &a / &b;
            tl.store(&at("c"), &r);
        },
    )
}

#[test]
fn test_one_element_per_program_with_runtime_strides() {
    let kernel = decorate(&["a", "b"], &["c"])
        .with_config(DiffConfig::new())
        .apply(strided_kernel())
        .unwrap();
    let a = random_tensor(&[3, 5], -1.0, 1.0, 31).requires_grad_(true);
    let b = random_tensor(&[3, 5], 0.5, 1.5, 32).requires_grad_(true);
    let c = Tensor::zeros(&[3, 5], DType::F64);
    let strides = || [KernelArg::Int(5), KernelArg::Int(1)];
    let mut args: Vec<KernelArg> = vec![(&a).into()];
    args.extend(strides());
    args.push((&b).into());
    args.extend(strides());
    args.push((&c).into());
    args.extend(strides());
    let outputs = kernel.call([3, 5, 1], args).unwrap();

    let (av, bv) = (a.to_vec(), b.to_vec());
    let expected: Vec<f64> = av.iter().zip(&bv).map(|(a, b)| (a * 2.0 + b * 3.0) * a / b).collect();
    assert_vec_close(&outputs[0].to_vec(), &expected, EPSILON);

    outputs[0].sum().backward().unwrap();
    let da: Vec<f64> = av.iter().zip(&bv).map(|(a, b)| (4.0 * a + 3.0 * b) / b).collect();
    let db: Vec<f64> = av.iter().zip(&bv).map(|(a, b)| -2.0 * a * a / (b * b)).collect();
    assert_vec_close(&a.grad().unwrap().to_vec(), &da, EPSILON);
    assert_vec_close(&b.grad().unwrap().to_vec(), &db, EPSILON);

    // Row-major strides on a (3, 5) grid never collide.
    let compiled = kernel
        .specialize(&[], &[("a", DType::F64), ("b", DType::F64), ("c", DType::F64)])
        .unwrap();
    assert_eq!(compiled.backward.report.guarded(), 2);
    let strides_of = |name: &str| match name.rsplit('_').next() {
        Some("0") => Some(5),
        Some("1") => Some(1),
        _ => None,
    };
    let (_, summary) = compiled.backward.body.resolve_writes([3, 5, 1], &strides_of);
    assert_eq!(summary.stores, 2);
}
