//! Blocked matmul with grouped program ordering and a compile-time K loop

mod common;

use common::{assert_vec_close, init_logger, matmul, random_tensor, transpose};
use rstest::rstest;
use tilegrad::prelude::*;
use tilegrad::synth::{NonAffineReason, ScatterDecision, ScatterReason};

const M: usize = 32;
const N: usize = 96;
const K: usize = 64;
const BLOCK: i64 = 16;

fn matmul_kernel() -> TileKernel {
    TileKernel::new(
        "matmul",
        vec![
            Param::pointer("a"),
            Param::pointer("b"),
            Param::pointer("c"),
            Param::constexpr("M"),
            Param::constexpr("N"),
            Param::constexpr("K"),
            Param::constexpr("BLOCK_M"),
            Param::constexpr("BLOCK_N"),
            Param::constexpr("BLOCK_K"),
            Param::constexpr("GROUP_M"),
        ],
        |tl| {
            let (m, n, k) = (tl.constexpr("M"), tl.constexpr("N"), tl.constexpr("K"));
            let (bm, bn, bk) = (
                tl.constexpr("BLOCK_M"),
                tl.constexpr("BLOCK_N"),
                tl.constexpr("BLOCK_K"),
            );
            let group_m = tl.constexpr("GROUP_M");

            // Grouped ordering: consecutive programs share rows of A.
            let pid = tl.program_id(0);
            let num_pid_m = tl.cdiv(m, bm);
            let num_pid_in_group = group_m * tl.cdiv(n, bn);
            let first_pid_m = (&pid / num_pid_in_group) * group_m;
            let group_size_m = (-&first_pid_m + num_pid_m).min(group_m);
            let local = &pid % num_pid_in_group;
            let pid_m = &first_pid_m + &local % &group_size_m;
            let pid_n = &local / &group_size_m;

            let offs_m = (pid_m * bm + tl.arange(0, bm)).expand_dims(1).unwrap();
            let offs_n = (pid_n * bn + tl.arange(0, bn)).expand_dims(0).unwrap();
            let offs_k = tl.arange(0, bk);

            let mut acc = tl.zeros(&[bm as usize, bn as usize], DType::F64);
            for kk in tl.static_range(0, tl.cdiv(k, bk)) {
                let ks = kk * bk + &offs_k;
                let a_offs = &offs_m * k + ks.expand_dims(0).unwrap();
                let b_offs = ks.expand_dims(1).unwrap() * n + &offs_n;
                let a = tl.load(&(tl.pointer("a") + a_offs));
                let b = tl.load(&(tl.pointer("b") + b_offs));
                acc += (&a.expand_dims(2) * &b.expand_dims(0)).sum(1);
            }
            tl.store(&(tl.pointer("c") + (&offs_m * n + &offs_n)), &acc);
        },
    )
}

fn constants() -> Vec<(&'static str, i64)> {
    vec![
        ("M", M as i64),
        ("N", N as i64),
        ("K", K as i64),
        ("BLOCK_M", BLOCK),
        ("BLOCK_N", BLOCK),
        ("BLOCK_K", BLOCK),
        ("GROUP_M", 8),
    ]
}

fn f64_pointers() -> Vec<(&'static str, DType)> {
    vec![("a", DType::F64), ("b", DType::F64), ("c", DType::F64)]
}

fn grid() -> Grid {
    [(M / BLOCK as usize) * (N / BLOCK as usize), 1, 1]
}

fn decorated(schedule: Schedule) -> DifferentiableKernel {
    decorate(&["a", "b"], &["c"])
        .with_config(DiffConfig::new())
        .with_executor(CpuExecutor::new().with_schedule(schedule))
        .apply(matmul_kernel())
        .unwrap()
}

#[rstest]
#[case::row_major(Schedule::RowMajor)]
#[case::shuffled(Schedule::Shuffled { seed: 42 })]
fn test_matmul_gradients(#[case] schedule: Schedule) {
    init_logger();
    let kernel = decorated(schedule);
    let a = random_tensor(&[M, K], -1.0, 1.0, 1).requires_grad_(true);
    let b = random_tensor(&[K, N], -1.0, 1.0, 2).requires_grad_(true);
    let c = Tensor::zeros(&[M, N], DType::F64);
    let outputs = kernel
        .call_with(grid(), vec![(&a).into(), (&b).into(), (&c).into()], &constants())
        .unwrap();

    let (av, bv) = (a.to_vec(), b.to_vec());
    assert_vec_close(&outputs[0].to_vec(), &matmul(&av, &bv, M, K, N), 1e-12);

    let dc = random_tensor(&[M, N], -1.0, 1.0, 3);
    outputs[0].backward_with(&dc).unwrap();
    let dcv = dc.to_vec();

    // dA = dC * B^T, dB = A^T * dC
    let da = matmul(&dcv, &transpose(&bv, K, N), M, N, K);
    let db = matmul(&transpose(&av, M, K), &dcv, K, M, N);
    assert_vec_close(&a.grad().unwrap().to_vec(), &da, 1e-10);
    assert_vec_close(&b.grad().unwrap().to_vec(), &db, 1e-10);
}

#[test]
fn test_k_loop_scatters_fall_back_to_atomics() {
    let kernel = decorated(Schedule::RowMajor);
    let compiled = kernel
        .specialize(&constants(), &f64_pointers())
        .unwrap();
    let report = &compiled.backward.report;

    // Four K iterations load each of A and B at four distinct addresses.
    assert_eq!(report.sites.len(), 8);
    assert_eq!(report.atomics(), 8);
    for site in &report.sites {
        assert_eq!(site.decision, ScatterDecision::AtomicAdd);
        assert_eq!(site.reason, ScatterReason::MultipleSites(4));
    }
}

#[test]
fn test_grouped_ordering_is_not_affine() {
    // A single K block leaves one load site per input, so the grouped
    // program remapping alone decides the scatter mode.
    let kernel = decorated(Schedule::RowMajor);
    let mut single_k = constants();
    single_k[2] = ("K", BLOCK);
    let compiled = kernel.specialize(&single_k, &f64_pointers()).unwrap();
    let report = &compiled.backward.report;
    assert_eq!(report.sites.len(), 2);
    assert!(matches!(report.sites[0].reason, ScatterReason::NonAffine(_)));
    assert_eq!(
        report.sites[1].reason,
        ScatterReason::NonAffine(NonAffineReason::Division)
    );
    assert_eq!(report.atomics(), 2);
}

#[test]
fn test_unroll_limit() {
    let kernel = decorate(&["a", "b"], &["c"])
        .with_config(DiffConfig::new().with_max_unroll(2))
        .apply(matmul_kernel())
        .unwrap();
    let a = random_tensor(&[M, K], -1.0, 1.0, 1);
    let b = random_tensor(&[K, N], -1.0, 1.0, 2);
    let c = Tensor::zeros(&[M, N], DType::F64);
    let err = kernel
        .call_with(grid(), vec![(&a).into(), (&b).into(), (&c).into()], &constants())
        .unwrap_err();
    assert!(matches!(err, tilegrad::error::LaunchError::Trace(_)));
}
