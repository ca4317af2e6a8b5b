//! Backward kernel synthesis
//!
//! [`synthesize`] turns a traced forward body into a backward body whose
//! parameters are the forward parameters, one seed pointer per declared
//! output and one gradient pointer per declared input.

mod backward;
mod context;
mod injectivity;

pub use backward::{
    synthesize, BackwardKernel, BackwardOptions, ResolvedDeclaration, ScatterDecision, ScatterReason,
    ScatterReport, ScatterSite,
};
pub use injectivity::{analyze_address, Injectivity, NonAffineReason};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScatterPolicy;
    use crate::error::{DecorateError, SynthesisError};
    use crate::exec::{ArgValue, Buffer, CpuExecutor, KernelExecutor};
    use crate::ir::{
        ArithKind, DType, KernelBody, NodeId, Op, OpKind, Param, ParamRole, Specialization, WriteMode,
    };
    use crate::trace::{trace, TileKernel};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn traced(kernel: &TileKernel) -> KernelBody {
        let spec = kernel
            .signature()
            .with_role(ParamRole::Pointer)
            .fold(Specialization::new(), |s, (_, p)| s.with_pointer_type(&p.name, DType::F64));
        trace(kernel, &spec, 64).unwrap()
    }

    fn derive(body: &KernelBody, inputs: &[&str], outputs: &[&str], options: BackwardOptions) -> BackwardKernel {
        let declaration = ResolvedDeclaration::resolve(&body.signature, &names(inputs), &names(outputs)).unwrap();
        synthesize(body, &declaration, &options).unwrap()
    }

    fn scalar_kernel() -> TileKernel {
        TileKernel::new(
            "poly",
            vec![Param::pointer("v"), Param::pointer("w"), Param::pointer("r")],
            |tl| {
                let v = tl.load(&tl.pointer("v"));
                let w = tl.load(&tl.pointer("w"));
                let r = (2.0 * &v * &v + &w * &w) * &w * &v;
                tl.store(&tl.pointer("r"), &r);
            },
        )
    }

    #[test]
    fn test_signature_gets_seed_and_grad_pointers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let backward = derive(&traced(&scalar_kernel()), &["v", "w"], &["r"], BackwardOptions::default());
        let params: Vec<&str> = backward.body.signature.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(params, vec!["v", "w", "r", "seed_r", "grad_v", "grad_w"]);
        assert_eq!(backward.seed_params, vec![3]);
        assert_eq!(backward.grad_params, vec![4, 5]);
        assert_eq!(backward.report.guarded(), 2);
        assert_eq!(backward.body.count_writes(|m| matches!(m, WriteMode::Guarded(_))), 2);
        assert!(backward.body.topological_order().is_ok());
    }

    #[test]
    fn test_scalar_gradients_execute() {
        let backward = derive(&traced(&scalar_kernel()), &["v", "w"], &["r"], BackwardOptions::default());
        let (body, summary) = backward.body.resolve_writes([1, 1, 1], &|_| None);
        assert_eq!(summary.atomics, 0);

        let buffer = |v: f64| ArgValue::Buffer(Buffer::from_vec(vec![v], DType::F64));
        let mut args = vec![
            buffer(1.5),
            buffer(2.0),
            buffer(0.0),
            buffer(1.0),
            buffer(0.0),
            buffer(0.0),
        ];
        CpuExecutor::new().launch(&body, [1, 1, 1], &mut args).unwrap();
        let value = |i: usize| args[i].as_buffer().map(|b| b.data[0]).unwrap_or(f64::NAN);
        // dr/dv = 6 v^2 w + w^3, dr/dw = 2 v^3 + 3 v w^2
        assert!((value(4) - 35.0).abs() < 1e-12);
        assert!((value(5) - 24.75).abs() < 1e-12);
        // The forward output is not written by the backward kernel.
        assert_eq!(value(2), 0.0);
    }

    #[test]
    fn test_declaration_invariants() {
        let body = traced(&scalar_kernel());
        let declaration = ResolvedDeclaration::resolve(&body.signature, &names(&["v"]), &names(&["w"])).unwrap();
        assert_eq!(
            synthesize(&body, &declaration, &BackwardOptions::default()).unwrap_err(),
            SynthesisError::OutputNotStored("w".to_string())
        );
        let declaration = ResolvedDeclaration::resolve(&body.signature, &names(&["r"]), &names(&["r"])).unwrap();
        assert_eq!(
            synthesize(&body, &declaration, &BackwardOptions::default()).unwrap_err(),
            SynthesisError::InputNotLoaded("r".to_string())
        );
    }

    #[test]
    fn test_resolve_rejects_bad_names() {
        let kernel = TileKernel::new("k", vec![Param::pointer("x"), Param::scalar("n")], |_| {});
        let sig = kernel.signature();
        assert_eq!(
            ResolvedDeclaration::resolve(sig, &[], &names(&["x"])).unwrap_err(),
            DecorateError::EmptyDeclaration("inputs")
        );
        assert_eq!(
            ResolvedDeclaration::resolve(sig, &names(&["y"]), &names(&["x"])).unwrap_err(),
            DecorateError::UnknownParameter("y".to_string())
        );
        assert_eq!(
            ResolvedDeclaration::resolve(sig, &names(&["n"]), &names(&["x"])).unwrap_err(),
            DecorateError::NotAPointer {
                name: "n".to_string(),
                role: ParamRole::Scalar
            }
        );
        let resolved = ResolvedDeclaration::resolve(sig, &names(&["x", "x"]), &names(&["x"])).unwrap();
        assert_eq!(resolved.inputs, vec![0]);
    }

    #[test]
    fn test_unsupported_adjoint() {
        let kernel = TileKernel::new("k", vec![Param::pointer("x"), Param::pointer("y")], |tl| {
            let x = tl.load(&tl.pointer("x"));
            tl.store(&tl.pointer("y"), &(x % 2.0));
        });
        let body = traced(&kernel);
        let declaration = ResolvedDeclaration::resolve(&body.signature, &names(&["x"]), &names(&["y"])).unwrap();
        let err = synthesize(&body, &declaration, &BackwardOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::UnsupportedAdjoint {
                kind: OpKind::Arith(ArithKind::Rem),
                ..
            }
        ));
    }

    #[test]
    fn test_graph_cycle_is_fatal() {
        let mut body = traced(&scalar_kernel());
        // Make the first arithmetic node consume the last value.
        let last_value = NodeId(body.len() - 2);
        let first_arith = body
            .ids()
            .find(|&id| matches!(body.node(id).op, Op::Arith { .. }))
            .unwrap();
        if let Op::Arith { operands, .. } = &mut body.nodes[first_arith.0].op {
            operands[0] = last_value;
        }
        let declaration = ResolvedDeclaration::resolve(&body.signature, &names(&["v"]), &names(&["r"])).unwrap();
        assert!(matches!(
            synthesize(&body, &declaration, &BackwardOptions::default()),
            Err(SynthesisError::GraphCycle(_))
        ));
    }

    fn unrolled_kernel() -> TileKernel {
        // y[i] = x[i] + x[i + 1]: two loads of `x` at different addresses.
        TileKernel::new("k", vec![Param::pointer("x"), Param::pointer("y")], |tl| {
            let x = tl.pointer("x");
            let y = tl.pointer("y");
            let pid = tl.program_id(0);
            let mut acc = tl.zeros(&[], DType::F64);
            for i in tl.static_range(0, 2) {
                acc += tl.load(&(&x + &pid + i));
            }
            tl.store(&(&y + &pid), &acc);
        })
    }

    #[test]
    fn test_multiple_sites_are_atomic() {
        let backward = derive(&traced(&unrolled_kernel()), &["x"], &["y"], BackwardOptions::default());
        assert_eq!(backward.report.atomics(), 2);
        assert!(backward
            .report
            .sites
            .iter()
            .all(|s| s.reason == ScatterReason::MultipleSites(2)));
    }

    #[test]
    fn test_force_atomic() {
        let options = BackwardOptions {
            scatter: ScatterPolicy::ForceAtomic,
            ..BackwardOptions::default()
        };
        let backward = derive(&traced(&scalar_kernel()), &["v", "w"], &["r"], options);
        assert_eq!(backward.report.atomics(), 2);
        assert_eq!(backward.body.count_writes(|m| *m == WriteMode::AtomicAdd), 2);
    }

    #[test]
    fn test_non_affine_address_is_atomic() {
        let kernel = TileKernel::new("k", vec![Param::pointer("x"), Param::pointer("y")], |tl| {
            let pid = tl.program_id(0);
            let x = tl.load(&(&tl.pointer("x") + &pid % 4));
            tl.store(&(&tl.pointer("y") + &pid), &x);
        });
        let backward = derive(&traced(&kernel), &["x"], &["y"], BackwardOptions::default());
        assert_eq!(
            backward.report.sites[0].reason,
            ScatterReason::NonAffine(NonAffineReason::Modulo)
        );
    }

    #[test]
    fn test_fan_out_and_merged_sites() {
        // The same load appears twice; both partials land in one scatter.
        let kernel = TileKernel::new("k", vec![Param::pointer("x"), Param::pointer("y")], |tl| {
            let x = tl.pointer("x");
            let a = tl.load(&x);
            let b = tl.load(&x);
            tl.store(&tl.pointer("y"), &(&a * &b + &a));
        });
        let backward = derive(&traced(&kernel), &["x"], &["y"], BackwardOptions::default());
        assert_eq!(backward.report.sites.len(), 1);

        let (body, _) = backward.body.resolve_writes([1, 1, 1], &|_| None);
        let buffer = |v: f64| ArgValue::Buffer(Buffer::from_vec(vec![v], DType::F64));
        let mut args = vec![buffer(3.0), buffer(0.0), buffer(1.0), buffer(0.0)];
        CpuExecutor::new().launch(&body, [1, 1, 1], &mut args).unwrap();
        // d(x^2 + x)/dx = 2x + 1
        assert_eq!(args[3].as_buffer().map(|b| b.data[0]), Some(7.0));
    }

    #[test]
    fn test_overwritten_store_does_not_seed() {
        let kernel = TileKernel::new("k", vec![Param::pointer("x"), Param::pointer("y")], |tl| {
            let x = tl.load(&tl.pointer("x"));
            let y = tl.pointer("y");
            tl.store(&y, &(&x * 5.0));
            tl.store(&y, &(&x * 2.0));
        });
        let backward = derive(&traced(&kernel), &["x"], &["y"], BackwardOptions::default());
        let (body, _) = backward.body.resolve_writes([1, 1, 1], &|_| None);
        let buffer = |v: f64| ArgValue::Buffer(Buffer::from_vec(vec![v], DType::F64));
        let mut args = vec![buffer(1.0), buffer(0.0), buffer(1.0), buffer(0.0)];
        CpuExecutor::new().launch(&body, [1, 1, 1], &mut args).unwrap();
        assert_eq!(args[3].as_buffer().map(|b| b.data[0]), Some(2.0));
    }

    fn reload_kernel(offset: i64) -> TileKernel {
        TileKernel::new(
            "reload",
            vec![Param::pointer("x"), Param::pointer("tmp"), Param::pointer("z")],
            move |tl| {
                let x = tl.load(&tl.pointer("x"));
                tl.store(&tl.pointer("tmp"), &x);
                let t = tl.load(&(tl.pointer("tmp") + offset));
                tl.store(&tl.pointer("z"), &(&t * &x));
            },
        )
    }

    #[test]
    fn test_load_after_store_reuses_stored_value() {
        let backward = derive(&traced(&reload_kernel(0)), &["x"], &["z"], BackwardOptions::default());
        assert_eq!(backward.report.sites.len(), 1);
        let (body, _) = backward.body.resolve_writes([1, 1, 1], &|_| None);
        let buffer = |v: f64| ArgValue::Buffer(Buffer::from_vec(vec![v], DType::F64));
        // `tmp` holds its pre-launch contents, as backward sees it.
        let mut args = vec![buffer(3.0), buffer(0.0), buffer(0.0), buffer(1.0), buffer(0.0)];
        CpuExecutor::new().launch(&body, [1, 1, 1], &mut args).unwrap();
        // The reload of `tmp` is not a declared input, so only the direct
        // use of `x` contributes: dz/dx = t = x.
        assert_eq!(args[4].as_buffer().map(|b| b.data[0]), Some(3.0));
    }

    #[test]
    fn test_load_after_mismatched_store_fails() {
        let body = traced(&reload_kernel(1));
        let declaration = ResolvedDeclaration::resolve(&body.signature, &names(&["x"]), &names(&["z"])).unwrap();
        match synthesize(&body, &declaration, &BackwardOptions::default()).unwrap_err() {
            SynthesisError::LoadAfterStore { param, .. } => assert_eq!(param, "tmp"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
