//! Differentiable kernel wrapper
//!
//! A decorated kernel keeps one compiled forward/backward pair per
//! specialization. A forward launch snapshots every pointer argument; the
//! backward launch of the same call runs against those snapshots, so kernels
//! that update their inputs in place still get correct gradients.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashMap;

use super::args::{bind, specialization_of, KernelArg};
use crate::autograd::{GradFn, Tensor};
use crate::config::DiffConfig;
use crate::dump::dump_or_warn;
use crate::error::{DecorateError, ExecError, IrError, LaunchError, SynthesisError, TraceError};
use crate::exec::{validate_grid, ArgValue, Buffer, CpuExecutor, Grid, KernelExecutor};
use crate::ir::{DType, KernelBody, ParamRole, Specialization};
use crate::synth::{synthesize, BackwardKernel, BackwardOptions, ResolvedDeclaration};
use crate::trace::{trace, TileKernel};

/// Start decorating a kernel: `inputs` are differentiated with respect to,
/// `outputs` are differentiated.
pub fn decorate(inputs: &[&str], outputs: &[&str]) -> Decorator {
    Decorator {
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        config: DiffConfig::from_env(),
        executor: Arc::new(CpuExecutor::new()),
    }
}

pub struct Decorator {
    inputs: Vec<String>,
    outputs: Vec<String>,
    config: DiffConfig,
    executor: Arc<dyn KernelExecutor>,
}

impl Decorator {
    pub fn with_config(mut self, config: DiffConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: impl KernelExecutor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Wrap `kernel`. A kernel without compile-time constants is traced and
    /// differentiated right away with `f32` pointers, so structural errors
    /// surface here rather than at the first call.
    pub fn apply(self, kernel: TileKernel) -> Result<DifferentiableKernel, DecorateError> {
        let declaration = ResolvedDeclaration::resolve(kernel.signature(), &self.inputs, &self.outputs)?;
        let eager = !kernel.has_constexprs();
        let wrapped = DifferentiableKernel {
            inner: Arc::new(KernelInner {
                kernel,
                declaration,
                config: self.config,
                executor: self.executor,
                cache: Mutex::new(FxHashMap::default()),
            }),
        };
        if eager {
            let spec = wrapped
                .inner
                .kernel
                .signature()
                .with_role(ParamRole::Pointer)
                .fold(Specialization::new(), |s, (_, p)| s.with_pointer_type(&p.name, DType::F32));
            wrapped.compile::<DecorateError>(&spec)?;
        }
        Ok(wrapped)
    }
}

/// Forward and backward bodies of one specialization.
#[derive(Debug)]
pub struct CompiledKernel {
    pub forward: KernelBody,
    pub backward: BackwardKernel,
}

struct KernelInner {
    kernel: TileKernel,
    declaration: ResolvedDeclaration,
    config: DiffConfig,
    executor: Arc<dyn KernelExecutor>,
    cache: Mutex<FxHashMap<Specialization, Arc<CompiledKernel>>>,
}

/// A forward kernel paired with its synthesized backward kernel.
#[derive(Clone)]
pub struct DifferentiableKernel {
    inner: Arc<KernelInner>,
}

impl fmt::Debug for DifferentiableKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifferentiableKernel")
            .field("kernel", &self.inner.kernel.name())
            .field("inputs", &self.declared_inputs())
            .field("outputs", &self.declared_outputs())
            .field("executor", &self.inner.executor.name())
            .finish()
    }
}

/// What a forward launch keeps for its backward launch.
#[derive(Debug, Clone)]
pub struct SavedLaunch {
    grid: Grid,
    specialization: Specialization,
    /// Arguments as they were before the forward launch ran.
    args: Vec<ArgValue>,
    /// Per-parameter tensor shape; empty for non-pointers.
    shapes: Vec<Vec<usize>>,
    compiled: Arc<CompiledKernel>,
}

impl SavedLaunch {
    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn specialization(&self) -> &Specialization {
        &self.specialization
    }

    pub fn compiled(&self) -> &CompiledKernel {
        &self.compiled
    }
}

impl DifferentiableKernel {
    pub fn name(&self) -> &str {
        self.inner.kernel.name()
    }

    pub fn config(&self) -> &DiffConfig {
        &self.inner.config
    }

    pub fn declared_inputs(&self) -> Vec<&str> {
        self.param_names(&self.inner.declaration.inputs)
    }

    pub fn declared_outputs(&self) -> Vec<&str> {
        self.param_names(&self.inner.declaration.outputs)
    }

    fn param_names(&self, positions: &[usize]) -> Vec<&str> {
        let signature = self.inner.kernel.signature();
        positions
            .iter()
            .filter_map(|&i| signature.param(i).map(|p| p.name.as_str()))
            .collect()
    }

    /// Number of specializations compiled so far.
    pub fn cached_specializations(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, FxHashMap<Specialization, Arc<CompiledKernel>>> {
        self.inner.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn compile<E>(&self, spec: &Specialization) -> Result<Arc<CompiledKernel>, E>
    where
        E: From<TraceError> + From<SynthesisError>,
    {
        let mut cache = self.cache();
        if let Some(compiled) = cache.get(spec) {
            debug!("`{}` [{}]: cache hit", self.name(), spec);
            return Ok(Arc::clone(compiled));
        }

        let config = &self.inner.config;
        let forward = trace(&self.inner.kernel, spec, config.max_unroll)?;
        let options = BackwardOptions {
            scatter: config.scatter,
            tie_policy: config.tie_policy,
        };
        let backward = synthesize(&forward, &self.inner.declaration, &options)?;
        info!(
            "compiled `{}` [{}]: {} forward nodes, {} backward nodes, {} atomic scatters",
            self.name(),
            spec,
            forward.len(),
            backward.body.len(),
            backward.report.atomics()
        );
        if let Some(dir) = &config.dump_dir {
            dump_or_warn(dir, &forward, &backward);
        }

        let compiled = Arc::new(CompiledKernel { forward, backward });
        cache.insert(spec.clone(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Compile (or fetch) the pair for explicit constants and pointer
    /// types. Pointers without a type default to `f32`.
    pub fn specialize(
        &self,
        constexprs: &[(&str, i64)],
        pointer_types: &[(&str, DType)],
    ) -> Result<Arc<CompiledKernel>, LaunchError> {
        let signature = self.inner.kernel.signature();
        let mut spec = Specialization::new();
        for &(name, value) in constexprs {
            match signature.lookup(name) {
                Some((_, param)) if param.role == ParamRole::Constexpr => {
                    spec = spec.with_constexpr(name, value);
                }
                _ => return Err(LaunchError::UnknownKeyword(name.to_string())),
            }
        }
        for (_, param) in signature.with_role(ParamRole::Pointer) {
            let dtype = pointer_types
                .iter()
                .find(|(name, _)| *name == param.name)
                .map_or(DType::F32, |&(_, dtype)| dtype);
            spec = spec.with_pointer_type(&param.name, dtype);
        }
        self.compile(&spec)
    }

    /// Launch the forward kernel; returns the declared outputs.
    pub fn call(&self, grid: Grid, args: Vec<KernelArg>) -> Result<Vec<Tensor>, LaunchError> {
        self.call_with(grid, args, &[])
    }

    /// Like [`call`](Self::call), with compile-time constants by name.
    pub fn call_with(
        &self,
        grid: Grid,
        args: Vec<KernelArg>,
        named: &[(&str, i64)],
    ) -> Result<Vec<Tensor>, LaunchError> {
        self.forward_with_context(grid, args, named).map(|(outputs, _)| outputs)
    }

    pub fn forward(&self, grid: Grid, args: Vec<KernelArg>) -> Result<Vec<Tensor>, LaunchError> {
        self.call(grid, args)
    }

    pub fn forward_with(
        &self,
        grid: Grid,
        args: Vec<KernelArg>,
        named: &[(&str, i64)],
    ) -> Result<Vec<Tensor>, LaunchError> {
        self.call_with(grid, args, named)
    }

    /// Launch the forward kernel and also return what its backward launch
    /// needs.
    ///
    /// Declared outputs come back as new tensors registered with the host
    /// autograd. Every other pointer argument receives the kernel's writes
    /// in place.
    pub fn forward_with_context(
        &self,
        grid: Grid,
        args: Vec<KernelArg>,
        named: &[(&str, i64)],
    ) -> Result<(Vec<Tensor>, SavedLaunch), LaunchError> {
        if !validate_grid(grid) {
            return Err(LaunchError::InvalidGrid(grid));
        }
        let signature = self.inner.kernel.signature();
        let bound = bind(signature, args, named)?;
        let spec = specialization_of(signature, &bound);
        let compiled = self.compile::<LaunchError>(&spec)?;

        let snapshot: Vec<ArgValue> = bound.iter().map(KernelArg::to_arg_value).collect();
        let shapes: Vec<Vec<usize>> = bound
            .iter()
            .map(|arg| arg.as_tensor().map(Tensor::shape).unwrap_or_default())
            .collect();

        let mut values = snapshot.clone();
        debug!("launching `{}` on {:?} with {}", self.name(), grid, self.inner.executor.name());
        self.inner.executor.launch(&compiled.forward, grid, &mut values)?;

        let declaration = &self.inner.declaration;
        let mut produced = FxHashMap::default();
        for (index, (arg, value)) in bound.iter().zip(values).enumerate() {
            let (Some(tensor), Some(buffer)) = (arg.as_tensor(), value.into_buffer()) else {
                continue;
            };
            let data = to_array(buffer, &shapes[index])?;
            if declaration.outputs.contains(&index) {
                produced.insert(index, (data, tensor.dtype()));
            } else {
                tensor.overwrite(data);
            }
        }
        let outputs: Vec<(ArrayD<f64>, DType)> = declaration
            .outputs
            .iter()
            .filter_map(|o| produced.remove(o))
            .collect();

        let saved = SavedLaunch {
            grid,
            specialization: spec,
            args: snapshot,
            shapes,
            compiled,
        };
        let inputs: Vec<Tensor> = declaration
            .inputs
            .iter()
            .filter_map(|&i| bound[i].as_tensor().cloned())
            .collect();
        let grad_fn = KernelBackward {
            kernel: self.clone(),
            saved: saved.clone(),
        };
        Ok((Tensor::from_function(outputs, inputs, grad_fn), saved))
    }

    /// Launch the backward kernel of a saved forward call.
    ///
    /// `grads` holds one gradient per declared output, `None` meaning zero.
    /// Returns one entry per kernel parameter: the gradient for declared
    /// inputs, `None` for everything else.
    pub fn backward(
        &self,
        saved: &SavedLaunch,
        grid: Grid,
        grads: &[Option<ArrayD<f64>>],
    ) -> Result<Vec<Option<ArrayD<f64>>>, LaunchError> {
        if grid != saved.grid {
            return Err(LaunchError::GridMismatch {
                forward: saved.grid,
                backward: grid,
            });
        }
        let declaration = &self.inner.declaration;
        if grads.len() != declaration.outputs.len() {
            return Err(LaunchError::GradientCount {
                expected: declaration.outputs.len(),
                actual: grads.len(),
            });
        }

        let forward = &saved.compiled.forward;
        let mut args = saved.args.clone();
        for (&output, grad) in declaration.outputs.iter().zip(grads) {
            let shape = &saved.shapes[output];
            let dtype = forward.pointer_type(output);
            let seed = match grad {
                Some(g) if g.shape() != shape.as_slice() => {
                    return Err(LaunchError::GradientShape {
                        name: forward.param_name(output).to_string(),
                        expected: shape.clone(),
                        actual: g.shape().to_vec(),
                    });
                }
                Some(g) => Buffer::from_vec(g.iter().copied().collect(), dtype),
                None => Buffer::zeros(shape.iter().product(), dtype),
            };
            args.push(ArgValue::Buffer(seed));
        }
        for &input in &declaration.inputs {
            let len = saved.shapes[input].iter().product();
            args.push(ArgValue::Buffer(Buffer::zeros(len, forward.pointer_type(input))));
        }

        let lookup = |name: &str| -> Option<i64> {
            let (index, _) = forward.signature.lookup(name)?;
            match saved.args.get(index)? {
                ArgValue::Int(v) => Some(*v),
                ArgValue::Buffer(_) => None,
            }
        };
        let (body, summary) = saved.compiled.backward.body.resolve_writes(grid, &lookup);
        debug!(
            "launching `{}` on {:?}: {} plain stores, {} atomic adds",
            body.name, grid, summary.stores, summary.atomics
        );
        self.inner.executor.launch(&body, grid, &mut args)?;

        let mut result = vec![None; forward.signature.len()];
        for (&input, &grad_param) in declaration.inputs.iter().zip(&saved.compiled.backward.grad_params) {
            let Some(buffer) = args.get(grad_param).and_then(ArgValue::as_buffer) else {
                continue;
            };
            result[input] = Some(to_array(buffer.clone(), &saved.shapes[input])?);
        }
        Ok(result)
    }
}

fn to_array(buffer: Buffer, shape: &[usize]) -> Result<ArrayD<f64>, LaunchError> {
    let len = buffer.len();
    ArrayD::from_shape_vec(IxDyn(shape), buffer.data).map_err(|_| {
        LaunchError::Exec(ExecError::Ir(IrError::Reshape {
            from: vec![len],
            to: shape.to_vec(),
        }))
    })
}

/// Autograd node of a decorated-kernel call.
#[derive(Debug)]
struct KernelBackward {
    kernel: DifferentiableKernel,
    saved: SavedLaunch,
}

impl GradFn for KernelBackward {
    fn name(&self) -> &str {
        self.kernel.name()
    }

    fn apply(&self, grads: &[Option<ArrayD<f64>>]) -> crate::Result<Vec<Option<ArrayD<f64>>>> {
        let mut per_param = self.kernel.backward(&self.saved, self.saved.grid, grads)?;
        Ok(self
            .kernel
            .inner
            .declaration
            .inputs
            .iter()
            .map(|&i| per_param[i].take())
            .collect())
    }
}
