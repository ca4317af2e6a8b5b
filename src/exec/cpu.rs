//! Reference interpreter for kernel bodies

use log::{debug, trace};
use ndarray::{ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use super::eval::{broadcast_owned, eval_address, eval_mask, IndexEnv};
use super::{validate_grid, ArgValue, Buffer, Grid, KernelExecutor};
use crate::error::{ExecError, IrError};
use crate::ir::shape::numel;
use crate::ir::{Access, KernelBody, NodeId, Op, OpNode, ParamRole, WriteMode};
use crate::rules::rules;

/// Order in which program instances run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schedule {
    /// Axis 0 fastest, then 1, then 2.
    #[default]
    RowMajor,
    /// A seeded random permutation of all program instances.
    Shuffled { seed: u64 },
}

/// Runs program instances sequentially on the host.
#[derive(Debug, Clone, Default)]
pub struct CpuExecutor {
    schedule: Schedule,
}

impl CpuExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn programs(&self, grid: Grid) -> Vec<[i64; 3]> {
        let mut programs = Vec::with_capacity(grid.iter().product());
        for z in 0..grid[2] {
            for y in 0..grid[1] {
                for x in 0..grid[0] {
                    programs.push([x as i64, y as i64, z as i64]);
                }
            }
        }
        if let Schedule::Shuffled { seed } = self.schedule {
            programs.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        programs
    }
}

fn check_args(kernel: &KernelBody, args: &[ArgValue]) -> Result<FxHashMap<String, i64>, ExecError> {
    if args.len() != kernel.signature.len() {
        return Err(ExecError::Arity {
            kernel: kernel.name.clone(),
            expected: kernel.signature.len(),
            actual: args.len(),
        });
    }
    let mut scalars = FxHashMap::default();
    for (param, arg) in kernel.signature.params.iter().zip(args) {
        match (param.role, arg) {
            (ParamRole::Pointer, ArgValue::Buffer(_)) => {}
            (ParamRole::Scalar | ParamRole::Constexpr, ArgValue::Int(v)) => {
                scalars.insert(param.name.clone(), *v);
            }
            (role, _) => {
                return Err(ExecError::ArgumentKind {
                    name: param.name.clone(),
                    expected: role,
                })
            }
        }
    }
    Ok(scalars)
}

fn buffer<'a>(kernel: &KernelBody, args: &'a mut [ArgValue], ptr: usize) -> Result<&'a mut Buffer, ExecError> {
    match args.get_mut(ptr) {
        Some(ArgValue::Buffer(buffer)) => Ok(buffer),
        _ => Err(ExecError::ArgumentKind {
            name: kernel.param_name(ptr).to_string(),
            expected: ParamRole::Pointer,
        }),
    }
}

fn operand<'a>(values: &'a [Option<ArrayD<f64>>], node: usize, id: NodeId) -> Result<&'a ArrayD<f64>, ExecError> {
    match values.get(id.0) {
        Some(Some(value)) if id.0 < node => Ok(value),
        _ => Err(ExecError::Ir(IrError::DanglingOperand {
            node: NodeId(node),
            operand: id,
        })),
    }
}

/// Offsets and lane mask of an access, broadcast to `shape`.
fn lanes(access: &Access, shape: &[usize], env: &IndexEnv<'_>) -> Result<(Vec<i64>, Vec<bool>), ExecError> {
    let offsets = broadcast_owned(&eval_address(&access.address, env)?, shape)?;
    let active = match &access.mask {
        Some(mask) => broadcast_owned(&eval_mask(mask, env)?, shape)?.iter().copied().collect(),
        None => vec![true; numel(shape)],
    };
    Ok((offsets.iter().copied().collect(), active))
}

fn slot(kernel: &KernelBody, buffer: &Buffer, ptr: usize, offset: i64) -> Result<usize, ExecError> {
    if offset < 0 || offset as usize >= buffer.len() {
        return Err(ExecError::OutOfBounds {
            param: kernel.param_name(ptr).to_string(),
            offset,
            len: buffer.len(),
        });
    }
    Ok(offset as usize)
}

fn from_vec(shape: &[usize], data: Vec<f64>) -> Result<ArrayD<f64>, ExecError> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
        ExecError::Ir(IrError::Reshape {
            from: vec![len],
            to: shape.to_vec(),
        })
    })
}

fn run_program(
    kernel: &KernelBody,
    env: &IndexEnv<'_>,
    args: &mut [ArgValue],
) -> Result<(), ExecError> {
    let mut values: Vec<Option<ArrayD<f64>>> = vec![None; kernel.len()];
    for (i, OpNode { op, shape, dtype }) in kernel.nodes.iter().enumerate() {
        let value = match op {
            Op::Load { access, other } => {
                let (offsets, active) = lanes(access, shape, env)?;
                let buffer = buffer(kernel, args, access.ptr)?;
                let mut data = Vec::with_capacity(offsets.len());
                for (offset, active) in offsets.into_iter().zip(active) {
                    if active {
                        data.push(buffer.data[slot(kernel, buffer, access.ptr, offset)?]);
                    } else {
                        data.push(*other);
                    }
                }
                Some(from_vec(shape, data)?)
            }
            Op::Store { access, value, mode } => {
                let value = operand(&values, i, *value)?;
                let value = broadcast_owned(value, shape)?;
                let (offsets, active) = lanes(access, shape, env)?;
                let buffer = buffer(kernel, args, access.ptr)?;
                let dtype = buffer.dtype;
                for ((offset, active), v) in offsets.into_iter().zip(active).zip(value.iter()) {
                    if !active {
                        continue;
                    }
                    let at = slot(kernel, buffer, access.ptr, offset)?;
                    buffer.data[at] = match mode {
                        WriteMode::Store => dtype.round(*v),
                        WriteMode::AtomicAdd => dtype.round(buffer.data[at] + v),
                        WriteMode::Guarded(_) => {
                            return Err(ExecError::UnresolvedWrite(kernel.param_name(access.ptr).to_string()))
                        }
                    };
                }
                None
            }
            Op::Const { value } => Some(ArrayD::from_elem(IxDyn(shape), *value)),
            Op::Arith { kind, operands } => {
                let inputs = operands
                    .iter()
                    .map(|&id| {
                        let value = operand(&values, i, id)?;
                        if value.shape() != shape.as_slice() {
                            return Err(ExecError::Ir(IrError::Broadcast {
                                lhs: value.shape().to_vec(),
                                rhs: shape.clone(),
                            }));
                        }
                        Ok(value.iter().copied().collect::<Vec<f64>>())
                    })
                    .collect::<Result<Vec<_>, ExecError>>()?;
                let mut lane = vec![0.0; inputs.len()];
                let mut data = Vec::with_capacity(numel(shape));
                for index in 0..numel(shape) {
                    for (slot, column) in lane.iter_mut().zip(&inputs) {
                        *slot = column[index];
                    }
                    let v = rules().eval_arith(*kind, &lane).ok_or_else(|| IrError::Arity {
                        op: kind.name().to_string(),
                        expected: kind.arity(),
                        actual: lane.len(),
                    })?;
                    data.push(dtype.round(v));
                }
                Some(from_vec(shape, data)?)
            }
            Op::Reduce { kind, operand: id, axis } => {
                let input = operand(&values, i, *id)?;
                if *axis >= input.ndim() {
                    return Err(ExecError::Ir(IrError::Axis {
                        axis: *axis,
                        rank: input.ndim(),
                    }));
                }
                let (identity, combine) = rules().reduction(*kind).ok_or_else(|| IrError::Arity {
                    op: kind.name().to_string(),
                    expected: 1,
                    actual: 0,
                })?;
                let reduced = input.map_axis(Axis(*axis), |lane| {
                    lane.iter().fold(identity, |acc, &v| combine(acc, v))
                });
                Some(reduced.mapv(|v| dtype.round(v)))
            }
            Op::Broadcast { operand: id } => Some(broadcast_owned(operand(&values, i, *id)?, shape)?),
            Op::Reshape { operand: id } => {
                let input = operand(&values, i, *id)?;
                if input.len() != numel(shape) {
                    return Err(ExecError::Ir(IrError::Reshape {
                        from: input.shape().to_vec(),
                        to: shape.clone(),
                    }));
                }
                Some(from_vec(shape, input.iter().copied().collect())?)
            }
        };
        values[i] = value;
    }
    Ok(())
}

impl KernelExecutor for CpuExecutor {
    fn name(&self) -> &str {
        "cpu"
    }

    fn launch(&self, kernel: &KernelBody, grid: Grid, args: &mut [ArgValue]) -> Result<(), ExecError> {
        if !validate_grid(grid) {
            return Err(ExecError::EmptyGrid(grid));
        }
        let scalars = check_args(kernel, args)?;
        let programs = self.programs(grid);
        debug!(
            "launching `{}` on {:?}: {} programs, {:?}",
            kernel.name,
            grid,
            programs.len(),
            self.schedule
        );
        for pid in programs {
            trace!("program {:?}", pid);
            let env = IndexEnv {
                pid,
                scalars: &scalars,
            };
            run_program(kernel, &env, args)?;
        }
        Ok(())
    }
}
