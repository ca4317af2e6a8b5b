//! Call-time argument binding

use crate::autograd::Tensor;
use crate::error::LaunchError;
use crate::exec::{ArgValue, Buffer};
use crate::ir::{KernelSignature, ParamRole, Specialization};

/// An argument of a decorated-kernel call.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Tensor(Tensor),
    Int(i64),
}

impl From<Tensor> for KernelArg {
    fn from(tensor: Tensor) -> Self {
        KernelArg::Tensor(tensor)
    }
}

impl From<&Tensor> for KernelArg {
    fn from(tensor: &Tensor) -> Self {
        KernelArg::Tensor(tensor.clone())
    }
}

macro_rules! impl_from_integer_for_arg {
    ($($t:ty),*) => {
        $(
            impl From<$t> for KernelArg {
                fn from(n: $t) -> Self {
                    KernelArg::Int(n as i64)
                }
            }
        )*
    };
}

impl_from_integer_for_arg!(i32, i64, u32, usize);

impl KernelArg {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            KernelArg::Tensor(t) => Some(t),
            KernelArg::Int(_) => None,
        }
    }

    pub(crate) fn to_arg_value(&self) -> ArgValue {
        match self {
            KernelArg::Tensor(t) => ArgValue::Buffer(Buffer::from_vec(t.to_vec(), t.dtype())),
            KernelArg::Int(v) => ArgValue::Int(*v),
        }
    }
}

/// Bind positional arguments and named compile-time constants to the
/// signature, in parameter order.
pub(crate) fn bind(
    signature: &KernelSignature,
    positional: Vec<KernelArg>,
    named: &[(&str, i64)],
) -> Result<Vec<KernelArg>, LaunchError> {
    if positional.len() > signature.len() {
        return Err(LaunchError::TooManyArguments {
            expected: signature.len(),
            actual: positional.len(),
        });
    }
    let mut slots: Vec<Option<KernelArg>> = positional.into_iter().map(Some).collect();
    slots.resize(signature.len(), None);

    for &(name, value) in named {
        let Some((index, param)) = signature.lookup(name) else {
            return Err(LaunchError::UnknownKeyword(name.to_string()));
        };
        if param.role != ParamRole::Constexpr {
            return Err(LaunchError::UnknownKeyword(name.to_string()));
        }
        if slots[index].is_some() {
            return Err(LaunchError::DuplicateArgument(name.to_string()));
        }
        slots[index] = Some(KernelArg::Int(value));
    }

    signature
        .params
        .iter()
        .zip(slots)
        .map(|(param, slot)| {
            let arg = slot.ok_or_else(|| LaunchError::MissingArgument(param.name.clone()))?;
            let matches = matches!(
                (param.role, &arg),
                (ParamRole::Pointer, KernelArg::Tensor(_))
                    | (ParamRole::Scalar | ParamRole::Constexpr, KernelArg::Int(_))
            );
            if !matches {
                return Err(LaunchError::ArgumentKind {
                    name: param.name.clone(),
                    expected: param.role,
                });
            }
            Ok(arg)
        })
        .collect()
}

/// Specialization selected by bound arguments.
pub(crate) fn specialization_of(signature: &KernelSignature, args: &[KernelArg]) -> Specialization {
    signature
        .params
        .iter()
        .zip(args)
        .fold(Specialization::new(), |spec, (param, arg)| match (param.role, arg) {
            (ParamRole::Constexpr, KernelArg::Int(v)) => spec.with_constexpr(&param.name, *v),
            (ParamRole::Pointer, KernelArg::Tensor(t)) => spec.with_pointer_type(&param.name, t.dtype()),
            _ => spec,
        })
}
