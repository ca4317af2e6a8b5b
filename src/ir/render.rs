//! Text rendering of kernel bodies
//!
//! The output reads like the tile language the kernel was written in, one
//! statement per node:
//!
//! ```text
//! kernel scale(x: *fp32, n: scalar) {
//!   %0 = load x[(pid0 * n)] : fp32[]
//!   %1 = mul %0, %0 : fp32[]
//!   store x[(pid0 * n)], %1
//! }
//! ```

use std::fmt::{self, Write};

use super::kernel::{KernelBody, ParamRole};
use super::node::{Access, Op, OpNode, WriteMode};

impl fmt::Display for KernelBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_kernel(self))
    }
}

/// Render a kernel body as text.
pub fn render_kernel(body: &KernelBody) -> String {
    let mut out = String::new();
    let params: Vec<String> = body
        .signature
        .params
        .iter()
        .enumerate()
        .map(|(i, p)| match p.role {
            ParamRole::Pointer => format!("{}: *{}", p.name, body.pointer_type(i)),
            ParamRole::Scalar => format!("{}: scalar", p.name),
            ParamRole::Constexpr => match body.specialization.constexprs.get(&p.name) {
                Some(value) => format!("{}: constexpr = {value}", p.name),
                None => format!("{}: constexpr", p.name),
            },
        })
        .collect();
    let _ = writeln!(out, "kernel {}({}) {{", body.name, params.join(", "));
    for (i, node) in body.nodes.iter().enumerate() {
        let _ = writeln!(out, "  {}", render_node(body, i, node));
    }
    out.push('}');
    out
}

fn render_access(body: &KernelBody, access: &Access) -> String {
    let mut text = format!("{}[{}]", body.param_name(access.ptr), access.address);
    if let Some(mask) = &access.mask {
        let _ = write!(text, " mask {mask}");
    }
    text
}

fn render_node(body: &KernelBody, index: usize, node: &OpNode) -> String {
    let ty = format!("{}{:?}", node.dtype, node.shape);
    match &node.op {
        Op::Load { access, other } => {
            let fallback = if access.mask.is_some() {
                format!(" other {other}")
            } else {
                String::new()
            };
            format!("%{index} = load {}{fallback} : {ty}", render_access(body, access))
        }
        Op::Store {
            access,
            value,
            mode,
        } => {
            let verb = match mode {
                WriteMode::Store => "store".to_string(),
                WriteMode::AtomicAdd => "atomic_add".to_string(),
                WriteMode::Guarded(cert) => format!("store_if {cert} else atomic_add"),
            };
            format!("{verb} {}, {value}", render_access(body, access))
        }
        Op::Const { value } => format!("%{index} = const {value} : {ty}"),
        Op::Arith { kind, operands } => {
            let args: Vec<String> = operands.iter().map(|id| id.to_string()).collect();
            format!("%{index} = {} {} : {ty}", kind.name(), args.join(", "))
        }
        Op::Reduce {
            kind,
            operand,
            axis,
        } => format!("%{index} = {} {operand}, axis={axis} : {ty}", kind.name()),
        Op::Broadcast { operand } => format!("%{index} = broadcast {operand} : {ty}"),
        Op::Reshape { operand } => format!("%{index} = reshape {operand} : {ty}"),
    }
}
