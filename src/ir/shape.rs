//! Tile shape helpers
//!
//! Shapes follow numpy broadcasting: dimensions are aligned from the right
//! and a dimension of extent 1 stretches to match the other side.

use crate::error::IrError;

/// Number of elements in a tile of the given shape.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Broadcast two shapes against each other.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, IrError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![1; rank];
    for (i, slot) in out.iter_mut().enumerate() {
        let l = dim_from_right(lhs, rank - 1 - i);
        let r = dim_from_right(rhs, rank - 1 - i);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(IrError::Broadcast {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

/// Broadcast any number of shapes.
pub fn broadcast_all<'a, I>(shapes: I) -> Result<Vec<usize>, IrError>
where
    I: IntoIterator<Item = &'a [usize]>,
{
    shapes
        .into_iter()
        .try_fold(Vec::new(), |acc, shape| broadcast_shapes(&acc, shape))
}

/// True if `from` can be broadcast to exactly `to`.
pub fn can_broadcast_to(from: &[usize], to: &[usize]) -> bool {
    matches!(broadcast_shapes(from, to), Ok(shape) if shape == to)
}

/// Insert a unit dimension at `axis`.
pub fn insert_axis(shape: &[usize], axis: usize) -> Result<Vec<usize>, IrError> {
    if axis > shape.len() {
        return Err(IrError::Axis {
            axis,
            rank: shape.len(),
        });
    }
    let mut out = shape.to_vec();
    out.insert(axis, 1);
    Ok(out)
}

/// Remove `axis` from a shape.
pub fn remove_axis(shape: &[usize], axis: usize) -> Result<Vec<usize>, IrError> {
    if axis >= shape.len() {
        return Err(IrError::Axis {
            axis,
            rank: shape.len(),
        });
    }
    let mut out = shape.to_vec();
    out.remove(axis);
    Ok(out)
}

fn dim_from_right(shape: &[usize], from_right: usize) -> usize {
    if from_right < shape.len() {
        shape[shape.len() - 1 - from_right]
    } else {
        1
    }
}
