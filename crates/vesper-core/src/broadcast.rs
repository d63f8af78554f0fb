//! NumPy-style broadcasting helpers used by elementwise folding.

use crate::{Error, Result};

/// Compute the broadcast output shape of two input shapes.
///
/// Shapes are aligned from the rightmost dimension; two dimensions match if
/// they are equal or one of them is 1, and missing leading dimensions count
/// as 1.
///
/// ```text
/// broadcast_shape(&[2, 3, 4], &[3, 4])       -> [2, 3, 4]
/// broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]) -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut result = Vec::with_capacity(rank);

    for i in 0..rank {
        let da = aligned_dim(a, rank, i);
        let db = aligned_dim(b, rank, i);

        if da == db || db == 1 {
            result.push(da);
        } else if da == 1 {
            result.push(db);
        } else {
            return Err(Error::Shape(format!(
                "Cannot broadcast shapes {:?} and {:?} at dimension {i}",
                a, b
            )));
        }
    }

    Ok(result)
}

/// Map a flat index in the broadcast output back to a flat index into an
/// input of shape `input`.
pub fn source_index(output: &[usize], input: &[usize], flat: usize) -> usize {
    let offset = output.len() - input.len();
    let mut remaining = flat;
    let mut index = 0;
    let mut stride = 1;

    for axis in (0..output.len()).rev() {
        let coord = remaining % output[axis];
        remaining /= output[axis];
        if axis >= offset {
            let dim = input[axis - offset];
            if dim != 1 {
                index += coord * stride;
            }
            stride *= dim;
        }
    }

    index
}

fn aligned_dim(shape: &[usize], rank: usize, i: usize) -> usize {
    let pad = rank - shape.len();
    if i < pad {
        1
    } else {
        shape[i - pad]
    }
}
