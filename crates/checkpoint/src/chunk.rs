//! Storage chunk shape selection

use runtime_core::{Error, Result};

/// Divisors of `n` in ascending order (`[1]` for an empty axis)
fn divisors(n: usize) -> Vec<usize> {
    if n == 0 {
        return vec![1];
    }
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            small.push(i);
            if i != n / i {
                large.push(n / i);
            }
        }
        i += 1;
    }
    small.extend(large.into_iter().rev());
    small
}

/// Choose a chunk shape for a local write of `write_shape`
///
/// Every chunk dimension divides the matching write dimension and the chunk
/// holds at most `target_elements` elements. Starting from the full write
/// shape, the axis with the largest current chunk dimension (the first such
/// axis on ties) is repeatedly shrunk to its next smaller divisor.
pub fn choose_chunk_shape(write_shape: &[usize], target_elements: usize) -> Result<Vec<usize>> {
    if target_elements == 0 {
        return Err(Error::invalid_config("chunk target must be at least one element"));
    }

    let mut candidates: Vec<Vec<usize>> = write_shape.iter().map(|&d| divisors(d)).collect();
    let current = |candidates: &[Vec<usize>]| -> Vec<usize> {
        candidates
            .iter()
            .map(|c| c.last().copied().unwrap_or(1))
            .collect()
    };

    loop {
        let shape = current(&candidates);
        if shape.iter().product::<usize>() <= target_elements {
            return Ok(shape);
        }

        // Product exceeds a positive target, so some axis is above 1
        let mut axis = 0;
        for (i, &dim) in shape.iter().enumerate() {
            if dim > shape[axis] {
                axis = i;
            }
        }
        candidates[axis].pop();
    }
}
