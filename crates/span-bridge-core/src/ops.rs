/// CPU kernels for the primitive operations the decomposed modules are
/// expressed in: matmul, linear, softmax, layer norm and activations.
///
/// All kernels are single-threaded; the parity tooling never introduces
/// parallelism so per-sample latency stays attributable.
use crate::error::{Error, Result};

/// Naive matrix multiplication: C = A * B
///
/// A: [M, K]
/// B: [K, N]
/// C: [M, N]
pub fn matmul_f32(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) -> Result<()> {
    if a.len() != m * k {
        return Err(Error::InvalidShape(format!(
            "Matrix A size mismatch: expected {}, got {}",
            m * k,
            a.len()
        )));
    }
    if b.len() != k * n {
        return Err(Error::InvalidShape(format!(
            "Matrix B size mismatch: expected {}, got {}",
            k * n,
            b.len()
        )));
    }
    if c.len() != m * n {
        return Err(Error::InvalidShape(format!(
            "Matrix C size mismatch: expected {}, got {}",
            m * n,
            c.len()
        )));
    }

    c.fill(0.0);
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for l in 0..k {
                sum += a[i * k + l] * b[l * n + j];
            }
            c[i * n + j] = sum;
        }
    }

    Ok(())
}

/// Matrix multiplication with transposed B: C = A * B^T
///
/// A: [M, K]
/// B: [N, K] (row-major, accessed as transposed)
/// C: [M, N]
///
/// Linear layer weights are stored [out_features, in_features], so this is
/// the natural projection kernel.
pub fn matmul_transposed(
    a: &[f32],
    b_t: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    if a.len() != m * k {
        return Err(Error::InvalidShape(format!(
            "Matrix A size mismatch: expected {}, got {}",
            m * k,
            a.len()
        )));
    }
    if b_t.len() != n * k {
        return Err(Error::InvalidShape(format!(
            "Matrix B^T size mismatch: expected {}, got {}",
            n * k,
            b_t.len()
        )));
    }
    if c.len() != m * n {
        return Err(Error::InvalidShape(format!(
            "Matrix C size mismatch: expected {}, got {}",
            m * n,
            c.len()
        )));
    }

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for l in 0..k {
                sum += a[i * k + l] * b_t[j * k + l];
            }
            c[i * n + j] = sum;
        }
    }

    Ok(())
}

/// Affine projection: output = input * weight^T + bias
///
/// input: [M, in_features], weight: [out_features, in_features],
/// bias: [out_features] (optional), output: [M, out_features]
pub fn linear(
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
    m: usize,
    in_features: usize,
    out_features: usize,
) -> Result<()> {
    matmul_transposed(input, weight, output, m, in_features, out_features)?;
    if let Some(bias) = bias {
        if bias.len() != out_features {
            return Err(Error::InvalidShape(format!(
                "Bias size mismatch: expected {}, got {}",
                out_features,
                bias.len()
            )));
        }
        for row in output.chunks_exact_mut(out_features) {
            for (v, b) in row.iter_mut().zip(bias.iter()) {
                *v += b;
            }
        }
    }
    Ok(())
}

/// Row-wise softmax over a [rows, cols] buffer, in place.
pub fn softmax_rows(data: &mut [f32], rows: usize, cols: usize) -> Result<()> {
    if data.len() != rows * cols {
        return Err(Error::InvalidShape(format!(
            "Softmax buffer size mismatch: expected {}, got {}",
            rows * cols,
            data.len()
        )));
    }

    for row in data.chunks_exact_mut(cols) {
        // Max-subtraction for numerical stability
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }

    Ok(())
}

/// Row-wise layer normalization over a [rows, dim] buffer, in place.
pub fn layer_norm_rows(
    data: &mut [f32],
    rows: usize,
    dim: usize,
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
) -> Result<()> {
    if data.len() != rows * dim {
        return Err(Error::InvalidShape(format!(
            "LayerNorm buffer size mismatch: expected {}, got {}",
            rows * dim,
            data.len()
        )));
    }
    if gamma.len() != dim || beta.len() != dim {
        return Err(Error::InvalidShape(format!(
            "LayerNorm gamma/beta size mismatch: expected {}, got {}/{}",
            dim,
            gamma.len(),
            beta.len()
        )));
    }

    for row in data.chunks_exact_mut(dim) {
        let mean: f32 = row.iter().sum::<f32>() / dim as f32;
        let variance: f32 = row.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / dim as f32;
        let std = (variance + eps).sqrt();
        for (v, (g, b)) in row.iter_mut().zip(gamma.iter().zip(beta.iter())) {
            *v = g * ((*v - mean) / std) + b;
        }
    }

    Ok(())
}

/// ReLU activation, in place.
pub fn relu_inplace(data: &mut [f32]) {
    for v in data.iter_mut() {
        *v = v.max(0.0);
    }
}

/// Logistic sigmoid, in place.
pub fn sigmoid_inplace(data: &mut [f32]) {
    for v in data.iter_mut() {
        *v = 1.0 / (1.0 + (-*v).exp());
    }
}

/// Elementwise addition: a += b
pub fn add_inplace(a: &mut [f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::InvalidShape(format!(
            "Add size mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
    Ok(())
}
