//! Dense and embedding layers with hand-written backward passes.
//!
//! All layers work on row-major minibatches: `(batch, features)`.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

/// Fully connected layer, `y = x Wᵀ + b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    /// (out, in)
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct LinearGrad {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Linear {
    /// Uniform(-1/sqrt(in), 1/sqrt(in)) init for weights and bias.
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let k = 1.0 / (in_dim.max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-k, k);
        Self {
            weight: Array2::from_shape_fn((out_dim, in_dim), |_| dist.sample(rng)),
            bias: Array1::from_shape_fn(out_dim, |_| dist.sample(rng)),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: ArrayView2<f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Returns parameter gradients and the gradient w.r.t. the input.
    pub fn backward(
        &self,
        x: ArrayView2<f64>,
        grad_out: ArrayView2<f64>,
    ) -> (LinearGrad, Array2<f64>) {
        let grad = LinearGrad {
            weight: grad_out.t().dot(&x),
            bias: grad_out.sum_axis(Axis(0)),
        };
        (grad, grad_out.dot(&self.weight))
    }

    pub fn zero_grad(&self) -> LinearGrad {
        LinearGrad {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }
}

/// Lookup table of learned vectors, one row per (folded) index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    /// (vocab, dim)
    pub table: Array2<f64>,
}

impl Embedding {
    /// N(0, 1) init.
    pub fn new<R: Rng + ?Sized>(vocab: usize, dim: usize, rng: &mut R) -> Self {
        Self {
            table: Array2::from_shape_fn((vocab, dim), |_| StandardNormal.sample(rng)),
        }
    }

    pub fn vocab(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    /// Indices past the table fold back modulo its size.
    pub fn slot(&self, index: usize) -> usize {
        index % self.vocab()
    }

    pub fn forward(&self, indices: &[usize]) -> Array2<f64> {
        let slots: Vec<usize> = indices.iter().map(|&i| self.slot(i)).collect();
        self.table.select(Axis(0), &slots)
    }

    /// Dense gradient of the table: rows scatter-added per index.
    pub fn backward(&self, indices: &[usize], grad_out: ArrayView2<f64>) -> Array2<f64> {
        let mut grad = Array2::zeros(self.table.raw_dim());
        for (row, &i) in indices.iter().enumerate() {
            let mut slot = grad.row_mut(self.slot(i));
            slot += &grad_out.row(row);
        }
        grad
    }
}

pub fn relu(x: &Array2<f64>) -> Array2<f64> {
    x.mapv(|v| v.max(0.0))
}

/// Gate `grad` by the sign of the pre-activation.
pub fn relu_backward(pre: &Array2<f64>, grad: &Array2<f64>) -> Array2<f64> {
    let mut out = grad.clone();
    out.zip_mut_with(pre, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward_backward_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new(3, 2, &mut rng);
        let x = array![[1.0, 2.0, 3.0], [0.0, -1.0, 0.5]];
        let y = layer.forward(x.view());
        assert_eq!(y.dim(), (2, 2));

        let (grad, gx) = layer.backward(x.view(), Array2::ones((2, 2)).view());
        assert_eq!(grad.weight.dim(), (2, 3));
        assert_eq!(grad.bias, array![2.0, 2.0]);
        assert_eq!(gx.dim(), (2, 3));
        // dL/dW[o, i] = sum_b x[b, i] when grad_out is all ones
        assert_eq!(grad.weight.row(0).to_vec(), vec![1.0, 1.0, 3.5]);
    }

    #[test]
    fn test_linear_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::new(2, 1, &mut rng);
        let x = array![[0.3, -0.7]];
        let loss = |l: &Linear| l.forward(x.view()).sum().powi(2);

        let out = layer.forward(x.view());
        let grad_out = out.mapv(|v| 2.0 * v);
        let (grad, _) = layer.backward(x.view(), grad_out.view());

        let eps = 1e-6;
        let mut bumped = layer.clone();
        bumped.weight[[0, 1]] += eps;
        let numeric = (loss(&bumped) - loss(&layer)) / eps;
        assert!((numeric - grad.weight[[0, 1]]).abs() < 1e-4);
    }

    #[test]
    fn test_embedding_folds_and_scatters() {
        let mut rng = StdRng::seed_from_u64(2);
        let emb = Embedding::new(4, 2, &mut rng);
        let rows = emb.forward(&[1, 5]);
        assert_eq!(rows.row(0), rows.row(1));

        let grad = emb.backward(&[1, 5, 2], array![[1.0, 1.0], [2.0, 0.0], [0.5, 0.5]].view());
        assert_eq!(grad.row(1).to_vec(), vec![3.0, 1.0]);
        assert_eq!(grad.row(2).to_vec(), vec![0.5, 0.5]);
        assert_eq!(grad.row(0).sum(), 0.0);
    }

    #[test]
    fn test_relu_backward_masks_inactive_units() {
        let pre = array![[-1.0, 2.0], [0.0, 0.5]];
        assert_eq!(relu(&pre), array![[0.0, 2.0], [0.0, 0.5]]);
        let g = relu_backward(&pre, &Array2::ones((2, 2)));
        assert_eq!(g, array![[0.0, 1.0], [0.0, 1.0]]);
    }
}
