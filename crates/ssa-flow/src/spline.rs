//! Element-wise monotonic rational splines.
//!
//! Each of the `dim` coordinates gets its own spline with `count_bins`
//! bins covering `[-bound, bound]`; outside that interval the transform is
//! the identity with zero log-Jacobian. Two families are supported:
//!
//! - **quadratic**: rational-quadratic segments (Durkan et al., 2019)
//! - **linear**: rational-linear segments, each split at a learnable
//!   fraction `λ` of the bin (Dolatabadi et al., 2020)
//!
//! ## Parameterization
//!
//! ```text
//! widths  = (min_w + (1 - K·min_w) · softmax(u_w)) · 2·bound
//! heights = (min_h + (1 - K·min_h) · softmax(u_h)) · 2·bound
//! derivs  = [1, min_d + softplus(u_d), 1]          (K + 1 knots)
//! λ       = min_λ + (1 - 2·min_λ) · sigmoid(u_λ)   (linear only)
//! ```
//!
//! Unit derivatives at both ends make the spline join the identity tails
//! with a continuous first derivative.

use candle_core::{DType, Tensor, D};
use candle_nn::{Init, VarBuilder};
use ssa_core::FlowOrder;

pub const MIN_BIN_WIDTH: f64 = 1e-3;
pub const MIN_BIN_HEIGHT: f64 = 1e-3;
pub const MIN_DERIVATIVE: f64 = 1e-3;
pub const MIN_LAMBDA: f64 = 0.025;

/// Static shape of one spline layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplineShape {
    pub dim: usize,
    pub count_bins: usize,
    pub bound: f64,
    pub order: FlowOrder,
}

impl SplineShape {
    /// Names and shapes of the layer's learnable tensors.
    pub fn parameters(&self) -> Vec<(&'static str, (usize, usize))> {
        let (d, k) = (self.dim, self.count_bins);
        let mut params = vec![
            ("widths", (d, k)),
            ("heights", (d, k)),
            ("derivatives", (d, k - 1)),
        ];
        if self.order == FlowOrder::Linear {
            params.push(("lambdas", (d, k)));
        }
        params
    }
}

/// One element-wise monotonic rational spline layer.
#[derive(Debug, Clone)]
pub struct RationalSpline {
    widths: Tensor,
    heights: Tensor,
    derivatives: Tensor,
    lambdas: Option<Tensor>,
    shape: SplineShape,
}

/// Per-bin quantities shared by forward and inverse passes, `[dim, K]` each.
struct Knots {
    widths: Tensor,
    left_x: Tensor,
    heights: Tensor,
    left_y: Tensor,
    d_lo: Tensor,
    d_hi: Tensor,
    lambdas: Option<Tensor>,
}

/// Knot quantities gathered for each element, `[batch, dim]` each.
struct Bins {
    w: Tensor,
    xk: Tensor,
    h: Tensor,
    yk: Tensor,
    dk: Tensor,
    dk1: Tensor,
    lambda: Option<Tensor>,
}

impl RationalSpline {
    /// Creates (or fetches) the layer parameters under `vb`.
    ///
    /// Widths, heights and derivatives start from `N(0, 1)`; lambdas from
    /// `U(0, 1)`.
    pub fn new(vb: VarBuilder, shape: SplineShape) -> candle_core::Result<Self> {
        let (d, k) = (shape.dim, shape.count_bins);
        let randn = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let widths = vb.get_with_hints((d, k), "widths", randn)?;
        let heights = vb.get_with_hints((d, k), "heights", randn)?;
        let derivatives = vb.get_with_hints((d, k - 1), "derivatives", randn)?;
        let lambdas = match shape.order {
            FlowOrder::Linear => Some(vb.get_with_hints(
                (d, k),
                "lambdas",
                Init::Uniform { lo: 0.0, up: 1.0 },
            )?),
            FlowOrder::Quadratic => None,
        };
        Ok(Self {
            widths,
            heights,
            derivatives,
            lambdas,
            shape,
        })
    }

    pub fn shape(&self) -> &SplineShape {
        &self.shape
    }

    /// Maps `x [batch, dim]` to `(y, log|dy/dx|)`, both `[batch, dim]`.
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let bound = self.shape.bound;
        let knots = self.knots()?;
        let inside = inside_mask(x, bound)?;
        let xc = x.clamp(-bound, bound)?;
        let bins = knots.gather(&bin_index(&xc, &knots.left_x)?)?;

        let (y, logdet) = match &bins.lambda {
            None => quadratic_forward(&xc, &bins)?,
            Some(lambda) => linear_forward(&xc, &bins, lambda)?,
        };

        let y = inside.where_cond(&y, x)?;
        let logdet = inside.where_cond(&logdet, &logdet.zeros_like()?)?;
        Ok((y, logdet))
    }

    /// Maps `y [batch, dim]` back to `x`.
    pub fn inverse(&self, y: &Tensor) -> candle_core::Result<Tensor> {
        let bound = self.shape.bound;
        let knots = self.knots()?;
        let inside = inside_mask(y, bound)?;
        let yc = y.clamp(-bound, bound)?;
        let bins = knots.gather(&bin_index(&yc, &knots.left_y)?)?;

        let x = match &bins.lambda {
            None => quadratic_inverse(&yc, &bins)?,
            Some(lambda) => linear_inverse(&yc, &bins, lambda)?,
        };
        inside.where_cond(&x, y)
    }

    fn knots(&self) -> candle_core::Result<Knots> {
        let k = self.shape.count_bins;
        let bound = self.shape.bound;
        let widths = normalized_bins(&self.widths, MIN_BIN_WIDTH, k, bound)?;
        let heights = normalized_bins(&self.heights, MIN_BIN_HEIGHT, k, bound)?;
        let left_x = left_edges(&widths, bound)?;
        let left_y = left_edges(&heights, bound)?;

        let inner = softplus(&self.derivatives)?.affine(1.0, MIN_DERIVATIVE)?;
        let ones = Tensor::ones((self.shape.dim, 1), inner.dtype(), inner.device())?;
        let derivs = Tensor::cat(&[&ones, &inner, &ones], 1)?;
        let d_lo = derivs.narrow(1, 0, k)?;
        let d_hi = derivs.narrow(1, 1, k)?;

        let lambdas = match &self.lambdas {
            Some(raw) => Some(sigmoid(raw)?.affine(1.0 - 2.0 * MIN_LAMBDA, MIN_LAMBDA)?),
            None => None,
        };
        Ok(Knots {
            widths,
            left_x,
            heights,
            left_y,
            d_lo,
            d_hi,
            lambdas,
        })
    }
}

impl Knots {
    fn gather(&self, idx: &Tensor) -> candle_core::Result<Bins> {
        Ok(Bins {
            w: select_bins(&self.widths, idx)?,
            xk: select_bins(&self.left_x, idx)?,
            h: select_bins(&self.heights, idx)?,
            yk: select_bins(&self.left_y, idx)?,
            dk: select_bins(&self.d_lo, idx)?,
            dk1: select_bins(&self.d_hi, idx)?,
            lambda: match &self.lambdas {
                Some(l) => Some(select_bins(l, idx)?),
                None => None,
            },
        })
    }
}

fn quadratic_forward(x: &Tensor, b: &Bins) -> candle_core::Result<(Tensor, Tensor)> {
    let s = (&b.h / &b.w)?;
    let xi = ((x - &b.xk)? / &b.w)?;
    let one_minus = xi.affine(-1.0, 1.0)?;
    let xi1m = (&xi * &one_minus)?;
    let xi2 = xi.sqr()?;

    // y = yk + h·(s·ξ² + dk·ξ(1-ξ)) / (s + (dk1 + dk - 2s)·ξ(1-ξ))
    let slope_sum = ((&b.dk1 + &b.dk)? - s.affine(2.0, 0.0)?)?;
    let numerator = (&b.h * ((&s * &xi2)? + (&b.dk * &xi1m)?)?)?;
    let denominator = (&s + (&slope_sum * &xi1m)?)?;
    let y = (&b.yk + (&numerator / &denominator)?)?;

    let deriv_num = (s.sqr()?
        * (((&b.dk1 * &xi2)? + (&s * &xi1m)?.affine(2.0, 0.0)?)? + (&b.dk * one_minus.sqr()?)?)?)?;
    let logdet = (deriv_num.log()? - denominator.log()?.affine(2.0, 0.0)?)?;
    Ok((y, logdet))
}

fn quadratic_inverse(y: &Tensor, b: &Bins) -> candle_core::Result<Tensor> {
    let s = (&b.h / &b.w)?;
    let dy = (y - &b.yk)?;
    let slope_sum = ((&b.dk1 + &b.dk)? - s.affine(2.0, 0.0)?)?;

    let a = ((&b.h * (&s - &b.dk)?)? + (&dy * &slope_sum)?)?;
    let bq = ((&b.h * &b.dk)? - (&dy * &slope_sum)?)?;
    let c = (&s * &dy)?.neg()?;
    let disc = (bq.sqr()? - (&a * &c)?.affine(4.0, 0.0)?)?.relu()?;
    // ξ = 2c / (-b - √disc), the root that stays in [0, 1]
    let xi = (c.affine(2.0, 0.0)? / (bq.neg()? - disc.sqrt()?)?)?;
    (&xi * &b.w)? + &b.xk
}

fn linear_forward(
    x: &Tensor,
    b: &Bins,
    lambda: &Tensor,
) -> candle_core::Result<(Tensor, Tensor)> {
    let LinearWeights { wb, wc, ya, yb, yc } = linear_weights(b, lambda)?;
    let theta = ((x - &b.xk)? / &b.w)?;
    let left = theta.le(lambda)?;
    let lam_minus = (lambda - &theta)?;
    let one_minus = theta.affine(-1.0, 1.0)?;
    let theta_minus = (&theta - lambda)?;

    // wa = 1 throughout
    let num_left = ((&ya * &lam_minus)? + (&wc * &yc)?.mul(&theta)?)?;
    let den_left = (&lam_minus + (&wc * &theta)?)?;
    let num_right = ((&wc * &yc)?.mul(&one_minus)? + (&wb * &yb)?.mul(&theta_minus)?)?;
    let den_right = ((&wc * &one_minus)? + (&wb * &theta_minus)?)?;
    let dnum_left = ((&wc * lambda)? * (&yc - &ya)?)?;
    let dnum_right = ((&wb * &wc)? * (lambda.affine(-1.0, 1.0)? * (&yb - &yc)?)?)?;

    let numerator = left.where_cond(&num_left, &num_right)?;
    let denominator = left.where_cond(&den_left, &den_right)?;
    let deriv_num = (left.where_cond(&dnum_left, &dnum_right)? / &b.w)?;

    let y = (&numerator / &denominator)?;
    let logdet = (deriv_num.log()? - denominator.abs()?.log()?.affine(2.0, 0.0)?)?;
    Ok((y, logdet))
}

fn linear_inverse(y: &Tensor, b: &Bins, lambda: &Tensor) -> candle_core::Result<Tensor> {
    let LinearWeights { wb, wc, ya, yb, yc } = linear_weights(b, lambda)?;
    let left = y.le(&yc)?;
    let wc_yc = (&wc * &yc)?;
    let lam_wb = (lambda * &wb)?;

    let num_left = (lambda * (&ya - y)?)?;
    let den_left = ((((&wc - 1.0)? * y)? + &ya)? - &wc_yc)?;
    let num_right = ((((&wc - &lam_wb)? * y)? + (&lam_wb * &yb)?)? - &wc_yc)?;
    let den_right = ((((&wc - &wb)? * y)? + (&wb * &yb)?)? - &wc_yc)?;

    let numerator = left.where_cond(&num_left, &num_right)?;
    let denominator = left.where_cond(&den_left, &den_right)?;
    let theta = (&numerator / &denominator)?;
    (&theta * &b.w)? + &b.xk
}

struct LinearWeights {
    wb: Tensor,
    wc: Tensor,
    ya: Tensor,
    yb: Tensor,
    yc: Tensor,
}

/// Segment weights of a rational-linear bin with `wa = 1`.
///
/// `wb = √(dk / dk1)` makes the end-point derivatives match the knots.
fn linear_weights(b: &Bins, lambda: &Tensor) -> candle_core::Result<LinearWeights> {
    let s = (&b.h / &b.w)?;
    let wb = (&b.dk / &b.dk1)?.sqrt()?;
    let one_minus_lam = lambda.affine(-1.0, 1.0)?;
    let wc = ((((lambda * &b.dk)? + ((&one_minus_lam * &wb)? * &b.dk1)?)?) / &s)?;
    let ya = b.yk.clone();
    let yb = (&b.yk + &b.h)?;
    let lam_wb = (lambda * &wb)?;
    let yc = ((((&one_minus_lam * &ya)? + (&lam_wb * &yb)?)?) / (&one_minus_lam + &lam_wb)?)?;
    Ok(LinearWeights { wb, wc, ya, yb, yc })
}

/// Bin sizes in data units: `(min + (1 - K·min)·softmax(u))·2·bound`.
fn normalized_bins(
    raw: &Tensor,
    min_size: f64,
    count_bins: usize,
    bound: f64,
) -> candle_core::Result<Tensor> {
    candle_nn::ops::softmax(raw, D::Minus1)?
        .affine(1.0 - min_size * count_bins as f64, min_size)?
        .affine(2.0 * bound, 0.0)
}

/// Left edge of every bin, starting at `-bound`.
fn left_edges(sizes: &Tensor, bound: f64) -> candle_core::Result<Tensor> {
    let (dim, k) = sizes.dims2()?;
    let cumulative = sizes.cumsum(1)?.narrow(1, 0, k - 1)?;
    let zeros = Tensor::zeros((dim, 1), sizes.dtype(), sizes.device())?;
    Tensor::cat(&[&zeros, &cumulative], 1)?.affine(1.0, -bound)
}

/// Index of the bin containing each element, `[batch, dim, 1]` u32.
///
/// Computed on the host: bin membership carries no gradient.
fn bin_index(values: &Tensor, left_edges: &Tensor) -> candle_core::Result<Tensor> {
    let rows = values.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let edges = left_edges.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let (n, d) = values.dims2()?;
    let mut idx = Vec::with_capacity(n * d);
    for row in &rows {
        for (j, &v) in row.iter().enumerate() {
            let bin = edges[j][1..].iter().filter(|&&edge| v >= edge).count();
            idx.push(bin as u32);
        }
    }
    Tensor::from_vec(idx, (n, d, 1), values.device())
}

/// Picks `param[j, idx[i, j]]` for every element, giving `[batch, dim]`.
fn select_bins(param: &Tensor, idx: &Tensor) -> candle_core::Result<Tensor> {
    let (n, d, _) = idx.dims3()?;
    let m = param.dim(1)?;
    param
        .unsqueeze(0)?
        .broadcast_as((n, d, m))?
        .contiguous()?
        .gather(idx, 2)?
        .squeeze(2)
}

fn inside_mask(x: &Tensor, bound: f64) -> candle_core::Result<Tensor> {
    let ge = x.ge(-bound)?;
    let le = x.le(bound)?;
    ge.mul(&le)
}

/// Stable `log(1 + exp(x))`.
fn softplus(x: &Tensor) -> candle_core::Result<Tensor> {
    x.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?
}

fn sigmoid(x: &Tensor) -> candle_core::Result<Tensor> {
    (x.neg()?.exp()? + 1.0)?.recip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn host(data: Vec<f64>, rows: usize, cols: usize) -> Tensor {
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn spline(order: FlowOrder, var_map: &VarMap) -> RationalSpline {
        let vb = VarBuilder::from_varmap(var_map, ssa_core::DTYPE, &Device::Cpu);
        RationalSpline::new(
            vb.pp("spline"),
            SplineShape {
                dim: 3,
                count_bins: 8,
                bound: 3.0,
                order,
            },
        )
        .unwrap()
    }

    fn grid() -> Tensor {
        let data: Vec<f64> = (0..30).map(|i| -4.2 + 0.29 * i as f64).collect();
        host(data, 10, 3)
    }

    #[test]
    fn parameter_shapes_follow_order() {
        let shape = SplineShape {
            dim: 2,
            count_bins: 4,
            bound: 1.0,
            order: FlowOrder::Quadratic,
        };
        assert_eq!(shape.parameters().len(), 3);
        let linear = SplineShape {
            order: FlowOrder::Linear,
            ..shape
        };
        assert_eq!(linear.parameters()[2], ("derivatives", (2, 3)));
        assert_eq!(linear.parameters()[3], ("lambdas", (2, 4)));
    }

    #[test]
    fn inverse_recovers_input_both_orders() {
        for order in [FlowOrder::Linear, FlowOrder::Quadratic] {
            let var_map = VarMap::new();
            let layer = spline(order, &var_map);
            let x = grid();
            let (y, _) = layer.forward(&x).unwrap();
            let back = layer.inverse(&y).unwrap();
            let a = x.to_vec2::<f64>().unwrap();
            let b = back.to_vec2::<f64>().unwrap();
            for (ra, rb) in a.iter().zip(b.iter()) {
                for (va, vb) in ra.iter().zip(rb.iter()) {
                    assert_abs_diff_eq!(va, vb, epsilon = 1e-8);
                }
            }
        }
    }

    #[test]
    fn tails_are_identity() {
        let var_map = VarMap::new();
        let layer = spline(FlowOrder::Linear, &var_map);
        let x = host(vec![-7.0, 3.5, 12.0], 1, 3);
        let (y, logdet) = layer.forward(&x).unwrap();
        assert_eq!(y.to_vec2::<f64>().unwrap(), vec![vec![-7.0, 3.5, 12.0]]);
        assert_eq!(logdet.to_vec2::<f64>().unwrap(), vec![vec![0.0, 0.0, 0.0]]);
    }

    #[test]
    fn spline_is_monotonic() {
        for order in [FlowOrder::Linear, FlowOrder::Quadratic] {
            let var_map = VarMap::new();
            let layer = spline(order, &var_map);
            let data: Vec<f64> = (0..200)
                .flat_map(|i| {
                    let v = -3.0 + 0.03 * i as f64;
                    [v, v, v]
                })
                .collect();
            let (y, _) = layer.forward(&host(data, 200, 3)).unwrap();
            let y = y.to_vec2::<f64>().unwrap();
            for w in y.windows(2) {
                for j in 0..3 {
                    assert!(w[1][j] >= w[0][j], "{order}: spline not monotonic");
                }
            }
        }
    }

    #[test]
    fn logdet_matches_finite_difference() {
        for order in [FlowOrder::Linear, FlowOrder::Quadratic] {
            let var_map = VarMap::new();
            let layer = spline(order, &var_map);
            let eps = 1e-6;
            let base: Vec<f64> = vec![-2.1, 0.37, 1.9, -0.6, 2.4, 0.05];
            let x = host(base.clone(), 2, 3);
            let x_hi = host(base.iter().map(|v| v + eps).collect(), 2, 3);
            let x_lo = host(base.iter().map(|v| v - eps).collect(), 2, 3);
            let (_, logdet) = layer.forward(&x).unwrap();
            let (y_hi, _) = layer.forward(&x_hi).unwrap();
            let (y_lo, _) = layer.forward(&x_lo).unwrap();
            let ld = logdet.to_vec2::<f64>().unwrap();
            let hi = y_hi.to_vec2::<f64>().unwrap();
            let lo = y_lo.to_vec2::<f64>().unwrap();
            for i in 0..2 {
                for j in 0..3 {
                    let numeric = ((hi[i][j] - lo[i][j]) / (2.0 * eps)).ln();
                    assert_abs_diff_eq!(ld[i][j], numeric, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn forward_is_differentiable() {
        let var_map = VarMap::new();
        let layer = spline(FlowOrder::Linear, &var_map);
        let (y, logdet) = layer.forward(&grid()).unwrap();
        let loss = (y.sqr().unwrap().sum_all().unwrap() + logdet.sum_all().unwrap()).unwrap();
        let grads = loss.backward().unwrap();
        for var in var_map.all_vars() {
            let grad = grads.get(&var).expect("every spline parameter receives a gradient");
            let values = grad.flatten_all().unwrap().to_vec1::<f64>().unwrap();
            assert!(values.iter().all(|v| v.is_finite()));
        }
    }
}
