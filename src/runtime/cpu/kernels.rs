//! Convolution kernels of the CPU runtime.
//!
//! All kernels read operands through their element strides, so they work for
//! row-major and channels-last layouts alike. Products are accumulated in
//! `f64` in logical output order; the result is then scattered into the
//! output buffer and narrowed once per element.

use crate::dtype::{Element, round_to_tf32};
use crate::shape::ConvGeometry;
use crate::tensor::for_each_offset;
use rayon::prelude::*;
use std::ops::Range;

/// How operand values are rounded before multiplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Native,
    DownConvert,
    Tf32,
}

#[inline]
fn load<T: Element>(v: T, precision: Precision) -> f64 {
    match precision {
        Precision::Native => v.to_f64(),
        Precision::DownConvert => v.down_converted(),
        #[allow(clippy::cast_possible_truncation)]
        Precision::Tf32 => f64::from(round_to_tf32(v.to_f64() as f32)),
    }
}

/// Element strides of the three operands plus the output extents.
#[derive(Debug, Clone, Copy)]
pub struct Layout<'a> {
    pub x: &'a [usize],
    pub w: &'a [usize],
    pub y: &'a [usize],
    pub y_shape: &'a [usize],
}

/// Scaling applied when writing results.
#[derive(Debug, Clone, Copy)]
pub struct Blend {
    pub alpha: f64,
    pub beta: f64,
}

struct Problem<'a, T> {
    g: &'a ConvGeometry,
    layout: Layout<'a>,
    points: Vec<Vec<usize>>,
    x: &'a [T],
    w: &'a [T],
}

impl<T: Element> Problem<'_, T> {
    /// `(n, co, spatial)` coordinates of a logical output index.
    fn split(&self, linear: usize) -> (usize, usize, usize) {
        let out_len = self.g.output_spatial_len();
        let spatial = linear % out_len;
        let rest = linear / out_len;
        (rest / self.g.out_channels, rest % self.g.out_channels, spatial)
    }

    /// Partial sum of one output element over the in-group channels `channels`.
    fn accumulate(
        &self,
        n: usize,
        co: usize,
        out: &[usize],
        channels: Range<usize>,
        precision: Precision,
    ) -> f64 {
        let (g, xs, ws) = (self.g, self.layout.x, self.layout.w);
        let first = (co / g.out_channels_per_group()) * g.in_channels_per_group();
        let mut acc = 0.0;
        'points: for kp in &self.points {
            let mut x_off = n * xs[0];
            let mut w_off = co * ws[0];
            for d in 0..g.spatial_rank() {
                let Some(p) = g.input_coord(d, out[d], kp[d]) else {
                    continue 'points;
                };
                x_off += p * xs[d + 2];
                w_off += kp[d] * ws[d + 2];
            }
            for c in channels.clone() {
                let xv = self.x[x_off + (first + c) * xs[1]];
                let wv = self.w[w_off + c * ws[1]];
                acc += load(xv, precision) * load(wv, precision);
            }
        }
        acc
    }
}

fn scatter<T: Element>(values: &[f64], layout: Layout<'_>, blend: Blend, y: &mut [T]) {
    for_each_offset(layout.y_shape, layout.y, |linear, offset| {
        let mut v = blend.alpha * values[linear];
        if blend.beta != 0.0 {
            v += blend.beta * y[offset].to_f64();
        }
        y[offset] = T::from_f64(v);
    });
}

/// Direct convolution, one parallel task per output element.
pub fn direct<T: Element>(
    g: &ConvGeometry,
    layout: Layout<'_>,
    blend: Blend,
    precision: Precision,
    x: &[T],
    w: &[T],
    y: &mut [T],
) {
    let problem = Problem { g, layout, points: g.kernel_points(), x, w };
    let cpg = g.in_channels_per_group();
    let values: Vec<f64> = (0..g.output_numel())
        .into_par_iter()
        .map_init(
            || vec![0usize; g.spatial_rank()],
            |out, linear| {
                let (n, co, spatial) = problem.split(linear);
                g.unravel_output(spatial, out);
                problem.accumulate(n, co, &out[..], 0..cpg, precision)
            },
        )
        .collect();
    scatter(&values, layout, blend, y);
}

/// Reduction split across input-channel chunks, summed with `rayon::reduce`.
///
/// Partial results are combined in whatever order the pool finishes them.
pub fn split_reduce<T: Element>(g: &ConvGeometry, layout: Layout<'_>, blend: Blend, x: &[T], w: &[T], y: &mut [T]) {
    let problem = Problem { g, layout, points: g.kernel_points(), x, w };
    let numel = g.output_numel();
    let cpg = g.in_channels_per_group();
    let chunks = cpg.min(rayon::current_num_threads()).max(1);
    let chunk_len = cpg.div_ceil(chunks).max(1);

    let values = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let channels = (chunk * chunk_len).min(cpg)..((chunk + 1) * chunk_len).min(cpg);
            let mut out = vec![0usize; g.spatial_rank()];
            let mut partial = vec![0.0; numel];
            for (linear, slot) in partial.iter_mut().enumerate() {
                let (n, co, spatial) = problem.split(linear);
                g.unravel_output(spatial, &mut out);
                *slot = problem.accumulate(n, co, &out, channels.clone(), Precision::Native);
            }
            partial
        })
        .reduce(
            || vec![0.0; numel],
            |mut a, b| {
                a.iter_mut().zip(&b).for_each(|(l, r)| *l += r);
                a
            },
        );
    scatter(&values, layout, blend, y);
}

/// Column-matrix bytes `im2col` needs for one batch item.
pub fn im2col_workspace_size(g: &ConvGeometry, element_size: usize) -> usize {
    g.in_channels
        .saturating_mul(g.kernel_len())
        .saturating_mul(g.output_spatial_len())
        .saturating_mul(element_size)
}

/// Lowers each batch item into `col` (`[cin * kernel, out]`) and multiplies
/// by the weight matrix. Requires `groups == 1` and
/// `col.len() >= cin * kernel * out`.
pub fn im2col_gemm<T: Element>(
    g: &ConvGeometry,
    layout: Layout<'_>,
    blend: Blend,
    x: &[T],
    w: &[T],
    col: &mut [T],
    y: &mut [T],
) {
    let (xs, ws) = (layout.x, layout.w);
    let points = g.kernel_points();
    let kl = g.kernel_len();
    let cols = g.output_spatial_len();
    let rows = g.in_channels * kl;
    let col = &mut col[..rows * cols];

    let w_row_offsets: Vec<usize> = (0..rows)
        .map(|r| {
            let kp = &points[r % kl];
            (r / kl) * ws[1] + kp.iter().enumerate().map(|(d, k)| k * ws[d + 2]).sum::<usize>()
        })
        .collect();

    let mut values = vec![0.0; g.output_numel()];
    for n in 0..g.batch {
        col.par_chunks_mut(cols.max(1)).enumerate().for_each(|(r, row)| {
            let (ci, kp) = (r / kl, &points[r % kl]);
            let mut out = vec![0usize; g.spatial_rank()];
            for (c, slot) in row.iter_mut().enumerate() {
                g.unravel_output(c, &mut out);
                let mut off = n * xs[0] + ci * xs[1];
                let mut inside = true;
                for d in 0..g.spatial_rank() {
                    match g.input_coord(d, out[d], kp[d]) {
                        Some(p) => off += p * xs[d + 2],
                        None => {
                            inside = false;
                            break;
                        }
                    }
                }
                *slot = if inside { x[off] } else { T::from_f64(0.0) };
            }
        });

        let col: &[T] = col;
        let batch = &mut values[n * g.out_channels * cols..(n + 1) * g.out_channels * cols];
        batch.par_chunks_mut(cols.max(1)).enumerate().for_each(|(co, out_row)| {
            for (r, &w_off) in w_row_offsets.iter().enumerate() {
                let wv = w[co * ws[0] + w_off].to_f64();
                let col_row = &col[r * cols..(r + 1) * cols];
                for (acc, &cv) in out_row.iter_mut().zip(col_row) {
                    *acc += wv * cv.to_f64();
                }
            }
        });
    }
    scatter(&values, layout, blend, y);
}
