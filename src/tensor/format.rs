//! Tensor text rendering.
//!
//! Follows the layout numeric libraries commonly print: nested brackets,
//! right-aligned values of one shared width, four decimals, scientific
//! notation when magnitudes span too far, and `...` summarization for
//! large tensors.

use super::{Device, Shape};

const PRECISION: usize = 4;
const LINE_WIDTH: usize = 80;
const SUMMARIZE_THRESHOLD: usize = 1000;
const EDGE_ITEMS: usize = 3;
const PREFIX: &str = "tensor(";

pub(super) fn render(shape: &Shape, data: &[f32], device: Device) -> String {
    let suffix = match device {
        Device::Cpu => String::new(),
        gpu => format!(", device='{}'", gpu),
    };

    if data.is_empty() {
        let size = if shape.rank() == 1 {
            String::new()
        } else {
            let dims: Vec<String> = shape.dims().iter().map(|d| d.to_string()).collect();
            let trailing = if dims.len() == 1 { "," } else { "" };
            format!(", size=({}{})", dims.join(", "), trailing)
        };
        return format!("{}[]{}{})", PREFIX, size, suffix);
    }

    let summarize = data.len() > SUMMARIZE_THRESHOLD;
    let mut visible = Vec::new();
    collect_visible(shape.dims(), data, summarize, &mut visible);
    let formatter = ValueFormat::new(&visible);

    let body = if shape.rank() == 0 {
        formatter.format(data[0])
    } else {
        format_dims(shape.dims(), data, PREFIX.len(), &formatter, summarize)
    };
    format!("{}{}{})", PREFIX, body, suffix)
}

/// Indices shown along a dimension of length `n`; `None` marks the elision.
fn shown(n: usize, summarize: bool) -> Vec<Option<usize>> {
    if summarize && n > 2 * EDGE_ITEMS {
        (0..EDGE_ITEMS)
            .map(Some)
            .chain(std::iter::once(None))
            .chain((n - EDGE_ITEMS..n).map(Some))
            .collect()
    } else {
        (0..n).map(Some).collect()
    }
}

fn collect_visible(dims: &[usize], data: &[f32], summarize: bool, out: &mut Vec<f32>) {
    match dims.len() {
        0 => out.extend_from_slice(data),
        1 => out.extend(shown(dims[0], summarize).into_iter().flatten().map(|i| data[i])),
        _ => {
            let stride: usize = dims[1..].iter().product();
            for i in shown(dims[0], summarize).into_iter().flatten() {
                collect_visible(&dims[1..], &data[i * stride..(i + 1) * stride], summarize, out);
            }
        }
    }
}

fn format_dims(
    dims: &[usize],
    data: &[f32],
    indent: usize,
    formatter: &ValueFormat,
    summarize: bool,
) -> String {
    if dims.len() == 1 {
        return format_row(data, indent, formatter, summarize);
    }

    let stride: usize = dims[1..].iter().product();
    let slices: Vec<String> = shown(dims[0], summarize)
        .into_iter()
        .map(|idx| match idx {
            Some(i) => format_dims(
                &dims[1..],
                &data[i * stride..(i + 1) * stride],
                indent + 1,
                formatter,
                summarize,
            ),
            None => "...".to_string(),
        })
        .collect();

    let sep = format!(
        ",{}{}",
        "\n".repeat(dims.len() - 1),
        " ".repeat(indent + 1)
    );
    format!("[{}]", slices.join(&sep))
}

fn format_row(data: &[f32], indent: usize, formatter: &ValueFormat, summarize: bool) -> String {
    let items: Vec<String> = shown(data.len(), summarize)
        .into_iter()
        .map(|idx| match idx {
            Some(i) => formatter.format(data[i]),
            None => " ...".to_string(),
        })
        .collect();

    let per_line = ((LINE_WIDTH.saturating_sub(indent)) / (formatter.width + 2)).max(1);
    let lines: Vec<String> = items.chunks(per_line).map(|c| c.join(", ")).collect();
    let sep = format!(",\n{}", " ".repeat(indent + 1));
    format!("[{}]", lines.join(&sep))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Every finite value is integral: `1.`, `-4.`.
    Int,
    Fixed,
    Sci,
}

struct ValueFormat {
    mode: Mode,
    width: usize,
}

impl ValueFormat {
    fn new(values: &[f32]) -> Self {
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let nonzero: Vec<f32> = finite.iter().map(|v| v.abs()).filter(|v| *v != 0.0).collect();

        let int_mode = finite.iter().all(|v| v.fract() == 0.0);
        let mode = if nonzero.is_empty() {
            if int_mode {
                Mode::Int
            } else {
                Mode::Fixed
            }
        } else {
            let max = nonzero.iter().copied().fold(f32::MIN, f32::max);
            let min = nonzero.iter().copied().fold(f32::MAX, f32::min);
            if int_mode {
                if max > 1.0e8 {
                    Mode::Sci
                } else {
                    Mode::Int
                }
            } else if max / min > 1000.0 || max > 1.0e8 || min < 1.0e-4 {
                Mode::Sci
            } else {
                Mode::Fixed
            }
        };

        let mut formatter = ValueFormat { mode, width: 0 };
        formatter.width = values
            .iter()
            .map(|v| formatter.format_raw(*v).len())
            .max()
            .unwrap_or(0);
        formatter
    }

    fn format_raw(&self, v: f32) -> String {
        if v.is_nan() {
            return "nan".to_string();
        }
        if v.is_infinite() {
            return if v > 0.0 { "inf" } else { "-inf" }.to_string();
        }
        match self.mode {
            Mode::Int => format!("{:.0}.", v),
            Mode::Fixed => format!("{:.*}", PRECISION, v),
            Mode::Sci => sci(v),
        }
    }

    fn format(&self, v: f32) -> String {
        format!("{:>width$}", self.format_raw(v), width = self.width)
    }
}

/// `1.2345e+08` style: signed exponent with at least two digits.
fn sci(v: f32) -> String {
    let raw = format!("{:.*e}", PRECISION, v);
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(shape: &[usize], data: &[f32]) -> String {
        render(&Shape::from(shape), data, Device::Cpu)
    }

    #[test]
    fn test_matrix_fixed() {
        assert_eq!(
            cpu(&[2, 2], &[1.0, -2.5, 0.25, 3.0]),
            "tensor([[ 1.0000, -2.5000],\n        [ 0.2500,  3.0000]])"
        );
    }

    #[test]
    fn test_gpu_suffix() {
        assert_eq!(
            render(&Shape::from([2]), &[0.5, 1.5], Device::Gpu(0)),
            "tensor([0.5000, 1.5000], device='gpu:0')"
        );
    }

    #[test]
    fn test_integral_values() {
        assert_eq!(cpu(&[3], &[1.0, 4.0, 9.0]), "tensor([1., 4., 9.])");
        assert_eq!(cpu(&[2], &[-1.0, 0.0]), "tensor([-1.,  0.])");
    }

    #[test]
    fn test_scalar_and_empty() {
        assert_eq!(cpu(&[], &[0.5]), "tensor(0.5000)");
        assert_eq!(cpu(&[0], &[]), "tensor([])");
        assert_eq!(cpu(&[0, 3], &[]), "tensor([], size=(0, 3))");
    }

    #[test]
    fn test_scientific_when_range_is_wide() {
        assert_eq!(
            cpu(&[2], &[1e-5, 1.0]),
            "tensor([1.0000e-05, 1.0000e+00])"
        );
        assert_eq!(sci(123456789.0), "1.2346e+08");
    }

    #[test]
    fn test_non_finite_values() {
        assert_eq!(
            cpu(&[3], &[f32::NAN, f32::INFINITY, 1.5]),
            "tensor([   nan,    inf, 1.5000])"
        );
    }

    #[test]
    fn test_summarized_vector() {
        let data: Vec<f32> = (0..2000).map(|i| i as f32).collect();
        assert_eq!(
            cpu(&[2000], &data),
            "tensor([   0.,    1.,    2.,  ..., 1997., 1998., 1999.])"
        );
    }

    #[test]
    fn test_three_dims_blank_line_between_blocks() {
        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(
            cpu(&[2, 2, 2], &data),
            "tensor([[[0., 1.],\n         [2., 3.]],\n\n        [[4., 5.],\n         [6., 7.]]])"
        );
    }

    #[test]
    fn test_long_rows_wrap() {
        let data: Vec<f32> = (0..12).map(|i| i as f32 + 0.5).collect();
        let text = cpu(&[12], &data);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("        "));
        assert!(lines.iter().all(|l| l.len() <= LINE_WIDTH));
    }
}
