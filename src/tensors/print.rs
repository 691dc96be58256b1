//! Diagnostic printer.
//!
//! Nested brackets per axis, one row per line for rank >= 2. Axes longer than
//! [`ELIDE_ABOVE`] show their first and last three entries around `...`.

use core::fmt;

use super::{numel, Element, Tensor};

/// Axes with more entries than this are elided in the middle.
const ELIDE_ABOVE: usize = 6;
const EDGE: usize = 3;

fn visible(len: usize) -> Vec<Option<usize>> {
    if len <= ELIDE_ABOVE {
        return (0..len).map(Some).collect();
    }
    (0..EDGE)
        .map(Some)
        .chain(core::iter::once(None))
        .chain((len - EDGE..len).map(Some))
        .collect()
}

fn write_axis<T: Element>(
    f: &mut fmt::Formatter<'_>,
    data: &[T],
    shape: &[usize],
    depth: usize,
) -> fmt::Result {
    let inner = numel(&shape[1..]);
    write!(f, "[")?;
    for (pos, entry) in visible(shape[0]).into_iter().enumerate() {
        if pos > 0 {
            if shape.len() > 1 {
                write!(f, ",\n{:indent$}", "", indent = depth + 1)?;
            } else {
                write!(f, ", ")?;
            }
        }
        match entry {
            None => write!(f, "...")?,
            Some(i) if shape.len() == 1 => write!(f, "{}", data[i])?,
            Some(i) => write_axis(f, &data[i * inner..(i + 1) * inner], &shape[1..], depth + 1)?,
        }
    }
    write!(f, "]")
}

impl<T: Element> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        write!(f, "tensor(")?;
        if self.rank() == 0 {
            write!(f, "{}", data[0])?;
        } else {
            write_axis(f, &data, self.shape(), "tensor(".len())?;
        }
        write!(f, ", shape={:?}, dtype={:?})", self.shape(), T::DTYPE)
    }
}
