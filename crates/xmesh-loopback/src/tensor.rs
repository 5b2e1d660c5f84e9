//! Dense row-major host tensors standing in for device buffers.

use xmesh_types::{Dtype, IndexRange};

use crate::error::{LoopbackError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTensor {
    shape: Vec<usize>,
    dtype: Dtype,
    data: Vec<u8>,
}

impl HostTensor {
    /// Every byte set to `byte`.
    pub fn filled(shape: Vec<usize>, dtype: Dtype, byte: u8) -> Self {
        let len = shape.iter().product::<usize>() * dtype.element_bytes();
        Self { shape, dtype, data: vec![byte; len] }
    }

    pub fn zeros(shape: Vec<usize>, dtype: Dtype) -> Self {
        Self::filled(shape, dtype, 0)
    }

    pub fn from_bytes(shape: Vec<usize>, dtype: Dtype, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.element_bytes();
        if data.len() != expected {
            return Err(LoopbackError::SizeMismatch { expected, actual: data.len() });
        }
        Ok(Self { shape, dtype, data })
    }

    /// Element `i` holds `i` in little-endian, truncated to the element
    /// width. Distinct per element as long as the tensor is small enough.
    pub fn iota(shape: Vec<usize>, dtype: Dtype) -> Self {
        let width = dtype.element_bytes();
        let count: usize = shape.iter().product();
        let data = (0..count as u64)
            .flat_map(|i| i.to_le_bytes().into_iter().take(width))
            .collect();
        Self { shape, dtype, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Copy the sub-block `ranges` out, row-major.
    pub fn read_block(&self, ranges: &[IndexRange]) -> Result<Vec<u8>> {
        let runs = block_runs(&self.shape, ranges, self.dtype.element_bytes())?;
        let mut out = Vec::with_capacity(runs.iter().map(|(_, len)| len).sum());
        for (start, len) in runs {
            out.extend_from_slice(&self.data[start..start + len]);
        }
        Ok(out)
    }

    /// Overwrite the sub-block `ranges` with `block`, row-major.
    pub fn write_block(&mut self, ranges: &[IndexRange], block: &[u8]) -> Result<()> {
        let runs = block_runs(&self.shape, ranges, self.dtype.element_bytes())?;
        let expected: usize = runs.iter().map(|(_, len)| len).sum();
        if block.len() != expected {
            return Err(LoopbackError::SizeMismatch { expected, actual: block.len() });
        }
        let mut cursor = 0;
        for (start, len) in runs {
            self.data[start..start + len].copy_from_slice(&block[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }
}

/// Contiguous `(byte offset, byte length)` runs covering `ranges` of a
/// row-major tensor, in row-major block order.
fn block_runs(shape: &[usize], ranges: &[IndexRange], element_bytes: usize) -> Result<Vec<(usize, usize)>> {
    if ranges.len() != shape.len() {
        return Err(LoopbackError::RankMismatch { expected: shape.len(), actual: ranges.len() });
    }
    for (axis, (range, len)) in ranges.iter().zip(shape).enumerate() {
        if range.end > *len || range.start > range.end {
            return Err(LoopbackError::OutOfBounds { axis, end: range.end, len: *len });
        }
    }
    if ranges.iter().any(IndexRange::is_empty) {
        return Ok(Vec::new());
    }
    let rank = shape.len();
    if rank == 0 {
        return Ok(vec![(0, element_bytes)]);
    }

    let mut strides = vec![1; rank];
    for axis in (0..rank - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    let inner = &ranges[rank - 1];
    let run = inner.len() * element_bytes;
    let mut coords: Vec<usize> = ranges[..rank - 1].iter().map(|r| r.start).collect();
    let mut runs = Vec::new();
    loop {
        let element = inner.start + coords.iter().zip(&strides).map(|(c, s)| c * s).sum::<usize>();
        runs.push((element * element_bytes, run));

        // Advance the outer coordinates like an odometer.
        let mut axis = rank - 1;
        loop {
            if axis == 0 {
                return Ok(runs);
            }
            axis -= 1;
            coords[axis] += 1;
            if coords[axis] < ranges[axis].end {
                break;
            }
            coords[axis] = ranges[axis].start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: usize, end: usize) -> IndexRange {
        IndexRange { start, end }
    }

    #[test]
    fn read_inner_block() {
        let t = HostTensor::iota(vec![4, 4], Dtype::U8);
        let block = t.read_block(&[r(1, 3), r(2, 4)]).unwrap();
        assert_eq!(block, vec![6, 7, 10, 11]);
    }

    #[test]
    fn write_then_read_back() {
        let mut t = HostTensor::zeros(vec![2, 3, 2], Dtype::I32);
        let ranges = [r(1, 2), r(0, 3), r(1, 2)];
        let block: Vec<u8> = (0..12).collect();
        t.write_block(&ranges, &block).unwrap();
        assert_eq!(t.read_block(&ranges).unwrap(), block);
        assert!(t.read_block(&[r(0, 1), r(0, 3), r(0, 2)]).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn wide_elements_keep_their_bytes() {
        let t = HostTensor::iota(vec![3], Dtype::F32);
        assert_eq!(t.read_block(&[r(2, 3)]).unwrap(), vec![2, 0, 0, 0]);
    }

    #[test]
    fn out_of_bounds_and_size_errors() {
        let mut t = HostTensor::zeros(vec![2, 2], Dtype::U8);
        assert!(matches!(
            t.read_block(&[r(0, 3), r(0, 2)]),
            Err(LoopbackError::OutOfBounds { axis: 0, .. })
        ));
        assert!(matches!(t.read_block(&[r(0, 2)]), Err(LoopbackError::RankMismatch { .. })));
        assert!(matches!(
            t.write_block(&[r(0, 1), r(0, 2)], &[1]),
            Err(LoopbackError::SizeMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn empty_block_is_empty() {
        let t = HostTensor::iota(vec![2, 2], Dtype::U8);
        assert!(t.read_block(&[r(1, 1), r(0, 2)]).unwrap().is_empty());
    }
}
