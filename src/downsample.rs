//! Spatial and temporal downsampling for the multiscale pyramid.
//!
//! Kernels are monomorphised per element type; the public boundary dispatches
//! once through a function-pointer pair keyed by [`DataType`]. Frame buffers
//! are plain byte vectors with no alignment guarantee, so elements are read
//! and written unaligned.

use bytemuck::Pod;
use num_traits::AsPrimitive;

use crate::data_type::DataType;

/// 2x2 box-average a frame of `width` x `height` pixels.
pub(crate) type ScaleFn = fn(&[u8], &mut usize, &mut usize) -> Vec<u8>;

/// Average `src` elementwise into `dst`.
pub(crate) type AverageFn = fn(&mut [u8], &[u8]);

/// The downsampling kernels for `data_type`.
pub(crate) fn kernels_for(data_type: DataType) -> (ScaleFn, AverageFn) {
    match data_type {
        DataType::UInt8 => (scale_image::<u8>, average_frames::<u8>),
        DataType::UInt16 => (scale_image::<u16>, average_frames::<u16>),
        DataType::UInt32 => (scale_image::<u32>, average_frames::<u32>),
        DataType::UInt64 => (scale_image::<u64>, average_frames::<u64>),
        DataType::Int8 => (scale_image::<i8>, average_frames::<i8>),
        DataType::Int16 => (scale_image::<i16>, average_frames::<i16>),
        DataType::Int32 => (scale_image::<i32>, average_frames::<i32>),
        DataType::Int64 => (scale_image::<i64>, average_frames::<i64>),
        DataType::Float32 => (scale_image::<f32>, average_frames::<f32>),
        DataType::Float64 => (scale_image::<f64>, average_frames::<f64>),
    }
}

fn read_element<T: Pod>(bytes: &[u8], index: usize) -> T {
    let size = std::mem::size_of::<T>();
    bytemuck::pod_read_unaligned(&bytes[index * size..(index + 1) * size])
}

fn write_element<T: Pod>(bytes: &mut [u8], index: usize, value: T) {
    let size = std::mem::size_of::<T>();
    bytes[index * size..(index + 1) * size].copy_from_slice(bytemuck::bytes_of(&value));
}

/// Downsample a frame by a factor of two along both spatial axes.
///
/// Every output pixel is the mean of a 2x2 input neighbourhood, accumulated
/// in `f64` and cast back with truncation toward zero. The final row and
/// column are replicated when the input extent is odd, so the output is
/// `ceil(h / 2)` x `ceil(w / 2)`. On return `width` and `height` hold the
/// output extents.
fn scale_image<T>(src: &[u8], width: &mut usize, height: &mut usize) -> Vec<u8>
where
    T: Pod + Copy + AsPrimitive<f64>,
    f64: AsPrimitive<T>,
{
    let (w, h) = (*width, *height);
    debug_assert!(src.len() >= w * h * std::mem::size_of::<T>());

    let (out_w, out_h) = (w.div_ceil(2), h.div_ceil(2));
    let mut dst = vec![0u8; out_w * out_h * std::mem::size_of::<T>()];

    let mut i = 0;
    for row in (0..h).step_by(2) {
        let row1 = (row + 1).min(h - 1);
        for col in (0..w).step_by(2) {
            let col1 = (col + 1).min(w - 1);
            let sum = read_element::<T>(src, row * w + col).as_()
                + read_element::<T>(src, row * w + col1).as_()
                + read_element::<T>(src, row1 * w + col).as_()
                + read_element::<T>(src, row1 * w + col1).as_();
            write_element::<T>(&mut dst, i, (0.25 * sum).as_());
            i += 1;
        }
    }

    *width = out_w;
    *height = out_h;
    dst
}

/// Average two equally-sized frames elementwise into `dst`:
/// `dst[i] = trunc(0.5 * (dst[i] + src[i]))`.
fn average_frames<T>(dst: &mut [u8], src: &[u8])
where
    T: Pod + Copy + AsPrimitive<f64>,
    f64: AsPrimitive<T>,
{
    debug_assert_eq!(dst.len(), src.len());
    let count = dst.len() / std::mem::size_of::<T>();
    for i in 0..count {
        let a: f64 = read_element::<T>(dst, i).as_();
        let b: f64 = read_element::<T>(src, i).as_();
        write_element::<T>(dst, i, (0.5 * (a + b)).as_());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of<T: Pod>(values: &[T]) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * std::mem::size_of::<T>()];
        for (i, v) in values.iter().enumerate() {
            write_element(&mut out, i, *v);
        }
        out
    }

    #[test]
    fn scale_even_u8() {
        let (mut w, mut h) = (4, 2);
        #[rustfmt::skip]
        let src = [
            1u8, 3, 10, 20,
            5, 7, 30, 40,
        ];
        let dst = scale_image::<u8>(&src, &mut w, &mut h);
        assert_eq!((w, h), (2, 1));
        assert_eq!(dst, vec![4, 25]);
    }

    #[test]
    fn scale_odd_replicates_edges() {
        let (mut w, mut h) = (3, 3);
        #[rustfmt::skip]
        let src = [
            1u8, 2, 3,
            4, 5, 6,
            7, 8, 9,
        ];
        let dst = scale_image::<u8>(&src, &mut w, &mut h);
        assert_eq!((w, h), (2, 2));
        // bottom-right output averages the replicated corner: (9*4)/4
        assert_eq!(dst, vec![3, 4, 7, 9]);
    }

    #[test]
    fn scale_truncates_toward_zero() {
        let (mut w, mut h) = (2, 2);
        let src = [1u8, 2, 2, 2];
        let dst = scale_image::<u8>(&src, &mut w, &mut h);
        // mean 1.75 truncates to 1
        assert_eq!(dst, vec![1]);
    }

    #[test]
    fn scale_u16_unpacks_elements() {
        let (mut w, mut h) = (2, 2);
        let src = bytes_of(&[100u16, 200, 300, 400]);
        let dst = scale_image::<u16>(&src, &mut w, &mut h);
        assert_eq!(dst, bytes_of(&[250u16]));
    }

    #[test]
    fn scale_float_keeps_fractions() {
        let (mut w, mut h) = (2, 2);
        let src = bytes_of(&[1.0f32, 2.0, 2.0, 2.0]);
        let dst = scale_image::<f32>(&src, &mut w, &mut h);
        assert_eq!(dst, bytes_of(&[1.75f32]));
    }

    #[test]
    fn scale_negative_means_truncate_toward_zero() {
        let (mut w, mut h) = (2, 2);
        let src = bytes_of(&[-4i16, -4, -4, -2]);
        let dst = scale_image::<i16>(&src, &mut w, &mut h);
        // mean -3.5 truncates toward zero to -3
        assert_eq!(dst, bytes_of(&[-3i16]));
    }

    #[test]
    fn average_pairs() {
        let mut a = vec![0u8, 10, 255];
        let b = vec![1u8, 11, 253];
        average_frames::<u8>(&mut a, &b);
        // 0.5 truncates to 0; exact means stay exact
        assert_eq!(a, vec![0, 10, 254]);
    }

    #[test]
    fn kernels_dispatch() {
        let (scale, average) = kernels_for(DataType::Int16);
        let (mut w, mut h) = (2, 1);
        let src = bytes_of(&[6i16, 6]);
        assert_eq!(scale(&src, &mut w, &mut h), bytes_of(&[6i16]));

        let mut a = bytes_of(&[-3i16]);
        let b = bytes_of(&[2i16]);
        average(&mut a, &b);
        // (-3 + 2) / 2 = -0.5 truncates toward zero to 0
        assert_eq!(a, bytes_of(&[0i16]));
    }
}
