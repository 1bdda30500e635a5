//! Typed device allocators: plain buffers, texel-packed weight images, and
//! the ping-pong activation pool.

use anyhow::{Context as _, Result};
use ocl::enums::{ImageChannelDataType, ImageChannelOrder, MemObjectType};
use ocl::{Buffer, Image, MemFlags, OclPrm};

use crate::device::Gpu;

/// Allocate an uninitialized device buffer of `len` elements.
pub fn create_buffer<T: OclPrm>(gpu: &Gpu, len: usize, flags: MemFlags) -> Result<Buffer<T>> {
    Buffer::<T>::builder()
        .queue(gpu.queue.clone())
        .flags(flags)
        .len(len)
        .build()
        .with_context(|| format!("buffer allocation failed ({} bytes)", len * std::mem::size_of::<T>()))
}

/// Allocate a device buffer initialized from host memory (copy-host-ptr).
pub fn create_buffer_with<T: OclPrm>(gpu: &Gpu, flags: MemFlags, data: &[T]) -> Result<Buffer<T>> {
    Buffer::<T>::builder()
        .queue(gpu.queue.clone())
        .flags(flags)
        .len(data.len())
        .copy_host_slice(data)
        .build()
        .with_context(|| format!("buffer upload failed ({} bytes)", std::mem::size_of_val(data)))
}

/// A weight matrix stored as a 2-D RGBA half-float texture: four adjacent
/// columns per texel, so a logical R x C matrix becomes ceil(C/4) x R texels.
pub struct WeightImage {
    pub image: Image<u16>,
    pub rows: usize,
    pub cols: usize,
}

impl WeightImage {
    /// Texel width of the image.
    pub fn width(&self) -> usize {
        self.cols.div_ceil(4)
    }
}

/// Stage a row-major half-float matrix for texel upload, zero-padding each
/// row out to a multiple of four columns. Returns the staged copy and the
/// padded column count.
pub fn pad_texel_rows(data: &[u16], rows: usize, cols: usize) -> (Vec<u16>, usize) {
    let padded_cols = cols.div_ceil(4) * 4;
    if padded_cols == cols {
        return (data.to_vec(), padded_cols);
    }
    let mut staged = vec![0u16; rows * padded_cols];
    for r in 0..rows {
        staged[r * padded_cols..r * padded_cols + cols].copy_from_slice(&data[r * cols..(r + 1) * cols]);
    }
    (staged, padded_cols)
}

/// Upload a half-float weight matrix as a read-only RGBA image.
pub fn create_weight_image(gpu: &Gpu, rows: usize, cols: usize, data: &[u16]) -> Result<WeightImage> {
    let (staged, padded_cols) = pad_texel_rows(data, rows, cols);
    let width = padded_cols / 4;

    let image = Image::<u16>::builder()
        .queue(gpu.queue.clone())
        .channel_order(ImageChannelOrder::Rgba)
        .channel_data_type(ImageChannelDataType::HalfFloat)
        .image_type(MemObjectType::Image2d)
        .dims((width, rows))
        .flags(ocl::flags::MEM_READ_ONLY)
        .copy_host_slice(&staged)
        .build()
        .with_context(|| format!("weight image allocation failed ({rows} x {cols})"))?;

    Ok(WeightImage { image, rows, cols })
}

/// Pair of same-size read-write buffers used ping-pong for activations.
pub struct ActivationPool {
    buffers: [Buffer<u16>; 2],
    current: usize,
    pub len: usize,
}

impl ActivationPool {
    pub fn new(gpu: &Gpu, len: usize) -> Result<Self> {
        let a = create_buffer::<u16>(gpu, len, ocl::flags::MEM_READ_WRITE)?;
        let b = create_buffer::<u16>(gpu, len, ocl::flags::MEM_READ_WRITE)?;
        Ok(Self { buffers: [a, b], current: 0, len })
    }

    pub fn current(&self) -> &Buffer<u16> {
        &self.buffers[self.current]
    }

    pub fn next(&self) -> &Buffer<u16> {
        &self.buffers[1 - self.current]
    }

    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_identity_for_aligned_columns() {
        let data: Vec<u16> = (0..8).collect();
        let (staged, padded) = pad_texel_rows(&data, 2, 4);
        assert_eq!(padded, 4);
        assert_eq!(staged, data);
    }

    #[test]
    fn padding_zero_fills_trailing_lanes() {
        // 2 rows x 6 cols pads to 8 columns, two texels wide.
        let data: Vec<u16> = (1..=12).collect();
        let (staged, padded) = pad_texel_rows(&data, 2, 6);
        assert_eq!(padded, 8);
        assert_eq!(staged.len(), 16);
        assert_eq!(&staged[0..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&staged[6..8], &[0, 0]);
        assert_eq!(&staged[8..14], &[7, 8, 9, 10, 11, 12]);
        assert_eq!(&staged[14..16], &[0, 0]);
    }

    #[test]
    fn image_width_follows_packing_law() {
        for (cols, width) in [(1usize, 1), (4, 1), (5, 2), (8, 2), (2048, 512)] {
            assert_eq!(cols.div_ceil(4), width, "cols={cols}");
        }
    }
}
