//! Sample precision and the copy kernels used on the audio thread.
//!
//! Native backends always exchange `f32`. Inside the buffer matrix samples are
//! stored as [`Sample`], which is `f32` unless the crate is built with the
//! `double-precision` feature.

use cpal::Sample as _;

#[cfg(not(feature = "double-precision"))]
pub type Sample = f32;

#[cfg(feature = "double-precision")]
pub type Sample = f64;

/// Native f32 to the matrix precision.
#[inline(always)]
pub fn from_native(value: f32) -> Sample {
  value.to_sample()
}

/// Matrix precision to native f32.
#[inline(always)]
pub fn to_native(value: Sample) -> f32 {
  value.to_sample()
}

/// Copy one native channel into a matrix buffer. Samples past the shorter of
/// the two slices are left untouched.
#[inline]
pub fn copy_from_native(src: &[f32], dst: &mut [Sample]) {
  for (d, s) in dst.iter_mut().zip(src) {
    *d = from_native(*s);
  }
}

/// Copy one matrix buffer into a native channel.
#[inline]
pub fn copy_to_native(src: &[Sample], dst: &mut [f32]) {
  for (d, s) in dst.iter_mut().zip(src) {
    *d = to_native(*s);
  }
}

/// Split interleaved native frames into planar buffers.
///
/// `src` holds frames of `channels` samples. Destination channels without a
/// native counterpart are zeroed; native channels without a destination are
/// skipped. The frame count is bounded by the shortest destination buffer.
pub fn deinterleave<B: AsMut<[Sample]>>(src: &[f32], channels: usize, dst: &mut [B]) {
  if channels == 0 {
    for buffer in dst.iter_mut() {
      buffer.as_mut().fill(0.0);
    }
    return;
  }

  for (ch, buffer) in dst.iter_mut().enumerate() {
    let buffer = buffer.as_mut();
    if ch >= channels {
      buffer.fill(0.0);
      continue;
    }
    for (d, frame) in buffer.iter_mut().zip(src.chunks_exact(channels)) {
      *d = from_native(frame[ch]);
    }
  }
}

/// Merge planar buffers into interleaved native frames.
///
/// Native channels without a source buffer are written as silence.
pub fn interleave<B: AsRef<[Sample]>>(src: &[B], dst: &mut [f32], channels: usize) {
  if channels == 0 {
    return;
  }

  for (frame_index, frame) in dst.chunks_exact_mut(channels).enumerate() {
    for (ch, out) in frame.iter_mut().enumerate() {
      *out = src
        .get(ch)
        .and_then(|buffer| buffer.as_ref().get(frame_index))
        .map(|s| to_native(*s))
        .unwrap_or(0.0);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deinterleave_splits_frames_by_channel() {
    let src = [1.0f32, -1.0, 2.0, -2.0, 3.0, -3.0];
    let mut dst = vec![vec![0.0 as Sample; 3], vec![0.0 as Sample; 3]];

    deinterleave(&src, 2, &mut dst);

    assert_eq!(dst[0], vec![1.0, 2.0, 3.0]);
    assert_eq!(dst[1], vec![-1.0, -2.0, -3.0]);
  }

  #[test]
  fn deinterleave_zeroes_channels_the_device_lacks() {
    let src = [0.5f32, 0.25];
    let mut dst = vec![vec![9.0 as Sample; 2], vec![9.0 as Sample; 2]];

    deinterleave(&src, 1, &mut dst);

    assert_eq!(dst[0], vec![0.5, 0.25]);
    assert_eq!(dst[1], vec![0.0, 0.0]);
  }

  #[test]
  fn deinterleave_skips_native_channels_without_buffer() {
    let src = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let mut dst = vec![vec![0.0 as Sample; 2]];

    deinterleave(&src, 3, &mut dst);

    assert_eq!(dst[0], vec![1.0, 4.0]);
  }

  #[test]
  fn interleave_is_the_inverse_of_deinterleave() {
    let src: Vec<f32> = (0..12).map(|i| i as f32 * 0.125).collect();
    let mut planar = vec![vec![0.0 as Sample; 4]; 3];
    let mut back = vec![0.0f32; 12];

    deinterleave(&src, 3, &mut planar);
    interleave(&planar, &mut back, 3);

    assert_eq!(back, src);
  }

  #[test]
  fn interleave_fills_missing_sources_with_silence() {
    let planar = vec![vec![1.0 as Sample, 2.0]];
    let mut dst = vec![7.0f32; 4];

    interleave(&planar, &mut dst, 2);

    assert_eq!(dst, vec![1.0, 0.0, 2.0, 0.0]);
  }

  #[test]
  fn native_round_trip_is_exact() {
    for value in [0.0f32, 1.0, -1.0, 0.333_333_34, f32::MIN_POSITIVE] {
      assert_eq!(to_native(from_native(value)), value);
    }
  }

  #[test]
  fn channel_copies_stop_at_the_shorter_slice() {
    let mut dst = [0.0 as Sample; 2];
    copy_from_native(&[0.5, 0.75, 1.0], &mut dst);
    assert_eq!(dst, [0.5, 0.75]);

    let mut native = [3.0f32; 3];
    copy_to_native(&dst, &mut native);
    assert_eq!(native, [0.5, 0.75, 3.0]);
  }
}
