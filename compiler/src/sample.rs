// sample.rs — Element codec for channel payloads and external frames
//
// Channels carry plain `Copy` elements. The External I/O Bridge moves them
// to and from byte frames in little-endian order.

use crate::graph::{ElemType, NumericKind};

pub trait Sample: Copy + Default + Send + 'static {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Element type this sample encodes, for plan compatibility checks.
    fn elem_type() -> ElemType;

    fn encode(self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_sample {
    ($($ty:ty => $kind:ident, $bits:expr, $signed:expr;)*) => {
        $(
            impl Sample for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn elem_type() -> ElemType {
                    ElemType::scalar(NumericKind::$kind, $bits, $signed)
                }

                fn encode(self, out: &mut [u8]) {
                    out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_sample! {
    f32 => Float, 32, true;
    f64 => Float, 64, true;
    i8 => Int, 8, true;
    i16 => Int, 16, true;
    i32 => Int, 32, true;
    i64 => Int, 64, true;
    u8 => Int, 8, false;
    u16 => Int, 16, false;
    u32 => Int, 32, false;
}

/// Encode `block` into `out`, which must hold `block.len() * T::WIDTH` bytes.
pub fn encode_block<T: Sample>(block: &[T], out: &mut [u8]) {
    for (value, chunk) in block.iter().zip(out.chunks_exact_mut(T::WIDTH)) {
        value.encode(chunk);
    }
}

/// Decode `bytes` into `out`, one element per `T::WIDTH` bytes.
pub fn decode_block<T: Sample>(bytes: &[u8], out: &mut [T]) {
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(T::WIDTH)) {
        *slot = T::decode(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_layout() {
        let mut buf = [0u8; 4];
        0x0102_0304u32.encode(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1]);
        assert_eq!(u32::decode(&buf), 0x0102_0304);
    }

    #[test]
    fn block_codec_preserves_values() {
        let block = [1.5f32, -2.25, 0.0, f32::MAX];
        let mut bytes = vec![0u8; block.len() * f32::WIDTH];
        encode_block(&block, &mut bytes);
        let mut back = [0f32; 4];
        decode_block(&bytes, &mut back);
        assert_eq!(back, block);
    }

    #[test]
    fn elem_types_match_widths() {
        assert_eq!(f32::elem_type(), ElemType::f32());
        assert_eq!(i16::elem_type().byte_width(), i16::WIDTH);
        assert!(!u8::elem_type().signed);
    }
}
