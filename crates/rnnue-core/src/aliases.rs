//! サポートするアーキテクチャの型エイリアス
//!
//! チェーンはコンパイル時合成のため、運用で使うトポロジを
//! ここで名前付けしておく。tools のバイナリもこの一覧を参照する。

use crate::layers::{AffineTransform, ClippedReLU, InputSlice};
use crate::network::Network;

/// 512 → 32 → 32 → 1（標準構成）
pub type Stack512x32x32 = AffineTransform<
    ClippedReLU<
        AffineTransform<ClippedReLU<AffineTransform<InputSlice<512>, 32>>, 32>,
    >,
    1,
>;

/// 1024 → 8 → 32 → 1（大型特徴量・細い中間層の構成）
pub type Stack1024x8x32 = AffineTransform<
    ClippedReLU<
        AffineTransform<ClippedReLU<AffineTransform<InputSlice<1024>, 8>>, 32>,
    >,
    1,
>;

pub type Network512 = Network<Stack512x32x32>;
pub type Network1024 = Network<Stack1024x8x32>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Layer;

    #[test]
    fn test_alias_shapes() {
        assert_eq!(Network512::INPUT_DIMENSIONS, 512);
        assert_eq!(Network512::OUTPUT_DIMENSIONS, 1);
        assert_eq!(Network1024::INPUT_DIMENSIONS, 1024);
        assert_eq!(Network1024::OUTPUT_DIMENSIONS, 1);
    }

    #[test]
    fn test_alias_hashes_differ() {
        assert_ne!(
            <Stack512x32x32 as Layer>::hash_value(),
            <Stack1024x8x32 as Layer>::hash_value()
        );
    }

    #[test]
    fn test_alias_architecture_names() {
        assert_eq!(
            Network512::architecture(),
            "AffineTransform[1<-32](ClippedReLU[32](AffineTransform[32<-32](\
             ClippedReLU[32](AffineTransform[32<-512](InputSlice[512])))))"
        );
    }
}
