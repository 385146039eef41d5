//! 推論カーネル共通の定数
//!
//! 次元のパディングとバッファ配置はここの定数だけで決まる。
//! 値を変えるとパラメータファイルのレイアウトも変わることに注意。

/// キャッシュラインサイズ（バッファ領域の切り上げ単位）
pub const CACHE_LINE_SIZE: usize = 64;

/// 対応する最大SIMD幅（バイト単位、AVX2 = 256bit = 32バイト）
///
/// 入力次元はこの倍数に切り上げてパディングする。
/// AVX-512 はこの倍数2個分を1チャンクとして処理する。
pub const MAX_SIMD_WIDTH: usize = 32;

/// バッチ処理する出力行のグループ幅
///
/// 出力次元は 1 またはこの値の倍数でなければならない。
pub const OUTPUT_LANE_GROUP: usize = 4;

/// 活性化の固定小数点スケーリングシフト量
pub const WEIGHT_SCALE_BITS: u32 = 6;

/// クリップ付き活性化の上限値
///
/// アフィン層への入力バイトはすべてこの値以下であることが
/// 量子化契約として保証される（maddubs 系バックエンドの
/// i16 中間和が飽和しない条件）。
pub const MAX_ACTIVATION: i32 = 127;

/// パラメータファイルのバージョンワード
pub const NETWORK_VERSION: u32 = 0x524E_4E31; // "RNN1"

/// アーキテクチャ文字列の最大長
pub const MAX_ARCH_LEN: usize = 1024;

/// パディング済み入力次元（SIMDアライメント用）
pub const fn padded_input(input_dim: usize) -> usize {
    input_dim.div_ceil(MAX_SIMD_WIDTH) * MAX_SIMD_WIDTH
}

/// `n` を `base` の倍数に切り上げ
pub const fn ceil_to_multiple(n: usize, base: usize) -> usize {
    n.div_ceil(base) * base
}
