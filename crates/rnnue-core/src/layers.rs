//! ネットワーク層の実装
//!
//! - [`Layer`]: 層チェーンの契約（次元・バッファ・ハッシュ・入出力・伝播）
//! - [`InputSlice`]: チェーン終端。抽出済み特徴量バイト列をそのまま渡す
//! - [`AffineTransform`]: 全結合アフィン変換層（入力×重み + バイアス）
//! - [`ClippedReLU`]: 整数スケーリング付きのクリップ付き ReLU 層
//!
//! # チェーン構成
//!
//! 各層は前段の層を型パラメータとして所有し、コンパイル時に固定された
//! 一本のチェーンを構成する:
//!
//! ```text
//! AffineTransform<ClippedReLU<AffineTransform<InputSlice<512>, 32>>, 1>
//! ```
//!
//! 伝播は最終層への1回の呼び出しで始まり、内側の層から順に共有
//! スクラッチバッファの自領域へ書き込んでいく。各層の領域は
//! キャッシュライン単位で切り上げられ、層が増えても加算されるだけの
//! 単純なレイアウトになっている。
//!
//! # バックエンドの等価性
//!
//! `propagate` は検出された SIMD 幅ごとに実装が分かれるが、すべての
//! バックエンドは [`AffineTransform::propagate_scalar`] と bit 単位で
//! 一致する 32bit 整数を出力しなければならない。探索側は評価値の
//! 再現性に依存しているため、これは近似ではなく正確性の要件である。

use crate::aligned::AlignedBox;
use crate::constants::{
    CACHE_LINE_SIZE, MAX_ACTIVATION, OUTPUT_LANE_GROUP, WEIGHT_SCALE_BITS, ceil_to_multiple,
    padded_input,
};
use serde::Serialize;
use std::io::{self, Read, Write};

/// AVX2での水平加算（i32×8 → i32）
#[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
#[inline]
unsafe fn hsum_i32_avx2(v: std::arch::x86_64::__m256i) -> i32 {
    use std::arch::x86_64::*;

    // 上位128bitと下位128bitを加算
    let hi = _mm256_extracti128_si256(v, 1);
    let lo = _mm256_castsi256_si128(v);
    let sum128 = _mm_add_epi32(lo, hi);

    // 64bit加算
    let hi64 = _mm_unpackhi_epi64(sum128, sum128);
    let sum64 = _mm_add_epi32(sum128, hi64);

    // 32bit加算
    let hi32 = _mm_shuffle_epi32(sum64, 1);
    let sum32 = _mm_add_epi32(sum64, hi32);

    _mm_cvtsi128_si32(sum32)
}

/// AVX2での4アキュムレータ水平加算 + バイアス加算
///
/// 4本の i32×8 をそれぞれ水平加算し、バイアス4要素を足した
/// i32×4 を返す。4出力同時処理の締め括りに使う。
#[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
#[inline]
unsafe fn m256_haddx4(
    sum0: std::arch::x86_64::__m256i,
    sum1: std::arch::x86_64::__m256i,
    sum2: std::arch::x86_64::__m256i,
    sum3: std::arch::x86_64::__m256i,
    bias: std::arch::x86_64::__m128i,
) -> std::arch::x86_64::__m128i {
    use std::arch::x86_64::*;

    let sum01 = _mm256_hadd_epi32(sum0, sum1);
    let sum23 = _mm256_hadd_epi32(sum2, sum3);
    let sum0123 = _mm256_hadd_epi32(sum01, sum23);

    let lo = _mm256_castsi256_si128(sum0123);
    let hi = _mm256_extracti128_si256(sum0123, 1);

    _mm_add_epi32(_mm_add_epi32(lo, hi), bias)
}

/// AVX512-VNNI用 DPBUSD（512bit版）
///
/// `vpdpbusd` 命令で u8×i8→i32 積和演算を1命令で実行。
/// 512bit = 64バイト = 16 x i32 を一度に処理。
#[cfg(all(target_arch = "x86_64", target_feature = "avx512vnni"))]
#[inline]
unsafe fn m512_add_dpbusd_epi32(
    acc: &mut std::arch::x86_64::__m512i,
    a: std::arch::x86_64::__m512i,
    b: std::arch::x86_64::__m512i,
) {
    use std::arch::x86_64::*;
    *acc = _mm512_dpbusd_epi32(*acc, a, b);
}

/// AVX512用 DPBUSD エミュレーション（VNNI非対応時）
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "avx512bw",
    not(target_feature = "avx512vnni")
))]
#[inline]
unsafe fn m512_add_dpbusd_epi32(
    acc: &mut std::arch::x86_64::__m512i,
    a: std::arch::x86_64::__m512i,
    b: std::arch::x86_64::__m512i,
) {
    use std::arch::x86_64::*;
    // maddubs: u8×i8 → i16 (飽和加算)
    let product = _mm512_maddubs_epi16(a, b);
    // madd: i16×i16 → i32 (隣接ペアの積和)
    let product32 = _mm512_madd_epi16(product, _mm512_set1_epi16(1));
    *acc = _mm512_add_epi32(*acc, product32);
}

/// AVX-512での水平加算 + バイアス加算（単出力用）
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "avx512f",
    any(target_feature = "avx512vnni", target_feature = "avx512bw")
))]
#[inline]
unsafe fn m512_hadd(sum: std::arch::x86_64::__m512i, bias: i32) -> i32 {
    use std::arch::x86_64::*;
    _mm512_reduce_add_epi32(sum) + bias
}

/// AVX-512での4アキュムレータ水平加算 + バイアス加算
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "avx512f",
    any(target_feature = "avx512vnni", target_feature = "avx512bw")
))]
#[inline]
unsafe fn m512_haddx4(
    sum0: std::arch::x86_64::__m512i,
    sum1: std::arch::x86_64::__m512i,
    sum2: std::arch::x86_64::__m512i,
    sum3: std::arch::x86_64::__m512i,
    bias: std::arch::x86_64::__m128i,
) -> std::arch::x86_64::__m128i {
    use std::arch::x86_64::*;

    let sum01a = _mm512_unpacklo_epi32(sum0, sum1);
    let sum01b = _mm512_unpackhi_epi32(sum0, sum1);
    let sum23a = _mm512_unpacklo_epi32(sum2, sum3);
    let sum23b = _mm512_unpackhi_epi32(sum2, sum3);

    let sum01 = _mm512_add_epi32(sum01a, sum01b);
    let sum23 = _mm512_add_epi32(sum23a, sum23b);

    let sum0123a = _mm512_unpacklo_epi64(sum01, sum23);
    let sum0123b = _mm512_unpackhi_epi64(sum01, sum23);

    let sum = _mm512_add_epi32(sum0123a, sum0123b);

    let lo256 = _mm512_castsi512_si256(sum);
    let hi256 = _mm512_extracti64x4_epi64(sum, 1);
    let sum256 = _mm256_add_epi32(lo256, hi256);

    let lo128 = _mm256_castsi256_si128(sum256);
    let hi128 = _mm256_extracti128_si256(sum256, 1);

    _mm_add_epi32(_mm_add_epi32(lo128, hi128), bias)
}

/// AVX512-VNNI用 DPBUSD（256bit版、VL拡張使用）
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "avx512vnni",
    target_feature = "avx512vl"
))]
#[inline]
unsafe fn m256_add_dpbusd_epi32(
    acc: &mut std::arch::x86_64::__m256i,
    a: std::arch::x86_64::__m256i,
    b: std::arch::x86_64::__m256i,
) {
    use std::arch::x86_64::*;
    *acc = _mm256_dpbusd_epi32(*acc, a, b);
}

/// AVX2用 DPBUSD エミュレーション（u8×i8→i32積和演算）
///
/// VNNI非対応CPU向け。`maddubs` + `madd` の2命令で積和演算を実行。
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "avx2",
    not(all(target_feature = "avx512vnni", target_feature = "avx512vl"))
))]
#[inline]
unsafe fn m256_add_dpbusd_epi32(
    acc: &mut std::arch::x86_64::__m256i,
    a: std::arch::x86_64::__m256i,
    b: std::arch::x86_64::__m256i,
) {
    use std::arch::x86_64::*;
    let product = _mm256_maddubs_epi16(a, b);
    let product32 = _mm256_madd_epi16(product, _mm256_set1_epi16(1));
    *acc = _mm256_add_epi32(*acc, product32);
}

/// SSE2での水平加算（i32×4 → i32）
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "sse2",
    not(target_feature = "avx2")
))]
#[inline]
unsafe fn hsum_i32_sse2(v: std::arch::x86_64::__m128i) -> i32 {
    use std::arch::x86_64::*;

    // 64bit加算
    let hi64 = _mm_unpackhi_epi64(v, v);
    let sum64 = _mm_add_epi32(v, hi64);

    // 32bit加算
    let hi32 = _mm_shuffle_epi32(sum64, 1);
    let sum32 = _mm_add_epi32(sum64, hi32);

    _mm_cvtsi128_si32(sum32)
}

/// SSSE3用 DPBUSD エミュレーション（u8×i8→i32積和演算）
/// _mm_maddubs_epi16 を使用（SSSE3命令）
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "ssse3",
    not(target_feature = "avx2")
))]
#[inline]
unsafe fn m128_add_dpbusd_epi32(
    acc: &mut std::arch::x86_64::__m128i,
    a: std::arch::x86_64::__m128i,
    b: std::arch::x86_64::__m128i,
) {
    use std::arch::x86_64::*;
    let product = _mm_maddubs_epi16(a, b);
    let product32 = _mm_madd_epi16(product, _mm_set1_epi16(1));
    *acc = _mm_add_epi32(*acc, product32);
}

/// SSSE3での4アキュムレータ水平加算 + バイアス加算
#[cfg(all(
    target_arch = "x86_64",
    target_feature = "ssse3",
    not(target_feature = "avx2")
))]
#[inline]
unsafe fn m128_haddx4(
    sum0: std::arch::x86_64::__m128i,
    sum1: std::arch::x86_64::__m128i,
    sum2: std::arch::x86_64::__m128i,
    sum3: std::arch::x86_64::__m128i,
    bias: std::arch::x86_64::__m128i,
) -> std::arch::x86_64::__m128i {
    use std::arch::x86_64::*;

    let sum01 = _mm_hadd_epi32(sum0, sum1);
    let sum23 = _mm_hadd_epi32(sum2, sum3);
    let sum0123 = _mm_hadd_epi32(sum01, sum23);

    _mm_add_epi32(sum0123, bias)
}

/// WASM SIMD128: u8×i8 の16要素内積を i32x4 に集約
#[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
#[inline]
unsafe fn dot_i8x16_u8i8_preexpanded(
    in_lo: std::arch::wasm32::v128,
    in_hi: std::arch::wasm32::v128,
    w_vec: std::arch::wasm32::v128,
) -> std::arch::wasm32::v128 {
    use std::arch::wasm32::*;
    let w_lo = i16x8_extend_low_i8x16(w_vec);
    let w_hi = i16x8_extend_high_i8x16(w_vec);

    let prod_lo = i16x8_mul(in_lo, w_lo);
    let prod_hi = i16x8_mul(in_hi, w_hi);

    let sum32_lo_lo = i32x4_extend_low_i16x8(prod_lo);
    let sum32_lo_hi = i32x4_extend_high_i16x8(prod_lo);
    let sum32_hi_lo = i32x4_extend_low_i16x8(prod_hi);
    let sum32_hi_hi = i32x4_extend_high_i16x8(prod_hi);

    let mut acc = i32x4_add(sum32_lo_lo, sum32_lo_hi);
    acc = i32x4_add(acc, sum32_hi_lo);
    i32x4_add(acc, sum32_hi_hi)
}

/// WASM SIMD128: 入力ベクトルをu16拡張して内積を計算
#[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
#[inline]
unsafe fn dot_i8x16_u8i8(
    in_vec: std::arch::wasm32::v128,
    w_vec: std::arch::wasm32::v128,
) -> std::arch::wasm32::v128 {
    use std::arch::wasm32::*;
    let in_lo = i16x8_extend_low_u8x16(in_vec);
    let in_hi = i16x8_extend_high_u8x16(in_vec);
    dot_i8x16_u8i8_preexpanded(in_lo, in_hi, w_vec)
}

/// WASM SIMD128: i32x4 の水平加算
#[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
#[inline]
unsafe fn hsum_i32x4(v: std::arch::wasm32::v128) -> i32 {
    use std::arch::wasm32::*;
    i32x4_extract_lane::<0>(v)
        + i32x4_extract_lane::<1>(v)
        + i32x4_extract_lane::<2>(v)
        + i32x4_extract_lane::<3>(v)
}

/// WASM SIMD128: 2本のi32x4を水平加算（シャッフル + 加算）
#[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
#[inline]
unsafe fn hadd_i32x4(
    x0: std::arch::wasm32::v128,
    x1: std::arch::wasm32::v128,
) -> std::arch::wasm32::v128 {
    use std::arch::wasm32::*;
    i32x4_add(i32x4_shuffle::<0, 2, 4, 6>(x0, x1), i32x4_shuffle::<1, 3, 5, 7>(x0, x1))
}

/// WASM SIMD128: 4本のi32x4を水平加算して1本のi32x4に詰める
#[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
#[inline]
unsafe fn haddx4(
    z0: std::arch::wasm32::v128,
    z1: std::arch::wasm32::v128,
    z2: std::arch::wasm32::v128,
    z3: std::arch::wasm32::v128,
) -> std::arch::wasm32::v128 {
    hadd_i32x4(hadd_i32x4(z0, z1), hadd_i32x4(z2, z3))
}

/// 層ごとのパラメータ統計
///
/// 診断ログと inspect ツールが使う読み込み後サマリ。
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    /// 層の表記（例: "AffineTransform[32<-512]"）
    pub layer: String,
    /// 重み要素数（パディング列込み）
    pub weight_count: usize,
    pub weight_min: i8,
    pub weight_max: i8,
    pub weight_nonzero: usize,
    pub bias_min: i32,
    pub bias_max: i32,
}

/// 層チェーンの契約
///
/// 各層は前段の層を所有し、チェーン全体の静的な形状
/// （入出力次元・バッファサイズ・構造ハッシュ）を関連定数として
/// 合成する。パラメータの読み書きと伝播は内側の層から順に再帰する。
pub trait Layer {
    /// この層が出力するスカラ型（u8 または i32）
    type Output: Copy;

    /// チェーン先頭の生特徴量の次元数
    const INPUT_DIMENSIONS: usize;

    /// この層の出力次元数
    const OUTPUT_DIMENSIONS: usize;

    /// この層までの伝播に必要なスクラッチバッファサイズ（バイト）
    ///
    /// 自領域（キャッシュライン切り上げ）+ 前段の `BUFFER_SIZE`。
    const BUFFER_SIZE: usize;

    /// チェーン構造のハッシュ値
    ///
    /// 形状のみから決まる純関数で、パラメータ値には一切依存しない。
    /// パラメータファイルに埋め込まれ、読み込み時に照合される。
    fn hash_value() -> u32;

    /// アーキテクチャ表記（入れ子形式、例: "AffineTransform[1<-32](InputSlice[32])"）
    fn architecture() -> String;

    /// 全パラメータをゼロで構築
    fn zeroed() -> Self
    where
        Self: Sized;

    /// ストリームからパラメータを読み込んで構築
    ///
    /// 前段を先に読み、続いて自分のパラメータを読む。
    /// ストリームが途中で尽きた場合はエラーを返し、部分的に
    /// 読み込まれた状態は残らない。
    fn read<R: Read>(reader: &mut R) -> io::Result<Self>
    where
        Self: Sized;

    /// パラメータをストリームへ書き出し（`read` の逆操作）
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    /// 内側から順に各層の統計を収集
    fn collect_stats(&self, stats: &mut Vec<LayerStats>);

    /// 順伝播
    ///
    /// `input` はチェーン先頭の生特徴量バイト列、`buffer` は
    /// `BUFFER_SIZE` バイト以上の共有スクラッチ領域。前段の出力を
    /// 再帰的に計算してから自分の出力を自領域へ書き、その領域への
    /// 参照を返す。
    fn propagate<'a>(&self, input: &'a [u8], buffer: &'a mut [u8]) -> &'a [Self::Output];
}

// =============================================================================
// InputSlice - チェーン終端
// =============================================================================

/// チェーン終端の入力層
///
/// 外部の特徴量抽出が生成したバイト列をそのまま次の層へ渡す。
/// パラメータを持たず、スクラッチバッファも消費しない。
///
/// # 入力の契約
///
/// 呼び出し側のバイト列は `padded_input(DIMS)` バイト以上で、
/// `DIMS` 以降のパディング領域はゼロでなければならない。
/// パディングがゼロでない場合、重みのパディング列と掛け合わされて
/// 結果に混入する。
#[derive(Debug)]
pub struct InputSlice<const DIMS: usize>;

impl<const DIMS: usize> InputSlice<DIMS> {
    /// 消費側が読むパディング済み幅
    pub const PADDED_OUTPUT: usize = padded_input(DIMS);
}

impl<const DIMS: usize> Layer for InputSlice<DIMS> {
    type Output = u8;

    const INPUT_DIMENSIONS: usize = DIMS;
    const OUTPUT_DIMENSIONS: usize = DIMS;
    const BUFFER_SIZE: usize = 0;

    fn hash_value() -> u32 {
        0xEC42_E90D ^ DIMS as u32
    }

    fn architecture() -> String {
        format!("InputSlice[{DIMS}]")
    }

    fn zeroed() -> Self {
        Self
    }

    fn read<R: Read>(_reader: &mut R) -> io::Result<Self> {
        Ok(Self)
    }

    fn write<W: Write>(&self, _writer: &mut W) -> io::Result<()> {
        Ok(())
    }

    fn collect_stats(&self, _stats: &mut Vec<LayerStats>) {}

    fn propagate<'a>(&self, input: &'a [u8], _buffer: &'a mut [u8]) -> &'a [u8] {
        debug_assert!(
            input.len() >= Self::PADDED_OUTPUT,
            "input length {} is less than padded width {}",
            input.len(),
            Self::PADDED_OUTPUT
        );
        &input[..Self::PADDED_OUTPUT]
    }
}

// =============================================================================
// AffineTransform - 全結合アフィン変換層
// =============================================================================

/// アフィン変換層
///
/// 前段の u8 出力（パディング済み）に対して `output = weights × input + biases`
/// を計算し、i32 の出力を生成する。重みは行優先で、各行は
/// パディング済み入力幅ぶんの列を持つ（パディング列はファイルにも
/// 存在するが、入力パディングがゼロである限り結果に影響しない）。
///
/// # 出力次元の制約
///
/// 出力次元は 1 または [`OUTPUT_LANE_GROUP`](crate::constants::OUTPUT_LANE_GROUP)
/// の倍数に限る。4行同時のバッチ処理がコンパイル時に既知の出力数を
/// 要求するためで、違反する次元はコンパイル時に拒否される:
///
/// ```compile_fail
/// use rnnue_core::layers::{AffineTransform, InputSlice, Layer};
///
/// // 出力3次元は 1 でもバッチ幅4の倍数でもないため構築できない
/// let layer: AffineTransform<InputSlice<8>, 3> = Layer::zeroed();
/// ```
#[derive(Debug)]
pub struct AffineTransform<P, const OUTPUT_DIM: usize> {
    /// 前段レイヤー（この層が所有する）
    pub previous: P,
    /// バイアス
    pub biases: [i32; OUTPUT_DIM],
    /// 重み（行優先、64バイトアライン）
    pub weights: AlignedBox<i8>,
}

impl<P: Layer<Output = u8>, const OUTPUT_DIM: usize> AffineTransform<P, OUTPUT_DIM> {
    /// 入力次元（前段の出力次元）
    pub const INPUT_DIM: usize = P::OUTPUT_DIMENSIONS;

    /// パディング済み入力次元
    pub const PADDED_INPUT: usize = padded_input(Self::INPUT_DIM);

    /// この層の出力が占めるバッファ領域（バイト）
    pub const SELF_BUFFER_SIZE: usize = ceil_to_multiple(OUTPUT_DIM * 4, CACHE_LINE_SIZE);

    /// 重み要素数（パディング列込み）
    pub const WEIGHT_LEN: usize = OUTPUT_DIM * Self::PADDED_INPUT;

    /// 出力次元の制約: 1 または OUTPUT_LANE_GROUP の倍数
    ///
    /// 参照された時点でコンパイル時に評価され、違反はビルドエラーになる。
    const OUTPUT_DIM_OK: () = assert!(
        OUTPUT_DIM == 1 || OUTPUT_DIM % OUTPUT_LANE_GROUP == 0,
        "affine output dimension must be 1 or a multiple of the lane group width"
    );

    /// スカラーリファレンス実装
    ///
    /// 全バックエンドが bit 単位で一致すべき正解値を定義する。
    /// SIMD 非対応ターゲットの実装そのものでもある。
    /// パディング済み幅全体を総和するため、入力のパディング領域は
    /// ゼロであることが前提になる。
    pub fn propagate_scalar(&self, input: &[u8], output: &mut [i32]) {
        debug_assert!(input.len() >= Self::PADDED_INPUT);
        debug_assert_eq!(output.len(), OUTPUT_DIM);

        for (i, (out, &bias)) in output.iter_mut().zip(&self.biases).enumerate() {
            let row = &self.weights[i * Self::PADDED_INPUT..(i + 1) * Self::PADDED_INPUT];
            let mut sum = bias;
            for (&w, &x) in row.iter().zip(&input[..Self::PADDED_INPUT]) {
                sum += w as i32 * x as i32;
            }
            *out = sum;
        }
    }

    /// SIMD バックエンドへのディスパッチ
    ///
    /// # アライメント要件
    ///
    /// **重要**: 入力スライスは64バイトアライメントが必要です。
    ///
    /// | ターゲット | 必要アライメント | 使用命令 |
    /// |-----------|-----------------|----------|
    /// | AVX-512 (`x86_64`) | 64バイト | `_mm512_load_si512` |
    /// | AVX2 (`x86_64`) | 32バイト以上 | `_mm256_load_si256` |
    /// | SSSE3/SSE2 (`x86_64`) | 16バイト以上 | `_mm_load_si128` |
    /// | WASM SIMD128 | 不要 | `v128_load`（任意アドレス対応） |
    /// | スカラー | 不要 | - |
    ///
    /// チェーン内部の入力は常にスクラッチバッファの64バイト境界領域
    /// なので条件を満たす。チェーン先頭の生特徴量は
    /// [`Aligned`](crate::aligned::Aligned) ラッパーで確保すること。
    ///
    /// # 入力値の契約
    ///
    /// 入力バイトはすべて [`MAX_ACTIVATION`](crate::constants::MAX_ACTIVATION)
    /// 以下であること。maddubs 系命令（SSSE3/AVX2/AVX512-BW）は u8×i8 の
    /// 隣接ペア積和を i16 飽和で行うため、127 を超える入力では飽和により
    /// スカラーリファレンスと一致しなくなる。クリップ付き活性化を経た
    /// 値はこの契約を常に満たす。
    fn forward(&self, input: &[u8], output: &mut [i32]) {
        debug_assert!(
            input.len() >= Self::PADDED_INPUT,
            "input length {} is less than PADDED_INPUT {}",
            input.len(),
            Self::PADDED_INPUT
        );
        debug_assert_eq!(output.len(), OUTPUT_DIM);
        debug_assert!(
            input[..Self::PADDED_INPUT].iter().all(|&v| v as i32 <= MAX_ACTIVATION),
            "affine input exceeds MAX_ACTIVATION"
        );

        // AVX-512: 512bit = 64 x u8/i8 または 16 x i32
        #[cfg(all(
            target_arch = "x86_64",
            target_feature = "avx512f",
            any(target_feature = "avx512vnni", target_feature = "avx512bw")
        ))]
        {
            // SAFETY:
            // - input.len() >= PADDED_INPUT (debug_assert で検証済み)
            // - weights.len() == OUTPUT_DIM * PADDED_INPUT (構造上保証)
            // - input は 64 バイトアライン（バッファ領域 or Aligned ラッパー）
            // - weights は AlignedBox<i8> で 64 バイトアライン
            // - PADDED_INPUT % 64 == 0 の分岐内では行オフセットも 64 バイト境界
            // - biases/output はアライン未保証のため unaligned load/store を使用
            unsafe {
                use std::arch::x86_64::*;

                let input_ptr = input.as_ptr();
                let weights_ptr = self.weights.as_ptr();

                if OUTPUT_DIM.is_multiple_of(OUTPUT_LANE_GROUP) {
                    let mut i = 0;
                    while i < OUTPUT_DIM {
                        let offset0 = i * Self::PADDED_INPUT;
                        let offset1 = (i + 1) * Self::PADDED_INPUT;
                        let offset2 = (i + 2) * Self::PADDED_INPUT;
                        let offset3 = (i + 3) * Self::PADDED_INPUT;

                        let bias =
                            _mm_loadu_si128(self.biases.as_ptr().add(i) as *const __m128i);

                        let result = if Self::PADDED_INPUT.is_multiple_of(64) {
                            // 512bit チャンクで処理
                            let num_chunks = Self::PADDED_INPUT / 64;
                            let mut sum0 = _mm512_setzero_si512();
                            let mut sum1 = _mm512_setzero_si512();
                            let mut sum2 = _mm512_setzero_si512();
                            let mut sum3 = _mm512_setzero_si512();

                            for j in 0..num_chunks {
                                let in_vec =
                                    _mm512_load_si512(input_ptr.add(j * 64) as *const _);
                                m512_add_dpbusd_epi32(
                                    &mut sum0,
                                    in_vec,
                                    _mm512_load_si512(
                                        weights_ptr.add(offset0 + j * 64) as *const _
                                    ),
                                );
                                m512_add_dpbusd_epi32(
                                    &mut sum1,
                                    in_vec,
                                    _mm512_load_si512(
                                        weights_ptr.add(offset1 + j * 64) as *const _
                                    ),
                                );
                                m512_add_dpbusd_epi32(
                                    &mut sum2,
                                    in_vec,
                                    _mm512_load_si512(
                                        weights_ptr.add(offset2 + j * 64) as *const _
                                    ),
                                );
                                m512_add_dpbusd_epi32(
                                    &mut sum3,
                                    in_vec,
                                    _mm512_load_si512(
                                        weights_ptr.add(offset3 + j * 64) as *const _
                                    ),
                                );
                            }

                            m512_haddx4(sum0, sum1, sum2, sum3, bias)
                        } else {
                            // パディング幅が 64 の倍数でない場合は 256bit チャンク
                            let num_chunks = Self::PADDED_INPUT / 32;
                            let mut sum0 = _mm256_setzero_si256();
                            let mut sum1 = _mm256_setzero_si256();
                            let mut sum2 = _mm256_setzero_si256();
                            let mut sum3 = _mm256_setzero_si256();

                            for j in 0..num_chunks {
                                let in_vec =
                                    _mm256_load_si256(input_ptr.add(j * 32) as *const __m256i);
                                m256_add_dpbusd_epi32(
                                    &mut sum0,
                                    in_vec,
                                    _mm256_load_si256(
                                        weights_ptr.add(offset0 + j * 32) as *const __m256i
                                    ),
                                );
                                m256_add_dpbusd_epi32(
                                    &mut sum1,
                                    in_vec,
                                    _mm256_load_si256(
                                        weights_ptr.add(offset1 + j * 32) as *const __m256i
                                    ),
                                );
                                m256_add_dpbusd_epi32(
                                    &mut sum2,
                                    in_vec,
                                    _mm256_load_si256(
                                        weights_ptr.add(offset2 + j * 32) as *const __m256i
                                    ),
                                );
                                m256_add_dpbusd_epi32(
                                    &mut sum3,
                                    in_vec,
                                    _mm256_load_si256(
                                        weights_ptr.add(offset3 + j * 32) as *const __m256i
                                    ),
                                );
                            }

                            m256_haddx4(sum0, sum1, sum2, sum3, bias)
                        };

                        _mm_storeu_si128(output.as_mut_ptr().add(i) as *mut __m128i, result);
                        i += OUTPUT_LANE_GROUP;
                    }
                    return;
                }

                // OUTPUT_DIM == 1（構築時の制約により他の値はあり得ない）
                debug_assert_eq!(OUTPUT_DIM, 1);
                if Self::PADDED_INPUT.is_multiple_of(64) {
                    let num_chunks = Self::PADDED_INPUT / 64;
                    let mut sum = _mm512_setzero_si512();
                    for j in 0..num_chunks {
                        let in_vec = _mm512_load_si512(input_ptr.add(j * 64) as *const _);
                        m512_add_dpbusd_epi32(
                            &mut sum,
                            in_vec,
                            _mm512_load_si512(weights_ptr.add(j * 64) as *const _),
                        );
                    }
                    output[0] = m512_hadd(sum, self.biases[0]);
                } else {
                    let num_chunks = Self::PADDED_INPUT / 32;
                    let mut sum = _mm256_setzero_si256();
                    for j in 0..num_chunks {
                        let in_vec = _mm256_load_si256(input_ptr.add(j * 32) as *const __m256i);
                        m256_add_dpbusd_epi32(
                            &mut sum,
                            in_vec,
                            _mm256_load_si256(weights_ptr.add(j * 32) as *const __m256i),
                        );
                    }
                    output[0] = self.biases[0] + hsum_i32_avx2(sum);
                }
            }
            return;
        }

        // AVX2: 256bit = 32 x u8/i8
        #[cfg(all(
            target_arch = "x86_64",
            target_feature = "avx2",
            not(all(
                target_feature = "avx512f",
                any(target_feature = "avx512vnni", target_feature = "avx512bw")
            ))
        ))]
        {
            // SAFETY:
            // - input.len() >= PADDED_INPUT (debug_assert で検証済み)
            // - weights.len() == OUTPUT_DIM * PADDED_INPUT (構造上保証)
            // - input は 64 バイトアライン、weights は AlignedBox で 64 バイトアライン
            // - PADDED_INPUT は 32 の倍数なので行オフセットは常に 32 バイト境界
            // - biases/output はアライン未保証のため unaligned load/store を使用
            unsafe {
                use std::arch::x86_64::*;

                let num_chunks = Self::PADDED_INPUT / 32;
                let input_ptr = input.as_ptr();
                let weights_ptr = self.weights.as_ptr();

                if OUTPUT_DIM.is_multiple_of(OUTPUT_LANE_GROUP) {
                    // 4出力同時処理: 入力ロードを共有し、水平加算と
                    // バイアス加算を m256_haddx4 で一括実行
                    let mut i = 0;
                    while i < OUTPUT_DIM {
                        let offset0 = i * Self::PADDED_INPUT;
                        let offset1 = (i + 1) * Self::PADDED_INPUT;
                        let offset2 = (i + 2) * Self::PADDED_INPUT;
                        let offset3 = (i + 3) * Self::PADDED_INPUT;

                        let mut sum0 = _mm256_setzero_si256();
                        let mut sum1 = _mm256_setzero_si256();
                        let mut sum2 = _mm256_setzero_si256();
                        let mut sum3 = _mm256_setzero_si256();

                        for j in 0..num_chunks {
                            let in_vec =
                                _mm256_load_si256(input_ptr.add(j * 32) as *const __m256i);
                            m256_add_dpbusd_epi32(
                                &mut sum0,
                                in_vec,
                                _mm256_load_si256(
                                    weights_ptr.add(offset0 + j * 32) as *const __m256i
                                ),
                            );
                            m256_add_dpbusd_epi32(
                                &mut sum1,
                                in_vec,
                                _mm256_load_si256(
                                    weights_ptr.add(offset1 + j * 32) as *const __m256i
                                ),
                            );
                            m256_add_dpbusd_epi32(
                                &mut sum2,
                                in_vec,
                                _mm256_load_si256(
                                    weights_ptr.add(offset2 + j * 32) as *const __m256i
                                ),
                            );
                            m256_add_dpbusd_epi32(
                                &mut sum3,
                                in_vec,
                                _mm256_load_si256(
                                    weights_ptr.add(offset3 + j * 32) as *const __m256i
                                ),
                            );
                        }

                        let bias =
                            _mm_loadu_si128(self.biases.as_ptr().add(i) as *const __m128i);
                        let result = m256_haddx4(sum0, sum1, sum2, sum3, bias);
                        _mm_storeu_si128(output.as_mut_ptr().add(i) as *mut __m128i, result);
                        i += OUTPUT_LANE_GROUP;
                    }
                    return;
                }

                // OUTPUT_DIM == 1（構築時の制約により他の値はあり得ない）
                debug_assert_eq!(OUTPUT_DIM, 1);
                let mut sum = _mm256_setzero_si256();
                for j in 0..num_chunks {
                    let in_vec = _mm256_load_si256(input_ptr.add(j * 32) as *const __m256i);
                    m256_add_dpbusd_epi32(
                        &mut sum,
                        in_vec,
                        _mm256_load_si256(weights_ptr.add(j * 32) as *const __m256i),
                    );
                }
                output[0] = self.biases[0] + hsum_i32_avx2(sum);
            }
            return;
        }

        // SSSE3: 128bit = 16 x u8/i8
        #[cfg(all(
            target_arch = "x86_64",
            target_feature = "ssse3",
            not(target_feature = "avx2")
        ))]
        {
            // SAFETY:
            // - input.len() >= PADDED_INPUT (debug_assert で検証済み)
            // - weights.len() == OUTPUT_DIM * PADDED_INPUT (構造上保証)
            // - input / weights は 64 バイトアラインで、PADDED_INPUT は 32 の
            //   倍数のため行オフセットは常に 16 バイト境界を満たす
            // - biases/output はアライン未保証のため unaligned load/store を使用
            unsafe {
                use std::arch::x86_64::*;

                let num_chunks = Self::PADDED_INPUT / 16;
                let input_ptr = input.as_ptr();
                let weights_ptr = self.weights.as_ptr();

                if OUTPUT_DIM.is_multiple_of(OUTPUT_LANE_GROUP) {
                    let mut i = 0;
                    while i < OUTPUT_DIM {
                        let offset0 = i * Self::PADDED_INPUT;
                        let offset1 = (i + 1) * Self::PADDED_INPUT;
                        let offset2 = (i + 2) * Self::PADDED_INPUT;
                        let offset3 = (i + 3) * Self::PADDED_INPUT;

                        let mut sum0 = _mm_setzero_si128();
                        let mut sum1 = _mm_setzero_si128();
                        let mut sum2 = _mm_setzero_si128();
                        let mut sum3 = _mm_setzero_si128();

                        for j in 0..num_chunks {
                            let in_vec = _mm_load_si128(input_ptr.add(j * 16) as *const __m128i);
                            m128_add_dpbusd_epi32(
                                &mut sum0,
                                in_vec,
                                _mm_load_si128(weights_ptr.add(offset0 + j * 16) as *const __m128i),
                            );
                            m128_add_dpbusd_epi32(
                                &mut sum1,
                                in_vec,
                                _mm_load_si128(weights_ptr.add(offset1 + j * 16) as *const __m128i),
                            );
                            m128_add_dpbusd_epi32(
                                &mut sum2,
                                in_vec,
                                _mm_load_si128(weights_ptr.add(offset2 + j * 16) as *const __m128i),
                            );
                            m128_add_dpbusd_epi32(
                                &mut sum3,
                                in_vec,
                                _mm_load_si128(weights_ptr.add(offset3 + j * 16) as *const __m128i),
                            );
                        }

                        let bias =
                            _mm_loadu_si128(self.biases.as_ptr().add(i) as *const __m128i);
                        let result = m128_haddx4(sum0, sum1, sum2, sum3, bias);
                        _mm_storeu_si128(output.as_mut_ptr().add(i) as *mut __m128i, result);
                        i += OUTPUT_LANE_GROUP;
                    }
                    return;
                }

                // OUTPUT_DIM == 1（構築時の制約により他の値はあり得ない）
                debug_assert_eq!(OUTPUT_DIM, 1);
                let mut sum = _mm_setzero_si128();
                for j in 0..num_chunks {
                    let in_vec = _mm_load_si128(input_ptr.add(j * 16) as *const __m128i);
                    m128_add_dpbusd_epi32(
                        &mut sum,
                        in_vec,
                        _mm_load_si128(weights_ptr.add(j * 16) as *const __m128i),
                    );
                }
                output[0] = self.biases[0] + hsum_i32_sse2(sum);
            }
            return;
        }

        // SSE2: 128bit = 16 x u8/i8 (SSSE3非対応環境のフォールバック)
        #[cfg(all(
            target_arch = "x86_64",
            target_feature = "sse2",
            not(target_feature = "ssse3")
        ))]
        {
            // SAFETY:
            // - input.len() >= PADDED_INPUT (debug_assert で検証済み)
            // - weights.len() == OUTPUT_DIM * PADDED_INPUT (構造上保証)
            // - input / weights は 64 バイトアラインで、PADDED_INPUT は 32 の
            //   倍数のため行オフセットは常に 16 バイト境界を満たす
            //
            // maddubs を使わず u8/i8 を手動で i16 拡張するため、この実装は
            // 入力値の範囲に関わらずスカラーリファレンスと厳密に一致する。
            unsafe {
                use std::arch::x86_64::*;

                let num_chunks = Self::PADDED_INPUT / 16;

                // 定数をループ外でホイスト
                let one = _mm_set1_epi16(1);
                let zero = _mm_setzero_si128();

                let input_ptr = input.as_ptr();
                let weights_ptr = self.weights.as_ptr();

                for (i, (out, &bias)) in output.iter_mut().zip(&self.biases).enumerate() {
                    let mut acc = _mm_setzero_si128();
                    let weight_row_offset = i * Self::PADDED_INPUT;

                    // 入力を16バイトずつ処理
                    for j in 0..num_chunks {
                        let offset = j * 16;
                        let in_vec = _mm_load_si128(input_ptr.add(offset) as *const __m128i);
                        let w_vec = _mm_load_si128(
                            weights_ptr.add(weight_row_offset + offset) as *const __m128i
                        );

                        // u8をi16にゼロ拡張
                        let in_lo = _mm_unpacklo_epi8(in_vec, zero);
                        let in_hi = _mm_unpackhi_epi8(in_vec, zero);
                        // i8をi16に符号拡張（cmpgtで符号ビットマスクを生成）
                        let sign = _mm_cmpgt_epi8(zero, w_vec);
                        let w_lo = _mm_unpacklo_epi8(w_vec, sign);
                        let w_hi = _mm_unpackhi_epi8(w_vec, sign);

                        // i16乗算
                        let prod_lo = _mm_mullo_epi16(in_lo, w_lo);
                        let prod_hi = _mm_mullo_epi16(in_hi, w_hi);

                        // i16 → i32 にワイドニング加算
                        let sum32_lo = _mm_madd_epi16(prod_lo, one);
                        let sum32_hi = _mm_madd_epi16(prod_hi, one);

                        acc = _mm_add_epi32(acc, sum32_lo);
                        acc = _mm_add_epi32(acc, sum32_hi);
                    }

                    // 水平加算してバイアスを加える
                    *out = bias + hsum_i32_sse2(acc);
                }
            }
            return;
        }

        // WASM SIMD128
        #[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
        {
            // SAFETY:
            // - input.len() >= PADDED_INPUT (debug_assert で検証済み)
            // - weights.len() == OUTPUT_DIM * PADDED_INPUT (構造上保証)
            // - WASM SIMD128 はアライメント不要（v128_load は任意アドレス対応）
            // - 4出力単位の出力ストアは i32 配列内の 16 バイト境界
            unsafe {
                use std::arch::wasm32::*;

                let num_chunks = Self::PADDED_INPUT / 16;
                let input_ptr = input.as_ptr();
                let weights_ptr = self.weights.as_ptr();

                // 4出力同時処理: 入力ロードを再利用
                if OUTPUT_DIM.is_multiple_of(OUTPUT_LANE_GROUP) {
                    let mut i = 0;
                    while i < OUTPUT_DIM {
                        let mut acc0 = i32x4_splat(0);
                        let mut acc1 = i32x4_splat(0);
                        let mut acc2 = i32x4_splat(0);
                        let mut acc3 = i32x4_splat(0);

                        let row0 = weights_ptr.add(i * Self::PADDED_INPUT);
                        let row1 = weights_ptr.add((i + 1) * Self::PADDED_INPUT);
                        let row2 = weights_ptr.add((i + 2) * Self::PADDED_INPUT);
                        let row3 = weights_ptr.add((i + 3) * Self::PADDED_INPUT);

                        for j in 0..num_chunks {
                            let offset = j * 16;
                            let in_vec = v128_load(input_ptr.add(offset) as *const v128);
                            let in_lo = i16x8_extend_low_u8x16(in_vec);
                            let in_hi = i16x8_extend_high_u8x16(in_vec);

                            let w0 = v128_load(row0.add(offset) as *const v128);
                            let w1 = v128_load(row1.add(offset) as *const v128);
                            let w2 = v128_load(row2.add(offset) as *const v128);
                            let w3 = v128_load(row3.add(offset) as *const v128);

                            acc0 = i32x4_add(acc0, dot_i8x16_u8i8_preexpanded(in_lo, in_hi, w0));
                            acc1 = i32x4_add(acc1, dot_i8x16_u8i8_preexpanded(in_lo, in_hi, w1));
                            acc2 = i32x4_add(acc2, dot_i8x16_u8i8_preexpanded(in_lo, in_hi, w2));
                            acc3 = i32x4_add(acc3, dot_i8x16_u8i8_preexpanded(in_lo, in_hi, w3));
                        }

                        let sum_vec = haddx4(acc0, acc1, acc2, acc3);
                        let bias_vec = v128_load(self.biases.as_ptr().add(i) as *const v128);
                        let out_vec = i32x4_add(bias_vec, sum_vec);
                        v128_store(output.as_mut_ptr().add(i) as *mut v128, out_vec);
                        i += OUTPUT_LANE_GROUP;
                    }
                    return;
                }

                // OUTPUT_DIM == 1（構築時の制約により他の値はあり得ない）
                debug_assert_eq!(OUTPUT_DIM, 1);
                let mut acc = i32x4_splat(0);
                for j in 0..num_chunks {
                    let offset = j * 16;
                    let in_vec = v128_load(input_ptr.add(offset) as *const v128);
                    let w_vec = v128_load(weights_ptr.add(offset) as *const v128);
                    acc = i32x4_add(acc, dot_i8x16_u8i8(in_vec, w_vec));
                }
                output[0] = self.biases[0] + hsum_i32x4(acc);
            }
            return;
        }

        // スカラーフォールバック
        #[allow(unreachable_code)]
        self.propagate_scalar(input, output);
    }
}

impl<P: Layer<Output = u8>, const OUTPUT_DIM: usize> Layer for AffineTransform<P, OUTPUT_DIM> {
    type Output = i32;

    const INPUT_DIMENSIONS: usize = P::INPUT_DIMENSIONS;
    const OUTPUT_DIMENSIONS: usize = OUTPUT_DIM;
    const BUFFER_SIZE: usize = P::BUFFER_SIZE + Self::SELF_BUFFER_SIZE;

    fn hash_value() -> u32 {
        let mut hash: u32 = 0xCC03_DAE4;
        hash = hash.wrapping_add(OUTPUT_DIM as u32);
        let prev = P::hash_value();
        hash ^= prev >> 1;
        hash ^= prev << 31;
        hash
    }

    fn architecture() -> String {
        format!("AffineTransform[{}<-{}]({})", OUTPUT_DIM, Self::INPUT_DIM, P::architecture())
    }

    fn zeroed() -> Self {
        let () = Self::OUTPUT_DIM_OK;
        Self {
            previous: P::zeroed(),
            biases: [0; OUTPUT_DIM],
            weights: AlignedBox::new_zeroed(Self::WEIGHT_LEN),
        }
    }

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let () = Self::OUTPUT_DIM_OK;
        let previous = P::read(reader)?;

        // バイアスを読み込み
        let mut biases = [0i32; OUTPUT_DIM];
        let mut buf4 = [0u8; 4];
        for bias in biases.iter_mut() {
            reader.read_exact(&mut buf4)?;
            *bias = i32::from_le_bytes(buf4);
        }

        // 重みを読み込み（行優先、パディング列込み、64バイトアラインで確保）
        let mut weights = AlignedBox::new_zeroed(Self::WEIGHT_LEN);
        let mut buf = vec![0u8; Self::WEIGHT_LEN];
        reader.read_exact(&mut buf)?;
        for (w, &b) in weights.iter_mut().zip(buf.iter()) {
            *w = b as i8;
        }

        Ok(Self { previous, biases, weights })
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.previous.write(writer)?;

        for &bias in &self.biases {
            writer.write_all(&bias.to_le_bytes())?;
        }

        let bytes: Vec<u8> = self.weights.iter().map(|&w| w as u8).collect();
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn collect_stats(&self, stats: &mut Vec<LayerStats>) {
        self.previous.collect_stats(stats);
        stats.push(LayerStats {
            layer: format!("AffineTransform[{}<-{}]", OUTPUT_DIM, Self::INPUT_DIM),
            weight_count: self.weights.len(),
            weight_min: self.weights.iter().copied().min().unwrap_or(0),
            weight_max: self.weights.iter().copied().max().unwrap_or(0),
            weight_nonzero: self.weights.iter().filter(|&&w| w != 0).count(),
            bias_min: self.biases.iter().copied().min().unwrap_or(0),
            bias_max: self.biases.iter().copied().max().unwrap_or(0),
        });
    }

    fn propagate<'a>(&self, input: &'a [u8], buffer: &'a mut [u8]) -> &'a [i32] {
        let () = Self::OUTPUT_DIM_OK;
        debug_assert!(
            buffer.len() >= Self::BUFFER_SIZE,
            "buffer length {} is less than BUFFER_SIZE {}",
            buffer.len(),
            Self::BUFFER_SIZE
        );

        // 自領域を先頭から切り出し、残りを前段に渡す
        let (own, rest) = buffer.split_at_mut(Self::SELF_BUFFER_SIZE);
        let prev_output = self.previous.propagate(input, rest);

        debug_assert_eq!(own.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        // SAFETY: own は SELF_BUFFER_SIZE (>= OUTPUT_DIM * 4) バイトで
        // 64 バイト境界に揃っており、i32 スライスとして有効
        let output: &'a mut [i32] = unsafe {
            std::slice::from_raw_parts_mut(own.as_mut_ptr() as *mut i32, OUTPUT_DIM)
        };

        self.forward(prev_output, &mut output[..]);
        output
    }
}

// =============================================================================
// ClippedReLU - クリップ付き活性化層
// =============================================================================

/// ClippedReLU層
///
/// 前段の i32 出力を右シフトし、0-127 にクランプして u8 へ変換する。
/// アフィン層同士を繋ぐ量子化段であり、この層を通った値は常に
/// maddubs 系バックエンドの入力契約（127 以下）を満たす。
/// パラメータは持たない。
///
/// フォールスルー構造:
/// 1. AVX2で32要素ずつ処理
/// 2. 残りをSSE2で16要素ずつ処理
/// 3. 残りをSSE2で8要素ずつ処理（DIM=8対応）
/// 4. 残りをスカラーで処理
#[derive(Debug)]
pub struct ClippedReLU<P> {
    /// 前段レイヤー（この層が所有する）
    pub previous: P,
}

impl<P: Layer<Output = i32>> ClippedReLU<P> {
    /// 入出力次元（この層は次元を変えない）
    pub const DIM: usize = P::OUTPUT_DIMENSIONS;

    /// この層の出力が占めるバッファ領域（バイト）
    pub const SELF_BUFFER_SIZE: usize = ceil_to_multiple(Self::DIM, CACHE_LINE_SIZE);

    /// 消費側が読むパディング済み幅
    ///
    /// キャッシュライン切り上げの自領域は常にこの幅を包含し、
    /// DIM 以降のバイトはバッファ確保時のゼロのまま残る。
    pub const PADDED_OUTPUT: usize = padded_input(Self::DIM);

    fn transform(input: &[i32], output: &mut [u8]) {
        debug_assert_eq!(input.len(), Self::DIM);
        debug_assert!(output.len() >= Self::DIM);

        let mut processed: usize = 0;

        // === AVX2: 32要素ずつ処理 ===
        #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
        {
            let num_chunks = Self::DIM / 32;
            if num_chunks > 0 {
                // SAFETY:
                // - num_chunks > 0 を確認済み
                // - loadu/storeu を使用するためアライメント不要
                unsafe {
                    use std::arch::x86_64::*;

                    let zero = _mm256_setzero_si256();
                    let offsets = _mm256_set_epi32(7, 3, 6, 2, 5, 1, 4, 0);

                    let in_ptr = input.as_ptr() as *const __m256i;
                    let out_ptr = output.as_mut_ptr() as *mut __m256i;

                    for i in 0..num_chunks {
                        let in0 = _mm256_loadu_si256(in_ptr.add(i * 4));
                        let in1 = _mm256_loadu_si256(in_ptr.add(i * 4 + 1));
                        let in2 = _mm256_loadu_si256(in_ptr.add(i * 4 + 2));
                        let in3 = _mm256_loadu_si256(in_ptr.add(i * 4 + 3));

                        let words0 = _mm256_srai_epi16(
                            _mm256_packs_epi32(in0, in1),
                            WEIGHT_SCALE_BITS as i32,
                        );
                        let words1 = _mm256_srai_epi16(
                            _mm256_packs_epi32(in2, in3),
                            WEIGHT_SCALE_BITS as i32,
                        );

                        let bytes = _mm256_max_epi8(_mm256_packs_epi16(words0, words1), zero);
                        let result = _mm256_permutevar8x32_epi32(bytes, offsets);

                        _mm256_storeu_si256(out_ptr.add(i), result);
                    }
                }
                processed = num_chunks * 32;
            }
        }

        // === SSE2: 16要素ずつ処理（残り部分） ===
        #[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
        {
            let remaining = Self::DIM - processed;
            let num_chunks = remaining / 16;
            if num_chunks > 0 {
                // SAFETY: 同上
                unsafe {
                    use std::arch::x86_64::*;

                    #[cfg(target_feature = "sse4.1")]
                    let zero = _mm_setzero_si128();
                    #[cfg(not(target_feature = "sse4.1"))]
                    let k0x80s = _mm_set1_epi8(-128i8);

                    let in_ptr = input.as_ptr().add(processed) as *const __m128i;
                    let out_ptr = output.as_mut_ptr().add(processed) as *mut __m128i;

                    for i in 0..num_chunks {
                        let in0 = _mm_loadu_si128(in_ptr.add(i * 4));
                        let in1 = _mm_loadu_si128(in_ptr.add(i * 4 + 1));
                        let in2 = _mm_loadu_si128(in_ptr.add(i * 4 + 2));
                        let in3 = _mm_loadu_si128(in_ptr.add(i * 4 + 3));

                        let words0 =
                            _mm_srai_epi16(_mm_packs_epi32(in0, in1), WEIGHT_SCALE_BITS as i32);
                        let words1 =
                            _mm_srai_epi16(_mm_packs_epi32(in2, in3), WEIGHT_SCALE_BITS as i32);

                        let packedbytes = _mm_packs_epi16(words0, words1);

                        #[cfg(target_feature = "sse4.1")]
                        let result = _mm_max_epi8(packedbytes, zero);
                        #[cfg(not(target_feature = "sse4.1"))]
                        let result = _mm_subs_epi8(_mm_adds_epi8(packedbytes, k0x80s), k0x80s);

                        _mm_storeu_si128(out_ptr.add(i), result);
                    }
                }
                processed += num_chunks * 16;
            }
        }

        // === SSE2: 8要素処理（DIM=8対応） ===
        #[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
        {
            let remaining = Self::DIM - processed;
            if remaining >= 8 {
                // SAFETY: 同上
                // 8個のi32を2つの__m128iで読み込み、下位8バイトのみ書き出す
                unsafe {
                    use std::arch::x86_64::*;

                    #[cfg(target_feature = "sse4.1")]
                    let zero = _mm_setzero_si128();
                    #[cfg(not(target_feature = "sse4.1"))]
                    let k0x80s = _mm_set1_epi8(-128i8);

                    let in_ptr = input.as_ptr().add(processed) as *const __m128i;
                    let out_ptr = output.as_mut_ptr().add(processed);

                    let in0 = _mm_loadu_si128(in_ptr);
                    let in1 = _mm_loadu_si128(in_ptr.add(1));

                    // i32 → i16 にパックしてから右シフト
                    let words = _mm_packs_epi32(in0, in1);
                    let shifted = _mm_srai_epi16(words, WEIGHT_SCALE_BITS as i32);
                    let packedbytes = _mm_packs_epi16(shifted, shifted);

                    // max(0, x)
                    #[cfg(target_feature = "sse4.1")]
                    let result = _mm_max_epi8(packedbytes, zero);
                    #[cfg(not(target_feature = "sse4.1"))]
                    let result = _mm_subs_epi8(_mm_adds_epi8(packedbytes, k0x80s), k0x80s);

                    _mm_storel_epi64(out_ptr as *mut __m128i, result);
                }
                processed += 8;
            }
        }

        // === WASM SIMD128: 8要素ずつ処理 ===
        #[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
        {
            let num_chunks = (Self::DIM - processed) / 8;
            if num_chunks > 0 {
                // SAFETY: 同上
                unsafe {
                    use std::arch::wasm32::*;

                    let zero = i8x16_splat(0);
                    let in_ptr = input.as_ptr().add(processed) as *const v128;
                    let out_ptr = output.as_mut_ptr().add(processed) as *mut i64;

                    for i in 0..num_chunks {
                        let in0 = v128_load(in_ptr.add(i * 2));
                        let in1 = v128_load(in_ptr.add(i * 2 + 1));

                        let shifted0 = i32x4_shr(in0, WEIGHT_SCALE_BITS);
                        let shifted1 = i32x4_shr(in1, WEIGHT_SCALE_BITS);
                        let words = i16x8_narrow_i32x4(shifted0, shifted1);

                        let bytes = i8x16_narrow_i16x8(words, words);
                        let result = i8x16_max(bytes, zero);

                        *out_ptr.add(i) = i64x2_extract_lane::<0>(result);
                    }
                }
                processed += num_chunks * 8;
            }
        }

        // === スカラーフォールバック（残り要素） ===
        for i in processed..Self::DIM {
            let shifted = input[i] >> WEIGHT_SCALE_BITS;
            output[i] = shifted.clamp(0, MAX_ACTIVATION) as u8;
        }
    }
}

impl<P: Layer<Output = i32>> Layer for ClippedReLU<P> {
    type Output = u8;

    const INPUT_DIMENSIONS: usize = P::INPUT_DIMENSIONS;
    const OUTPUT_DIMENSIONS: usize = P::OUTPUT_DIMENSIONS;
    const BUFFER_SIZE: usize = P::BUFFER_SIZE + Self::SELF_BUFFER_SIZE;

    fn hash_value() -> u32 {
        0x538D_24C7u32.wrapping_add(P::hash_value())
    }

    fn architecture() -> String {
        format!("ClippedReLU[{}]({})", Self::DIM, P::architecture())
    }

    fn zeroed() -> Self {
        Self { previous: P::zeroed() }
    }

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        // この層自体にはパラメータがない
        Ok(Self { previous: P::read(reader)? })
    }

    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.previous.write(writer)
    }

    fn collect_stats(&self, stats: &mut Vec<LayerStats>) {
        self.previous.collect_stats(stats);
    }

    fn propagate<'a>(&self, input: &'a [u8], buffer: &'a mut [u8]) -> &'a [u8] {
        debug_assert!(
            buffer.len() >= Self::BUFFER_SIZE,
            "buffer length {} is less than BUFFER_SIZE {}",
            buffer.len(),
            Self::BUFFER_SIZE
        );

        let (own, rest) = buffer.split_at_mut(Self::SELF_BUFFER_SIZE);
        let prev_output = self.previous.propagate(input, rest);

        Self::transform(prev_output, own);

        // DIM 以降のパディングバイトは確保時のゼロのまま
        &own[..Self::PADDED_OUTPUT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::Aligned;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use std::io::Cursor;

    type Affine8x4 = AffineTransform<InputSlice<8>, 4>;
    type Affine4x1 = AffineTransform<InputSlice<4>, 1>;

    #[test]
    fn test_input_slice_passthrough() {
        let layer: InputSlice<8> = Layer::zeroed();
        let mut input = Aligned([0u8; 32]);
        input.0[0] = 1;
        input.0[7] = 9;
        let mut buffer = [0u8; 0];
        let out = layer.propagate(&input.0, &mut buffer);
        assert_eq!(out.len(), 32);
        assert_eq!(out[0], 1);
        assert_eq!(out[7], 9);
    }

    #[test]
    fn test_affine_transform_propagate() {
        // PADDED_INPUT = 32 なので入力も32バイト必要
        let mut layer: Affine8x4 = Layer::zeroed();
        layer.biases = [10, 20, 30, 40];
        layer.weights[0] = 1;
        layer.weights[1] = 2; // 行0: [1, 2, 0, ...]
        layer.weights[Affine8x4::PADDED_INPUT] = 3;
        layer.weights[Affine8x4::PADDED_INPUT + 1] = 4; // 行1: [3, 4, 0, ...]

        let mut input = Aligned([0u8; 32]);
        input.0[0] = 1;
        input.0[1] = 2;
        let mut buffer = Aligned([0u8; <Affine8x4 as Layer>::BUFFER_SIZE]);

        let out = layer.propagate(&input.0, &mut buffer.0);

        // out[0] = 10 + 1*1 + 2*2 = 15
        // out[1] = 20 + 1*3 + 2*4 = 31
        assert_eq!(out, &[15, 31, 30, 40]);
    }

    #[test]
    fn test_identity_rows_then_single_sum() {
        // 8入力、4出力、行iは列iのみ1の単位行列パターン、バイアス0
        let mut first: Affine8x4 = Layer::zeroed();
        for i in 0..4 {
            first.weights[i * Affine8x4::PADDED_INPUT + i] = 1;
        }
        let mut input = Aligned([0u8; 32]);
        for (i, v) in input.0.iter_mut().take(8).enumerate() {
            *v = (i + 1) as u8; // 1, 2, ..., 8
        }
        let mut buffer = Aligned([0u8; <Affine8x4 as Layer>::BUFFER_SIZE]);
        let mid = first.propagate(&input.0, &mut buffer.0);
        assert_eq!(mid, &[1, 2, 3, 4]);

        // その4値を消費する単出力段: 重み [1,1,1,1]、バイアス 10
        let mut head: Affine4x1 = Layer::zeroed();
        for j in 0..4 {
            head.weights[j] = 1;
        }
        head.biases[0] = 10;
        let mut head_input = Aligned([0u8; 32]);
        for (dst, &v) in head_input.0.iter_mut().zip(mid.iter()) {
            *dst = v as u8;
        }
        let mut head_buffer = Aligned([0u8; <Affine4x1 as Layer>::BUFFER_SIZE]);
        let out = head.propagate(&head_input.0, &mut head_buffer.0);
        assert_eq!(out, &[20]); // 1+2+3+4+10
    }

    #[test]
    fn test_zero_weights_return_biases() {
        type L = AffineTransform<InputSlice<32>, 4>;
        let mut layer: L = Layer::zeroed();
        layer.biases = [5, -7, 123_456, -987_654];

        let mut input = Aligned([0u8; 32]);
        for (i, v) in input.0.iter_mut().enumerate() {
            *v = (i * 3 % 128) as u8;
        }
        let mut buffer = Aligned([0u8; <L as Layer>::BUFFER_SIZE]);
        let out = layer.propagate(&input.0, &mut buffer.0);
        assert_eq!(out, &layer.biases);
    }

    #[test]
    fn test_propagate_matches_scalar_reference() {
        // パディングが非自明になる次元（48 → 64）でコンパイル済み
        // バックエンドとスカラーリファレンスの一致を確認する
        type L = AffineTransform<InputSlice<48>, 8>;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5EED_0001);

        let mut layer: L = Layer::zeroed();
        for trial in 0..32 {
            for w in layer.weights.iter_mut() {
                *w = rng.random_range(-128i32..=127) as i8;
            }
            for b in layer.biases.iter_mut() {
                *b = rng.random_range(-1_000_000..=1_000_000);
            }

            let mut input = Aligned([0u8; 64]);
            for v in input.0.iter_mut().take(48) {
                *v = rng.random_range(0..=127u32) as u8;
            }

            let mut buffer = Aligned([0u8; <L as Layer>::BUFFER_SIZE]);
            let out = layer.propagate(&input.0, &mut buffer.0);

            let mut reference = [0i32; 8];
            layer.propagate_scalar(&input.0, &mut reference);
            assert_eq!(out, &reference, "mismatch at trial {trial}");
        }
    }

    #[test]
    fn test_single_output_matches_scalar_reference() {
        type L = AffineTransform<InputSlice<96>, 1>;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5EED_0002);

        let mut layer: L = Layer::zeroed();
        for trial in 0..32 {
            for w in layer.weights.iter_mut() {
                *w = rng.random_range(-128i32..=127) as i8;
            }
            layer.biases[0] = rng.random_range(-1_000_000..=1_000_000);

            let mut input = Aligned([0u8; 96]);
            for v in input.0.iter_mut() {
                *v = rng.random_range(0..=127u32) as u8;
            }

            let mut buffer = Aligned([0u8; <L as Layer>::BUFFER_SIZE]);
            let out = layer.propagate(&input.0, &mut buffer.0);

            let mut reference = [0i32; 1];
            layer.propagate_scalar(&input.0, &mut reference);
            assert_eq!(out, &reference, "mismatch at trial {trial}");
        }
    }

    #[test]
    fn test_clipped_relu_chain() {
        // 対角重み64で x → (64x >> 6) = x の恒等変換になる
        type Chain = ClippedReLU<AffineTransform<InputSlice<8>, 8>>;
        let mut chain: Chain = Layer::zeroed();
        for i in 0..8 {
            chain.previous.weights[i * AffineTransform::<InputSlice<8>, 8>::PADDED_INPUT + i] = 64;
        }

        let mut input = Aligned([0u8; 32]);
        for (i, v) in input.0.iter_mut().take(8).enumerate() {
            *v = i as u8;
        }
        let mut buffer = Aligned([0u8; <Chain as Layer>::BUFFER_SIZE]);
        let out = chain.propagate(&input.0, &mut buffer.0);

        assert_eq!(&out[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        // パディング領域はゼロのまま
        assert!(out[8..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_clipped_relu_clamps() {
        // ゼロ重み + バイアスのみで活性化の境界値を直接駆動する
        type Chain = ClippedReLU<AffineTransform<InputSlice<8>, 8>>;
        let mut chain: Chain = Layer::zeroed();
        chain.previous.biases = [0, 64, 128, -64, 8_128, 8_192, -100_000, 100_000];

        let input = Aligned([0u8; 32]);
        let mut buffer = Aligned([0u8; <Chain as Layer>::BUFFER_SIZE]);
        let out = chain.propagate(&input.0, &mut buffer.0);

        // x >> 6 を 0..=127 にクランプ
        assert_eq!(&out[..8], &[0, 1, 2, 0, 127, 127, 0, 127]);
    }

    #[test]
    fn test_hash_value_depends_on_shape() {
        let h_4 = <AffineTransform<InputSlice<8>, 4> as Layer>::hash_value();
        let h_8 = <AffineTransform<InputSlice<8>, 8> as Layer>::hash_value();
        let h_in16 = <AffineTransform<InputSlice<16>, 4> as Layer>::hash_value();
        assert_ne!(h_4, h_8);
        assert_ne!(h_4, h_in16);

        // 活性化を挟むとさらに変わる
        let h_relu =
            <ClippedReLU<AffineTransform<InputSlice<8>, 4>> as Layer>::hash_value();
        assert_ne!(h_4, h_relu);
    }

    #[test]
    fn test_layer_parameter_round_trip() {
        // write で書いたバイト列を read で読み戻すと bit 単位で一致する
        let mut modified: Affine8x4 = Layer::zeroed();
        modified.biases = [1, 2, 3, 4];
        modified.weights[0] = 77;

        let mut bytes = Vec::new();
        modified.write(&mut bytes).unwrap();
        let reloaded = <Affine8x4 as Layer>::read(&mut Cursor::new(bytes)).unwrap();

        assert_eq!(reloaded.biases, modified.biases);
        assert_eq!(reloaded.weights[0], 77);
    }

    #[test]
    fn test_architecture_string() {
        type Chain = AffineTransform<ClippedReLU<AffineTransform<InputSlice<8>, 4>>, 1>;
        assert_eq!(
            <Chain as Layer>::architecture(),
            "AffineTransform[1<-4](ClippedReLU[4](AffineTransform[4<-8](InputSlice[8])))"
        );
    }

    #[test]
    fn test_buffer_size_is_additive() {
        // 8入力→4出力: 自領域 16B → 64B 切り上げ
        assert_eq!(<Affine8x4 as Layer>::BUFFER_SIZE, 64);

        type Chain = AffineTransform<ClippedReLU<AffineTransform<InputSlice<8>, 4>>, 1>;
        // 64 (内側アフィン) + 64 (ReLU, 4B→64B) + 64 (外側アフィン)
        assert_eq!(<Chain as Layer>::BUFFER_SIZE, 192);
    }

    #[test]
    fn test_read_rejects_truncated_stream() {
        // バイアス4個 + 重み 4*32 = 144 バイト必要なところ10バイトしかない
        let mut cursor = Cursor::new(vec![0u8; 10]);
        let result = <Affine8x4 as Layer>::read(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn test_layer_read_consumes_exact_bytes() {
        // バイアス 4*4 + 重み 4*32 = 144 バイト
        let data = vec![0u8; 145];
        let mut cursor = Cursor::new(data);
        let _layer = <Affine8x4 as Layer>::read(&mut cursor).unwrap();
        assert_eq!(cursor.position(), 144);
    }

    #[test]
    fn test_collect_stats() {
        type Chain = AffineTransform<ClippedReLU<AffineTransform<InputSlice<8>, 4>>, 1>;
        let mut chain: Chain = Layer::zeroed();
        chain.previous.previous.weights[0] = -3;
        chain.previous.previous.weights[1] = 7;
        chain.biases[0] = 42;

        let mut stats = Vec::new();
        chain.collect_stats(&mut stats);

        // 内側から順に2つのアフィン層
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].layer, "AffineTransform[4<-8]");
        assert_eq!(stats[0].weight_min, -3);
        assert_eq!(stats[0].weight_max, 7);
        assert_eq!(stats[0].weight_nonzero, 2);
        assert_eq!(stats[1].layer, "AffineTransform[1<-4]");
        assert_eq!(stats[1].bias_max, 42);
    }
}
