//! rnnue-core: 量子化アフィン変換チェーンの推論コア
//!
//! 疎なバイト特徴量ベクトルをスカラ評価値へ変換する、整数演算のみの
//! 全結合チェーンを実装する。探索プログラムの評価関数として毎秒
//! 数百万回呼ばれる前提で、伝播は割り当てなし・単一パスで走る。
//!
//! # 構成
//!
//! ```text
//! Network<L>
//! └── L: Layer          // コンパイル時合成のチェーン
//!     ├── AffineTransform<P, N>   // u8 入力 × i8 重み → i32 出力
//!     ├── ClippedReLU<P>          // i32 → u8 (0..=127 クランプ)
//!     └── InputSlice<DIMS>        // チェーン終端（抽出済み特徴量）
//! ```
//!
//! 各層は前段を型として所有し、次元・バッファサイズ・構造ハッシュは
//! すべて関連定数で合成される。評価は [`Network::evaluate`] の1回の
//! 呼び出しで、呼び出し側所有の [`EvalBuffer`] に内側の層から順に
//! 書き込んでいく。
//!
//! # 数値契約
//!
//! `propagate` の全 SIMD バックエンドはスカラーリファレンス
//! ([`AffineTransform::propagate_scalar`]) と bit 単位で一致する。
//! 読み込んだ後のネットワークは不変で、同じ入力に対して常に同じ
//! 出力を返す。
//!
//! # 使用例
//!
//! ```
//! use rnnue_core::aligned::Aligned;
//! use rnnue_core::layers::{AffineTransform, ClippedReLU, InputSlice};
//! use rnnue_core::network::Network;
//!
//! type Stack = AffineTransform<ClippedReLU<AffineTransform<InputSlice<32>, 8>>, 1>;
//!
//! let network = Network::<Stack>::zeroed();
//! let features = Aligned([0u8; 32]);
//! let mut buffer = Network::<Stack>::new_buffer();
//! let out = network.evaluate(&features.0, &mut buffer);
//! assert_eq!(out, &[0]);
//! ```

pub mod aliases;
pub mod aligned;
pub mod constants;
pub mod layers;
pub mod network;

pub use aligned::{Aligned, AlignedBox};
pub use layers::{AffineTransform, ClippedReLU, InputSlice, Layer, LayerStats};
pub use network::{EvalBuffer, Network, NetworkHeader, read_header};
