//! ネットワーク全体の構造とパラメータファイル I/O
//!
//! [`Network`] は最終層（= チェーン全体）を所有し、評価の入口と
//! パラメータファイルの読み書きを提供する。
//!
//! # ファイルフォーマット
//!
//! リトルエンディアン固定:
//!
//! ```text
//! u32  バージョンワード
//! u32  構造ハッシュ（チェーン形状から計算、パラメータ非依存）
//! u32  アーキテクチャ文字列長
//! [u8] アーキテクチャ文字列（人間用、照合には使わない）
//! ...  各層のパラメータ（内側の層から順、バイアス → 重み）
//! ```
//!
//! 長さプレフィックスを持たないため、構造の合わないファイルは
//! ストリーム枯渇か無意味な読み取りになる。これを防ぐのが
//! 構造ハッシュの照合で、パラメータを1バイトも読む前に行われる。

use crate::aligned::AlignedBox;
use crate::constants::{MAX_ARCH_LEN, NETWORK_VERSION};
use crate::layers::Layer;
use log::debug;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::Path;

/// パラメータファイルのヘッダ情報
#[derive(Debug, Clone, Serialize)]
pub struct NetworkHeader {
    /// バージョンワード
    pub version: u32,
    /// 構造ハッシュ
    pub hash: u32,
    /// アーキテクチャ表記
    pub architecture: String,
}

/// ヘッダのみを読み込む
///
/// バージョンやハッシュの照合は行わない（inspect ツール用）。
/// 文字列長が壊れている場合のみエラーを返す。
pub fn read_header<R: Read>(reader: &mut R) -> io::Result<NetworkHeader> {
    let mut buf4 = [0u8; 4];

    reader.read_exact(&mut buf4)?;
    let version = u32::from_le_bytes(buf4);

    reader.read_exact(&mut buf4)?;
    let hash = u32::from_le_bytes(buf4);

    reader.read_exact(&mut buf4)?;
    let arch_len = u32::from_le_bytes(buf4) as usize;
    if arch_len == 0 || arch_len > MAX_ARCH_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid arch string length: {arch_len} (max: {MAX_ARCH_LEN})"),
        ));
    }

    let mut arch = vec![0u8; arch_len];
    reader.read_exact(&mut arch)?;
    let architecture = String::from_utf8_lossy(&arch).into_owned();

    Ok(NetworkHeader { version, hash, architecture })
}

/// 評価用スクラッチバッファ
///
/// チェーン全体の伝播結果を保持する呼び出し側所有のアリーナ。
/// 64バイト境界で確保され、評価のたびに再利用される。
/// 各層は自分の論理的な出力幅までしか書かないため、パディング
/// バイトは確保時のゼロのまま保たれる。
///
/// 並行に評価する場合はスレッドごとに1つずつ持つこと。
/// 同じバッファを同時に複数の評価へ渡してはならない。
pub struct EvalBuffer {
    data: AlignedBox<u8>,
}

impl EvalBuffer {
    /// `size` バイトのゼロ初期化バッファを確保
    pub fn new(size: usize) -> Self {
        Self { data: AlignedBox::new_zeroed(size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 層チェーン全体を所有する評価ネットワーク
///
/// 読み込み後は不変で、重み・バイアスが変更されることはない。
/// `evaluate` は `&self` しか取らず内部状態を持たないため、
/// 複数スレッドが同一の `Network` を共有し、それぞれ専用の
/// [`EvalBuffer`] で並行に評価してよい。
#[derive(Debug)]
pub struct Network<L: Layer> {
    /// 最終層（チェーン全体を所有する）
    pub stack: L,
}

impl<L: Layer> Network<L> {
    /// チェーン先頭の生特徴量の次元数
    pub const INPUT_DIMENSIONS: usize = L::INPUT_DIMENSIONS;

    /// チェーン末尾の出力次元数
    pub const OUTPUT_DIMENSIONS: usize = L::OUTPUT_DIMENSIONS;

    /// 1回の評価に必要なスクラッチバッファサイズ（バイト）
    pub const BUFFER_SIZE: usize = L::BUFFER_SIZE;

    /// チェーン構造のハッシュ値
    pub fn hash_value() -> u32 {
        L::hash_value()
    }

    /// アーキテクチャ表記
    pub fn architecture() -> String {
        L::architecture()
    }

    /// 全パラメータをゼロで構築
    pub fn zeroed() -> Self {
        Self { stack: L::zeroed() }
    }

    /// このネットワーク用のスクラッチバッファを確保
    pub fn new_buffer() -> EvalBuffer {
        EvalBuffer::new(Self::BUFFER_SIZE)
    }

    /// ファイルから読み込み
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read(&mut reader)
    }

    /// バイト列から読み込み
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Self::read(&mut cursor)
    }

    /// リーダーから読み込み
    ///
    /// ヘッダを検証してから全層のパラメータを読む。バージョン不一致・
    /// 構造ハッシュ不一致・途中でのストリーム枯渇・末尾の余りデータは
    /// すべて `InvalidData` 系のエラーになり、部分的に読まれた
    /// ネットワークが返ることはない。
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let header = read_header(reader)?;

        if header.version != NETWORK_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Unknown network version: {:#010x}, expected {NETWORK_VERSION:#010x}",
                    header.version
                ),
            ));
        }

        // 構造ハッシュの照合。パラメータを読む前に行うことで、
        // 構造の合わないファイルを黙って誤読することを防ぐ
        let expected = L::hash_value();
        if header.hash != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Network hash mismatch: file has {:#010x}, compiled chain is {:#010x} ({})",
                    header.hash,
                    expected,
                    L::architecture()
                ),
            ));
        }

        let stack = L::read(reader)?;

        // EOF検証: 余りデータがないことを確認
        // 構造の合わないファイルがたまたまハッシュを通過した場合の保険
        let mut probe = [0u8; 1];
        match reader.read(&mut probe) {
            Ok(0) => {}
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Network file has unexpected trailing data",
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e),
        }

        debug!(
            "[Network Load] hash={:#010x} arch={}",
            header.hash, header.architecture
        );

        let network = Self { stack };

        #[cfg(feature = "diagnostics")]
        network.log_load_diagnostics();

        Ok(network)
    }

    /// 読み込み時の診断ログを出力
    #[cfg(feature = "diagnostics")]
    fn log_load_diagnostics(&self) {
        use log::info;

        let mut stats = Vec::new();
        self.stack.collect_stats(&mut stats);

        for s in &stats {
            info!(
                "[Network Load] {}: weight min={} max={} nonzero={}/{} ({:.2}%), bias [{}, {}]",
                s.layer,
                s.weight_min,
                s.weight_max,
                s.weight_nonzero,
                s.weight_count,
                s.weight_nonzero as f64 / s.weight_count as f64 * 100.0,
                s.bias_min,
                s.bias_max
            );
        }
    }

    /// ライターへ書き出し（`read` の逆操作）
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&NETWORK_VERSION.to_le_bytes())?;
        writer.write_all(&L::hash_value().to_le_bytes())?;

        let arch = L::architecture();
        writer.write_all(&(arch.len() as u32).to_le_bytes())?;
        writer.write_all(arch.as_bytes())?;

        self.stack.write(writer)
    }

    /// 評価を実行
    ///
    /// `features` は抽出済み特徴量バイト列で、長さはチェーン先頭の
    /// パディング済み幅以上、64バイトアライン
    /// （[`Aligned`](crate::aligned::Aligned) 推奨）、値は 0..=127、
    /// 論理次元以降のパディングはゼロであること。
    ///
    /// 割り当ては一切発生せず、処理時間は入力サイズに比例して有界。
    pub fn evaluate<'a>(
        &self,
        features: &'a [u8],
        buffer: &'a mut EvalBuffer,
    ) -> &'a [L::Output] {
        self.stack.propagate(features, buffer.as_mut_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::Aligned;
    use crate::layers::{AffineTransform, ClippedReLU, InputSlice};
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    // 16 → 8 → (ReLU) → 1 の小型チェーン
    type TestStack = AffineTransform<ClippedReLU<AffineTransform<InputSlice<16>, 8>>, 1>;
    type TestNetwork = Network<TestStack>;

    fn random_network(seed: u64) -> TestNetwork {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut network = TestNetwork::zeroed();

        let inner = &mut network.stack.previous.previous;
        for w in inner.weights.iter_mut() {
            *w = rng.random_range(-64i32..=64) as i8;
        }
        for b in inner.biases.iter_mut() {
            *b = rng.random_range(-8_192..=8_192);
        }

        let head = &mut network.stack;
        for w in head.weights.iter_mut() {
            *w = rng.random_range(-64i32..=64) as i8;
        }
        head.biases[0] = rng.random_range(-8_192..=8_192);

        network
    }

    fn random_features(seed: u64) -> Aligned<[u8; 32]> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut features = Aligned([0u8; 32]);
        for v in features.0.iter_mut().take(16) {
            *v = rng.random_range(0..=127u32) as u8;
        }
        features
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let network = random_network(0xAB);

        let mut bytes = Vec::new();
        network.write(&mut bytes).unwrap();
        let reloaded = TestNetwork::from_bytes(&bytes).unwrap();

        assert_eq!(&network.stack.biases, &reloaded.stack.biases);
        assert_eq!(&network.stack.weights[..], &reloaded.stack.weights[..]);
        assert_eq!(
            &network.stack.previous.previous.biases,
            &reloaded.stack.previous.previous.biases
        );
        assert_eq!(
            &network.stack.previous.previous.weights[..],
            &reloaded.stack.previous.previous.weights[..]
        );

        // 評価結果も一致する
        let features = random_features(0xF0);
        let mut buf1 = TestNetwork::new_buffer();
        let mut buf2 = TestNetwork::new_buffer();
        assert_eq!(
            network.evaluate(&features.0, &mut buf1),
            reloaded.evaluate(&features.0, &mut buf2)
        );
    }

    #[test]
    fn test_header_contents() {
        let network = random_network(0xCD);
        let mut bytes = Vec::new();
        network.write(&mut bytes).unwrap();

        let header = read_header(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(header.version, NETWORK_VERSION);
        assert_eq!(header.hash, TestNetwork::hash_value());
        assert_eq!(header.architecture, TestNetwork::architecture());
    }

    #[test]
    fn test_hash_in_file_ignores_parameter_values() {
        // パラメータ値が違ってもヘッダのハッシュは同一
        let a = random_network(1);
        let b = random_network(2);

        let mut bytes_a = Vec::new();
        let mut bytes_b = Vec::new();
        a.write(&mut bytes_a).unwrap();
        b.write(&mut bytes_b).unwrap();

        let ha = read_header(&mut Cursor::new(&bytes_a[..])).unwrap();
        let hb = read_header(&mut Cursor::new(&bytes_b[..])).unwrap();
        assert_eq!(ha.hash, hb.hash);
    }

    #[test]
    fn test_read_rejects_bad_version() {
        let network = random_network(0xEF);
        let mut bytes = Vec::new();
        network.write(&mut bytes).unwrap();
        bytes[0] ^= 0xFF;

        let result = TestNetwork::from_bytes(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_rejects_hash_mismatch() {
        // 形状の違うチェーンで書いたファイルは読めない
        type OtherStack = AffineTransform<ClippedReLU<AffineTransform<InputSlice<16>, 4>>, 1>;
        let other = Network::<OtherStack>::zeroed();
        let mut bytes = Vec::new();
        other.write(&mut bytes).unwrap();

        let result = TestNetwork::from_bytes(&bytes);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_read_rejects_truncated_stream() {
        let network = random_network(0x11);
        let mut bytes = Vec::new();
        network.write(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 7);

        let result = TestNetwork::from_bytes(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_rejects_trailing_data() {
        let network = random_network(0x22);
        let mut bytes = Vec::new();
        network.write(&mut bytes).unwrap();
        bytes.push(0);

        let result = TestNetwork::from_bytes(&bytes);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let network = random_network(0x33);
        let features = random_features(0x44);

        let mut buffer = TestNetwork::new_buffer();
        let first = network.evaluate(&features.0, &mut buffer).to_vec();

        // 同じバッファを再利用しても、新しいバッファでも同じ結果
        for _ in 0..8 {
            assert_eq!(network.evaluate(&features.0, &mut buffer), &first[..]);
        }
        let mut fresh = TestNetwork::new_buffer();
        assert_eq!(network.evaluate(&features.0, &mut fresh), &first[..]);
    }

    #[test]
    fn test_zero_network_outputs_head_bias() {
        // 全重みゼロなら ReLU(バイアス) も噛んだ上で最終バイアスのみ残る
        let mut network = TestNetwork::zeroed();
        network.stack.biases[0] = 777;

        let features = random_features(0x55);
        let mut buffer = TestNetwork::new_buffer();
        let out = network.evaluate(&features.0, &mut buffer);
        assert_eq!(out, &[777]);
    }

    #[test]
    fn test_buffer_size_matches_chain() {
        // 64 (8出力アフィン: 32B→64B) + 64 (ReLU: 8B→64B) + 64 (単出力アフィン)
        assert_eq!(TestNetwork::BUFFER_SIZE, 192);
        assert_eq!(TestNetwork::new_buffer().len(), 192);
        assert_eq!(TestNetwork::INPUT_DIMENSIONS, 16);
        assert_eq!(TestNetwork::OUTPUT_DIMENSIONS, 1);
    }

    #[test]
    fn test_network_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TestNetwork>();
    }
}
