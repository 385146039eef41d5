//! テスト用パラメータファイルを生成するツール
//!
//! コンパイル済みエイリアスのいずれかを、ゼロ重みまたは
//! シード付き乱数重みで書き出す。丸ごと読み戻せることが
//! ベンチマークや結合テストの前提になる。

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rnnue_core::aliases::{Network512, Network1024};
use rnnue_core::{AffineTransform, Layer};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Arch {
    /// 512 → 32 → 32 → 1
    Stack512,
    /// 1024 → 8 → 32 → 1
    Stack1024,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "テスト用パラメータファイルを生成する")]
struct Cli {
    /// 出力先ファイル
    out: PathBuf,

    /// アーキテクチャ
    #[arg(long, value_enum, default_value_t = Arch::Stack512)]
    arch: Arch,

    /// 乱数シード（未指定ならゼロ重みで出力）
    #[arg(long)]
    seed: Option<u64>,
}

/// アフィン層の重み・バイアスを乱数で埋める
///
/// 値域は量子化契約の範囲内（重み ±64、バイアス ±8192）に抑え、
/// 生成したネットワークがそのまま評価に使えるようにする。
fn randomize_affine<P: Layer<Output = u8>, const N: usize>(
    layer: &mut AffineTransform<P, N>,
    rng: &mut ChaCha8Rng,
) {
    for w in layer.weights.iter_mut() {
        *w = rng.random_range(-64i32..=64) as i8;
    }
    for b in layer.biases.iter_mut() {
        *b = rng.random_range(-8_192..=8_192);
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (bytes, hash) = match cli.arch {
        Arch::Stack512 => {
            let mut network = Network512::zeroed();
            if let Some(seed) = cli.seed {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                randomize_affine(&mut network.stack.previous.previous.previous.previous, &mut rng);
                randomize_affine(&mut network.stack.previous.previous, &mut rng);
                randomize_affine(&mut network.stack, &mut rng);
            }
            let mut bytes = Vec::new();
            network.write(&mut bytes)?;
            (bytes, Network512::hash_value())
        }
        Arch::Stack1024 => {
            let mut network = Network1024::zeroed();
            if let Some(seed) = cli.seed {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                randomize_affine(&mut network.stack.previous.previous.previous.previous, &mut rng);
                randomize_affine(&mut network.stack.previous.previous, &mut rng);
                randomize_affine(&mut network.stack, &mut rng);
            }
            let mut bytes = Vec::new();
            network.write(&mut bytes)?;
            (bytes, Network1024::hash_value())
        }
    };

    std::fs::write(&cli.out, &bytes)
        .with_context(|| format!("failed to write {}", cli.out.display()))?;

    println!(
        "wrote {} ({} bytes, hash {hash:#010x})",
        cli.out.display(),
        bytes.len()
    );

    Ok(())
}
