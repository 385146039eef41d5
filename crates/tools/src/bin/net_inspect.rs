//! パラメータファイルのヘッダと重み統計を表示するツール
//!
//! 構造ハッシュがコンパイル済みエイリアスに一致する場合は
//! 全体を読み込み、層ごとの重み統計も出力する。

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rnnue_core::aliases::{Network512, Network1024};
use rnnue_core::{Layer, LayerStats, NetworkHeader, read_header};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(author, version, about = "パラメータファイルのヘッダと重み統計を表示する")]
struct Cli {
    /// 対象のパラメータファイル
    file: PathBuf,

    /// JSON で出力する
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    header: NetworkHeader,
    layers: Vec<LayerStats>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let file = File::open(&cli.file)
        .with_context(|| format!("failed to open {}", cli.file.display()))?;
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader).context("failed to read network header")?;

    let layers = if header.hash == Network512::hash_value() {
        let network = Network512::load(&cli.file)
            .with_context(|| format!("failed to load {}", cli.file.display()))?;
        let mut stats = Vec::new();
        network.stack.collect_stats(&mut stats);
        stats
    } else if header.hash == Network1024::hash_value() {
        let network = Network1024::load(&cli.file)
            .with_context(|| format!("failed to load {}", cli.file.display()))?;
        let mut stats = Vec::new();
        network.stack.collect_stats(&mut stats);
        stats
    } else {
        log::warn!(
            "unknown architecture hash {:#010x}, skipping layer stats",
            header.hash
        );
        Vec::new()
    };

    let report = Report { header, layers };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("version:      {:#010x}", report.header.version);
    println!("hash:         {:#010x}", report.header.hash);
    println!("architecture: {}", report.header.architecture);
    for s in &report.layers {
        println!(
            "{}: weight min={} max={} nonzero={}/{} ({:.2}%), bias [{}, {}]",
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

    Ok(())
}
