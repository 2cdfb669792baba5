use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;
use serde::Serialize;
use tokio::task::block_in_place;

use crate::cli::{SubCommandExtend, connect};
use crate::config::Opts;
use crate::imhash::{self, Fingerprint};
use crate::neardup::NearDupIndex;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 汉明距离小于该值的图片视为近似
    #[arg(long, value_name = "N", default_value_t = 24, value_parser = clap::value_parser!(u32).range(1..=128))]
    pub threshold: u32,
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    pub count: usize,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct SearchHit {
    distance: u32,
    img_id: Option<u64>,
    imhash: Fingerprint,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let fp = block_in_place(|| -> Result<Fingerprint> {
            let img = image::open(&self.image)?;
            Ok(imhash::fingerprint(&img))
        })?;
        debug!("imhash: {fp}");

        let (store, _) = connect(opts).await?;
        let index = NearDupIndex::new(store);

        let mut hits = vec![];
        for neighbor in index.search(fp.as_bytes(), self.threshold).await?.into_iter().take(self.count) {
            let img_id = index.lookup(&neighbor.fingerprint).await?;
            hits.push(SearchHit { distance: neighbor.distance, img_id, imhash: neighbor.fingerprint });
        }

        print_result(&hits, self)
    }
}

fn print_result(result: &[SearchHit], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for hit in result {
                let img_id = hit.img_id.map_or_else(|| "-".to_string(), |id| id.to_string());
                println!("{}\t{}\t{}", hit.distance, img_id, hit.imhash);
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
