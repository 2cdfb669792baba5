use anyhow::Result;
use booru_index::cli::SubCommandExtend;
use booru_index::config::{Opts, SubCommand};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::IndexWorker(config) => config.run(&opts).await,
        SubCommand::CrawlWorker(config) => config.run(&opts).await,
        SubCommand::Crawl(config) => config.run(&opts).await,
        SubCommand::Associate(config) => config.run(&opts).await,
        SubCommand::Show(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
        SubCommand::RenameCharacter(config) => config.run(&opts).await,
    }
}
