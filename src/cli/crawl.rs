use clap::Parser;
use log::info;

use crate::cli::{SubCommandExtend, connect};
use crate::config::Opts;
use crate::queue::{Job, JobQueue};
use crate::scraper::SiteRegistry;

#[derive(Parser, Debug, Clone)]
pub struct CrawlCommand {
    /// 图站名称
    pub site: String,
    /// 归一化后的角色名，需要先关联搜索标签
    pub characters: Vec<String>,
}

impl SubCommandExtend for CrawlCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        SiteRegistry::builtin().get(&self.site)?;
        let (_, queue) = connect(opts).await?;

        for character in &self.characters {
            let job = Job::DoIndexingCrawl { site: self.site.clone(), character: character.clone() };
            let id = queue.enqueue(&job).await?;
            info!("已加入爬取任务 {id}: {} {character}", self.site);
        }
        Ok(())
    }
}
