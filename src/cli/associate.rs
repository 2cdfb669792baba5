use clap::Parser;
use log::info;

use crate::cli::{SubCommandExtend, connect};
use crate::config::Opts;
use crate::queue::{Job, JobQueue};
use crate::scraper::{self, SiteRegistry};

#[derive(Parser, Debug, Clone)]
pub struct AssociateCommand {
    /// 图站名称
    pub site: String,
    /// 归一化后的角色名
    pub character: String,
    /// 图站上的搜索标签，gelbooru 可用逗号分隔多个标签
    pub tags: String,
    /// 放入爬虫队列，而不是立即写入
    #[arg(long)]
    pub enqueue: bool,
}

impl SubCommandExtend for AssociateCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let adapter = SiteRegistry::builtin().get(&self.site)?;
        adapter.search_terms(&self.tags)?;
        let (store, queue) = connect(opts).await?;

        if self.enqueue {
            let job = Job::DoAssociateCharacter {
                site: self.site.clone(),
                character: self.character.clone(),
                tags: self.tags.clone(),
            };
            let id = queue.enqueue(&job).await?;
            info!("已加入关联任务 {id}");
        } else {
            scraper::associate_tag(store.as_ref(), adapter.as_ref(), &self.character, &self.tags).await?;
        }
        Ok(())
    }
}
