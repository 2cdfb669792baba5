use clap::Parser;

use crate::cli::{SubCommandExtend, connect};
use crate::config::Opts;
use crate::db::RecordStore;

#[derive(Parser, Debug, Clone)]
pub struct RenameCharacterCommand {
    /// 原角色名
    pub from: String,
    /// 新角色名，已存在时合并
    pub to: String,
}

impl SubCommandExtend for RenameCharacterCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let (store, _) = connect(opts).await?;
        let count = RecordStore::new(store).rename_character(&self.from, &self.to).await?;
        println!("{count}");
        Ok(())
    }
}
