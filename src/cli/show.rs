use anyhow::Result;
use clap::Parser;
use serde_json::json;

use crate::cli::{SubCommandExtend, connect};
use crate::config::Opts;
use crate::db::RecordStore;
use crate::snowflake;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    /// 图片 ID
    pub img_id: u64,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let (store, _) = connect(opts).await?;
        let records = RecordStore::new(store);

        let record = records.get(self.img_id).await?;
        let aliases = records.aliases(self.img_id).await?;
        let created_at = chrono::DateTime::from_timestamp_millis(snowflake::timestamp_of(self.img_id));

        let mut value = serde_json::to_value(&record)?;
        value["aliases"] = json!(aliases);
        value["created_at"] = json!(created_at.map(|t| t.to_rfc3339()));
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }
}
