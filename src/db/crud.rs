use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info};

use super::model::{PrimaryFields, utf8};
use super::{Guard, IndexedImage, Op, QueuedImage, Store, keys};
use crate::error::{Error, Result};
use crate::{neardup, snowflake};

/// 图片记录及其全部二级索引的读写
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn Store>,
}

impl RecordStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 写入一条记录所需的全部操作
    fn put_ops(image: &IndexedImage) -> Vec<Op> {
        let id = image.img_id.to_string();
        let ts = snowflake::timestamp_of(image.img_id) as f64;
        let site = image.source_site();

        let mut ops = vec![
            Op::sadd(keys::IMAGES, [id.as_str()]),
            Op::del(keys::image(image.img_id)),
            Op::HSet { key: keys::image(image.img_id).into(), fields: PrimaryFields::to_fields(image) },
            Op::del(keys::image_characters(image.img_id)),
            Op::sadd(keys::image_characters(image.img_id), image.characters().iter().map(String::as_str)),
            Op::del(keys::image_authors(image.img_id)),
            Op::sadd(keys::image_authors(image.img_id), image.authors().iter().map(String::as_str)),
            Op::del(keys::image_source_tags(image.img_id)),
            Op::sadd(keys::image_source_tags(image.img_id), image.source_tags().iter().map(String::as_str)),
            Op::sadd(keys::image_aliases(image.img_id), [image.queued.alias()]),
            Op::sadd(keys::site(site), [id.as_str()]),
            Op::sadd(keys::site_source_ids(site), [image.source_id()]),
            Op::sadd(keys::rating(image.sfw_rating().as_str()), [id.as_str()]),
            Op::zadd(keys::CHARACTERS, image.characters().iter().map(|c| (c.as_str(), 0.))),
            Op::zadd(keys::AUTHORS, image.authors().iter().map(|a| (a.as_str(), 0.))),
            Op::zadd(keys::TAGS_ALL, image.source_tags().iter().map(|t| (format!("{t}@{site}"), 0.))),
            Op::zadd(keys::site_tags(site), image.source_tags().iter().map(|t| (t.as_str(), 0.))),
        ];

        for character in image.characters().iter().filter(|c| !c.is_empty()) {
            ops.push(Op::zadd(keys::character(character), [(id.as_str(), ts)]));
        }
        for author in image.authors().iter().filter(|a| !a.is_empty()) {
            ops.push(Op::zadd(keys::author(author), [(id.as_str(), ts)]));
        }
        for tag in image.source_tags().iter().filter(|t| !t.is_empty()) {
            ops.push(Op::zadd(keys::site_tag(site, tag), [(id.as_str(), ts)]));
            ops.push(Op::zadd(keys::merged_site_tag(tag, site), [(id.as_str(), ts)]));
            ops.push(Op::zadd(keys::merged_tag(tag), [(id.as_str(), ts)]));
        }

        ops.extend(neardup::insert_ops(&image.imhash, image.img_id));
        ops
    }

    /// 原子地写入记录及其全部二级索引
    ///
    /// 同一站点的 source_id 已经入库，或相同指纹已属于其他记录时不做任何修改，返回 false
    pub async fn put(&self, image: &IndexedImage) -> Result<bool> {
        let guards = vec![
            Guard::NotMember {
                key: keys::site_source_ids(image.source_site()).into(),
                member: image.source_id().into(),
            },
            Guard::NotExists { key: keys::imhash(image.imhash.as_bytes()) },
        ];
        let written = self.store.exec_guarded(guards, Self::put_ops(image)).await?;
        if written {
            debug!("写入记录 {}", image.img_id);
        } else {
            debug!("{} 已存在，跳过写入", image.queued.alias());
        }
        Ok(written)
    }

    pub async fn get(&self, img_id: u64) -> Result<IndexedImage> {
        let fields = self.store.hgetall(keys::image(img_id).as_bytes()).await?;
        if fields.is_empty() {
            return Err(Error::NotFound(img_id));
        }
        let primary = PrimaryFields::from_fields(fields)?;
        let queued = QueuedImage {
            source_site: primary.source_site,
            source_id: primary.source_id,
            source_url: primary.source_url,
            characters: self.string_set(&keys::image_characters(img_id)).await?,
            sfw_rating: primary.sfw_rating,
            authors: self.string_set(&keys::image_authors(img_id)).await?,
            source_tags: self.string_set(&keys::image_source_tags(img_id)).await?,
        };
        Ok(IndexedImage::new(img_id, primary.imhash, queued))
    }

    /// 记录已入库图片在另一个来源上的别名
    pub async fn mark_duplicate(&self, existing_id: u64, queued: &QueuedImage) -> Result<()> {
        if !self.store.exists(keys::image(existing_id).as_bytes()).await? {
            return Err(Error::NotFound(existing_id));
        }
        let id = existing_id.to_string();
        self.store
            .exec(vec![
                Op::sadd(keys::image_aliases(existing_id), [queued.alias()]),
                Op::sadd(keys::site(&queued.source_site), [id.as_str()]),
                Op::sadd(keys::site_source_ids(&queued.source_site), [queued.source_id.as_str()]),
            ])
            .await
    }

    pub async fn aliases(&self, img_id: u64) -> Result<BTreeSet<String>> {
        self.string_set(&keys::image_aliases(img_id)).await
    }

    /// 该来源是否已经入库或被记录为重复
    pub async fn is_known_source(&self, site: &str, source_id: &str) -> Result<bool> {
        self.store.sismember(keys::site_source_ids(site).as_bytes(), source_id.as_bytes()).await
    }

    /// 角色的所有图片，按入库时间升序
    pub async fn character_images(&self, name: &str) -> Result<Vec<u64>> {
        let items = self.store.zrange_withscores(keys::character(name).as_bytes()).await?;
        items.into_iter().map(|(member, _)| parse_id(member)).collect()
    }

    /// 将角色 from 的所有图片合并到 to 名下，返回受影响的图片数量
    pub async fn rename_character(&self, from: &str, to: &str) -> Result<usize> {
        if from == to {
            return Ok(0);
        }
        let items = self.store.zrange_withscores(keys::character(from).as_bytes()).await?;
        if items.is_empty() {
            return Ok(0);
        }

        let mut ops = vec![
            Op::zadd(keys::character(to), items.iter().map(|(m, s)| (m.clone(), *s))),
            Op::del(keys::character(from)),
            Op::zrem(keys::CHARACTERS, [from]),
            Op::zadd(keys::CHARACTERS, [(to, 0.)]),
        ];
        for (member, _) in &items {
            let img_id = parse_id(member.clone())?;
            ops.push(Op::srem(keys::image_characters(img_id), [from]));
            ops.push(Op::sadd(keys::image_characters(img_id), [to]));
        }
        self.store.exec(ops).await?;

        info!("角色 {from} 已合并到 {to}，共 {} 张图片", items.len());
        Ok(items.len())
    }

    async fn string_set(&self, key: &str) -> Result<BTreeSet<String>> {
        self.store.smembers(key.as_bytes()).await?.into_iter().map(utf8).collect()
    }
}

fn parse_id(member: Vec<u8>) -> Result<u64> {
    let s = utf8(member)?;
    s.parse().map_err(|_| Error::Malformed(format!("image id {s:?}")))
}
