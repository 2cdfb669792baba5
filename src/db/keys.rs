//! 共享存储中的键布局

pub const IMAGES: &str = "index:images";
pub const CHARACTERS: &str = "index:characters";
pub const AUTHORS: &str = "index:authors";
pub const TAGS_ALL: &str = "index:tags:all";

/// 近似重复索引的桶：(字节偏移, 字节值)
pub fn hash_bucket(offset: usize, value: u8) -> Vec<u8> {
    format!("hash_idx:{:02}:{:02x}", offset, value).into_bytes()
}

/// 指纹到图片 ID 的反向映射，指纹以原始字节拼接
pub fn imhash(fingerprint: &[u8]) -> Vec<u8> {
    let mut key = b"imhash:".to_vec();
    key.extend_from_slice(fingerprint);
    key
}

pub fn image(img_id: u64) -> String {
    format!("index:image:{img_id}")
}

pub fn image_characters(img_id: u64) -> String {
    format!("index:image:{img_id}:characters")
}

pub fn image_authors(img_id: u64) -> String {
    format!("index:image:{img_id}:authors")
}

pub fn image_source_tags(img_id: u64) -> String {
    format!("index:image:{img_id}:source_tags")
}

pub fn image_aliases(img_id: u64) -> String {
    format!("index:image:{img_id}:aliases")
}

pub fn site(site: &str) -> String {
    format!("index:sites:{site}")
}

pub fn site_source_ids(site: &str) -> String {
    format!("index:sites:{site}:source_ids")
}

pub fn rating(rating: &str) -> String {
    format!("index:rating:{rating}")
}

pub fn character(name: &str) -> String {
    format!("index:characters:{name}")
}

pub fn author(name: &str) -> String {
    format!("index:authors:{name}")
}

/// 某站点的标签名集合
pub fn site_tags(site: &str) -> String {
    format!("index:tags:{site}")
}

pub fn site_tag(site: &str, tag: &str) -> String {
    format!("index:tags:{site}:{tag}")
}

pub fn merged_tag(tag: &str) -> String {
    format!("index:tags:merged:{tag}")
}

pub fn merged_site_tag(tag: &str, site: &str) -> String {
    format!("index:tags:merged:{tag}@{site}")
}

pub fn snowflake(group_id: u8, worker_id: u8) -> String {
    format!("last_snowflake:{group_id}:{worker_id}")
}

/// 站点的已关联角色集合
pub fn site_characters(site: &str) -> String {
    format!("{site}:characters")
}

/// 角色在某站点上的搜索标签
pub fn site_character(site: &str, name: &str) -> String {
    format!("{site}:characters:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bucket_format() {
        assert_eq!(hash_bucket(3, 0xab), b"hash_idx:03:ab");
        assert_eq!(hash_bucket(15, 0x01), b"hash_idx:15:01");
    }

    #[test]
    fn test_imhash_key_keeps_raw_bytes() {
        assert_eq!(imhash(&[0x00, 0xff]), b"imhash:\x00\xff");
    }
}
