use std::fmt;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::hamming;

pub const HASH_SIZE: u32 = 8;
pub const FINGERPRINT_LEN: usize = 16;

pub type DHash = [u8; 8];
pub type AHash = [u8; 8];

/// 图片感知指纹：8 字节 dHash 后接 8 字节 aHash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_parts(dhash: DHash, ahash: AHash) -> Self {
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes[..8].copy_from_slice(&dhash);
        bytes[8..].copy_from_slice(&ahash);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &Fingerprint) -> u32 {
        hamming::hamming_128(&self.0, &other.0)
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.try_into().map_err(|_| Error::InvalidFingerprint(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Fingerprint::try_from(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}

/// 计算图片的感知指纹
pub fn fingerprint(img: &DynamicImage) -> Fingerprint {
    let gray = img.to_luma8();
    Fingerprint::from_parts(d_hash(&gray), a_hash(&gray))
}

/// 解码图片数据并计算感知指纹
pub fn fingerprint_bytes(data: &[u8]) -> Result<Fingerprint> {
    let img = image::load_from_memory(data)?;
    Ok(fingerprint(&img))
}

/// 差异哈希：缩放到 9x8，每行比较相邻像素
pub fn d_hash(gray: &GrayImage) -> DHash {
    let small = imageops::resize(gray, HASH_SIZE + 1, HASH_SIZE, FilterType::Lanczos3);
    let data = small.as_raw();

    let mut hash = [0; 8];
    for (i, chunk) in data.chunks_exact(HASH_SIZE as usize + 1).enumerate() {
        let mut b = 0;
        for j in 0..HASH_SIZE as usize {
            b <<= 1;
            b |= if chunk[j] < chunk[j + 1] { 1 } else { 0 };
        }
        hash[i] = b;
    }
    hash
}

/// 均值哈希：缩放到 8x8，像素高于均值记为 1
pub fn a_hash(gray: &GrayImage) -> AHash {
    let small = imageops::resize(gray, HASH_SIZE, HASH_SIZE, FilterType::Lanczos3);
    let data = small.as_raw();
    let mean = data.iter().map(|&p| p as f64).sum::<f64>() / data.len() as f64;

    let mut hash = [0; 8];
    for (i, chunk) in data.chunks_exact(HASH_SIZE as usize).enumerate() {
        let mut b = 0;
        for &p in chunk {
            b <<= 1;
            b |= if p as f64 > mean { 1 } else { 0 };
        }
        hash[i] = b;
    }
    hash
}
