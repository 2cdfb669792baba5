use crate::error::{Error, Result};

/// 计算两个指纹的汉明距离，长度不一致时返回错误
pub fn distance(va: &[u8], vb: &[u8]) -> Result<u32> {
    if va.len() != vb.len() {
        return Err(Error::LengthMismatch { left: va.len(), right: vb.len() });
    }
    if let (Ok(a), Ok(b)) = (<&[u8; 16]>::try_from(va), <&[u8; 16]>::try_from(vb)) {
        return Ok(hamming_128(a, b));
    }
    Ok(va.iter().zip(vb).map(|(a, b)| (a ^ b).count_ones()).sum())
}

#[inline(always)]
pub fn hamming_naive<const N: usize>(va: &[u8; N], vb: &[u8; N]) -> u32 {
    let mut sum = 0;
    for i in 0..N {
        sum += (va[i] ^ vb[i]).count_ones();
    }
    sum
}

/// 16 字节指纹的快速路径
#[inline(always)]
pub fn hamming_128(va: &[u8; 16], vb: &[u8; 16]) -> u32 {
    (u128::from_ne_bytes(*va) ^ u128::from_ne_bytes(*vb)).count_ones()
}
