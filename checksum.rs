use crate::super_block::{sb_offsets, SuperBlock};
use crate::validate::SbInvalid;

/// On-disk checksum types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CsumType {
    /// No checksum
    None = 0,
    /// crc32c, seeded and finalised with all ones
    Crc32cNonzero = 1,
    /// crc64, seeded and finalised with all ones
    Crc64Nonzero = 2,
    /// chacha20/poly1305 with an 80 bit MAC
    Chacha20Poly1305_80 = 3,
    /// chacha20/poly1305 with a 128 bit MAC
    Chacha20Poly1305_128 = 4,
    /// Raw crc32c
    Crc32c = 5,
    /// Raw crc64
    Crc64 = 6,
    /// xxhash
    Xxhash = 7,
}

/// Number of checksum types
pub const CSUM_NR: u64 = 8;

impl CsumType {
    /// Decode a checksum type number
    pub fn from_u64(v: u64) -> Option<CsumType> {
        Some(match v {
            0 => CsumType::None,
            1 => CsumType::Crc32cNonzero,
            2 => CsumType::Crc64Nonzero,
            3 => CsumType::Chacha20Poly1305_80,
            4 => CsumType::Chacha20Poly1305_128,
            5 => CsumType::Crc32c,
            6 => CsumType::Crc64,
            7 => CsumType::Xxhash,
            _ => return None,
        })
    }

    /// Checksum `data` with a zero nonce.
    ///
    /// Only the types usable for superblocks are implemented; the rest
    /// return `None`.
    pub fn checksum(self, data: &[u8]) -> Option<[u8; 16]> {
        let v = match self {
            CsumType::None => 0,
            CsumType::Crc32cNonzero => crc32c::crc32c(data) as u64,
            // crc32c_append pre and post inverts, undo both to get the raw crc
            CsumType::Crc32c => !crc32c::crc32c_append(!0u32, data) as u64,
            _ => return None,
        };
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&v.to_le_bytes());
        Some(out)
    }
}

/// Checksum a whole superblock: everything from the end of the checksum
/// slot to the end of the last field.
pub fn csum_vstruct<T: AsRef<[u8]>>(
    sb: &SuperBlock<T>,
    csum_type: u64,
) -> std::result::Result<[u8; 16], SbInvalid> {
    let ty = CsumType::from_u64(csum_type).ok_or(SbInvalid::CsumTypeUnknown(csum_type))?;
    let end = sb.vstruct_bytes();
    let buf = sb.as_ref();
    if end > buf.len() {
        return Err(SbInvalid::TooBig {
            got: end,
            max: buf.len(),
        });
    }
    ty.checksum(&buf[sb_offsets::CSUM.end..end])
        .ok_or(SbInvalid::CsumTypeUnsupported(csum_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_variants() {
        // standard check value for "123456789"
        let nonzero = CsumType::Crc32cNonzero.checksum(b"123456789").unwrap();
        assert_eq!(&nonzero[..8], &0xe306_9283u64.to_le_bytes());
        assert_eq!(&nonzero[8..], &[0u8; 8]);

        let raw = CsumType::Crc32c.checksum(b"123456789").unwrap();
        assert_ne!(raw, nonzero);
        assert_eq!(CsumType::Crc32c.checksum(b"").unwrap(), [0u8; 16]);
    }

    #[test]
    fn unsupported_types() {
        assert!(CsumType::Crc64.checksum(b"x").is_none());
        assert!(CsumType::from_u64(CSUM_NR).is_none());
        assert_eq!(CsumType::from_u64(5), Some(CsumType::Crc32c));
    }
}
