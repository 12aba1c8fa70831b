use std::fmt::Write;
use std::ops::Range;

use crate::super_block::get_bits;
use crate::validate::FieldInvalid;

/// Size of the crypt section payload: flags, KDF flags and the key
const CRYPT_PAYLOAD_BYTES: usize = 56;

const KDF_TYPE: Range<u64> = 0..4;
const SCRYPT_N: Range<u64> = 0..16;
const SCRYPT_R: Range<u64> = 16..32;
const SCRYPT_P: Range<u64> = 32..48;

/// The encryption section: KDF parameters and the encrypted key
#[derive(Debug, Clone, Copy)]
pub struct CryptField<'a> {
    buf: &'a [u8],
}

impl<'a> CryptField<'a> {
    /// View a crypt section payload
    pub fn new(buf: &'a [u8]) -> CryptField<'a> {
        CryptField { buf }
    }

    fn word(&self, idx: usize, bits: &Range<u64>) -> u64 {
        if self.buf.len() < (idx + 1) * 8 {
            0
        } else {
            get_bits(self.buf, idx, bits)
        }
    }

    /// Key derivation function, zero is scrypt
    pub fn kdf_type(&self) -> u64 {
        self.word(0, &KDF_TYPE)
    }

    /// log2 of the scrypt N parameter
    pub fn scrypt_n(&self) -> u64 {
        self.word(1, &SCRYPT_N)
    }

    /// scrypt r parameter
    pub fn scrypt_r(&self) -> u64 {
        self.word(1, &SCRYPT_R)
    }

    /// scrypt p parameter
    pub fn scrypt_p(&self) -> u64 {
        self.word(1, &SCRYPT_P)
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), FieldInvalid> {
        if self.buf.len() < CRYPT_PAYLOAD_BYTES {
            return Err(FieldInvalid::WrongSize {
                got: self.buf.len() + 8,
                want: CRYPT_PAYLOAD_BYTES + 8,
            });
        }

        if self.kdf_type() != 0 {
            return Err(FieldInvalid::BadKdfType(self.kdf_type()));
        }

        Ok(())
    }

    pub(crate) fn to_text(&self, out: &mut String) {
        let _ = writeln!(out, "KDF:               {}", self.kdf_type());
        let _ = writeln!(out, "scrypt n:          {}", self.scrypt_n());
        let _ = writeln!(out, "scrypt r:          {}", self.scrypt_r());
        let _ = writeln!(out, "scrypt p:          {}", self.scrypt_p());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_and_kdf() {
        let short = [0u8; 16];
        assert_eq!(
            CryptField::new(&short).validate(),
            Err(FieldInvalid::WrongSize { got: 24, want: 64 })
        );

        let mut buf = [0u8; CRYPT_PAYLOAD_BYTES];
        buf[8] = 14;
        buf[10] = 8;
        buf[12] = 16;
        let f = CryptField::new(&buf);
        assert!(f.validate().is_ok());
        assert_eq!((f.scrypt_n(), f.scrypt_r(), f.scrypt_p()), (14, 8, 16));

        buf[0] = 1;
        assert_eq!(
            CryptField::new(&buf).validate(),
            Err(FieldInvalid::BadKdfType(1))
        );
    }
}
