//! Fingerprinting of point identities. The flattener groups points by a
//! deterministic byte fingerprint computed over an ordered list of typed
//! values: the aggregation operation, the metric name and the tag pairs.
//! Hash generation is a capability consumed through the `KeyHasher` trait;
//! a seahash-backed implementation ships as the default.

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use seahash;
use std::error;
use std::fmt;
use std::fmt::Write;

/// A typed input to the fingerprint hash. The encoding of each variant is
/// distinct, so `Str("1")` and `I64(1)` can never collide by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum HashParam<'a> {
    /// A string value.
    Str(&'a str),
    /// A signed integer value.
    I64(i64),
    /// An unsigned integer value.
    U64(u64),
    /// A floating point value, hashed by bit pattern.
    F64(f64),
    /// A boolean value.
    Bool(bool),
}

/// Failure to digest a parameter list.
#[derive(Clone, Debug, PartialEq)]
pub enum HashError {
    /// The hasher does not support the given parameter.
    UnsupportedParameter(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HashError::UnsupportedParameter(ref what) => {
                write!(f, "unsupported hash parameter: {}", what)
            }
        }
    }
}

impl error::Error for HashError {
    fn description(&self) -> &str {
        "hash error"
    }
}

/// The hash-generation capability.
///
/// Implementations must be deterministic and order-sensitive over the
/// parameter list: the same parameters in the same order always produce the
/// same bytes, and reordering parameters produces different bytes.
pub trait KeyHasher {
    /// Digest an ordered list of typed values into a byte fingerprint.
    fn digest(&self, params: &[HashParam]) -> Result<Vec<u8>, HashError>;
}

/// The default `KeyHasher`, seahash over a tag-prefixed byte encoding of
/// each parameter. Never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeaKeyHasher;

impl KeyHasher for SeaKeyHasher {
    fn digest(&self, params: &[HashParam]) -> Result<Vec<u8>, HashError> {
        let mut buf: Vec<u8> = Vec::with_capacity(128);
        for param in params {
            // The leading tag byte keeps differently typed parameters from
            // encoding to the same bytes. Strings get a length prefix so
            // adjacent strings cannot bleed into one another.
            match *param {
                HashParam::Str(s) => {
                    buf.push(0x01);
                    buf.write_u64::<LittleEndian>(s.len() as u64).unwrap();
                    buf.extend_from_slice(s.as_bytes());
                }
                HashParam::I64(i) => {
                    buf.push(0x02);
                    buf.write_i64::<LittleEndian>(i).unwrap();
                }
                HashParam::U64(u) => {
                    buf.push(0x03);
                    buf.write_u64::<LittleEndian>(u).unwrap();
                }
                HashParam::F64(v) => {
                    buf.push(0x04);
                    buf.write_u64::<LittleEndian>(v.to_bits()).unwrap();
                }
                HashParam::Bool(b) => {
                    buf.push(0x05);
                    buf.push(b as u8);
                }
            }
        }
        let hash = seahash::hash(&buf);
        let mut out = vec![0; 8];
        BigEndian::write_u64(&mut out, hash);
        Ok(out)
    }
}

/// Hex-encode a digest into the string form used as an aggregation key.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).unwrap();
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    #[test]
    fn digest_is_deterministic() {
        let hasher = SeaKeyHasher;
        let params = [
            HashParam::Str("avg"),
            HashParam::Str("cpu.idle"),
            HashParam::Str("host"),
            HashParam::Str("a1"),
        ];
        let a = hasher.digest(&params).unwrap();
        let b = hasher.digest(&params).unwrap();
        assert_eq!(a, b);
        assert_eq!(8, a.len());
    }

    #[test]
    fn digest_is_order_sensitive() {
        let hasher = SeaKeyHasher;
        let ab = hasher
            .digest(&[HashParam::Str("a"), HashParam::Str("b")])
            .unwrap();
        let ba = hasher
            .digest(&[HashParam::Str("b"), HashParam::Str("a")])
            .unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn typed_params_do_not_collide() {
        let hasher = SeaKeyHasher;
        let s = hasher.digest(&[HashParam::Str("1")]).unwrap();
        let i = hasher.digest(&[HashParam::I64(1)]).unwrap();
        let u = hasher.digest(&[HashParam::U64(1)]).unwrap();
        assert_ne!(s, i);
        assert_ne!(s, u);
        assert_ne!(i, u);
    }

    #[test]
    fn adjacent_strings_do_not_bleed() {
        let hasher = SeaKeyHasher;
        let ab_c = hasher
            .digest(&[HashParam::Str("ab"), HashParam::Str("c")])
            .unwrap();
        let a_bc = hasher
            .digest(&[HashParam::Str("a"), HashParam::Str("bc")])
            .unwrap();
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn hex_digest_round_trips_bytes() {
        assert_eq!("00ff10", hex_digest(&[0x00, 0xff, 0x10]));
    }

    #[test]
    fn single_character_change_changes_digest() {
        fn inner(base: String) -> TestResult {
            let hasher = SeaKeyHasher;
            let mut changed = base.clone();
            changed.push('x');
            let a = hasher.digest(&[HashParam::Str(&base)]).unwrap();
            let b = hasher.digest(&[HashParam::Str(&changed)]).unwrap();
            if a == b {
                return TestResult::failed();
            }
            TestResult::passed()
        }
        QuickCheck::new().quickcheck(inner as fn(String) -> TestResult);
    }
}
