//! Chunk codecs.
//!
//! Chunks flagged as `compressed` are stored in the local cache (and shipped
//! to drive providers) in encoded form. Which codec was used is not recorded
//! in the metadata store: it is recovered from the stored bytes themselves via
//! [`Compression::from_magic_bytes`], so the configured codec can change
//! without invalidating chunks written under the previous setting.
//!
//! Gzip and Bzip2 are always available; Zstd sits behind the `zstd` feature.

pub mod error;
mod ops;

use crate::error::{Error, ErrorKind};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5A, 0x68];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
#[cfg(feature = "zstd")]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// A supported chunk codec.
///
/// Defaults to [`None`](Self::None) (stored as-is).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Bzip2
    Bzip2,
    /// Gzip (deflate)
    Gzip,
    /// Zstandard
    #[cfg(feature = "zstd")]
    Zstd,
}

impl Compression {
    /// Detect the codec of an encoded chunk from its leading bytes.
    ///
    /// Anything unrecognised (including an empty slice) is treated as
    /// [`None`](Self::None), since an uncompressed chunk can start with
    /// arbitrary bytes.
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            return Compression::Gzip;
        }
        if bytes.starts_with(&BZIP2_MAGIC) {
            return Compression::Bzip2;
        }
        #[cfg(feature = "zstd")]
        if bytes.starts_with(&ZSTD_MAGIC) {
            return Compression::Zstd;
        }
        Compression::None
    }

    /// Short name used in configuration files and log output.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "bz2" | "bzip2" => Ok(Compression::Bzip2),
            "gz" | "gzip" => Ok(Compression::Gzip),
            #[cfg(feature = "zstd")]
            "zst" | "zstd" => Ok(Compression::Zstd),
            #[cfg(not(feature = "zstd"))]
            "zst" | "zstd" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[test]
    fn compression_default() {
        assert_eq!(Compression::default(), Compression::None);
    }

    #[rstest]
    #[case("none", Compression::None)]
    #[case("gzip", Compression::Gzip)]
    #[case("GZ", Compression::Gzip)]
    #[case(" bzip2 ", Compression::Bzip2)]
    #[case("bz2", Compression::Bzip2)]
    #[cfg_attr(feature = "zstd", case("zstd", Compression::Zstd))]
    fn test_from_str(#[case] test: &str, #[case] expected: Compression) {
        assert_eq!(test.parse::<Compression>().unwrap(), expected);
    }

    #[rstest]
    #[case("lz4")]
    #[case("")]
    #[cfg_attr(not(feature = "zstd"), case("zstd"))]
    fn test_from_str_invalid(#[case] test: &str) {
        assert!(test.parse::<Compression>().is_err());
    }

    #[rstest]
    #[case(&[], Compression::None)]
    #[case(&[0x00, 0x01, 0x02], Compression::None)]
    #[case(&[0x1F, 0x8B, 0x08, 0x00], Compression::Gzip)]
    #[case(&[0x42, 0x5A, 0x68, 0x39], Compression::Bzip2)]
    #[cfg_attr(feature = "zstd", case(&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd))]
    fn test_from_magic_bytes(#[case] bytes: &[u8], #[case] expected: Compression) {
        assert_eq!(Compression::from_magic_bytes(bytes), expected);
    }

    #[test]
    fn test_display_matches_parse() {
        for format in [Compression::None, Compression::Gzip, Compression::Bzip2] {
            assert_eq!(format.to_string().parse::<Compression>().unwrap(), format);
        }
    }
}
