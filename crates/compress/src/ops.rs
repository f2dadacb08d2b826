//! Codec Operations

use crate::Compression;
use crate::error::{ErrorKind, Result};
use bzip2::{Compression as BzCompression, read::BzDecoder, write::BzEncoder};
use exn::ResultExt;
use flate2::{Compression as GzCompression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use tracing::instrument;
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

// Chunks are encoded on the write path of every file channel, so these are
// the libraries' balanced defaults rather than their maximum levels.
const BZIP2_LEVEL: BzCompression = BzCompression::new(6);
const GZIP_LEVEL: GzCompression = GzCompression::new(6);
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

impl Compression {
    /// Encode a chunk payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use cirrus_compress::Compression;
    ///
    /// let encoded = Compression::Gzip.compress(b"chunk payload").unwrap();
    /// assert_eq!(Compression::from_magic_bytes(&encoded), Compression::Gzip);
    /// ```
    #[instrument(level = "trace", skip(input), fields(format = %self, input_size = input.len()))]
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() / 2);
        match self {
            Compression::None => output.extend_from_slice(input),
            Compression::Bzip2 => {
                let mut encoder = BzEncoder::new(&mut output, BZIP2_LEVEL);
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
            },
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(&mut output, GZIP_LEVEL);
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::new(&mut output, ZSTD_LEVEL).or_raise(|| ErrorKind::Encoder)?;
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
            },
        }
        Ok(output)
    }

    /// Decode a chunk payload that is known to be in this format.
    #[instrument(level = "trace", skip(input), fields(format = %self, input_size = input.len()))]
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() * 2);
        self.wrap_reader(input)?.read_to_end(&mut output).or_raise(|| ErrorKind::InvalidData)?;
        Ok(output)
    }

    /// Decode a stored chunk, detecting its codec from the magic bytes.
    ///
    /// ```
    /// use cirrus_compress::Compression;
    ///
    /// let encoded = Compression::Bzip2.compress(b"hello").unwrap();
    /// assert_eq!(Compression::decompress_detect(&encoded).unwrap(), b"hello");
    /// // Unrecognised bytes are passed through untouched.
    /// assert_eq!(Compression::decompress_detect(b"plain").unwrap(), b"plain");
    /// ```
    pub fn decompress_detect(input: &[u8]) -> Result<Vec<u8>> {
        Compression::from_magic_bytes(input).decompress(input)
    }

    /// Wrap a reader with the matching decoding layer.
    pub fn wrap_reader<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
            Compression::Gzip => Box::new(GzDecoder::new(reader)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(reader).or_raise(|| ErrorKind::Encoder)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;
    use std::io::Read;

    #[rstest]
    #[case(Compression::None)]
    #[case(Compression::Bzip2)]
    #[case(Compression::Gzip)]
    #[cfg_attr(feature = "zstd", case(Compression::Zstd))]
    fn test_detect_recovers_payload(#[case] format: Compression) {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = format.compress(&payload).unwrap();
        assert_eq!(Compression::from_magic_bytes(&encoded), format);
        assert_eq!(Compression::decompress_detect(&encoded).unwrap(), payload);
    }

    #[rstest]
    #[case(Compression::Bzip2)]
    #[case(Compression::Gzip)]
    #[cfg_attr(feature = "zstd", case(Compression::Zstd))]
    fn test_invalid_compressed_data(#[case] format: Compression) {
        assert!(format.decompress(b"This is not compressed data").is_err());
    }

    #[test]
    fn test_empty_chunk() {
        let encoded = Compression::Gzip.compress(&[]).unwrap();
        assert!(!encoded.is_empty());
        assert!(Compression::decompress_detect(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_wrap_reader_streams() {
        let encoded = Compression::Gzip.compress(b"streamed chunk").unwrap();
        let mut reader = Compression::Gzip.wrap_reader(encoded.as_slice()).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "streamed chunk");
    }
}
