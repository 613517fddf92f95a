//! Streaming decompression of downloaded images.
//!
//! The fetcher writes the response body into a sink; wrapping the scratch
//! file in a [`DecodingWriter`] decompresses while downloading, so the
//! compressed image never touches the disk.

use std::io::{self, Write};

use baas_shared::errors::{BaasError, BaasResult};

/// Image compression, from the manifest's `DiskCompressionStrategy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
    Gzip,
}

impl Compression {
    /// Parse a compression strategy. An empty strategy means uncompressed.
    pub fn from_strategy(strategy: &str) -> BaasResult<Self> {
        match strategy.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            "gzip" => Ok(Compression::Gzip),
            other => Err(BaasError::Decode(format!(
                "unknown disk compression strategy '{}'",
                other
            ))),
        }
    }
}

/// Writer that decompresses everything written to it into `W`.
pub enum DecodingWriter<W: Write> {
    Raw(W),
    Zstd(zstd::stream::write::Decoder<'static, W>),
    Gzip(flate2::write::GzDecoder<W>),
}

impl<W: Write> DecodingWriter<W> {
    pub fn new(compression: Compression, inner: W) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => DecodingWriter::Raw(inner),
            Compression::Zstd => DecodingWriter::Zstd(zstd::stream::write::Decoder::new(inner)?),
            Compression::Gzip => DecodingWriter::Gzip(flate2::write::GzDecoder::new(inner)),
        })
    }

    /// Flush remaining decoded bytes and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            DecodingWriter::Raw(mut w) => {
                w.flush()?;
                Ok(w)
            }
            DecodingWriter::Zstd(mut d) => {
                d.flush()?;
                let mut w = d.into_inner();
                w.flush()?;
                Ok(w)
            }
            DecodingWriter::Gzip(d) => {
                let mut w = d.finish()?;
                w.flush()?;
                Ok(w)
            }
        }
    }
}

impl<W: Write> Write for DecodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DecodingWriter::Raw(w) => w.write(buf),
            DecodingWriter::Zstd(d) => d.write(buf),
            DecodingWriter::Gzip(d) => d.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DecodingWriter::Raw(w) => w.flush(),
            DecodingWriter::Zstd(d) => d.flush(),
            DecodingWriter::Gzip(d) => d.flush(),
        }
    }
}
