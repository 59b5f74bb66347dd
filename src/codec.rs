//! Streaming compression layered over the raw tar byte stream.
//!
//! Five abstract levels are mapped to codec-specific levels so callers never
//! deal with gzip's 1-9 scale or LZ4's frame levels directly. The write side
//! must be `finish()`ed before the underlying sink is closed so trailers and
//! frame ends are flushed; the raw sink itself stays with the caller.

use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::options::{Algorithm, Level};

/// A byte sink optionally wrapped in a compressor.
pub enum CodecWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Lz4(lz4::Encoder<W>),
}

impl<W: Write> CodecWriter<W> {
    pub fn new(sink: W, algorithm: Algorithm, level: Level) -> io::Result<Self> {
        match algorithm {
            Algorithm::None => Ok(CodecWriter::Plain(sink)),
            Algorithm::Gzip => Ok(CodecWriter::Gzip(GzEncoder::new(sink, gzip_level(level)))),
            Algorithm::Lz4 => {
                // Block checksums stay off; the frame's content checksum is
                // enough for a streaming archive.
                let encoder = lz4::EncoderBuilder::new()
                    .level(lz4_level(level))
                    .build(sink)?;
                Ok(CodecWriter::Lz4(encoder))
            }
        }
    }

    /// Flushes all codec framing and returns the underlying sink. Must be
    /// called exactly once, before the sink is closed.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CodecWriter::Plain(mut sink) => {
                sink.flush()?;
                Ok(sink)
            }
            CodecWriter::Gzip(encoder) => encoder.finish(),
            CodecWriter::Lz4(encoder) => {
                let (sink, result) = encoder.finish();
                result?;
                Ok(sink)
            }
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::Plain(w) => w.write(buf),
            CodecWriter::Gzip(w) => w.write(buf),
            CodecWriter::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::Plain(w) => w.flush(),
            CodecWriter::Gzip(w) => w.flush(),
            CodecWriter::Lz4(w) => w.flush(),
        }
    }
}

/// A byte source optionally wrapped in a decompressor.
pub enum CodecReader<R: Read> {
    Plain(R),
    Gzip(MultiGzDecoder<R>),
    Lz4(lz4::Decoder<R>),
}

impl<R: Read> CodecReader<R> {
    pub fn new(source: R, algorithm: Algorithm) -> io::Result<Self> {
        match algorithm {
            Algorithm::None => Ok(CodecReader::Plain(source)),
            Algorithm::Gzip => Ok(CodecReader::Gzip(MultiGzDecoder::new(source))),
            Algorithm::Lz4 => Ok(CodecReader::Lz4(lz4::Decoder::new(source)?)),
        }
    }
}

impl<R: Read> Read for CodecReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CodecReader::Plain(r) => r.read(buf),
            CodecReader::Gzip(r) => r.read(buf),
            CodecReader::Lz4(r) => r.read(buf),
        }
    }
}

fn gzip_level(level: Level) -> Compression {
    match level {
        Level::Fastest => Compression::new(1),
        Level::Fast => Compression::new(3),
        Level::Default => Compression::default(),
        Level::Good => Compression::new(7),
        Level::Best => Compression::new(9),
    }
}

fn lz4_level(level: Level) -> u32 {
    match level {
        // Frame level 0 is LZ4's fast path.
        Level::Fastest | Level::Fast | Level::Default => 0,
        Level::Good => 5,
        Level::Best => 9,
    }
}
