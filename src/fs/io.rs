//! File objects with text or binary modes
//!
//! Text mode decodes on read through [`DecodingReader`] and encodes on write
//! through [`EncodingWriter`]. Both wrap a plain byte stream, so the same
//! wrappers serve local files and files held by a remote session.

use std::io::{Cursor, Read, Write};
use std::str::FromStr;

use encoding_rs::{CoderResult, Decoder, DecoderResult, Encoder, EncoderResult, Encoding};
use tracing::warn;

use super::FileSystem;
use crate::error::FsError;

const CHUNK_SIZE: usize = 8192;

/// What to do with bytes that cannot be decoded or characters that cannot be encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingErrors {
    #[default]
    Strict,
    Replace,
    Ignore,
}

impl FromStr for EncodingErrors {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(EncodingErrors::Strict),
            "replace" => Ok(EncodingErrors::Replace),
            "ignore" => Ok(EncodingErrors::Ignore),
            other => Err(FsError::InvalidArgument(format!(
                "unknown error handler: {}",
                other
            ))),
        }
    }
}

/// Parsed `open` mode string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub write: bool,
    pub append: bool,
    pub binary: bool,
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (write, append, binary) = match s {
            "r" | "rt" => (false, false, false),
            "rb" => (false, false, true),
            "w" | "wt" => (true, false, false),
            "wb" => (true, false, true),
            "a" | "at" => (true, true, false),
            "ab" => (true, true, true),
            other => {
                return Err(FsError::InvalidArgument(format!(
                    "invalid mode: '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            write,
            append,
            binary,
        })
    }
}

fn lookup_encoding(label: &str) -> Result<&'static Encoding, FsError> {
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| FsError::InvalidArgument(format!("unknown encoding: {}", label)))
}

/// Decode-on-read wrapper around a byte reader
pub struct DecodingReader<R> {
    inner: R,
    decoder: Decoder,
    errors: EncodingErrors,
    finished: bool,
}

impl<R: Read> DecodingReader<R> {
    pub fn new(inner: R, encoding: &'static Encoding, errors: EncodingErrors) -> Self {
        Self {
            inner,
            decoder: encoding.new_decoder(),
            errors,
            finished: false,
        }
    }

    pub fn with_label(inner: R, label: &str, errors: EncodingErrors) -> Result<Self, FsError> {
        Ok(Self::new(inner, lookup_encoding(label)?, errors))
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.decoder.encoding()
    }

    /// Read and decode everything left in the stream
    pub fn read_text(&mut self) -> Result<String, FsError> {
        let mut out = String::new();
        if self.finished {
            return Ok(out);
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                self.decode_chunk(&[], true, &mut out)?;
                self.finished = true;
                return Ok(out);
            }
            self.decode_chunk(&buf[..n], false, &mut out)?;
        }
    }

    fn decode_chunk(&mut self, mut src: &[u8], last: bool, out: &mut String) -> Result<(), FsError> {
        loop {
            match self.errors {
                EncodingErrors::Replace => {
                    let needed = self
                        .decoder
                        .max_utf8_buffer_length(src.len())
                        .unwrap_or(src.len() * 3 + 16);
                    out.reserve(needed);
                    let (result, read, _replaced) = self.decoder.decode_to_string(src, out, last);
                    src = &src[read..];
                    if let CoderResult::InputEmpty = result {
                        return Ok(());
                    }
                }
                EncodingErrors::Strict | EncodingErrors::Ignore => {
                    let needed = self
                        .decoder
                        .max_utf8_buffer_length_without_replacement(src.len())
                        .unwrap_or(src.len() * 3 + 16);
                    out.reserve(needed);
                    let (result, read) =
                        self.decoder
                            .decode_to_string_without_replacement(src, out, last);
                    src = &src[read..];
                    match result {
                        DecoderResult::InputEmpty => return Ok(()),
                        DecoderResult::OutputFull => {}
                        DecoderResult::Malformed(_, _) => {
                            if self.errors == EncodingErrors::Strict {
                                return Err(FsError::InvalidArgument(format!(
                                    "'{}' codec can't decode input",
                                    self.decoder.encoding().name()
                                )));
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encode-on-write wrapper around a byte writer
pub struct EncodingWriter<W: Write> {
    inner: W,
    encoder: Encoder,
    errors: EncodingErrors,
}

impl<W: Write> EncodingWriter<W> {
    pub fn new(inner: W, encoding: &'static Encoding, errors: EncodingErrors) -> Self {
        Self {
            inner,
            encoder: encoding.output_encoding().new_encoder(),
            errors,
        }
    }

    pub fn with_label(inner: W, label: &str, errors: EncodingErrors) -> Result<Self, FsError> {
        Ok(Self::new(inner, lookup_encoding(label)?, errors))
    }

    pub fn write_text(&mut self, text: &str) -> Result<(), FsError> {
        let bytes = self.encode(text, false)?;
        self.inner.write_all(&bytes)?;
        Ok(())
    }

    /// Flush encoder state and the underlying writer
    pub fn finish(&mut self) -> Result<(), FsError> {
        let tail = self.encode("", true)?;
        self.inner.write_all(&tail)?;
        self.inner.flush()?;
        Ok(())
    }

    fn encode(&mut self, mut src: &str, last: bool) -> Result<Vec<u8>, FsError> {
        let mut out = Vec::with_capacity(src.len());
        loop {
            let needed = self
                .encoder
                .max_buffer_length_from_utf8_without_replacement(src.len())
                .unwrap_or(src.len() * 4 + 16);
            out.reserve(needed);
            let (result, read) =
                self.encoder
                    .encode_from_utf8_to_vec_without_replacement(src, &mut out, last);
            src = &src[read..];
            match result {
                EncoderResult::InputEmpty => return Ok(out),
                EncoderResult::OutputFull => {}
                EncoderResult::Unmappable(c) => match self.errors {
                    EncodingErrors::Strict => {
                        return Err(FsError::InvalidArgument(format!(
                            "'{}' codec can't encode character {:?}",
                            self.encoder.encoding().name(),
                            c
                        )))
                    }
                    EncodingErrors::Replace => out.push(b'?'),
                    EncodingErrors::Ignore => {}
                },
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Buffered writer committing to a [`FileSystem`] on flush
pub struct FileWriter<'a> {
    fs: &'a dyn FileSystem,
    path: String,
    buf: Vec<u8>,
}

impl<'a> FileWriter<'a> {
    /// Create (or truncate, unless `append`) the target and return a writer for it
    pub fn create(fs: &'a dyn FileSystem, path: &str, append: bool) -> Result<Self, FsError> {
        fs.write_file(path, &[], append)?;
        Ok(Self {
            fs,
            path: path.to_string(),
            buf: Vec::new(),
        })
    }

    fn commit(&mut self) -> Result<(), FsError> {
        if !self.buf.is_empty() {
            self.fs.write_file(&self.path, &self.buf, true)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl Write for FileWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit().map_err(std::io::Error::other)
    }
}

impl Drop for FileWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            warn!("Failed to write {} on close: {}", self.path, e);
        }
    }
}

/// An open file, in one of four modes
pub enum FileObject<'a> {
    Text(DecodingReader<Cursor<Vec<u8>>>),
    Bytes(Cursor<Vec<u8>>),
    TextWriter(EncodingWriter<FileWriter<'a>>),
    BytesWriter(FileWriter<'a>),
}

impl FileObject<'_> {
    pub fn read_text(&mut self) -> Result<String, FsError> {
        match self {
            FileObject::Text(reader) => reader.read_text(),
            _ => Err(FsError::Unsupported("file not open for reading text".into())),
        }
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, FsError> {
        match self {
            FileObject::Bytes(cursor) => {
                let mut out = Vec::new();
                cursor.read_to_end(&mut out)?;
                Ok(out)
            }
            _ => Err(FsError::Unsupported("file not open for reading bytes".into())),
        }
    }

    pub fn write_text(&mut self, text: &str) -> Result<(), FsError> {
        match self {
            FileObject::TextWriter(writer) => writer.write_text(text),
            _ => Err(FsError::Unsupported("file not open for writing text".into())),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), FsError> {
        match self {
            FileObject::BytesWriter(writer) => {
                writer.write_all(data)?;
                Ok(())
            }
            _ => Err(FsError::Unsupported("file not open for writing bytes".into())),
        }
    }

    /// Flush pending writes, reporting any failure
    pub fn close(self) -> Result<(), FsError> {
        match self {
            FileObject::TextWriter(mut writer) => {
                writer.finish()?;
                writer.into_inner().commit()
            }
            FileObject::BytesWriter(mut writer) => writer.commit(),
            FileObject::Text(_) | FileObject::Bytes(_) => Ok(()),
        }
    }
}

/// Open `path` on `fs` with a python-like mode string (`r`, `rb`, `w`, `wb`, `a`, `ab`)
pub fn open<'a>(
    fs: &'a dyn FileSystem,
    path: &str,
    mode: &str,
    encoding: Option<&str>,
    errors: EncodingErrors,
) -> Result<FileObject<'a>, FsError> {
    let mode: OpenMode = mode.parse()?;
    if mode.binary && encoding.is_some() {
        return Err(FsError::InvalidArgument(
            "binary mode doesn't take an encoding argument".into(),
        ));
    }
    let label = encoding.unwrap_or("utf-8");

    if mode.write {
        let writer = FileWriter::create(fs, path, mode.append)?;
        if mode.binary {
            Ok(FileObject::BytesWriter(writer))
        } else {
            Ok(FileObject::TextWriter(EncodingWriter::with_label(
                writer, label, errors,
            )?))
        }
    } else {
        let data = Cursor::new(fs.read_file(path)?);
        if mode.binary {
            Ok(FileObject::Bytes(data))
        } else {
            Ok(FileObject::Text(DecodingReader::with_label(
                data, label, errors,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;

    #[test]
    fn test_mode_parsing() {
        let mode: OpenMode = "rb".parse().unwrap();
        assert!(mode.binary && !mode.write);
        let mode: OpenMode = "a".parse().unwrap();
        assert!(mode.append && mode.write && !mode.binary);
        assert!("rw+".parse::<OpenMode>().is_err());
    }

    #[test]
    fn test_decoding_reader_latin1() {
        let data = Cursor::new(vec![0x63, 0x61, 0x66, 0xe9]);
        let mut reader = DecodingReader::with_label(data, "latin1", EncodingErrors::Strict).unwrap();
        assert_eq!(reader.read_text().unwrap(), "café");
    }

    #[test]
    fn test_decoding_reader_error_policies() {
        let bad = vec![b'o', b'k', 0xff, b'!'];

        let mut strict =
            DecodingReader::with_label(Cursor::new(bad.clone()), "utf-8", EncodingErrors::Strict)
                .unwrap();
        assert!(matches!(
            strict.read_text(),
            Err(FsError::InvalidArgument(_))
        ));

        let mut replace =
            DecodingReader::with_label(Cursor::new(bad.clone()), "utf-8", EncodingErrors::Replace)
                .unwrap();
        assert_eq!(replace.read_text().unwrap(), "ok\u{fffd}!");

        let mut ignore =
            DecodingReader::with_label(Cursor::new(bad), "utf-8", EncodingErrors::Ignore).unwrap();
        assert_eq!(ignore.read_text().unwrap(), "ok!");
    }

    #[test]
    fn test_encoding_writer_unmappable() {
        let mut strict =
            EncodingWriter::with_label(Vec::new(), "windows-1252", EncodingErrors::Strict).unwrap();
        assert!(strict.write_text("snow ☃").is_err());

        let mut replace =
            EncodingWriter::with_label(Vec::new(), "windows-1252", EncodingErrors::Replace).unwrap();
        replace.write_text("é ☃").unwrap();
        replace.finish().unwrap();
        assert_eq!(replace.into_inner(), vec![0xe9, b' ', b'?']);
    }

    #[test]
    fn test_open_write_then_read_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let path = path.to_str().unwrap();
        let fs = LocalFs::new();

        let mut file = open(&fs, path, "w", Some("latin1"), EncodingErrors::Strict).unwrap();
        file.write_text("naïve").unwrap();
        file.close().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"na\xefve");

        let mut file = open(&fs, path, "a", Some("latin1"), EncodingErrors::Strict).unwrap();
        file.write_text("!").unwrap();
        file.close().unwrap();

        let mut file = open(&fs, path, "r", Some("latin1"), EncodingErrors::Strict).unwrap();
        assert_eq!(file.read_text().unwrap(), "naïve!");
        assert!(file.read_bytes().is_err());
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let fs = LocalFs::new();
        assert!(matches!(
            open(&fs, path.to_str().unwrap(), "rb", None, EncodingErrors::Strict),
            Err(FsError::NotFound(_))
        ));
    }
}
