use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Sequential, line-oriented access to a text file, regardless of whether it
/// is stored plain or gzip-compressed.
pub trait TextSource: Send {
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>>;

    fn line_number(&self) -> usize;
}

struct LineSource<R: BufRead + Send> {
    reader: R,
    line: Vec<u8>,
    line_active: bool,
    line_number: usize,
}

impl<R: BufRead + Send> LineSource<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(1024),
            line_active: false,
            line_number: 0,
        }
    }
}

impl<R: BufRead + Send> TextSource for LineSource<R> {
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>> {
        if self.line_active {
            self.line.clear();
            self.line_active = false;
        }

        let bytes_read = self.reader.read_until(b'\n', &mut self.line)?;
        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        self.line_number += 1;
        self.line_active = true;
        Ok(Some(&self.line))
    }

    fn line_number(&self) -> usize {
        self.line_number
    }
}

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Opens a text file for line-by-line reading, transparently decompressing
/// `.gz` files.
pub fn open_text_source(path: &Path) -> io::Result<Box<dyn TextSource>> {
    let file = File::open(path).map_err(|e| with_path_context(e, "opening", path))?;
    if is_gzip_path(path) {
        let decoder: Box<dyn Read + Send> = Box::new(MultiGzDecoder::new(file));
        Ok(Box::new(LineSource::new(BufReader::new(decoder))))
    } else {
        Ok(Box::new(LineSource::new(BufReader::new(file))))
    }
}

/// Buffered output that is either plain or gzip-compressed. Dropping a sink
/// discards errors; call [`TextSink::finish`] to flush the buffer, write the
/// gzip trailer and surface any failure.
pub enum TextSink<W: Write = File> {
    Plain(BufWriter<W>),
    Gzip(BufWriter<GzEncoder<W>>),
}

impl<W: Write> TextSink<W> {
    pub fn plain(inner: W) -> Self {
        Self::Plain(BufWriter::new(inner))
    }

    pub fn gzip(inner: W) -> Self {
        Self::Gzip(BufWriter::new(GzEncoder::new(inner, Compression::default())))
    }

    pub fn finish(self) -> io::Result<W> {
        let mut inner = match self {
            Self::Plain(writer) => writer.into_inner().map_err(|e| e.into_error())?,
            Self::Gzip(writer) => writer.into_inner().map_err(|e| e.into_error())?.finish()?,
        };
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for TextSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Gzip(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Gzip(writer) => writer.flush(),
        }
    }
}

/// Creates a buffered writer for `path`, gzip-compressing when the path ends
/// in `.gz`.
pub fn create_text_sink(path: &Path) -> io::Result<TextSink> {
    let file = File::create(path).map_err(|e| with_path_context(e, "creating", path))?;
    if is_gzip_path(path) {
        Ok(TextSink::gzip(file))
    } else {
        Ok(TextSink::plain(file))
    }
}

fn with_path_context(err: io::Error, action: &str, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{action} {}: {err}", path.display()))
}
