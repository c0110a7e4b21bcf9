use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use bytes::Bytes;

/// Body bytes handed to a storage, tagged with their content type.
pub trait Payload {
    fn content_type(&self) -> Option<&str>;

    /// Copies the whole body into `sink`, returning the number of bytes written.
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<u64>;
}

#[derive(Debug, Clone)]
pub struct BytesPayload {
    bytes: Bytes,
    content_type: Option<String>,
}

impl BytesPayload {
    pub fn new(bytes: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        }
    }
}

impl Payload for BytesPayload {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<u64> {
        sink.write_all(&self.bytes)?;
        Ok(self.bytes.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct FilePayload {
    path: PathBuf,
    content_type: Option<String>,
}

impl FilePayload {
    pub fn new(path: impl Into<PathBuf>, content_type: Option<&str>) -> Self {
        Self {
            path: path.into(),
            content_type: content_type.map(str::to_string),
        }
    }
}

impl Payload for FilePayload {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<u64> {
        let mut file = File::open(&self.path)?;
        io::copy(&mut file, sink)
    }
}

/// Streams a body from any reader; it can be written only once.
pub struct ReaderPayload<R> {
    reader: R,
    content_type: Option<String>,
}

impl<R: Read> ReaderPayload<R> {
    pub fn new(reader: R, content_type: Option<&str>) -> Self {
        Self {
            reader,
            content_type: content_type.map(str::to_string),
        }
    }
}

impl<R: Read> Payload for ReaderPayload<R> {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<u64> {
        io::copy(&mut self.reader, sink)
    }
}
