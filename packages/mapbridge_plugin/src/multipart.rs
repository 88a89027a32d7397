//! Incremental `multipart/form-data` writer.
//!
//! Headers go out when a part begins; the part body is whatever is written
//! through the [`Write`] impl until the next part begins or [`finish`] is
//! called. Nothing is buffered here.
//!
//! [`finish`]: MultipartWriter::finish

use std::io::{self, Write};
use uuid::Uuid;

pub struct MultipartWriter<W> {
    inner: W,
    boundary: String,
    started: bool,
}

impl<W: Write> MultipartWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_boundary(inner, format!("mapbridge-{}", Uuid::new_v4().simple()))
    }

    pub fn with_boundary(inner: W, boundary: impl Into<String>) -> Self {
        Self {
            inner,
            boundary: boundary.into(),
            started: false,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// A complete plain form field.
    pub fn write_field(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        check_header_value(name)?;
        self.delimiter()?;
        write!(
            self.inner,
            "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
            name
        )?;
        self.inner.write_all(value)
    }

    /// Start a file part. Its body follows through `write`.
    pub fn begin_part(&mut self, name: &str, file_name: &str) -> io::Result<()> {
        check_header_value(name)?;
        check_header_value(file_name)?;
        self.delimiter()?;
        write!(
            self.inner,
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            name, file_name
        )
    }

    /// Write the closing boundary and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        if self.started {
            self.inner.write_all(b"\r\n")?;
        }
        write!(self.inner, "--{}--\r\n", self.boundary)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn delimiter(&mut self) -> io::Result<()> {
        if self.started {
            self.inner.write_all(b"\r\n")?;
        }
        self.started = true;
        write!(self.inner, "--{}\r\n", self.boundary)
    }
}

impl<W: Write> Write for MultipartWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn check_header_value(value: &str) -> io::Result<()> {
    if value.contains(['"', '\r', '\n']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported character in part name {:?}", value),
        ));
    }
    Ok(())
}
