//! Output and POST-body access handed to a service for each request.

use std::fmt;
use std::io::{self, Write};

use super::record::{self, MAX_CONTENT};

/// Request-scoped I/O.
///
/// Writes are buffered; errors are latched and reported by
/// [`ServiceIo::flush`].
pub trait ServiceIo {
    /// Read up to `buf.len()` bytes of the POST body. Returns `0` at the end.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    fn write(&mut self, data: &[u8]);

    /// Write formatted text; use with `format_args!`.
    fn print(&mut self, args: fmt::Arguments<'_>) {
        match args.as_str() {
            Some(s) => self.write(s.as_bytes()),
            None => self.write(args.to_string().as_bytes()),
        }
    }

    /// Write one header line followed by `\r\n`.
    fn add_header_field(&mut self, field: &str) {
        self.write(field.as_bytes());
        self.write(b"\r\n");
    }

    /// Terminate the header block.
    fn end_header_field(&mut self) {
        self.write(b"\r\n");
    }

    fn flush(&mut self) -> io::Result<()>;
}

fn read_from(source: &[u8], pos: &mut usize, buf: &mut [u8]) -> usize {
    let remaining = &source[(*pos).min(source.len())..];
    let n = remaining.len().min(buf.len());
    buf[..n].copy_from_slice(&remaining[..n]);
    *pos += n;
    n
}

/// [`ServiceIo`] bound to one request on a FastCGI connection.
///
/// Output goes out as `STDOUT` records once a full record's worth is
/// buffered, on [`flush`](ServiceIo::flush), and when the request ends.
pub struct ResponseIo<'a, W: Write> {
    stream: &'a mut W,
    request_id: u16,
    body: &'a [u8],
    read_pos: usize,
    pending: Vec<u8>,
    error: Option<io::Error>,
}

impl<'a, W: Write> ResponseIo<'a, W> {
    pub fn new(stream: &'a mut W, request_id: u16, body: &'a [u8]) -> Self {
        Self {
            stream,
            request_id,
            body,
            read_pos: 0,
            pending: Vec::new(),
            error: None,
        }
    }

    fn send_pending(&mut self) -> io::Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        record::write_stream(&mut *self.stream, record::STDOUT, self.request_id, &self.pending)?;
        self.pending.clear();
        Ok(())
    }

    /// Send remaining output, the empty `STDOUT` terminator and
    /// `END_REQUEST`.
    pub fn finish(mut self) -> io::Result<()> {
        self.send_pending()?;
        record::write_record(&mut *self.stream, record::STDOUT, self.request_id, &[])?;
        record::write_record(
            &mut *self.stream,
            record::END_REQUEST,
            self.request_id,
            &record::end_request_body(0, record::REQUEST_COMPLETE),
        )?;
        self.stream.flush()
    }
}

impl<W: Write> ServiceIo for ResponseIo<'_, W> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        read_from(self.body, &mut self.read_pos, buf)
    }

    fn write(&mut self, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        self.pending.extend_from_slice(data);
        if self.pending.len() >= MAX_CONTENT {
            if let Err(e) = self.send_pending() {
                self.error = Some(e);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending()?;
        self.stream.flush()
    }
}

/// In-memory [`ServiceIo`] for exercising a service without a web server.
#[derive(Debug, Clone, Default)]
pub struct BufferServiceIo {
    post: Vec<u8>,
    read_pos: usize,
    buffer: Vec<u8>,
}

impl BufferServiceIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the POST body returned by [`ServiceIo::read`].
    pub fn set_post_data(&mut self, data: &[u8]) {
        self.post = data.to_vec();
        self.read_pos = 0;
    }

    /// Everything written so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn reset_buffer(&mut self) {
        self.buffer.clear();
    }
}

impl ServiceIo for BufferServiceIo {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        read_from(&self.post, &mut self.read_pos, buf)
    }

    fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
