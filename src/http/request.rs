use crate::{
    errors::ErrorKind,
    http::types::{self, Header, HeaderMap, Method, Url, Version},
    limits::{MultipartLimits, ReqLimits},
    multipart::{self, stream::Part, MultipartData},
    query::Query,
};
use memchr::{memchr, memchr_iter};
use std::{io, time::Duration};
use tokio::{io::AsyncReadExt, net::TcpStream, time::sleep};

/// High-performance HTTP request representation.
///
/// Borrows from the connection's read buffer; the lifetime `'r` ties every
/// field to the single [`Parser`] buffer that produced it. No field here is
/// ever obtained through an unsafe lifetime extension — see [`Cursor`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request<'r> {
    method: Method,
    url: Url<'r>,
    version: Version,
    headers: HeaderMap<'r>,
    body: Option<&'r [u8]>,
}

impl<'r> Request<'r> {
    #[cfg(test)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Request {
            method: Method::Get,
            url: Url::new(limits),
            version: Version::Http11,
            headers: HeaderMap::new(limits.header_count),
            body: None,
        }
    }
}

// Public API
impl<'r> Request<'r> {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url<'r> {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Returns the value of the `Content-Length` header if present.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// Reports whether the request headers asked for `Transfer-Encoding: chunked`.
    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        self.headers.chunked
    }

    /// Reports whether this request is a WebSocket upgrade request, per
    /// `Connection: Upgrade` + `Upgrade: websocket`.
    #[inline]
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token(b"connection", b"upgrade")
            && self.headers.has_token(b"upgrade", b"websocket")
    }

    /// Returns the request body if present.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    /// Parses the whole body as `multipart/form-data`, buffering every
    /// field and file in memory.
    ///
    /// Fails if the body is missing, the `Content-Type` header is absent
    /// or not `multipart/form-data`, or any of `limits` is exceeded.
    pub fn multipart(&self, limits: &MultipartLimits) -> Result<MultipartData, multipart::Error> {
        let content_type = self.header(b"content-type").ok_or(multipart::Error::MissingBoundary)?;
        let body = self.body().ok_or(multipart::Error::MalformedPart)?;
        multipart::parse(body, content_type, limits)
    }

    /// Parses the whole body as `multipart/form-data`, spilling file parts
    /// to temporary files under `spill_dir` instead of holding them in
    /// memory.
    ///
    /// Useful when a handler expects large file uploads and wants to bound
    /// peak memory use even though the body itself was already buffered
    /// off the wire; see [`multipart::stream::Parser`].
    pub async fn multipart_streaming(
        &self,
        spill_dir: std::path::PathBuf,
        limits: MultipartLimits,
    ) -> Result<Vec<Part>, multipart::Error> {
        let content_type = self.header(b"content-type").ok_or(multipart::Error::MissingBoundary)?;
        let body = self.body().ok_or(multipart::Error::MalformedPart)?;

        let mut parser = multipart::stream::Parser::new(content_type, spill_dir, limits)?;
        parser.feed(body).await
    }
}

/// Outcome of parsing one request off the wire: the parsed view plus how
/// many bytes of the buffer it consumed (headers + body).
#[derive(Debug)]
pub(crate) struct Parsed<'r> {
    pub(crate) request: Request<'r>,
    pub(crate) consumed: usize,
    pub(crate) keep_alive: bool,
    pub(crate) version: Version,
}

/// Parses one HTTP/1.1 or HTTP/1.0 request out of `buf`.
///
/// This is a pure function over an immutable byte slice: every slice handed
/// back in the returned [`Request`] borrows directly from `buf` with the
/// caller-supplied lifetime `'r`, so there is no need to smuggle a `'static`
/// lifetime past the borrow checker the way a fixed, reused buffer would.
#[inline]
pub(crate) fn parse<'r>(buf: &'r [u8], limits: &ReqLimits) -> Result<Parsed<'r>, ErrorKind> {
    let mut c = Cursor::new(buf);

    let method = parse_method(&mut c)?;
    let url = parse_url(&mut c, limits)?;
    let (version, mut keep_alive) = check_version(&mut c)?;

    let mut headers = HeaderMap::new(limits.header_count);
    parse_headers(&mut c, &mut headers, &mut keep_alive, limits)?;

    let (body, consumed) = check_body(&c, &headers)?;

    Ok(Parsed {
        request: Request {
            method,
            url,
            version,
            headers,
            body,
        },
        consumed,
        keep_alive,
        version,
    })
}

// Parse first line

#[inline]
fn parse_method(c: &mut Cursor<'_>) -> Result<Method, ErrorKind> {
    // "OPTIONS " - The longest possible method with a space (8 bytes)
    let slice = c.get_slice(0, 8).ok_or(ErrorKind::InvalidMethod)?;
    let (method, step) = Method::from_bytes(slice)?;
    c.position = step;
    Ok(method)
}

#[inline]
fn parse_url<'r>(c: &mut Cursor<'r>, limits: &ReqLimits) -> Result<Url<'r>, ErrorKind> {
    let posit = c
        .find_char(limits.url_size, b' ')
        .ok_or(ErrorKind::InvalidUrl)?;

    let mut url = Url::new(limits);

    let start = c.position;
    let start_pos = start + posit;
    let slice_url = c
        .buf
        .get(start..start_pos)
        .ok_or(ErrorKind::InvalidUrl)?;

    if slice_url.is_empty() || c.buf[start - 1] != b'/' {
        return Err(ErrorKind::InvalidUrl);
    }

    let mut last = 0;
    for index in memchr_iter(b'/', slice_url) {
        if url.parts.len() == limits.url_parts {
            return Err(ErrorKind::InvalidUrl);
        }

        let slice_part = c
            .get_slice(start + last, index - last)
            .ok_or(ErrorKind::InvalidUrl)?;

        if !slice_part.is_empty() {
            url.parts.push(slice_part);
        }
        last = index + 1;
    }

    let range = [start + last, (posit - last).saturating_sub(1)];
    let (end, url_middle) = match c.find_char(posit, b'?') {
        Some(q_pos) => {
            let slice = c
                .get_slice(q_pos, (range[0] + range[1]).saturating_sub(q_pos))
                .ok_or(ErrorKind::InvalidUrl)?;
            let limit = url.query_parts.capacity();

            Query::parse_into(&mut url.query_parts, slice, limit)?;
            url.query = Some(slice);

            (q_pos, q_pos)
        }
        None => (posit, posit),
    };

    let slice = c
        .get_slice(range[0], (c.position + end).saturating_sub(range[0]))
        .ok_or(ErrorKind::InvalidUrl)?;

    if !slice.is_empty() {
        url.parts.push(slice);
    }

    url.path = c
        .get_slice(c.position, url_middle)
        .ok_or(ErrorKind::InvalidUrl)?;
    url.target = c.get_slice(c.position, posit).ok_or(ErrorKind::InvalidUrl)?;

    c.advance(posit);

    Ok(url)
}

#[inline]
fn check_version(c: &mut Cursor<'_>) -> Result<(Version, bool), ErrorKind> {
    // "HTTP/1.X\r\n" - HTTP version with line break (10 bytes)
    let slice = c.find_slice(10, b'\n').ok_or(ErrorKind::InvalidVersion)?;

    if !matches!(slice.len(), 8 | 9) {
        return Err(ErrorKind::InvalidVersion);
    }

    let (version, keep_alive) = Version::from_bytes(&slice[..8])?;
    c.has_crlf = slice.last() == Some(&b'\r');

    Ok((version, keep_alive))
}

// Parse headers

#[inline]
fn parse_headers<'r>(
    c: &mut Cursor<'r>,
    headers: &mut HeaderMap<'r>,
    keep_alive: &mut bool,
    limits: &ReqLimits,
) -> Result<(), ErrorKind> {
    let mut total_header_bytes = 0usize;

    for _ in 0..=limits.header_count {
        let Some(header) = parse_header(c, limits)? else {
            return Ok(());
        };

        total_header_bytes += header.name.len() + header.value.len() + 4;
        if total_header_bytes > limits.total_headers_size {
            return Err(ErrorKind::TooManyHeaders);
        }

        if !parse_special_header(&header, headers, keep_alive, limits)? {
            headers.headers.push(header);
        }
    }

    Err(ErrorKind::TooManyHeaders)
}

#[inline]
fn parse_header<'r>(c: &mut Cursor<'r>, limits: &ReqLimits) -> Result<Option<Header<'r>>, ErrorKind> {
    let h_line = limits.header_name_size + limits.header_value_size + 4;

    // HeaderName: Someone=data\r\n
    //                            |
    let end = c.find_char(h_line, b'\n').ok_or(ErrorKind::InvalidHeader)?;

    match c.get_slice(c.position + end - 1, 2) {
        Some([b'\r', b'\n']) if c.has_crlf => {}
        Some([_, b'\n']) if !c.has_crlf => {}
        _ => return Err(ErrorKind::InvalidHeader),
    }

    // HeaderName: Someone=data\r\n
    //           |
    let Some(split) = c.find_char(end, b':') else {
        check_end_of_headers(c, end)?;
        return Ok(None);
    };

    if c.get_slice(c.position + split, 2) != Some(b": ") {
        return Err(ErrorKind::InvalidHeader);
    }

    let value_start = split + 2;
    let len_value = end - value_start - c.has_crlf as usize;

    if split > limits.header_name_size || len_value > limits.header_value_size {
        return Err(ErrorKind::InvalidHeader);
    }

    let name = c
        .get_slice(c.position, split)
        .ok_or(ErrorKind::InvalidHeader)?;
    if name.is_empty() {
        return Err(ErrorKind::InvalidHeader);
    }

    let value = c
        .get_slice(c.position + value_start, len_value)
        .ok_or(ErrorKind::InvalidHeader)?;

    c.advance(end);

    Ok(Some(Header::new(name, value)))
}

#[inline]
fn parse_special_header<'r>(
    header: &Header<'r>,
    headers: &mut HeaderMap<'r>,
    keep_alive: &mut bool,
    limits: &ReqLimits,
) -> Result<bool, ErrorKind> {
    if header.name.eq_ignore_ascii_case(b"content-length") {
        parse_content_length(header.value, headers, limits)?;
        return Ok(true);
    }
    if header.name.eq_ignore_ascii_case(b"connection") {
        parse_connection(header.value, keep_alive)?;
        return Ok(true);
    }
    if header.name.eq_ignore_ascii_case(b"transfer-encoding") {
        if header.value.eq_ignore_ascii_case(b"chunked") {
            headers.chunked = true;
        }
        return Ok(true);
    }
    Ok(false)
}

#[inline]
fn check_end_of_headers(c: &mut Cursor<'_>, start: usize) -> Result<(), ErrorKind> {
    // [\r, \n, \r, \n] or [x, x, \n, \n]
    let p_end = c
        .get_slice(c.position + start - 3, 4)
        .ok_or(ErrorKind::InvalidHeader)?;

    if !match c.has_crlf {
        true => p_end.ends_with(b"\r\n\r\n"),
        false => p_end.ends_with(b"\n\n"),
    } {
        return Err(ErrorKind::InvalidHeader);
    }

    c.position += c.has_crlf as usize + 1;

    Ok(())
}

#[inline]
fn parse_content_length(
    value: &[u8],
    headers: &mut HeaderMap<'_>,
    limits: &ReqLimits,
) -> Result<(), ErrorKind> {
    let len = types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
    if len > limits.body_size {
        return Err(ErrorKind::BodyTooLarge);
    }
    headers.content_length = Some(len);
    Ok(())
}

#[inline]
fn parse_connection(value: &[u8], keep_alive: &mut bool) -> Result<(), ErrorKind> {
    if value.eq_ignore_ascii_case(b"keep-alive") {
        *keep_alive = true;
    } else if value.eq_ignore_ascii_case(b"close") {
        *keep_alive = false;
    } else {
        return Err(ErrorKind::InvalidConnection);
    }
    Ok(())
}

// Parse body

/// Decides how much of `c.buf` belongs to this request's body and returns
/// it alongside the total number of bytes (headers + body) consumed.
///
/// `buf` may run past the end of this request: a pipelined next request
/// already sitting in the same read is simply bytes this function never
/// looks at. The caller compacts them out via `Parser::advance(consumed)`.
#[inline]
fn check_body<'r>(
    c: &Cursor<'r>,
    headers: &HeaderMap<'r>,
) -> Result<(Option<&'r [u8]>, usize), ErrorKind> {
    let available = c.buf.len() - c.position;

    if headers.chunked {
        // By the time this pure parse runs, `Parser::dechunk` has already
        // compacted the chunk envelope out of the mutable buffer and scoped
        // `c.buf` to exactly this request, so the whole remainder is body.
        return Ok(match available {
            0 => (None, c.position),
            _ => (c.buf.get(c.position..), c.buf.len()),
        });
    }

    match headers.content_length {
        Some(len) if available < len => Err(ErrorKind::Incomplete),
        // `available >= len` was just established, so this is in bounds.
        Some(len) => Ok((Some(&c.buf[c.position..c.position + len]), c.position + len)),
        // No Content-Length and no chunking means no body at all, per RFC
        // 7230 §3.3.3 — any trailing bytes belong to a pipelined request.
        None => Ok((None, c.position)),
    }
}

// Cursor

/// A read-only scan cursor over one request's bytes.
///
/// `buf` is `&'r [u8]`, so slices handed back by `get_slice`/`find_slice`
/// carry the lifetime of the underlying buffer, not of `&self` — the same
/// "decoupled lifetime" trick `std::str::split` relies on. This is what lets
/// every helper take `&mut self` to advance `position` while still returning
/// slices that outlive the call.
struct Cursor<'r> {
    buf: &'r [u8],
    position: usize,
    has_crlf: bool,
}

impl<'r> Cursor<'r> {
    #[inline(always)]
    fn new(buf: &'r [u8]) -> Self {
        Cursor {
            buf,
            position: 0,
            has_crlf: false,
        }
    }

    #[inline]
    fn find_slice(&mut self, limit: usize, delimiter: u8) -> Option<&'r [u8]> {
        let step = self.find_char(limit, delimiter)?;
        let last_index = self.advance(step);
        self.get_slice(last_index, step)
    }

    #[inline]
    fn find_char(&self, step: usize, delimiter: u8) -> Option<usize> {
        let slice = self.get_slice(self.position, step)?;
        memchr(delimiter, slice)
    }

    #[inline(always)]
    fn get_slice(&self, start: usize, step: usize) -> Option<&'r [u8]> {
        self.buf.get(start..start + step)
    }

    #[inline(always)]
    fn advance(&mut self, step: usize) -> usize {
        let old = self.position;
        self.position += step + 1;
        old
    }
}

// Parser — owns the growable connection-level read buffer.

#[derive(Debug)]
pub(crate) struct Parser {
    buffer: Vec<u8>,
    len: usize,
}

impl Parser {
    #[inline]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Parser {
            buffer: vec![0; limits.precalc.buffer],
            len: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn from<V: AsRef<[u8]>>(limits: &ReqLimits, value: V) -> Self {
        let mut buffer = vec![0; limits.precalc.buffer];
        let value = value.as_ref();
        buffer[0..value.len()].copy_from_slice(value);

        Parser {
            buffer,
            len: value.len(),
        }
    }

    #[inline(always)]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has no room left for another `fill_more` read.
    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.len >= self.buffer.len()
    }

    /// Drops the first `consumed` bytes (one fully-parsed request) and
    /// shifts anything buffered past it — a pipelined next request, most
    /// commonly — down to the front, so the next call to `bytes()` sees it
    /// with no further socket read required.
    #[inline]
    pub(crate) fn advance(&mut self, consumed: usize) {
        let remaining = self.len - consumed;
        if remaining > 0 {
            self.buffer.copy_within(consumed..self.len, 0);
        }
        self.len = remaining;
    }

    /// Reads additional bytes from `stream`, appending past what is already
    /// buffered. Used both for a connection's very first read (into an
    /// empty buffer) and to top up a request whose headers or body didn't
    /// arrive in the first read (and, ahead of dechunking, to pull in the
    /// rest of a chunked body).
    #[inline]
    pub(crate) async fn fill_more(
        &mut self,
        stream: &mut TcpStream,
        time: Duration,
        max_len: usize,
    ) -> Result<usize, io::Error> {
        if self.len >= self.buffer.len() && self.buffer.len() < max_len {
            self.buffer.resize((self.buffer.len() * 2).min(max_len), 0);
        }

        tokio::select! {
            biased;

            read_result = stream.read(&mut self.buffer[self.len..]) => {
                let n = read_result?;
                self.len += n;
                Ok(n)
            }
            _ = sleep(time) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"))
            },
        }
    }

    /// Decodes `Transfer-Encoding: chunked` in place: chunk-size lines and
    /// trailing CRLFs are removed and the chunk payloads are shifted left so
    /// they sit contiguously, mirroring what a Content-Length body would
    /// look like. `body_start` is the offset of the first chunk-size line.
    ///
    /// Returns the offset just past the dechunked body — the slice callers
    /// should hand to [`parse`] for this request. Any bytes that followed
    /// the terminating `0\r\n\r\n` (a pipelined next request) are shifted
    /// along with it, so `self.len()` after this call covers both.
    ///
    /// Returns [`ErrorKind::Incomplete`] rather than [`ErrorKind::InvalidChunk`]
    /// when the buffer simply doesn't hold the whole chunked body yet — the
    /// caller reads more and retries. Dechunking can't be partially undone,
    /// so every error that means "not enough data" is detected during a
    /// read-only scan, before any byte is moved; only once the whole chunk
    /// sequence (through the terminating `0\r\n\r\n`) is confirmed present
    /// does the in-place compaction run.
    pub(crate) fn dechunk(&mut self, body_start: usize, max_body: usize) -> Result<usize, ErrorKind> {
        let mut read_pos = body_start;
        let mut write_pos = body_start;
        let mut body_len = 0usize;
        let mut chunks: Vec<(usize, usize)> = Vec::new();

        let raw_end = loop {
            let Some(line_end) = memchr(b'\n', &self.buffer[read_pos..self.len]).map(|p| read_pos + p) else {
                return Err(ErrorKind::Incomplete);
            };

            let size_line = &self.buffer[read_pos..line_end];
            let size_line = match size_line.split(|&b| b == b';').next() {
                Some(s) => s,
                None => size_line,
            };
            let size_line = trim_cr(size_line);
            let chunk_size = types::slice_to_u64_hex(size_line).ok_or(ErrorKind::InvalidChunk)? as usize;

            read_pos = line_end + 1;

            if chunk_size == 0 {
                // Trailing headers (if any) followed by a final CRLF; we
                // don't surface trailers to handlers, just skip past them.
                loop {
                    let Some(end) = memchr(b'\n', &self.buffer[read_pos..self.len]).map(|p| read_pos + p) else {
                        return Err(ErrorKind::Incomplete);
                    };
                    let blank = trim_cr(&self.buffer[read_pos..end]).is_empty();
                    read_pos = end + 1;
                    if blank {
                        break;
                    }
                }
                break read_pos;
            }

            body_len += chunk_size;
            if body_len > max_body {
                return Err(ErrorKind::BodyTooLarge);
            }
            if read_pos + chunk_size + 2 > self.len {
                return Err(ErrorKind::Incomplete);
            }
            if &self.buffer[read_pos + chunk_size..read_pos + chunk_size + 2] != b"\r\n" {
                return Err(ErrorKind::InvalidChunk);
            }

            chunks.push((read_pos, chunk_size));
            read_pos += chunk_size + 2;
        };

        for (src, len) in chunks {
            self.buffer.copy_within(src..src + len, write_pos);
            write_pos += len;
        }

        let parse_len = write_pos;
        let trailing = self.len - raw_end;
        if trailing > 0 {
            self.buffer.copy_within(raw_end..self.len, write_pos);
        }
        self.len = write_pos + trailing;

        Ok(parse_len)
    }
}

#[inline]
fn trim_cr(bytes: &[u8]) -> &[u8] {
    match bytes.last() {
        Some(b'\r') => &bytes[..bytes.len() - 1],
        _ => bytes,
    }
}

/// Reports whether `buf` holds a full header section (request line through
/// the blank line that ends it), for either CRLF or bare-LF line endings.
/// Run ahead of [`parse`] so the connection loop knows when to stop topping
/// up the buffer and attempt a parse, rather than treating a header split
/// across two reads as a parse error.
#[inline]
pub(crate) fn headers_complete(buf: &[u8]) -> bool {
    memchr::memmem::find(buf, b"\r\n\r\n").is_some() || memchr::memmem::find(buf, b"\n\n").is_some()
}

/// Scans the header section of a not-yet-parsed request for
/// `Transfer-Encoding: chunked`, returning the offset where the chunk-size
/// lines begin if found.
///
/// Run before [`parse`] so [`Parser::dechunk`] can compact the chunk
/// envelope out of the mutable buffer first; `parse` itself only ever sees
/// a body that already looks like a Content-Length body.
pub(crate) fn detect_chunked(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    let mut chunked = false;

    loop {
        let line_end = memchr(b'\n', buf.get(pos..)?)? + pos;
        let line = trim_cr(&buf[pos..line_end]);

        if line.is_empty() {
            return chunked.then_some(line_end + 1);
        }

        if let Some(colon) = memchr(b':', line) {
            let name = &line[..colon];
            let value = types::trim_ascii(&line[colon + 1..]);

            if name.eq_ignore_ascii_case(b"transfer-encoding") && value.eq_ignore_ascii_case(b"chunked") {
                chunked = true;
            }
        }

        pos = line_end + 1;
    }
}

#[cfg(test)]
mod detect_chunked_tests {
    use super::*;

    #[test]
    fn finds_chunked_body_start() {
        let req = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        let start = detect_chunked(req).unwrap();
        assert_eq!(&req[start..], b"4\r\nWiki\r\n0\r\n\r\n");
    }

    #[test]
    fn content_length_request_is_not_chunked() {
        let req = b"POST /up HTTP/1.1\r\nContent-Length: 4\r\n\r\nWiki";
        assert_eq!(detect_chunked(req), None);
    }

    #[test]
    fn incomplete_headers_returns_none() {
        let req = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n";
        assert_eq!(detect_chunked(req), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    fn parsed<'r>(buf: &'r [u8], limits: &ReqLimits) -> Result<Parsed<'r>, ErrorKind> {
        parse(buf, limits)
    }

    #[test]
    fn parse_method_table() {
        #[rustfmt::skip]
        let cases = [
            ("GET /url", Some(Method::Get)),
            ("PUT / HTTP/1.1\r\n\r\n", Some(Method::Put)),
            ("POST / HTTP/1.1\r\n\r\n", Some(Method::Post)),
            ("HEAD / HTTP/1.1\r\n\r\n", Some(Method::Head)),
            ("PATCH / HTTP/1.1\r\n\r\n", Some(Method::Patch)),
            ("DELETE / HTTP/1.1\r\n\r\n", Some(Method::Delete)),
            ("OPTIONS / HTTP/1.1\r\n\r\n", Some(Method::Options)),
            ("CONNECT / HTTP/1.1\r\n\r\n", Some(Method::Connect)),
            ("TRACE / HTTP/1.1\r\n\r\n", Some(Method::Trace)),
            ("PYU / HTTP/1.1\r\n\r\n", None),
        ];

        let limits = ReqLimits::default().precalculate();
        for (req, expected) in cases {
            let result = parsed(req.as_bytes(), &limits);
            match expected {
                Some(method) => assert_eq!(result.unwrap().request.method(), method),
                None => assert_eq!(result.unwrap_err(), ErrorKind::InvalidMethod),
            }
        }
    }

    #[test]
    fn parse_url_segments_and_query() {
        let limits = ReqLimits::default().precalculate();
        let req = b"GET /api/users/123?sort=name&debug HTTP/1.1\r\n\r\n";
        let parsed = parse(req, &limits).unwrap();
        let url = parsed.request.url();

        assert_eq!(str(url.path_segment(0)), Some("api"));
        assert_eq!(str(url.path_segment(1)), Some("users"));
        assert_eq!(str(url.path_segment(2)), Some("123"));
        assert_eq!(str_op(url.path()), "/api/users/123");
        assert_eq!(str(url.query(b"sort")), Some("name"));
        assert_eq!(str(url.query(b"debug")), Some(""));
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let limits = ReqLimits::default().precalculate();
        let req = b"GET /search?q=rust+web&email=a%40b.com HTTP/1.1\r\n\r\n";
        let parsed = parse(req, &limits).unwrap();
        let url = parsed.request.url();

        assert_eq!(str(url.query(b"q")), Some("rust web"));
        assert_eq!(str(url.query(b"email")), Some("a@b.com"));
    }

    #[test]
    fn query_all_returns_every_occurrence_in_order() {
        let limits = ReqLimits::default().precalculate();
        let req = b"GET /tags?tag=a&tag=b&tag=c HTTP/1.1\r\n\r\n";
        let parsed = parse(req, &limits).unwrap();
        let url = parsed.request.url();

        let tags: Vec<&str> = url.query_all(b"tag").map(|v| std::str::from_utf8(v).unwrap()).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_headers_and_body() {
        let limits = ReqLimits::default().precalculate();
        let req = b"POST /upload HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"data\": \"value\"}";
        let parsed = parse(req, &limits).unwrap();

        assert_eq!(
            str(parsed.request.header(b"content-type")),
            Some("application/json")
        );
        assert_eq!(parsed.request.content_length(), Some(17));
        assert_eq!(
            parsed.request.body(),
            Some(b"{\"data\": \"value\"}" as &[u8])
        );
        assert!(parsed.keep_alive);
    }

    #[test]
    fn multipart_parses_fields_and_files_from_the_buffered_body() {
        let limits = ReqLimits::default().precalculate();
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            hello\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\r\n\
            file-bytes\r\n\
            --B--\r\n";
        let mut req = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        req.extend_from_slice(body);

        let parsed = parse(&req, &limits).unwrap();
        let data = parsed.request.multipart(&MultipartLimits::default()).unwrap();

        assert_eq!(data.field("title"), Some(&b"hello"[..]));
        assert_eq!(data.file("upload").unwrap().file_name, "a.txt");
    }

    #[test]
    fn multipart_rejects_a_non_multipart_body() {
        let limits = ReqLimits::default().precalculate();
        let req = b"POST /upload HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        let parsed = parse(req, &limits).unwrap();

        assert_eq!(
            parsed.request.multipart(&MultipartLimits::default()).unwrap_err(),
            multipart::Error::UnsupportedContentType
        );
    }

    #[tokio::test]
    async fn multipart_streaming_spills_a_file_to_disk() {
        let limits = ReqLimits::default().precalculate();
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\r\n\
            file-bytes\r\n\
            --B--\r\n";
        let mut req = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        req.extend_from_slice(body);

        let parsed = parse(&req, &limits).unwrap();
        let parts = parsed
            .request
            .multipart_streaming(std::env::temp_dir(), MultipartLimits::default())
            .await
            .unwrap();

        assert_eq!(parts.len(), 1);
        match &parts[0] {
            Part::File(f) => assert_eq!(std::fs::read(f.path()).unwrap(), b"file-bytes"),
            Part::Field(_) => panic!("expected a file part"),
        }
    }

    #[test]
    fn short_body_is_incomplete_not_an_error() {
        let limits = ReqLimits::default().precalculate();
        let req = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort";
        assert_eq!(parse(req, &limits).unwrap_err(), ErrorKind::Incomplete);
    }

    #[test]
    fn trailing_pipelined_bytes_are_not_consumed_as_body() {
        let limits = ReqLimits::default().precalculate();
        let req = b"GET / HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n";
        let parsed = parse(req, &limits).unwrap();

        assert_eq!(parsed.request.body(), None);
        assert_eq!(&req[parsed.consumed..], b"GET /second HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn content_length_body_stops_before_next_pipelined_request() {
        let limits = ReqLimits::default().precalculate();
        let req = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n\r\n";
        let parsed = parse(req, &limits).unwrap();

        assert_eq!(parsed.request.body(), Some(b"hello" as &[u8]));
        assert_eq!(&req[parsed.consumed..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn connection_close_is_honored() {
        let limits = ReqLimits::default().precalculate();
        let req = b"OPTIONS / HTTP/1.1\r\nCoNNEctIon: close\r\n\r\n";
        let parsed = parse(req, &limits).unwrap();
        assert!(!parsed.keep_alive);
    }

    #[test]
    fn missing_slash_prefix_is_invalid_url() {
        let limits = ReqLimits::default().precalculate();
        assert_eq!(
            parse(b"GET qwe/qwe HTTP/1.1\r\n\r\n", &limits).unwrap_err(),
            ErrorKind::InvalidUrl
        );
    }

    #[test]
    fn dechunk_reassembles_contiguous_body() {
        let limits = ReqLimits::default().precalculate();
        let mut parser = Parser::from(
            &limits,
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        let body_start = parser.bytes().len() - 21;
        let total = parser.dechunk(body_start, limits.body_size).unwrap();
        assert_eq!(&parser.buffer[body_start..total], b"Wikipedia");
    }

    #[test]
    fn dechunk_retains_pipelined_bytes_after_terminator() {
        let limits = ReqLimits::default().precalculate();
        let req = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let mut parser = Parser::from(&limits, req);
        let body_start = detect_chunked(req).unwrap();

        let parse_len = parser.dechunk(body_start, limits.body_size).unwrap();
        assert_eq!(&parser.buffer[body_start..parse_len], b"Wiki");
        assert_eq!(&parser.buffer[parse_len..parser.len()], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn dechunk_reports_incomplete_without_mutating() {
        let limits = ReqLimits::default().precalculate();
        let req = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npe";
        let body_start = detect_chunked(req).unwrap();
        let mut parser = Parser::from(&limits, req);

        assert_eq!(parser.dechunk(body_start, limits.body_size).unwrap_err(), ErrorKind::Incomplete);
        assert_eq!(parser.bytes(), req);
    }

    #[test]
    fn headers_complete_detects_blank_line() {
        assert!(!headers_complete(b"GET / HTTP/1.1\r\nHost: x"));
        assert!(headers_complete(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(headers_complete(b"GET / HTTP/1.1\nHost: x\n\n"));
    }

    #[test]
    fn parser_advance_shifts_pipelined_remainder_to_front() {
        let limits = ReqLimits::default().precalculate();
        let mut parser = Parser::from(&limits, b"GET / HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n");
        let consumed = parse(parser.bytes(), &limits).unwrap().consumed;

        parser.advance(consumed);
        assert_eq!(parser.bytes(), b"GET /two HTTP/1.1\r\n\r\n");
    }
}
