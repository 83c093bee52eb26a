//! `multipart/form-data` parsing, buffered and streaming-with-disk-spill.

use crate::limits::MultipartLimits;
use memchr::memchr;
use std::{error, fmt};

#[derive(Debug, PartialEq)]
pub enum Error {
    MissingBoundary,
    MalformedPart,
    TooManyFiles,
    FileTooLarge,
    BodyTooLarge,
    UnsupportedContentType,
    Io,
}

impl error::Error for Error {}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Io
    }
}

/// A single non-file form field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: Vec<u8>,
}

/// A single uploaded file, held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub field_name: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// The fully-parsed contents of a buffered `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultipartData {
    pub fields: Vec<Field>,
    pub files: Vec<FileUpload>,
}

impl MultipartData {
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.value.as_slice())
    }

    pub fn file(&self, field_name: &str) -> Option<&FileUpload> {
        self.files.iter().find(|f| f.field_name == field_name)
    }
}

/// Extracts the `boundary=...` parameter from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &[u8]) -> Result<Vec<u8>, Error> {
    let content_type = std::str::from_utf8(content_type).map_err(|_| Error::MissingBoundary)?;

    if !content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
        return Err(Error::UnsupportedContentType);
    }

    content_type
        .split(';')
        .skip(1)
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"').as_bytes().to_vec())
        .ok_or(Error::MissingBoundary)
}

/// Parses a complete `multipart/form-data` body held entirely in memory.
///
/// For large uploads, prefer [`stream::Parser`] to bound peak memory use.
pub fn parse(body: &[u8], content_type: &[u8], limits: &MultipartLimits) -> Result<MultipartData, Error> {
    if body.len() as u64 > limits.max_multipart_size {
        return Err(Error::BodyTooLarge);
    }

    let boundary = boundary_from_content_type(content_type)?;
    let delimiter = {
        let mut d = Vec::with_capacity(boundary.len() + 2);
        d.extend_from_slice(b"--");
        d.extend_from_slice(&boundary);
        d
    };

    let mut data = MultipartData::default();
    let mut pos = find(body, &delimiter, 0).ok_or(Error::MalformedPart)? + delimiter.len();

    loop {
        if body.get(pos..pos + 2) == Some(b"--") {
            break;
        }
        pos = skip_crlf(body, pos);

        let header_end = find(body, b"\r\n\r\n", pos).ok_or(Error::MalformedPart)?;
        let headers = &body[pos..header_end];
        let body_start = header_end + 4;

        let next_delim = find(body, &delimiter, body_start).ok_or(Error::MalformedPart)?;
        let part_end = trim_trailing_crlf(body, next_delim);
        let part_body = &body[body_start..part_end];

        let (field_name, file_name, content_type) = parse_part_headers(headers)?;

        match file_name {
            Some(file_name) => {
                if data.files.len() >= limits.max_file_count {
                    return Err(Error::TooManyFiles);
                }
                if part_body.len() as u64 > limits.max_file_size {
                    return Err(Error::FileTooLarge);
                }
                if let Some(allowed) = &limits.allowed_content_types {
                    let ct = content_type.as_deref().unwrap_or("");
                    if !allowed.iter().any(|a| a == ct) {
                        return Err(Error::UnsupportedContentType);
                    }
                }

                data.files.push(FileUpload {
                    field_name,
                    file_name,
                    content_type,
                    data: part_body.to_vec(),
                });
            }
            None => data.fields.push(Field {
                name: field_name,
                value: part_body.to_vec(),
            }),
        }

        pos = next_delim + delimiter.len();
    }

    Ok(data)
}

fn parse_part_headers(headers: &[u8]) -> Result<(String, Option<String>, Option<String>), Error> {
    let mut field_name = None;
    let mut file_name = None;
    let mut content_type = None;

    for line in headers.split(|&b| b == b'\n') {
        let line = crate::http::types::trim_ascii(line);
        let Some(colon) = memchr(b':', line) else { continue };
        let name = &line[..colon];
        let value = crate::http::types::trim_ascii(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"content-disposition") {
            let value = std::str::from_utf8(value).map_err(|_| Error::MalformedPart)?;
            field_name = extract_quoted_param(value, "name=").map(str::to_owned);
            file_name = extract_filename_star(value)
                .or_else(|| extract_quoted_param(value, "filename=").map(str::to_owned));
        } else if name.eq_ignore_ascii_case(b"content-type") {
            content_type = std::str::from_utf8(value).ok().map(str::to_owned);
        }
    }

    Ok((field_name.ok_or(Error::MalformedPart)?, file_name, content_type))
}

fn extract_quoted_param<'a>(header: &'a str, prefix: &str) -> Option<&'a str> {
    let start = header.find(prefix)? + prefix.len();
    let rest = &header[start..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Extracts `filename*=charset'lang'percent-encoded` per RFC 2231, used by
/// clients to send non-ASCII filenames instead of the plain `filename=` form.
fn extract_filename_star(header: &str) -> Option<String> {
    let start = header.find("filename*=")? + "filename*=".len();
    let rest = header[start..].split(';').next().unwrap_or("").trim();

    let mut parts = rest.splitn(3, '\'');
    let _charset = parts.next()?;
    let _lang = parts.next()?;
    let encoded = parts.next()?;

    Some(percent_decode(encoded))
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn skip_crlf(body: &[u8], pos: usize) -> usize {
    if body.get(pos..pos + 2) == Some(b"\r\n") {
        pos + 2
    } else {
        pos
    }
}

fn trim_trailing_crlf(body: &[u8], end: usize) -> usize {
    if end >= 2 && &body[end - 2..end] == b"\r\n" {
        end - 2
    } else {
        end
    }
}

/// Streaming parser with temp-file spill for large file parts, modeled on
/// [`HttpConnection`](crate::server::connection::HttpConnection)'s
/// loop-with-enum-state shape: bytes are fed in as they arrive, and a
/// boundary match is the only thing that ever completes a part.
pub mod stream {
    use super::{find, parse_part_headers, Error, Field};
    use crate::limits::MultipartLimits;
    use std::path::{Path, PathBuf};
    use tokio::{
        fs::File,
        io::{AsyncWriteExt, BufWriter},
    };

    #[derive(Clone, Copy, PartialEq)]
    enum StateKind {
        SeekingBoundary,
        AfterDelimiter,
        ReadingHeaders,
        ReadingBody,
        Done,
    }

    enum State {
        /// Looking for the opening `--boundary` at the start of the body.
        SeekingBoundary,
        /// Just consumed a boundary line; the next two bytes decide whether
        /// this is the closing `--` or a normal part starts.
        AfterDelimiter,
        /// Accumulating the `\r\n\r\n`-terminated header block of one part.
        ReadingHeaders,
        /// Accumulating (or spilling) one part's body until the next boundary.
        ReadingBody {
            field_name: String,
            file_name: Option<String>,
            content_type: Option<String>,
            field_value: Vec<u8>,
            file: Option<(PathBuf, BufWriter<File>, u64)>,
        },
        Done,
    }

    impl State {
        fn kind(&self) -> StateKind {
            match self {
                State::SeekingBoundary => StateKind::SeekingBoundary,
                State::AfterDelimiter => StateKind::AfterDelimiter,
                State::ReadingHeaders => StateKind::ReadingHeaders,
                State::ReadingBody { .. } => StateKind::ReadingBody,
                State::Done => StateKind::Done,
            }
        }
    }

    /// One part completed while feeding a streamed multipart body.
    #[derive(Debug)]
    pub enum Part {
        Field(Field),
        File(StreamingFileUpload),
    }

    /// One streamed file part, with its data spilled to a temp file that
    /// is removed when this value is dropped. The file is already flushed
    /// and closed for writing by the time a caller sees this — open it for
    /// reading via [`StreamingFileUpload::path`] whenever convenient.
    #[derive(Debug)]
    pub struct StreamingFileUpload {
        pub field_name: String,
        pub file_name: String,
        pub content_type: Option<String>,
        pub size: u64,
        path: PathBuf,
    }

    impl StreamingFileUpload {
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for StreamingFileUpload {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Drives a `multipart/form-data` body to disk part-by-part, bounding
    /// peak memory to roughly one boundary's worth of slack regardless of
    /// how large an individual file part is.
    pub struct Parser {
        state: State,
        opening_delimiter: Vec<u8>,
        body_delimiter: Vec<u8>,
        buf: Vec<u8>,
        bytes_seen: u64,
        files_emitted: usize,
        spill_dir: PathBuf,
        limits: MultipartLimits,
    }

    impl Parser {
        pub fn new(content_type: &[u8], spill_dir: PathBuf, limits: MultipartLimits) -> Result<Self, Error> {
            let boundary = super::boundary_from_content_type(content_type)?;

            let mut opening_delimiter = Vec::with_capacity(boundary.len() + 2);
            opening_delimiter.extend_from_slice(b"--");
            opening_delimiter.extend_from_slice(&boundary);

            let mut body_delimiter = Vec::with_capacity(boundary.len() + 4);
            body_delimiter.extend_from_slice(b"\r\n--");
            body_delimiter.extend_from_slice(&boundary);

            Ok(Self {
                state: State::SeekingBoundary,
                opening_delimiter,
                body_delimiter,
                buf: Vec::new(),
                bytes_seen: 0,
                files_emitted: 0,
                spill_dir,
                limits,
            })
        }

        pub fn is_done(&self) -> bool {
            self.state.kind() == StateKind::Done
        }

        /// Feeds one chunk of the request body. Returns every part that
        /// became complete as a result — usually zero or one, but a chunk
        /// containing several small fields can complete more than one.
        pub async fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Part>, Error> {
            self.bytes_seen += chunk.len() as u64;
            if self.bytes_seen > self.limits.max_multipart_size {
                return Err(Error::BodyTooLarge);
            }
            self.buf.extend_from_slice(chunk);

            let mut parts = Vec::new();
            loop {
                match self.state.kind() {
                    StateKind::Done => break,

                    StateKind::SeekingBoundary => {
                        let Some(pos) = find(&self.buf, &self.opening_delimiter, 0) else { break };
                        self.buf.drain(..pos + self.opening_delimiter.len());
                        self.state = State::AfterDelimiter;
                    }

                    StateKind::AfterDelimiter => {
                        let Some(next_two) = self.buf.get(..2) else { break };
                        if next_two == b"--" {
                            self.buf.drain(..2);
                            self.state = State::Done;
                        } else if next_two == b"\r\n" {
                            self.buf.drain(..2);
                            self.state = State::ReadingHeaders;
                        } else {
                            return Err(Error::MalformedPart);
                        }
                    }

                    StateKind::ReadingHeaders => {
                        let Some(header_end) = find(&self.buf, b"\r\n\r\n", 0) else { break };
                        let (field_name, file_name, content_type) = parse_part_headers(&self.buf[..header_end])?;
                        self.buf.drain(..header_end + 4);

                        let file = match &file_name {
                            Some(_) => {
                                if self.files_emitted >= self.limits.max_file_count {
                                    return Err(Error::TooManyFiles);
                                }
                                if let Some(allowed) = &self.limits.allowed_content_types {
                                    let ct = content_type.as_deref().unwrap_or("");
                                    if !allowed.iter().any(|a| a == ct) {
                                        return Err(Error::UnsupportedContentType);
                                    }
                                }

                                let path = self.spill_dir.join(format!("multipart-{:x}", rand::random::<u64>()));
                                let writer = BufWriter::new(File::create(&path).await?);
                                Some((path, writer, 0u64))
                            }
                            None => None,
                        };

                        self.state = State::ReadingBody {
                            field_name,
                            file_name,
                            content_type,
                            field_value: Vec::new(),
                            file,
                        };
                    }

                    StateKind::ReadingBody => {
                        match find(&self.buf, &self.body_delimiter, 0) {
                            Some(pos) => {
                                let tail: Vec<u8> = self.buf.drain(..pos).collect();
                                self.buf.drain(..self.body_delimiter.len());
                                let part = self.finish_part(&tail).await?;
                                parts.push(part);
                                self.state = State::AfterDelimiter;
                            }
                            None => {
                                // Flush everything except a delimiter-sized
                                // tail, in case the delimiter straddles the
                                // boundary between this chunk and the next.
                                let keep = self.body_delimiter.len().saturating_sub(1).min(self.buf.len());
                                let flush_len = self.buf.len() - keep;
                                if flush_len == 0 {
                                    break;
                                }
                                let flushed: Vec<u8> = self.buf.drain(..flush_len).collect();
                                self.accumulate(&flushed).await?;
                                break;
                            }
                        }
                    }
                }
            }

            Ok(parts)
        }

        /// Writes (or buffers) bytes belonging to the part currently being read.
        async fn accumulate(&mut self, bytes: &[u8]) -> Result<(), Error> {
            let State::ReadingBody { file, field_value, .. } = &mut self.state else {
                unreachable!("accumulate only called while reading a part's body")
            };

            match file {
                Some((_, writer, written)) => {
                    *written += bytes.len() as u64;
                    if *written > self.limits.max_file_size {
                        return Err(Error::FileTooLarge);
                    }
                    writer.write_all(bytes).await?;
                }
                None => field_value.extend_from_slice(bytes),
            }
            Ok(())
        }

        /// Appends the final slice of a completed part's body, then closes
        /// it out into a [`Part`].
        async fn finish_part(&mut self, tail: &[u8]) -> Result<Part, Error> {
            self.accumulate(tail).await?;

            let State::ReadingBody { field_name, file_name, content_type, field_value, file } =
                std::mem::replace(&mut self.state, State::Done)
            else {
                unreachable!("finish_part only called while reading a part's body")
            };

            match (file_name, file) {
                (Some(file_name), Some((path, mut writer, written))) => {
                    writer.flush().await?;
                    self.files_emitted += 1;
                    Ok(Part::File(StreamingFileUpload {
                        field_name,
                        file_name,
                        content_type,
                        size: written,
                        path,
                    }))
                }
                _ => Ok(Part::Field(Field { name: field_name, value: field_value })),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn spill_dir() -> PathBuf {
            std::env::temp_dir()
        }

        fn unwrap_file(part: Part) -> StreamingFileUpload {
            match part {
                Part::File(f) => f,
                Part::Field(_) => panic!("expected a file, got a field"),
            }
        }

        #[tokio::test]
        async fn parses_a_field_and_a_file_fed_in_one_chunk() {
            let body = b"--B\r\n\
                Content-Disposition: form-data; name=\"title\"\r\n\r\n\
                hello\r\n\
                --B\r\n\
                Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
                Content-Type: text/plain\r\n\r\n\
                file-bytes\r\n\
                --B--\r\n";

            let mut parser =
                Parser::new(b"multipart/form-data; boundary=B", spill_dir(), MultipartLimits::default()).unwrap();
            let parts = parser.feed(body).await.unwrap();

            assert!(parser.is_done());
            assert_eq!(parts.len(), 2);

            let field = unwrap_field_from(&parts, 0);
            assert_eq!(field.name, "title");
            assert_eq!(field.value, b"hello");

            let file = unwrap_file_from(parts, 1);
            assert_eq!(file.field_name, "upload");
            assert_eq!(file.file_name, "a.txt");
            assert_eq!(file.size, 10);
            let contents = std::fs::read(file.path()).unwrap();
            assert_eq!(contents, b"file-bytes");
        }

        fn unwrap_field_from(parts: &[Part], idx: usize) -> &Field {
            match &parts[idx] {
                Part::Field(f) => f,
                Part::File(_) => panic!("expected a field, got a file"),
            }
        }

        fn unwrap_file_from(parts: Vec<Part>, idx: usize) -> StreamingFileUpload {
            let mut parts = parts;
            unwrap_file(parts.remove(idx))
        }

        #[tokio::test]
        async fn delimiter_split_across_two_feeds_is_still_recognized() {
            let whole = b"--B\r\n\
                Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\r\n\
                file-bytes\r\n\
                --B--\r\n";

            // Split right in the middle of the closing `\r\n--B--` delimiter.
            let split_at = whole.len() - 3;
            let (first, second) = whole.split_at(split_at);

            let mut parser =
                Parser::new(b"multipart/form-data; boundary=B", spill_dir(), MultipartLimits::default()).unwrap();
            let mut parts = parser.feed(first).await.unwrap();
            assert!(parts.is_empty());
            assert!(!parser.is_done());

            parts.extend(parser.feed(second).await.unwrap());

            assert!(parser.is_done());
            assert_eq!(parts.len(), 1);
            let file = unwrap_file(parts.remove(0));
            let contents = std::fs::read(file.path()).unwrap();
            assert_eq!(contents, b"file-bytes");
        }

        #[tokio::test]
        async fn dropping_a_streaming_file_upload_deletes_its_temp_file() {
            let body = b"--B\r\n\
                Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\r\n\
                file-bytes\r\n\
                --B--\r\n";

            let mut parser =
                Parser::new(b"multipart/form-data; boundary=B", spill_dir(), MultipartLimits::default()).unwrap();
            let file = unwrap_file(parser.feed(body).await.unwrap().remove(0));
            let path = file.path().to_path_buf();
            assert!(path.exists());
            drop(file);
            assert!(!path.exists());
        }

        #[test]
        fn rejects_unsupported_content_type() {
            let parser = Parser::new(b"application/json", spill_dir(), MultipartLimits::default());
            assert!(matches!(parser, Err(Error::UnsupportedContentType)));
        }

        #[tokio::test]
        async fn enforces_file_size_limit() {
            let body = b"--B\r\n\
                Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\r\n\
                file-bytes\r\n\
                --B--\r\n";

            let mut limits = MultipartLimits::default();
            limits.max_file_size = 3;
            let mut parser = Parser::new(b"multipart/form-data; boundary=B", spill_dir(), limits).unwrap();
            assert_eq!(parser.feed(body).await.unwrap_err(), Error::FileTooLarge);
        }

        #[tokio::test]
        async fn enforces_body_size_limit_while_streaming() {
            let mut limits = MultipartLimits::default();
            limits.max_multipart_size = 4;
            let body = b"--B\r\nmore bytes than the limit allows";

            let mut parser = Parser::new(b"multipart/form-data; boundary=B", spill_dir(), limits).unwrap();
            assert_eq!(parser.feed(body).await.unwrap_err(), Error::BodyTooLarge);
        }

        #[tokio::test]
        async fn enforces_file_count_limit() {
            let body = b"--B\r\n\
                Content-Disposition: form-data; name=\"a\"; filename=\"a.txt\"\r\n\r\n\
                x\r\n\
                --B\r\n\
                Content-Disposition: form-data; name=\"b\"; filename=\"b.txt\"\r\n\r\n\
                y\r\n\
                --B--\r\n";

            let mut limits = MultipartLimits::default();
            limits.max_file_count = 1;
            let mut parser = Parser::new(b"multipart/form-data; boundary=B", spill_dir(), limits).unwrap();
            assert_eq!(parser.feed(body).await.unwrap_err(), Error::TooManyFiles);
        }

        #[tokio::test]
        async fn malformed_part_without_content_disposition_name_is_rejected() {
            let body = b"--B\r\nX-Custom: 1\r\n\r\nvalue\r\n--B--\r\n";

            let mut parser =
                Parser::new(b"multipart/form-data; boundary=B", spill_dir(), MultipartLimits::default()).unwrap();
            assert_eq!(parser.feed(body).await.unwrap_err(), Error::MalformedPart);
        }
    }
}
