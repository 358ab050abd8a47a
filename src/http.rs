//! HTTP/1.x message codec.
//!
//! Covers the framing UPnP needs: SSDP datagrams (HTTP over UDP), the GENA
//! callback listener and the canned responses it writes. Headers keep their
//! first-seen spelling but are looked up case-insensitively. Bodies are
//! framed by `Content-Length` or `Transfer-Encoding: chunked`.

use std::fmt::Write as _;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Upper bound on the head (start line + headers) of a streamed request.
const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Upper bound on a streamed request body.
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            other => Err(Error::Malformed(format!("unsupported version {other:?}"))),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Version::Http10 => write!(f, "HTTP/1.0"),
            Version::Http11 => write!(f, "HTTP/1.1"),
        }
    }
}

/// Ordered header map. Insertion preserves the first-seen name spelling,
/// lookup and replacement fold ASCII case.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in self.iter() {
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (n, v) in iter {
            headers.insert(n, v);
        }
        headers
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parses one complete request out of a buffer (a datagram, typically).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, rest) = split_head(data)?;
        let mut lines = head.lines();
        let start = lines.next().filter(|l| !l.is_empty()).ok_or_else(|| {
            Error::Malformed("missing start line".to_string())
        })?;
        let (method, target, version) = parse_request_line(start)?;
        let headers = parse_header_lines(lines);
        let body = read_framed_body(&headers, rest)?;
        Ok(Self {
            method,
            target,
            version,
            headers,
            body,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = write!(out, "{} {} {}\r\n", self.method, self.target, self.version);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Whether the connection may be reused after this message.
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

impl HttpResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, rest) = split_head(data)?;
        let mut lines = head.lines();
        let start = lines.next().filter(|l| !l.is_empty()).ok_or_else(|| {
            Error::Malformed("missing start line".to_string())
        })?;
        let (version, status, reason) = parse_status_line(start)?;
        let headers = parse_header_lines(lines);
        let body = read_framed_body(&headers, rest)?;
        Ok(Self {
            version,
            status,
            reason,
            headers,
            body,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = write!(out, "{} {} {}\r\n", self.version, self.status, self.reason);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

/// HTTP/1.0 reuses only on an explicit `Connection: keep-alive`; HTTP/1.1
/// reuses unless told `Connection: close`.
pub fn keep_alive(version: Version, headers: &Headers) -> bool {
    let connection = headers.get("Connection");
    match version {
        Version::Http10 => {
            connection.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
        }
        Version::Http11 => !connection.is_some_and(|v| v.eq_ignore_ascii_case("close")),
    }
}

fn split_head(data: &[u8]) -> Result<(&str, &[u8])> {
    let (head, rest) = match find_head_end(data) {
        Some(end) => (&data[..end], &data[end + 4..]),
        // header-only datagrams routinely omit the final blank line
        None => (data, &data[data.len()..]),
    };
    let head = std::str::from_utf8(head)
        .map_err(|_| Error::Malformed("header bytes are not utf-8".to_string()))?;
    Ok((head, rest))
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(line: &str) -> Result<(String, String, Version)> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version))
            if !method.is_empty() && !target.is_empty() =>
        {
            Ok((
                method.to_string(),
                target.to_string(),
                Version::parse(version.trim())?,
            ))
        }
        _ => Err(Error::Malformed(format!("bad request line {line:?}"))),
    }
}

fn parse_status_line(line: &str) -> Result<(Version, u16, String)> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(version), Some(code), Some(reason)) => {
            let version = Version::parse(version.trim())?;
            let status = code
                .parse()
                .map_err(|_| Error::Malformed(format!("bad status code {code:?}")))?;
            Ok((version, status, reason.trim().to_string()))
        }
        _ => Err(Error::Malformed(format!("bad status line {line:?}"))),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Headers {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim(), value.trim());
        }
    }
    headers
}

/// Frames a body already held in memory.
fn read_framed_body(headers: &Headers, rest: &[u8]) -> Result<Vec<u8>> {
    if is_chunked(headers) {
        return match try_decode_chunked(rest)? {
            Chunked::Complete(body) => Ok(body),
            Chunked::Partial => Err(Error::Malformed("unexpected eof in chunked body".to_string())),
        };
    }
    if let Some(len) = content_length(headers)? {
        if rest.len() < len {
            return Err(Error::Malformed(format!(
                "body truncated: have {} of {len} bytes",
                rest.len()
            )));
        }
        return Ok(rest[..len].to_vec());
    }
    Ok(rest.to_vec())
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &Headers) -> Result<Option<usize>> {
    match headers.get("Content-Length") {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Malformed(format!("bad content-length {v:?}"))),
        None => Ok(None),
    }
}

enum Chunked {
    Complete(Vec<u8>),
    Partial,
}

/// Decodes a chunked body from `data`. `Partial` means more bytes are
/// needed; a bad chunk-size line is an error immediately.
fn try_decode_chunked(data: &[u8]) -> Result<Chunked> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = find_crlf(&data[pos..]) else {
            return Ok(Chunked::Partial);
        };
        let line = &data[pos..pos + line_end];
        let line = std::str::from_utf8(line)
            .map_err(|_| Error::Malformed("chunk size is not utf-8".to_string()))?;
        let size_token = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| Error::Malformed(format!("bad chunk size {size_token:?}")))?;
        pos += line_end + 2;
        if size == 0 {
            // optional trailers, terminated by a blank line
            loop {
                let Some(end) = find_crlf(&data[pos..]) else {
                    // tolerate a missing trailer section terminator
                    return Ok(Chunked::Complete(body));
                };
                let trailer = &data[pos..pos + end];
                pos += end + 2;
                if trailer.is_empty() {
                    return Ok(Chunked::Complete(body));
                }
            }
        }
        if data.len() < pos + size + 2 {
            return Ok(Chunked::Partial);
        }
        body.extend_from_slice(&data[pos..pos + size]);
        if &data[pos + size..pos + size + 2] != b"\r\n" {
            return Err(Error::Malformed("chunk not terminated by crlf".to_string()));
        }
        pos += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Reads exactly one request off a stream, honoring Content-Length and
/// chunked framing. Used by the event callback listener.
pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end + 4;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::Malformed("request head too large".to_string()));
        }
        if fill(stream, &mut buf).await? == 0 {
            return Err(Error::Malformed(if buf.is_empty() {
                "missing start line".to_string()
            } else {
                "unexpected eof in request head".to_string()
            }));
        }
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::Malformed("header bytes are not utf-8".to_string()))?;
    let mut lines = head.lines();
    let start = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Malformed("missing start line".to_string()))?;
    let (method, target, version) = parse_request_line(start)?;
    let headers = parse_header_lines(lines);

    let body = if is_chunked(&headers) {
        loop {
            match try_decode_chunked(&buf[head_end..])? {
                Chunked::Complete(body) => break body,
                Chunked::Partial => {
                    if buf.len() > MAX_BODY_SIZE {
                        return Err(Error::Malformed("request body too large".to_string()));
                    }
                    if fill(stream, &mut buf).await? == 0 {
                        return Err(Error::Malformed(
                            "unexpected eof in chunked body".to_string(),
                        ));
                    }
                }
            }
        }
    } else if let Some(len) = content_length(&headers)? {
        if len > MAX_BODY_SIZE {
            return Err(Error::Malformed("request body too large".to_string()));
        }
        while buf.len() - head_end < len {
            if fill(stream, &mut buf).await? == 0 {
                return Err(Error::Malformed("unexpected eof in body".to_string()));
            }
        }
        buf[head_end..head_end + len].to_vec()
    } else {
        Vec::new()
    };

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

async fn fill<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut Vec<u8>) -> Result<usize> {
    let mut chunk = [0u8; 1024];
    let read = stream
        .read(&mut chunk)
        .await
        .map_err(Error::transport)?;
    buf.extend_from_slice(&chunk[..read]);
    Ok(read)
}
