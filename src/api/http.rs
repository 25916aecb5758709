//! Minimal blocking HTTP/1.1 wire handling: request parsing, responses and
//! `multipart/form-data` bodies.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{anyhow, Result};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }
}

/// Failures while reading a request, each answered with its own status.
#[derive(Debug)]
pub(crate) enum ReadError {
    Malformed(String),
    TooLarge(usize),
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::Io(err)
    }
}

pub(crate) fn read_request(stream: &mut TcpStream, max_body: usize) -> Result<HttpRequest, ReadError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed("connection closed before headers".into()));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(ReadError::Malformed("request headers too large".into()));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ReadError::Malformed("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ReadError::Malformed("missing method".into()))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| ReadError::Malformed("missing path".into()))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ReadError::Malformed("invalid content-length".into()))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(ReadError::TooLarge(content_length));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed("body shorter than content-length".into()));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query,
        headers,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

pub(crate) fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

pub(crate) fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Cache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
        status = status,
        reason = reason_phrase(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Parse a `multipart/form-data` body given the request's content type.
pub(crate) fn parse_multipart(content_type: &str, body: &[u8]) -> Result<Vec<MultipartPart>> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .filter(|b| !b.is_empty())
        .ok_or_else(|| anyhow!("multipart body without boundary"))?;
    let delimiter = format!("--{}", boundary).into_bytes();

    let mut parts = Vec::new();
    let mut rest = match find(body, &delimiter) {
        Some(pos) => &body[pos + delimiter.len()..],
        None => return Err(anyhow!("multipart boundary not found")),
    };
    loop {
        if rest.starts_with(b"--") {
            break;
        }
        let rest_after_crlf = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| anyhow!("malformed multipart delimiter"))?;
        let next = find(rest_after_crlf, &delimiter)
            .ok_or_else(|| anyhow!("unterminated multipart part"))?;
        let section = &rest_after_crlf[..next];
        let section = section.strip_suffix(b"\r\n").unwrap_or(section);
        parts.push(parse_part(section)?);
        rest = &rest_after_crlf[next + delimiter.len()..];
    }
    Ok(parts)
}

fn parse_part(section: &[u8]) -> Result<MultipartPart> {
    let split = find(section, b"\r\n\r\n").ok_or_else(|| anyhow!("multipart part without headers"))?;
    let head = String::from_utf8_lossy(&section[..split]);
    let mut name = None;
    let mut filename = None;
    for line in head.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        for param in value.split(';').map(str::trim) {
            if let Some(v) = param.strip_prefix("name=") {
                name = Some(v.trim_matches('"').to_string());
            } else if let Some(v) = param.strip_prefix("filename=") {
                filename = Some(v.trim_matches('"').to_string());
            }
        }
    }
    Ok(MultipartPart {
        name: name.ok_or_else(|| anyhow!("multipart part without a name"))?,
        filename,
        data: section[split + 4..].to_vec(),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
