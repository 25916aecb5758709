//! Single-frame pulls from a remote camera device.
//!
//! The device serves one JPEG per request at `/capture-frame`. Every failure
//! (timeout, refused connection, HTTP error status, empty or oversized body)
//! is reported as `RemoteSource`.

use std::io::Read;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_REMOTE_ADDR: &str = "192.168.1.100:5000";
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
const CAPTURE_PATH: &str = "/capture-frame";
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct RemoteFrame {
    pub bytes: Vec<u8>,
    /// Address as requested, used as the job's origin.
    pub address: String,
}

pub struct RemoteCamera {
    agent: ureq::Agent,
    default_address: String,
    timeout: Duration,
}

impl RemoteCamera {
    pub fn new(default_address: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout(timeout)
            .build();
        Self {
            agent,
            default_address: default_address.into(),
            timeout,
        }
    }

    pub fn default_address(&self) -> &str {
        &self.default_address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch one frame from `address`, or the default address when `None`.
    pub fn fetch_frame(&self, address: Option<&str>) -> Result<RemoteFrame> {
        let address = address
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.default_address)
            .to_string();
        let url = frame_url(&address)?;

        let response = match self.agent.get(url.as_str()).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(Error::RemoteSource(format!(
                    "camera at {} answered HTTP {}",
                    address, code
                )))
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(Error::RemoteSource(format!(
                    "cannot reach camera at {}: {}",
                    address, transport
                )))
            }
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_FRAME_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::RemoteSource(format!("reading frame from {}: {}", address, e)))?;
        if bytes.is_empty() {
            return Err(Error::RemoteSource(format!("camera at {} sent an empty frame", address)));
        }
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(Error::RemoteSource(format!(
                "frame from {} exceeds {} bytes",
                address, MAX_FRAME_BYTES
            )));
        }
        log::debug!("fetched {} bytes from {}", bytes.len(), url);
        Ok(RemoteFrame { bytes, address })
    }
}

impl Default for RemoteCamera {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_ADDR, DEFAULT_REMOTE_TIMEOUT)
    }
}

/// Frame URL for an address given as `host`, `host:port` or a full URL.
pub fn frame_url(address: &str) -> Result<Url> {
    let invalid = |e: url::ParseError| Error::Validation(format!("invalid camera address {:?}: {}", address, e));
    if address.contains("://") {
        let url = Url::parse(address).map_err(invalid)?;
        return match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::Validation(format!(
                "unsupported camera scheme '{}'; expected http(s)",
                other
            ))),
        };
    }
    let url = Url::parse(&format!("http://{}{}", address.trim_end_matches('/'), CAPTURE_PATH))
        .map_err(invalid)?;
    if url.path() != CAPTURE_PATH {
        return Err(Error::Validation(format!(
            "camera address {:?} must be a host or host:port",
            address
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn bare_addresses_get_the_capture_path() {
        assert_eq!(
            frame_url("192.168.1.100").unwrap().as_str(),
            "http://192.168.1.100/capture-frame"
        );
        assert_eq!(
            frame_url("pi.local:5000/").unwrap().as_str(),
            "http://pi.local:5000/capture-frame"
        );
        assert_eq!(
            frame_url("https://cam.example/snap.jpg").unwrap().as_str(),
            "https://cam.example/snap.jpg"
        );
        assert!(frame_url("ftp://cam/x").is_err());
        assert!(frame_url("host/with/path").is_err());
    }

    #[test]
    fn refused_connections_are_remote_errors() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let camera = RemoteCamera::new(format!("127.0.0.1:{}", port), Duration::from_secs(1));
        let err = camera.fetch_frame(None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RemoteSource);
    }

    #[test]
    fn error_statuses_are_remote_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
        });
        let camera = RemoteCamera::default();
        let err = camera.fetch_frame(Some(&addr.to_string())).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RemoteSource);
        assert!(err.to_string().contains("503"));
        server.join().unwrap();
    }

    #[test]
    fn returns_the_frame_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\nConnection: close\r\n\r\nJPEG")
                .unwrap();
            request
        });
        let camera = RemoteCamera::default();
        let frame = camera.fetch_frame(Some(&addr.to_string())).unwrap();
        assert_eq!(frame.bytes, b"JPEG");
        assert_eq!(frame.address, addr.to_string());
        assert!(server.join().unwrap().starts_with("GET /capture-frame "));
    }
}
