//! Blocking network helpers used by the supervisor thread.
//!
//! Never call these from inside a tokio runtime: the HTTP client is the
//! blocking `reqwest` flavor.

use crate::backoff::{retry_until, Backoff};
use crate::errors::{Result, StreamError};
use bytes::Bytes;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Whether something accepts TCP connections on `host:port`.
pub fn port_open(host: &str, port: u16) -> bool {
    match resolve(host, port) {
        Some(addr) => TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok(),
        None => false,
    }
}

pub fn wait_for_port(host: &str, port: u16, backoff: &mut Backoff, max_tries: u32) -> Result<()> {
    retry_until(backoff, max_tries, &format!("{}:{} never opened", host, port), || {
        port_open(host, port)
    })
}

pub fn wait_for_port_to_close(host: &str, port: u16, backoff: &mut Backoff, max_tries: u32) -> Result<()> {
    retry_until(backoff, max_tries, &format!("{}:{} still open", host, port), || {
        !port_open(host, port)
    })
}

fn client() -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder().timeout(HTTP_TIMEOUT).build()?)
}

/// Ask a media server to stop.
pub fn post_shutdown(base_url: &str) -> Result<()> {
    let url = format!("{}/shutdown", base_url.trim_end_matches('/'));
    let response = client()?.post(&url).send()?;
    if !response.status().is_success() {
        return Err(StreamError::Http(format!("{} returned {}", url, response.status())));
    }
    Ok(())
}

/// GET an image, failing on non-success status or an empty body.
pub fn fetch_jpeg(url: &str) -> Result<Bytes> {
    let response = client()?.get(url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(StreamError::Http(format!("{} returned {}", url, status)));
    }
    let body = response.bytes()?;
    if body.is_empty() {
        return Err(StreamError::StaleDataTimeout(format!("{} returned no data", url)));
    }
    Ok(body)
}
