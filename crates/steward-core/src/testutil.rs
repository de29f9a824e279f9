//! In-process HTTP stub for exercising the request layer.
//!
//! Serves scripted responses over a real socket so the client under test
//! runs its actual reqwest stack, redirects included. Connections are
//! handled serially, which keeps the hit log in request order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) struct StubServer {
    pub addr: SocketAddr,
    hits: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    /// Spawn a listener on an ephemeral port. `respond` maps
    /// `(method, target, nth-repeat-of-this-line)` to a delay in
    /// milliseconds and a complete HTTP response.
    pub async fn spawn<F>(respond: F) -> Self
    where
        F: Fn(&str, &str, usize) -> (u64, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let Some((method, target)) = read_request(&mut sock).await else {
                    continue;
                };
                let nth = {
                    let mut log = log.lock();
                    let line = format!("{method} {target}");
                    let nth = log.iter().filter(|h| **h == line).count();
                    log.push(line);
                    nth
                };
                let (delay_ms, response) = respond(&method, &target, nth);
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        Self { addr, hits }
    }

    /// How many times an exact `"METHOD target"` line was requested.
    pub fn count(&self, line: &str) -> usize {
        self.hits.lock().iter().filter(|h| *h == line).count()
    }
}

/// A 200 response carrying `body`.
pub(crate) fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// A 302 redirect to `location`.
pub(crate) fn redirect(location: &str) -> String {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\n\
         Content-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

/// Read one request off the socket, draining any body so the peer never
/// sees a reset mid-write. Returns the request line's method and target.
async fn read_request(sock: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = sock.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let content_length = head
            .lines()
            .skip(1)
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        let mut body_len = buf.len() - head_end - 4;
        while body_len < content_length {
            let n = sock.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body_len += n;
        }

        let mut parts = head.lines().next()?.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        return Some((method, target));
    }
}
