//! Asset fetching over HTTP.
//!
//! One blocking request per call, body copied into a caller-supplied sink.
//! No retries: any failure is returned as `BaasError::Transport`.

use std::io::Write;
use std::time::Duration;

use baas_shared::constants::server;
use baas_shared::errors::{BaasError, BaasResult};

/// Request/response byte transfer.
pub trait AssetFetch {
    /// Fetch `uri` and write the response body into `sink`.
    ///
    /// Returns the number of body bytes written.
    fn fetch(&self, uri: &str, sink: &mut dyn Write) -> BaasResult<u64>;

    /// Fetch `uri` into memory.
    fn fetch_to_vec(&self, uri: &str) -> BaasResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.fetch(uri, &mut buf)?;
        Ok(buf)
    }
}

impl<T: AssetFetch + ?Sized> AssetFetch for &T {
    fn fetch(&self, uri: &str, sink: &mut dyn Write) -> BaasResult<u64> {
        (**self).fetch(uri, sink)
    }
}

/// HTTP fetch client.
///
/// Built once per pipeline run and dropped when the run ends. `ureq` is
/// blocking and spawns no threads, which keeps the forked worker
/// single-threaded.
pub struct HttpFetcher {
    agent: ureq::Agent,
    origin: String,
}

impl HttpFetcher {
    pub fn new(origin: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            origin: origin.into(),
        }
    }
}

impl AssetFetch for HttpFetcher {
    fn fetch(&self, uri: &str, sink: &mut dyn Write) -> BaasResult<u64> {
        tracing::debug!("GET {}", uri);

        let response = self
            .agent
            .get(uri)
            .set("Origin", &self.origin)
            .set("Type", server::REQUEST_TYPE)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => {
                    BaasError::Transport(format!("GET {} returned HTTP {}", uri, code))
                }
                ureq::Error::Transport(t) => {
                    BaasError::Transport(format!("GET {} failed: {}", uri, t))
                }
            })?;

        let mut body = response.into_reader();
        let written = std::io::copy(&mut body, sink).map_err(|e| {
            BaasError::Transport(format!("Failed to stream body of {}: {}", uri, e))
        })?;
        sink.flush().map_err(|e| {
            BaasError::Transport(format!("Failed to flush body of {}: {}", uri, e))
        })?;

        tracing::debug!("GET {} -> {} bytes", uri, written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serve one request with `status` and `body`, reporting the request headers.
    fn serve_once(
        status: &'static str,
        body: &'static [u8],
    ) -> (String, mpsc::Receiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                headers.push(line);
            }
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
            tx.send(headers).unwrap();
        });

        (format!("http://{}/disk.json", addr), rx)
    }

    #[test]
    fn test_fetch_writes_body_and_sends_standard_headers() {
        let (uri, headers) = serve_once("200 OK", b"{\"Images\": []}");
        let fetcher = HttpFetcher::new("http://localhost:9090", Duration::from_secs(5));

        let body = fetcher.fetch_to_vec(&uri).unwrap();
        assert_eq!(body, b"{\"Images\": []}");

        let headers = headers.recv().unwrap();
        assert!(headers[0].starts_with("GET /disk.json"));
        let lower: Vec<String> = headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        assert!(lower.contains(&"origin: http://localhost:9090".to_string()));
        assert!(lower.contains(&"type: system".to_string()));
    }

    #[test]
    fn test_non_success_status_is_transport_error() {
        let (uri, _headers) = serve_once("404 Not Found", b"missing");
        let fetcher = HttpFetcher::new("http://localhost:9090", Duration::from_secs(5));

        let mut sink = Vec::new();
        let err = fetcher.fetch(&uri, &mut sink).unwrap_err();
        assert!(matches!(err, BaasError::Transport(ref m) if m.contains("404")));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let fetcher = HttpFetcher::new("http://localhost:9090", Duration::from_secs(5));

        let err = fetcher
            .fetch_to_vec(&format!("http://127.0.0.1:{}/disk.json", port))
            .unwrap_err();
        assert!(matches!(err, BaasError::Transport(_)));
    }
}
