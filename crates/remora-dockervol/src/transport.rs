use crate::error::{DockervolError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header;
use hyper::Method;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, error};

const MAX_RETRIES: u64 = 3;

/// JSON request/response client over a local unix socket.
///
/// Each call dials a fresh connection, mirroring how the docker
/// plugin protocol is spoken (one request per connection, no
/// keep-alive assumptions about the peer).
pub struct SocketClient {
    path: PathBuf,
    timeout: Duration,
}

impl SocketClient {
    pub fn new(path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Issue `method` against `uri_path` with an optional JSON
    /// payload, decoding the JSON response body.
    ///
    /// Transport failures are retried with linear back-off (1, 2, 3
    /// seconds); a response with a non-2xx status is a transport
    /// failure and is not retried.
    pub async fn do_json<P, R>(&self, method: Method, uri_path: &str, payload: Option<&P>) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = match payload {
            Some(p) => serde_json::to_vec(p)
                .map_err(|e| DockervolError::transport(format!("failed to encode request: {}", e)))?,
            None => Vec::new(),
        };
        debug!(
            "request: action={} path={} payload={}",
            method,
            uri_path,
            String::from_utf8_lossy(&body)
        );

        let response = self.send_with_retry(&method, uri_path, body).await?;
        let (status, bytes) = response;

        if status != hyper::StatusCode::OK && status != hyper::StatusCode::CREATED {
            error!(
                "status code was {} for request: action={} path={}",
                status, method, uri_path
            );
            return Err(DockervolError::transport(format!(
                "status code was {} for request: action={} path={}: {}",
                status,
                method,
                uri_path,
                String::from_utf8_lossy(&bytes)
            )));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            DockervolError::transport(format!(
                "unable to decode response from action={} path={}: {}",
                method, uri_path, e
            ))
        })
    }

    async fn send_with_retry(
        &self,
        method: &Method,
        uri_path: &str,
        body: Vec<u8>,
    ) -> Result<(hyper::StatusCode, Bytes)> {
        let mut try_number = 0;
        loop {
            match self.send_once(method, uri_path, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if try_number < MAX_RETRIES => {
                    try_number += 1;
                    debug!(
                        "transport failure on try {} for {} {}: {}",
                        try_number, method, uri_path, e
                    );
                    tokio::time::sleep(Duration::from_secs(try_number)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        uri_path: &str,
        body: Vec<u8>,
    ) -> Result<(hyper::StatusCode, Bytes)> {
        let op = async {
            let stream = UnixStream::connect(&self.path).await.map_err(|e| {
                DockervolError::transport(format!(
                    "unable to dial {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

            let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| DockervolError::transport(format!("handshake failed: {}", e)))?;
            tokio::spawn(async move {
                let _ = connection.await;
            });

            let request = hyper::Request::builder()
                .method(method.clone())
                .uri(format!("http://unix{}", uri_path))
                .header(header::HOST, "unix")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ACCEPT, "application/json")
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| DockervolError::transport(format!("invalid request: {}", e)))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| DockervolError::transport(format!("request failed: {}", e)))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| DockervolError::transport(format!("failed to read response: {}", e)))?
                .to_bytes();
            debug!("response: {} length={}", status, bytes.len());
            Ok((status, bytes))
        };

        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| {
                DockervolError::transport(format!(
                    "request to {} timed out after {:?}",
                    self.path.display(),
                    self.timeout
                ))
            })?
    }
}
