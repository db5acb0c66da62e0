//! Transport for communicating with the container engine over its Unix socket
//!
//! One connection is opened per request. The engine and kernel make Unix
//! socket connections cheap, and isolation keeps a slow streaming call from
//! interfering with fast control calls.

use std::fmt;

use futures_util::{stream::Stream, StreamExt, TryStreamExt};
use hyper::{
    body::Bytes, header, upgrade::Upgraded, Body, Client, Method, Request, Response, StatusCode,
};
use hyperlocal::{UnixConnector, Uri as DomainUri};
use log::debug;
use mime::Mime;
use serde::Deserialize;

use crate::errors::{Error, Result};

/// Request body variants accepted by the transport
pub(crate) enum Payload {
    None,
    Json(Vec<u8>),
    Tar(Vec<u8>),
}

impl Payload {
    fn mime(&self) -> Option<Mime> {
        match self {
            Payload::None => None,
            Payload::Json(_) => Some(mime::APPLICATION_JSON),
            Payload::Tar(_) => Some("application/x-tar".parse().expect("valid mime")),
        }
    }

    fn into_body(self) -> Body {
        match self {
            Payload::None => Body::empty(),
            Payload::Json(bytes) | Payload::Tar(bytes) => bytes.into(),
        }
    }
}

/// HTTP client bound to the engine's Unix socket
#[derive(Clone)]
pub(crate) struct Transport {
    client: Client<UnixConnector>,
    path: String,
}

impl fmt::Debug for Transport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        write!(f, "Unix({})", self.path)
    }
}

impl Transport {
    pub fn new<S>(socket_path: S) -> Transport
    where
        S: Into<String>,
    {
        Transport {
            // pool_max_idle_per_host(0) turns connection reuse off, giving
            // each request its own connection
            client: Client::builder()
                .pool_max_idle_per_host(0)
                .build(UnixConnector),
            path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.path
    }

    fn build_request(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload,
        upgrade: bool,
    ) -> Result<Request<Body>> {
        let uri: hyper::Uri = DomainUri::new(&self.path, endpoint).into();
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "localhost");

        builder = if upgrade {
            builder
                .header(header::CONNECTION, "Upgrade")
                .header(header::UPGRADE, "tcp")
        } else {
            builder.header(header::CONNECTION, "close")
        };

        let req = match payload.mime() {
            Some(mime) => builder
                .header(header::CONTENT_TYPE, mime.as_ref())
                .body(payload.into_body())?,
            None => builder.body(Body::empty())?,
        };
        Ok(req)
    }

    async fn send_request(
        &self,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        self.client.request(req).await.map_err(|e| {
            if e.is_connect() {
                Error::Connection {
                    path: self.path.clone(),
                    detail: e.to_string(),
                }
            } else {
                Error::Hyper(e)
            }
        })
    }

    /// Perform a request and return the response body on a success status.
    /// Error statuses are drained and surfaced as [`Error::Fault`].
    async fn get_body(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload,
    ) -> Result<Body> {
        debug!("{} {}", method, endpoint);
        let req = self.build_request(method, endpoint, payload, false)?;
        let response = self.send_request(req).await?;

        let status = response.status();
        match status {
            StatusCode::OK
            | StatusCode::CREATED
            | StatusCode::NO_CONTENT
            | StatusCode::NOT_MODIFIED
            | StatusCode::SWITCHING_PROTOCOLS => Ok(response.into_body()),
            _ => {
                let bytes = concat_body(response.into_body()).await?;
                Err(Error::Fault {
                    code: status,
                    message: error_message(&bytes, status),
                })
            }
        }
    }

    /// Make a request and buffer the whole response into a `String`
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload,
    ) -> Result<String> {
        let body = self.get_body(method, endpoint, payload).await?;
        let bytes = concat_body(body).await?;
        let string = String::from_utf8(bytes)?;
        debug!("{} raw response: {}", endpoint, string);
        Ok(string)
    }

    /// Make a request and buffer the response as raw bytes (tar archives)
    pub async fn request_bytes(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload,
    ) -> Result<Vec<u8>> {
        let body = self.get_body(method, endpoint, payload).await?;
        concat_body(body).await
    }

    /// Make a request and leave the response body open for streaming reads.
    ///
    /// hyper hands back the body as a chunk sequence for both raw
    /// (connection-close) and chunked transfer-encoded responses, so one
    /// reader downstream covers both engine styles.
    pub async fn stream_chunks(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let body = self.get_body(method, endpoint, payload).await?;
        Ok(body.map_err(Error::Hyper))
    }

    /// Make a request, upgrading the connection on success.
    ///
    /// Used for stdin-attached execs, where the same connection carries
    /// writes to the process and the multiplexed output stream back.
    pub async fn stream_upgrade(
        &self,
        method: Method,
        endpoint: &str,
        payload: Payload,
    ) -> Result<Upgraded> {
        let req = self.build_request(method, endpoint, payload, true)?;
        let response = self.send_request(req).await?;
        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => Ok(response.into_body().on_upgrade().await?),
            _ => Err(Error::ConnectionNotUpgraded),
        }
    }
}

async fn concat_body(mut body: Body) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    while let Some(chunk) = body.next().await {
        v.extend(chunk?);
    }
    Ok(v)
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Extract the engine's JSON error message from a response body, falling
/// back to a body excerpt or the canonical status reason.
fn error_message(
    body: &[u8],
    status: StatusCode,
) -> String {
    if let Ok(err) = serde_json::from_slice::<ErrorResponse>(body) {
        return err.message;
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error code")
            .to_owned()
    } else {
        let mut excerpt = trimmed.to_owned();
        if excerpt.len() > 256 {
            let mut end = 256;
            while !excerpt.is_char_boundary(end) {
                end -= 1;
            }
            excerpt.truncate(end);
        }
        excerpt
    }
}
