//! Local proxy for forwarding tunneled requests
//!
//! Every request envelope yields exactly one response envelope. Failures of
//! the local hop become a synthesized 500 response instead of an error.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue as WireValue, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use revtun_shared::{normalize_body, HeaderValue, Headers, RequestEnvelope, ResponseEnvelope};
use std::error::Error as StdError;
use std::io;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Headers the outbound client computes itself
const HOP_HEADERS: [&str; 2] = ["content-length", "host"];

const ERROR_DETAILS: &str = "Error processing the request in the tunnel client";

/// Failure of the local hop
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Invalid method '{0}'")]
    InvalidMethod(String),

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    #[error("Local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ForwardError {
    /// Short machine-readable code for the error body
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::InvalidMethod(_) => "EINVALIDMETHOD",
            ForwardError::InvalidHeader(_) => "EINVALIDHEADER",
            ForwardError::Request(e) => {
                match io_error_kind(e) {
                    Some(io::ErrorKind::ConnectionRefused) => return "ECONNREFUSED",
                    Some(io::ErrorKind::ConnectionReset) => return "ECONNRESET",
                    Some(io::ErrorKind::TimedOut) => return "ETIMEDOUT",
                    _ => {}
                }
                if e.is_timeout() {
                    "ETIMEDOUT"
                } else if e.is_connect() {
                    "ECONNECT"
                } else if e.is_body() || e.is_decode() {
                    "EBODY"
                } else {
                    "EREQUEST"
                }
            }
        }
    }

}

fn io_error_kind(e: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = e.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}

/// Copy inbound headers minus `content-length` and `host`, in any letter case
pub fn sanitize_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Executes request envelopes against the local HTTP service
#[derive(Debug, Clone)]
pub struct RequestForwarder {
    client: Client,
    base_url: String,
}

impl RequestForwarder {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ForwardError> {
        // No timeout: a hung local call only stalls its own response.
        let client = Client::builder()
            .no_proxy()
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Forward one request. Never fails; local errors become a 500 envelope.
    pub async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope {
        info!("Proxying {} {} ({})", request.method, request.path, request.id);

        match self.dispatch(&request).await {
            Ok(response) => {
                debug!("Request {} completed with {}", request.id, response.status_code);
                response
            }
            Err(e) => {
                warn!("Local request {} failed: {}", request.id, e);
                error_response(request.id, &e)
            }
        }
    }

    async fn dispatch(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ForwardError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(request.method.clone()))?;

        let mut builder = self
            .client
            .request(method, self.target_url(&request.path))
            .headers(to_header_map(&sanitize_headers(&request.headers))?);

        if let Some(body) = &request.body {
            let bytes = normalize_body(body);
            if !bytes.is_empty() {
                builder = builder.body(bytes);
            }
        }

        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        let headers = from_header_map(response.headers());
        let body = response.bytes().await?;

        Ok(ResponseEnvelope {
            id: request.id.clone(),
            status_code,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn target_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// Synthesized 500 response for a failed local request
pub fn error_response(id: String, error: &ForwardError) -> ResponseEnvelope {
    let mut headers = Headers::new();
    headers.insert("Content-Type".into(), "application/json".into());

    let body = serde_json::json!({
        // reqwest's Display already carries the cause chain
        "error": error.to_string(),
        "code": error.code(),
        "details": ERROR_DETAILS,
    });

    ResponseEnvelope {
        id,
        status_code: 500,
        headers,
        body: body.to_string(),
    }
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap, ForwardError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let key = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ForwardError::InvalidHeader(name.clone()))?;
        for v in value.as_slice() {
            let v = WireValue::from_str(v).map_err(|_| ForwardError::InvalidHeader(name.clone()))?;
            map.append(key.clone(), v);
        }
    }
    Ok(map)
}

/// `set-cookie` is always a list, other headers only when repeated
fn from_header_map(map: &HeaderMap) -> Headers {
    map.keys()
        .map(|name| {
            let values: Vec<String> = map
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let value = if *name == SET_COOKIE {
                HeaderValue::Multi(values)
            } else {
                HeaderValue::from(values)
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{any, get};
    use axum::Router;
    use revtun_shared::RequestBody;
    use serde_json::Value;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    /// Echoes the request back as JSON
    async fn echo(headers: AxumHeaders, body: Bytes) -> impl IntoResponse {
        let names: Vec<String> = headers.keys().map(|k| k.as_str().to_string()).collect();
        let xs: Vec<String> = headers
            .get_all("x-multi")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        let host = headers
            .get("host")
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        axum::Json(serde_json::json!({
            "names": names,
            "multi": xs,
            "host": host,
            "len": body.len(),
            "body": String::from_utf8_lossy(&body),
        }))
    }

    fn request(id: &str, method: &str, path: &str) -> RequestEnvelope {
        RequestEnvelope {
            id: id.into(),
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    fn forwarder(port: u16) -> RequestForwarder {
        RequestForwarder::new(format!("http://127.0.0.1:{}", port)).unwrap()
    }

    #[test]
    fn test_sanitize_headers() {
        let mut headers = Headers::new();
        headers.insert("Content-Length".into(), "10".into());
        headers.insert("HOST".into(), "public.example.com".into());
        headers.insert("host".into(), "public.example.com".into());
        headers.insert("Accept".into(), "text/html".into());
        headers.insert(
            "x-multi".into(),
            HeaderValue::Multi(vec!["1".into(), "2".into()]),
        );

        let clean = sanitize_headers(&headers);
        assert_eq!(clean.len(), 2);
        assert_eq!(clean["Accept"], HeaderValue::from("text/html"));
        assert_eq!(clean["x-multi"], headers["x-multi"]);
    }

    #[tokio::test]
    async fn test_forward_health() {
        let app = Router::new().route(
            "/health",
            get(|| async { ([("content-type", "application/json")], r#"{"ok":true}"#) }),
        );
        let port = serve(app).await;

        let response = forwarder(port).forward(request("r1", "GET", "/health")).await;
        assert_eq!(response.id, "r1");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, r#"{"ok":true}"#);
        assert_eq!(
            response.headers["content-type"],
            HeaderValue::from("application/json")
        );
    }

    #[tokio::test]
    async fn test_status_code_relayed() {
        let app = Router::new()
            .route("/created", any(|| async { (StatusCode::CREATED, "made") }))
            .route(
                "/moved",
                get(|| async { (StatusCode::FOUND, [("location", "/elsewhere")], "") }),
            );
        let port = serve(app).await;
        let fwd = forwarder(port);

        let response = fwd.forward(request("a", "POST", "/created")).await;
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body, "made");

        let response = fwd.forward(request("b", "GET", "/missing")).await;
        assert_eq!(response.status_code, 404);

        // Redirects are relayed, not followed
        let response = fwd.forward(request("c", "GET", "/moved")).await;
        assert_eq!(response.status_code, 302);
        assert_eq!(response.headers["location"], HeaderValue::from("/elsewhere"));
    }

    #[tokio::test]
    async fn test_response_header_shapes() {
        let app = Router::new().route(
            "/cookie",
            get(|| async {
                let mut headers = AxumHeaders::new();
                headers.insert("set-cookie", "a=1".parse().unwrap());
                headers.append("x-tag", "one".parse().unwrap());
                headers.append("x-tag", "two".parse().unwrap());
                (headers, "ok")
            }),
        );
        let port = serve(app).await;

        let response = forwarder(port).forward(request("h1", "GET", "/cookie")).await;
        assert_eq!(
            response.headers["set-cookie"],
            HeaderValue::Multi(vec!["a=1".into()])
        );
        assert_eq!(
            response.headers["x-tag"],
            HeaderValue::Multi(vec!["one".into(), "two".into()])
        );
        assert_eq!(response.headers["content-length"], HeaderValue::from("2"));
    }

    #[tokio::test]
    async fn test_tagged_buffer_body_forwarded_as_bytes() {
        let port = serve(Router::new().route("/echo", any(echo))).await;

        let mut req = request("r2", "POST", "/echo");
        req.body = Some(RequestBody::from_json(
            serde_json::json!({"type": "Buffer", "data": [104, 105]}),
        ));
        let response = forwarder(port).forward(req).await;

        let echoed: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(echoed["len"], 2);
        assert_eq!(echoed["body"], "hi");
    }

    #[tokio::test]
    async fn test_headers_sanitized_on_the_wire() {
        let port = serve(Router::new().route("/echo", any(echo))).await;

        let mut req = request("r3", "POST", "/echo");
        req.headers.insert("Host".into(), "public.example.com".into());
        req.headers.insert("content-length".into(), "999".into());
        req.headers.insert(
            "x-multi".into(),
            HeaderValue::Multi(vec!["one".into(), "two".into()]),
        );
        req.body = Some(RequestBody::Text("abc".into()));
        let response = forwarder(port).forward(req).await;

        let echoed: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(echoed["multi"], serde_json::json!(["one", "two"]));
        assert_eq!(echoed["host"], format!("127.0.0.1:{}", port));
        assert_eq!(echoed["len"], 3);
    }

    #[tokio::test]
    async fn test_unreachable_service_synthesizes_500() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = forwarder(port).forward(request("r4", "GET", "/health")).await;
        assert_eq!(response.id, "r4");
        assert_eq!(response.status_code, 500);
        assert_eq!(
            response.headers["Content-Type"],
            HeaderValue::from("application/json")
        );

        let body: Value = serde_json::from_str(&response.body).unwrap();
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Local request failed: error sending request"));
        assert!(message.contains(&format!("127.0.0.1:{}", port)));
        let mut segments: Vec<&str> = message.split(": ").collect();
        let total = segments.len();
        segments.sort_unstable();
        segments.dedup();
        assert_eq!(segments.len(), total, "cause repeated in {:?}", message);
        assert!(matches!(
            body["code"].as_str(),
            Some("ECONNREFUSED") | Some("ECONNECT")
        ));
        assert_eq!(body["details"], ERROR_DETAILS);
    }

    #[tokio::test]
    async fn test_invalid_method_synthesizes_500() {
        let response = forwarder(1).forward(request("r5", "GE T", "/")).await;
        assert_eq!(response.status_code, 500);
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["code"], "EINVALIDMETHOD");
    }

    #[test]
    fn test_target_url() {
        let fwd = RequestForwarder::new("http://localhost:8000").unwrap();
        assert_eq!(fwd.target_url("/a?b=1"), "http://localhost:8000/a?b=1");
        assert_eq!(fwd.target_url("a"), "http://localhost:8000/a");
    }
}
