//! Request head construction per protocol.

use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Request, Uri};

use crate::dispatch::task::Task;

/// Connection-specific headers that HTTP/2 forbids.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::HOST,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name == "keep-alive" || name == "proxy-connection"
}

/// Origin-form request with a Host header.
pub fn http1(task: &Task) -> Result<Request<()>, http::Error> {
    let mut builder = Request::builder()
        .method(task.method.clone())
        .uri(task.path.as_str());
    if let Some(headers) = builder.headers_mut() {
        copy_headers(&task.headers, headers, false);
        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, HeaderValue::from_str(&task.host)?);
        }
        if !task.body.is_empty() && !headers.contains_key(header::CONTENT_LENGTH) {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(task.body.len()));
        }
    }
    builder.body(())
}

/// Absolute-form request; the authority becomes `:authority`.
pub fn http2(task: &Task) -> Result<Request<()>, http::Error> {
    let uri = absolute_uri(&task.host, &task.path)?;
    let mut builder = Request::builder()
        .method(task.method.clone())
        .uri(uri)
        .version(http::Version::HTTP_2);
    if let Some(headers) = builder.headers_mut() {
        copy_headers(&task.headers, headers, true);
    }
    builder.body(())
}

pub fn absolute_uri(host: &str, path: &str) -> Result<Uri, http::Error> {
    let uri = Uri::builder()
        .scheme("https")
        .authority(host)
        .path_and_query(path)
        .build()?;
    Ok(uri)
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, strip_hop_by_hop: bool) {
    for (name, value) in from {
        if strip_hop_by_hop && is_hop_by_hop(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// The peer asked to close the connection after this response.
pub fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::dispatch::task::TaskRequest;

    fn task(headers: HeaderMap, body: &'static [u8]) -> Task {
        let request = TaskRequest::new(http::Method::POST, "example.com", "/upload?x=1")
            .headers(headers)
            .body(body);
        Task::new(request, Duration::from_secs(5)).0
    }

    #[test]
    fn http1_adds_host_and_length() {
        let req = http1(&task(HeaderMap::new(), b"abc")).unwrap();
        assert_eq!(req.uri(), "/upload?x=1");
        assert_eq!(req.headers()[header::HOST], "example.com");
        assert_eq!(req.headers()[header::CONTENT_LENGTH], "3");
    }

    #[test]
    fn http2_strips_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let req = http2(&task(headers, b"")).unwrap();
        assert_eq!(req.uri(), "https://example.com/upload?x=1");
        assert!(!req.headers().contains_key(header::CONNECTION));
        assert!(!req.headers().contains_key("keep-alive"));
        assert_eq!(req.headers()[header::ACCEPT], "*/*");
    }

    #[test]
    fn connection_close_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_close(&headers));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Close"));
        assert!(wants_close(&headers));
    }
}
