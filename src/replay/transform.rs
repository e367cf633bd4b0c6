// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Rewrites the head of a captured request so the target accepts it: the `Host` header names the
//! target, and `Authorization` is replaced when an override is configured. Bodies pass through
//! untouched.
use tracing::trace;
use url::Url;

#[derive(Debug, Clone)]
pub struct RequestTransformer {
    host: String,
    authorization: Option<String>,
}

impl RequestTransformer {
    pub fn new(target: &Url, authorization: Option<String>) -> Self {
        let host = match (target.host_str(), target.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        Self {
            host,
            authorization,
        }
    }

    pub fn transform(&self, request: &[u8]) -> Vec<u8> {
        let Some((head_len, separator)) = find_head(request) else {
            trace!("request head incomplete, sending unmodified");
            return request.to_vec();
        };
        let Ok(head) = std::str::from_utf8(&request[..head_len]) else {
            trace!("request head is not UTF-8, sending unmodified");
            return request.to_vec();
        };
        let eol = if separator == b"\r\n\r\n" { "\r\n" } else { "\n" };

        let mut lines = head.split(eol);
        let mut rewritten = String::with_capacity(head.len() + 64);
        rewritten.push_str(lines.next().unwrap_or_default());
        rewritten.push_str(eol);
        if !self.host.is_empty() {
            rewritten.push_str("Host: ");
            rewritten.push_str(&self.host);
            rewritten.push_str(eol);
        }
        if let Some(authorization) = &self.authorization {
            rewritten.push_str("Authorization: ");
            rewritten.push_str(authorization);
            rewritten.push_str(eol);
        }
        for line in lines {
            let name = line.split(':').next().unwrap_or_default().trim();
            if name.eq_ignore_ascii_case("host") && !self.host.is_empty() {
                continue;
            }
            if name.eq_ignore_ascii_case("authorization") && self.authorization.is_some() {
                continue;
            }
            rewritten.push_str(line);
            rewritten.push_str(eol);
        }
        rewritten.push_str(eol);

        let mut out = rewritten.into_bytes();
        out.extend_from_slice(&request[head_len + separator.len()..]);
        out
    }
}

/// True if the request line names the HEAD method, whose response never carries a body.
pub fn is_head_request(request: &[u8]) -> bool {
    request.starts_with(b"HEAD ")
}

fn find_head(request: &[u8]) -> Option<(usize, &'static [u8])> {
    if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, b"\r\n\r\n"));
    }
    request
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, &b"\n\n"[..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn replaces_host_and_authorization() {
        let transformer =
            RequestTransformer::new(&target("https://new.example:9200"), Some("Basic abc".into()));
        let request = b"POST /idx/_doc HTTP/1.1\r\nhost: old.example\r\nauthorization: Basic xyz\r\ncontent-length: 2\r\n\r\n{}";
        let out = String::from_utf8(transformer.transform(request)).unwrap();
        assert_eq!(
            out,
            "POST /idx/_doc HTTP/1.1\r\nHost: new.example:9200\r\nAuthorization: Basic abc\r\ncontent-length: 2\r\n\r\n{}"
        );
    }

    #[test]
    fn keeps_authorization_without_override() {
        let transformer = RequestTransformer::new(&target("http://new.example"), None);
        let request = b"GET / HTTP/1.1\nHost: old\nAuthorization: Bearer t\n\n";
        let out = String::from_utf8(transformer.transform(request)).unwrap();
        assert_eq!(out, "GET / HTTP/1.1\nHost: new.example\nAuthorization: Bearer t\n\n");
    }

    #[test]
    fn passes_through_incomplete_head() {
        let transformer = RequestTransformer::new(&target("http://new.example"), None);
        let request = b"GET / HTTP/1.1\r\nHost: old";
        assert_eq!(transformer.transform(request), request.to_vec());
    }

    #[test]
    fn detects_head_requests() {
        assert!(is_head_request(b"HEAD / HTTP/1.1\r\n\r\n"));
        assert!(!is_head_request(b"GET / HTTP/1.1\r\n\r\n"));
    }
}
