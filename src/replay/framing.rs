// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Decides when an HTTP/1.x response read from the target is complete.
//!
//! The executor keeps reading until [`response_complete`] says so or the peer closes. Responses
//! without any length information are delimited by connection close.

#[derive(Debug, PartialEq, Eq)]
enum BodyLength {
    None,
    Exact(usize),
    Chunked,
    UntilClose,
}

struct Head {
    status: u16,
    /// Offset of the first body byte.
    body_start: usize,
    length: BodyLength,
}

/// True once `buf` holds a complete final response. Interim `1xx` responses (other than `101`)
/// are skipped.
pub fn response_complete(buf: &[u8], head_request: bool) -> bool {
    let mut offset = 0;
    loop {
        let Some(head) = parse_head(&buf[offset..], head_request) else {
            return false;
        };
        if (100..200).contains(&head.status) && head.status != 101 {
            offset += head.body_start;
            continue;
        }
        let body = &buf[offset + head.body_start..];
        return match head.length {
            BodyLength::None => true,
            BodyLength::Exact(n) => body.len() >= n,
            BodyLength::Chunked => chunked_complete(body),
            BodyLength::UntilClose => false,
        };
    }
}

fn parse_head(buf: &[u8], head_request: bool) -> Option<Head> {
    let end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let text = String::from_utf8_lossy(&buf[..end]);
    let mut lines = text.split("\r\n");
    let status = lines
        .next()?
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())?;

    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse::<usize>().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    let length = if head_request || status < 200 || status == 204 || status == 304 {
        BodyLength::None
    } else if chunked {
        BodyLength::Chunked
    } else if let Some(n) = content_length {
        BodyLength::Exact(n)
    } else {
        BodyLength::UntilClose
    };

    Some(Head {
        status,
        body_start: end + 4,
        length,
    })
}

/// Walks chunk headers until the zero-size chunk and its trailer section are fully buffered.
fn chunked_complete(mut body: &[u8]) -> bool {
    loop {
        let Some(line_end) = find_crlf(body) else {
            return false;
        };
        let size_field = String::from_utf8_lossy(&body[..line_end]);
        let size_hex = size_field.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            // unparsable framing; wait for the peer to close
            return false;
        };
        body = &body[line_end + 2..];

        if size == 0 {
            // trailers end with an empty line
            loop {
                let Some(end) = find_crlf(body) else {
                    return false;
                };
                if end == 0 {
                    return true;
                }
                body = &body[end + 2..];
            }
        }

        let Some(chunk_len) = size.checked_add(2) else {
            return false;
        };
        if body.len() < chunk_len {
            return false;
        }
        body = &body[chunk_len..];
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
