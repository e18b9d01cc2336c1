//! Decoding of form bodies into [`Request::data`].
//!
//! Two encodings are understood, selected by a substring match on
//! `Content-Type`:
//!
//! - `multipart/form-data; boundary=...`
//! - `application/x-www-form-urlencoded`
//!
//! Anything else leaves `data` empty.

use crate::{query::Query, Request};
use memchr::{memchr, memmem};
use thiserror::Error;

const MULTIPART: &str = "multipart/form-data";
const URLENCODED: &str = "application/x-www-form-urlencoded";
const DISPOSITION: &[u8] = b"form-data; name=\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("multipart body without a boundary parameter")]
    MissingBoundary,
    #[error("multipart boundary is empty")]
    EmptyBoundary,
}

/// Fills `req.data` from its body.
///
/// A malformed multipart segment ends the scan without an error; fields
/// decoded before it are kept.
pub(crate) fn decode(req: &mut Request, percent_decode: bool) -> Result<(), FormError> {
    req.data.clear();

    let Some(content_type) = req.header("Content-Type") else {
        return Ok(());
    };
    let multipart = content_type.contains(MULTIPART);
    let urlencoded = content_type.contains(URLENCODED);
    let boundary = multipart.then(|| boundary_of(content_type)).transpose()?;

    if let Some(boundary) = boundary {
        let mut data = std::mem::take(&mut req.data);
        multipart_fields(req.body(), boundary.as_bytes(), |name, value| {
            data.insert(name, value)
        });
        req.data = data;
    }

    if urlencoded {
        let mut data = std::mem::take(&mut req.data);
        Query::parse_into(&mut data, req.body(), percent_decode);
        req.data = data;
    }

    Ok(())
}

fn boundary_of(content_type: &str) -> Result<String, FormError> {
    let (_, rest) = content_type
        .split_once("boundary=")
        .ok_or(FormError::MissingBoundary)?;

    let token = rest.split(';').next().unwrap_or_default().trim();
    let token = token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token);

    match token.is_empty() {
        true => Err(FormError::EmptyBoundary),
        false => Ok(format!("--{token}")),
    }
}

fn multipart_fields(body: &[u8], delimiter: &[u8], mut emit: impl FnMut(String, String)) {
    let finder = memmem::Finder::new(delimiter);

    let Some(mut pos) = finder.find(body) else {
        return;
    };

    loop {
        let start = pos + delimiter.len();
        let rest = &body[start..];

        if rest.starts_with(b"--") {
            return;
        }
        let Some(next) = finder.find(rest) else {
            return;
        };
        let segment = &rest[..next];

        let Some(name_at) = memmem::find(segment, DISPOSITION) else {
            return;
        };
        let name_start = name_at + DISPOSITION.len();
        let Some(name_len) = memchr(b'"', &segment[name_start..]) else {
            return;
        };
        let Some(blank) = memmem::find(segment, b"\r\n\r\n") else {
            return;
        };

        let value_start = blank + 4;
        let value_end = next.saturating_sub(2).max(value_start);
        let value = &segment[value_start..value_end];
        let value = match value.iter().rposition(|b| !b.is_ascii_whitespace()) {
            Some(last) => &value[..=last],
            None => &value[..0],
        };

        emit(
            String::from_utf8_lossy(&segment[name_start..name_start + name_len]).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );

        pos = start + next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content_type: Option<&str>, body: &str) -> Request {
        let header = content_type
            .map(|ct| format!("Content-Type: {ct}\r\n"))
            .unwrap_or_default();
        let raw = format!(
            "POST /form HTTP/1.1\r\n{header}Content-Length: {}\r\n\r\n{body}",
            body.len()
        );

        Request::parse(raw.as_bytes(), false).unwrap()
    }

    fn fields(req: &Request) -> Vec<(&str, &str)> {
        req.data().iter().collect()
    }

    #[test]
    fn missing_content_type_is_noop() {
        let mut req = request(None, "a=1");

        assert_eq!(decode(&mut req, false), Ok(()));
        assert!(req.data().is_empty());
    }

    #[test]
    fn unknown_content_type_is_noop() {
        let mut req = request(Some("application/json"), r#"{"a":1}"#);

        assert_eq!(decode(&mut req, false), Ok(()));
        assert!(req.data().is_empty());
    }

    #[test]
    fn urlencoded() {
        #[rustfmt::skip]
        let cases = [
            ("a=1&b=2",       vec![("a", "1"), ("b", "2")]),
            ("a=1&flag&b=",   vec![("a", "1"), ("b", "")]),
            ("x=a%20b",       vec![("x", "a%20b")]),
            ("",              vec![]),
        ];

        for (body, expected) in cases {
            let mut req = request(Some(URLENCODED), body);

            assert_eq!(decode(&mut req, false), Ok(()));
            assert_eq!(fields(&req), expected, "{body:?}");
        }
    }

    #[test]
    fn urlencoded_many_distinct_fields() {
        let body: String = (0..100_000).map(|n| format!("k{n}=&")).collect();
        assert!(body.len() < crate::limits::ReqLimits::default().max_body_size);

        let mut req = request(Some(URLENCODED), &body);
        let started = std::time::Instant::now();

        assert_eq!(decode(&mut req, false), Ok(()));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(req.data().len(), 100_000);
        assert_eq!(req.data().get("k99999"), Some(""));
    }

    #[test]
    fn urlencoded_with_decoding() {
        let mut req = request(Some(URLENCODED), "name=J%C3%B6rg+M");

        assert_eq!(decode(&mut req, true), Ok(()));
        assert_eq!(req.data().get("name"), Some("Jörg M"));
    }

    #[test]
    fn multipart_single_field() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\nhello\r\n--B--";
        let mut req = request(Some("multipart/form-data; boundary=B"), body);

        assert_eq!(decode(&mut req, false), Ok(()));
        assert_eq!(fields(&req), vec![("x", "hello")]);
    }

    #[test]
    fn multipart_fields_and_trimming() {
        let body = concat!(
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"title\"\r\n",
            "\r\n",
            "Report  \t\r\n",
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "line one\r\nline two\r\n",
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"empty\"\r\n",
            "\r\n",
            "\r\n",
            "--XyZ--\r\n",
        );
        let mut req = request(Some("multipart/form-data; boundary=\"XyZ\""), body);

        assert_eq!(decode(&mut req, false), Ok(()));
        assert_eq!(
            fields(&req),
            vec![
                ("title", "Report"),
                ("file", "line one\r\nline two"),
                ("empty", ""),
            ]
        );
    }

    #[test]
    fn multipart_stops_at_malformed_segment() {
        #[rustfmt::skip]
        let cases = [
            (
                // second segment has no disposition
                "--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--B\r\nX: y\r\n\r\n2\r\n--B\r\nContent-Disposition: form-data; name=\"c\"\r\n\r\n3\r\n--B--",
                vec![("a", "1")],
            ),
            (
                // second segment has no blank line
                "--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--B\r\nContent-Disposition: form-data; name=\"b\"\r\n2\r\n--B--",
                vec![("a", "1")],
            ),
            (
                // no closing boundary after the first segment
                "--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n",
                vec![],
            ),
            (
                // no boundary at all
                "just text",
                vec![],
            ),
        ];

        for (body, expected) in cases {
            let mut req = request(Some("multipart/form-data; boundary=B"), body);

            assert_eq!(decode(&mut req, false), Ok(()));
            assert_eq!(fields(&req), expected);
        }
    }

    #[test]
    fn multipart_boundary_errors() {
        #[rustfmt::skip]
        let cases = [
            ("multipart/form-data",                 FormError::MissingBoundary),
            ("multipart/form-data; charset=utf-8",  FormError::MissingBoundary),
            ("multipart/form-data; boundary=",      FormError::EmptyBoundary),
            ("multipart/form-data; boundary=\"\"",  FormError::EmptyBoundary),
        ];

        for (content_type, error) in cases {
            let mut req = request(Some(content_type), "");
            assert_eq!(decode(&mut req, false), Err(error));
        }
    }
}
