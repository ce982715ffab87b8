//! `application/x-www-form-urlencoded` body decoding for the configured set
//! of form methods.

use bytes::Bytes;
use futures_core::stream::Stream;
use http::header::CONTENT_TYPE;

use crate::{config::HttpConfig, h1::RequestBody, handler::Request};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// true when the request method and content type qualify for form decoding.
pub fn is_form_request(cfg: &HttpConfig, req: &Request) -> bool {
    cfg.is_form_encoded_method(req.method())
        && req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
            .unwrap_or(false)
}

/// read the whole request body and decode it as form fields. order of the
/// pairs is preserved.
pub async fn read_form(cfg: &HttpConfig, req: &mut Request) -> std::io::Result<Vec<(String, String)>> {
    if !is_form_request(cfg, req) {
        return Ok(Vec::new());
    }
    let body = read_body(req.body_mut()).await?;
    Ok(parse_form(&body))
}

async fn read_body(body: &mut RequestBody) -> std::io::Result<Bytes> {
    use core::future::poll_fn;
    use core::pin::Pin;

    let mut collected = Vec::new();
    loop {
        let next = poll_fn(|cx| Pin::new(&mut *body).poll_next(cx)).await;
        match next {
            Some(chunk) => collected.extend_from_slice(&chunk?),
            None => return Ok(Bytes::from(collected)),
        }
    }
}

/// decode `name=value&name=value` pairs with percent and plus decoding.
/// undecodable pairs are skipped.
pub fn parse_form(bytes: &[u8]) -> Vec<(String, String)> {
    bytes
        .split(|&b| b == b'&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut split = pair.splitn(2, |&b| b == b'=');
            let name = percent_decode(split.next()?)?;
            let value = percent_decode(split.next().unwrap_or(b""))?;
            Some((name, value))
        })
        .collect()
}

fn percent_decode(input: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        match b {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = hex_val(*iter.next()?)?;
                let lo = hex_val(*iter.next()?)?;
                out.push(hi << 4 | lo);
            }
            b => out.push(b),
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_pairs() {
        let pairs = parse_form(b"name=value&greeting=hello+world&enc=%21%3D");
        assert_eq!(
            pairs,
            [
                ("name".to_string(), "value".to_string()),
                ("greeting".to_string(), "hello world".to_string()),
                ("enc".to_string(), "!=".to_string()),
            ]
        );
    }

    #[test]
    fn broken_pairs_skipped() {
        let pairs = parse_form(b"ok=1&bad=%zz&also_ok=2");
        assert_eq!(
            pairs,
            [("ok".to_string(), "1".to_string()), ("also_ok".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn method_and_content_type_gate() {
        let cfg = HttpConfig::new();

        let mut req = http::Request::new(RequestBody::default());
        *req.method_mut() = http::Method::POST;
        req.headers_mut().insert(
            CONTENT_TYPE,
            http::header::HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
        );
        assert!(is_form_request(&cfg, &req));

        *req.method_mut() = http::Method::GET;
        assert!(!is_form_request(&cfg, &req));
    }
}
