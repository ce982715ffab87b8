//! end to end tests of the http/1 connection machinery over in memory
//! endpoints.

use core::future::poll_fn;
use core::pin::Pin;

use std::rc::Rc;

use bytes::BytesMut;
use futures_core::Stream;
use http::{header::HeaderMap, Request};
use tokio_util::sync::CancellationToken;

use joist_http::{
    body::ResponseBody,
    config::HttpConfig,
    customize::ConnectInfo,
    handler::{handler_fn, Handler, HandlerDispatch, Request as HandlerRequest, Response as HandlerResponse},
    io::memory::{self, MemoryHandle},
    upgrade::{OnUpgrade, UpgradeHandler},
    HttpServiceBuilder, RequestBody,
};
use joist_service::Service;

async fn read_body(body: &mut RequestBody) -> std::io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    loop {
        match poll_fn(|cx| Pin::new(&mut *body).poll_next(cx)).await {
            Some(chunk) => collected.extend_from_slice(&chunk?),
            None => return Ok(collected),
        }
    }
}

fn echo_handler() -> Rc<dyn Handler> {
    handler_fn(|req: &mut HandlerRequest, res: &mut HandlerResponse| {
        Box::pin(async move {
            let path = req.uri().path().to_string();
            let body = read_body(req.body_mut()).await.unwrap_or_default();
            let mut text = format!("path={path}");
            if !body.is_empty() {
                text.push_str(&format!(" body={}", String::from_utf8_lossy(&body)));
            }
            *res.body_mut() = ResponseBody::bytes(text);
            Ok(true)
        })
    })
}

fn ignore_body_handler() -> Rc<dyn Handler> {
    handler_fn(|_req: &mut HandlerRequest, res: &mut HandlerResponse| {
        Box::pin(async move {
            *res.body_mut() = ResponseBody::bytes("ignored");
            Ok(true)
        })
    })
}

/// serve the given client bytes through a freshly built service and return
/// everything the server wrote.
async fn serve(input: &[u8], dispatch: HandlerDispatch) -> BytesMut {
    serve_with(input, dispatch, HttpConfig::new(), CancellationToken::new(), true)
        .await
        .0
}

async fn serve_with(
    input: &[u8],
    dispatch: HandlerDispatch,
    cfg: HttpConfig,
    token: CancellationToken,
    close_input: bool,
) -> (BytesMut, MemoryHandle) {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let builder = HttpServiceBuilder::h1(dispatch).config(cfg);
            let service = builder.call(()).await.unwrap();

            let (mut io, handle) = memory::pair();
            handle.write(input);
            if close_input {
                handle.close();
            }

            service
                .serve_io(&mut io, ConnectInfo::default(), token, BytesMut::new())
                .await
                .unwrap();

            (handle.output(), handle)
        })
        .await
}

fn output_str(output: &BytesMut) -> String {
    String::from_utf8_lossy(output).into_owned()
}

#[tokio::test]
async fn http10_close_with_zero_length() {
    let dispatch = HandlerDispatch::new(handler_fn(|_req: &mut HandlerRequest, _res: &mut HandlerResponse| {
        Box::pin(async move { Ok(true) })
    }));

    let output = serve(b"GET / HTTP/1.0\r\n\r\n", dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
    assert!(text.contains("content-length: 0\r\n"), "{text}");
    assert!(text.contains("connection: close\r\n"), "{text}");
}

#[tokio::test]
async fn pipelined_responses_in_order() {
    let dispatch = HandlerDispatch::new(echo_handler());

    let input = b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let output = serve(input, dispatch).await;
    let text = output_str(&output);

    let first = text.find("path=/first").expect("first response missing");
    let second = text.find("path=/second").expect("second response missing");
    assert!(first < second, "responses out of order: {text}");
    assert!(text.contains("connection: close\r\n"), "{text}");
}

#[tokio::test]
async fn expect_continue_on_body_read() {
    let dispatch = HandlerDispatch::new(echo_handler());

    let input = b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\nabc";
    let output = serve(input, dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\n"), "{text}");
    let continue_end = "HTTP/1.1 100 Continue\r\n\r\n".len();
    assert!(text[continue_end..].starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(text.contains("body=abc"), "{text}");
}

#[tokio::test]
async fn expect_continue_skipped_without_read() {
    let dispatch = HandlerDispatch::new(ignore_body_handler());

    let input = b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\nabc";
    let output = serve(input, dispatch).await;
    let text = output_str(&output);

    assert!(!text.contains("100 Continue"), "{text}");
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    // the unread body forces the connection closed.
    assert!(text.contains("connection: close\r\n"), "{text}");
}

#[tokio::test]
async fn unknown_expectation_fails() {
    let dispatch = HandlerDispatch::new(echo_handler());

    let output = serve(b"GET / HTTP/1.1\r\nHost: x\r\nExpect: the-cheese\r\n\r\n", dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 417 Expectation Failed\r\n"), "{text}");
}

#[tokio::test]
async fn oversized_head_answers_431() {
    let dispatch = HandlerDispatch::new(echo_handler());
    let cfg = HttpConfig::new().request_header_size(64);

    let mut input = b"GET / HTTP/1.1\r\nHost: x\r\nx-filler: ".to_vec();
    input.extend_from_slice(&[b'a'; 128]);
    input.extend_from_slice(b"\r\n\r\n");

    let (output, _) = serve_with(&input, dispatch, cfg, CancellationToken::new(), true).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 431 "), "{text}");
}

#[tokio::test]
async fn content_length_conflict_is_bad_request() {
    let dispatch = HandlerDispatch::new(echo_handler());

    let input = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\nabc";
    let output = serve(input, dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 400 "), "{text}");
}

#[tokio::test]
async fn chunked_body_with_trailers() {
    let dispatch = HandlerDispatch::new(handler_fn(
        |req: &mut HandlerRequest, res: &mut HandlerResponse| {
            Box::pin(async move {
                let body = read_body(req.body_mut()).await.unwrap();
                let trailers = req.body().trailers().unwrap_or_default();
                let text = format!(
                    "body={} checksum={}",
                    String::from_utf8_lossy(&body),
                    trailers
                        .get("x-checksum")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none"),
                );
                *res.body_mut() = ResponseBody::bytes(text);
                Ok(true)
            })
        },
    ));

    let input =
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nx-checksum: ok\r\ncontent-length: 3\r\n\r\n";
    let output = serve(input, dispatch).await;
    let text = output_str(&output);

    assert!(text.contains("body=abc checksum=ok"), "{text}");
}

#[tokio::test]
async fn head_response_has_length_but_no_body() {
    let dispatch = HandlerDispatch::new(handler_fn(|_req: &mut HandlerRequest, res: &mut HandlerResponse| {
        Box::pin(async move {
            *res.body_mut() = ResponseBody::bytes("would-be-body");
            Ok(true)
        })
    }));

    let output = serve(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", dispatch).await;
    let text = output_str(&output);

    assert!(text.contains("content-length: 13\r\n"), "{text}");
    assert!(!text.contains("would-be-body"), "{text}");
}

#[derive(Clone)]
struct H2cUpgrade {
    seen: Rc<std::cell::RefCell<Option<Vec<u8>>>>,
}

impl<Io> UpgradeHandler<Io> for H2cUpgrade {
    fn protocols(&self) -> &[&str] {
        &["h2c"]
    }

    fn prepare(&self, _head: &Request<()>, fields: &mut HeaderMap) -> bool {
        fields.insert("x-upgrade", http::header::HeaderValue::from_static("prepared"));
        true
    }

    async fn upgrade(&self, on: OnUpgrade<'_, Io>) -> std::io::Result<()> {
        *self.seen.borrow_mut() = Some(on.read_buf.to_vec());
        Ok(())
    }
}

#[tokio::test]
async fn h2c_upgrade_switches_protocols() {
    let seen = Rc::new(std::cell::RefCell::new(None));
    let upgrade = H2cUpgrade { seen: seen.clone() };

    let local = tokio::task::LocalSet::new();
    let (output, seen) = local
        .run_until(async move {
            let builder = HttpServiceBuilder::h1(HandlerDispatch::new(echo_handler())).upgrade(upgrade);
            let service = builder.call(()).await.unwrap();

            let (mut io, handle) = memory::pair();
            handle.write(
                b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQCAAAAAAIAAAAA\r\n\r\nleftover",
            );
            handle.close();

            service
                .serve_io(&mut io, ConnectInfo::default(), CancellationToken::new(), BytesMut::new())
                .await
                .unwrap();

            (handle.output(), seen)
        })
        .await;

    let text = output_str(&output);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{text}");
    assert!(text.contains("connection: upgrade\r\n"), "{text}");
    assert!(text.contains("upgrade: h2c\r\n"), "{text}");
    assert!(text.contains("x-upgrade: prepared\r\n"), "{text}");

    // bytes past the request head reach the next protocol untouched.
    assert_eq!(seen.borrow().as_deref(), Some(&b"leftover"[..]));
}

#[tokio::test]
async fn h2_preface_without_support_is_426() {
    let dispatch = HandlerDispatch::new(echo_handler());

    let output = serve(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n", dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 426 "), "{text}");
}

#[tokio::test(start_paused = true)]
async fn delayed_dispatch_timeout_still_dispatches() {
    let dispatch = HandlerDispatch::new(handler_fn(
        |req: &mut HandlerRequest, res: &mut HandlerResponse| {
            Box::pin(async move {
                let outcome = match read_body(req.body_mut()).await {
                    Ok(_) => "read",
                    Err(_) => "input-failed",
                };
                *res.body_mut() = ResponseBody::bytes(outcome);
                Ok(true)
            })
        },
    ));

    let cfg = HttpConfig::new().keep_alive_timeout(core::time::Duration::from_millis(100));

    // body bytes never arrive. the handler still runs, observing a failed
    // input stream.
    let input = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\n";
    let (output, _handle) = serve_with(input, dispatch, cfg, CancellationToken::new(), false).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    assert!(text.contains("input-failed"), "{text}");
}

#[tokio::test]
async fn graceful_stop_refuses_pipelined_request() {
    let dispatch = HandlerDispatch::new(echo_handler());
    let token = CancellationToken::new();
    token.cancel();

    let input = b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n";
    let (output, handle) = serve_with(input, dispatch, HttpConfig::new(), token, false).await;
    let text = output_str(&output);

    assert!(text.contains("path=/first"), "{text}");
    assert!(!text.contains("path=/second"), "{text}");
    assert!(handle.is_output_shutdown());
}

#[tokio::test]
async fn detected_protocol_hands_bytes_to_dispatcher() {
    use joist_http::connector::{detect, Detect, H1Detect, TlsDetect};

    let local = tokio::task::LocalSet::new();
    let output = local
        .run_until(async move {
            let builder = HttpServiceBuilder::h1(HandlerDispatch::new(echo_handler()));
            let service = builder.call(()).await.unwrap();

            let (mut io, handle) = memory::pair();
            handle.write(b"GET /detected HTTP/1.1\r\nHost: x\r\n\r\n");
            handle.close();

            let tls = TlsDetect;
            let h1 = H1Detect;
            let chain: [&dyn Detect; 2] = [&tls, &h1];
            let (protocol, pre_read) = detect(&mut io, &chain, 8192).await.unwrap();
            assert_eq!(protocol, "http/1.1");

            // the peeked bytes continue as already read input.
            service
                .serve_io(&mut io, ConnectInfo::default(), CancellationToken::new(), pre_read)
                .await
                .unwrap();

            handle.output()
        })
        .await;

    let text = output_str(&output);
    assert!(text.contains("path=/detected"), "{text}");
}

#[tokio::test]
async fn handler_error_becomes_500() {
    let dispatch = HandlerDispatch::new(handler_fn(|_req: &mut HandlerRequest, _res: &mut HandlerResponse| {
        Box::pin(async move { Err("kaboom".into()) })
    }));

    let output = serve(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 500 "), "{text}");
}

#[tokio::test]
async fn unhandled_request_is_404() {
    let dispatch = HandlerDispatch::new(handler_fn(|_req: &mut HandlerRequest, _res: &mut HandlerResponse| {
        Box::pin(async move { Ok(false) })
    }));

    let output = serve(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n", dispatch).await;
    let text = output_str(&output);

    assert!(text.starts_with("HTTP/1.1 404 "), "{text}");
}
