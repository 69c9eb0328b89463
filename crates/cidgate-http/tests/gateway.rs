//! End-to-end tests driving [`GatewayService::handle`] against an in-memory
//! backend, plus a few over a real HTTP/1 connection.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use cidgate_core::cids::{DAG_CBOR, DAG_JSON, LIBP2P_KEY, RAW, identity_cid, sha256_cid};
use cidgate_core::{Cid, ContentPath, MemoryBackend, car, codec};
use cidgate_http::body::GatewayBody;
use cidgate_http::caching::dir_index_etag;
use cidgate_http::{GatewayConfig, GatewayService};
use http::header::{
    ACCEPT, CACHE_CONTROL, CONTENT_RANGE, CONTENT_TYPE, ETAG, HOST, IF_NONE_MATCH, LOCATION, RANGE,
    TRAILER,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PATH_GATEWAY: &str = "127.0.0.1";

struct Site {
    backend: MemoryBackend,
    file: Cid,
    dir: Cid,
}

/// A site with `index.html`, a text file, and `_redirects`.
fn site() -> Site {
    let backend = MemoryBackend::new();
    let file = backend.add_file("0123456789");
    let index = backend.add_file("<!doctype html><p>home</p>");
    let rules = backend.add_file("/old /new.html 301\n");
    let dir = backend.add_directory([
        ("_redirects", rules),
        ("digits.txt", file),
        ("index.html", index),
    ]);
    Site { backend, file, dir }
}

fn service(backend: &MemoryBackend) -> GatewayService {
    GatewayService::new(Arc::new(backend.clone()), GatewayConfig::default()).unwrap()
}

fn get(host: &str, uri: &str) -> http::request::Builder {
    Request::builder().method(Method::GET).uri(uri).header(HOST, host)
}

async fn body_bytes(resp: Response<GatewayBody>) -> Bytes {
    resp.into_body().collect().await.unwrap().to_bytes()
}

async fn body_text(resp: Response<GatewayBody>) -> String {
    String::from_utf8(body_bytes(resp).await.to_vec()).unwrap()
}

/// Serve a single HTTP/1 connection on an ephemeral port.
async fn serve_one_connection(svc: GatewayService) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), svc)
            .await
            .ok();
    });
    addr
}

/// Send a GET that accepts trailers and return the raw response bytes.
async fn raw_get_with_trailers(addr: SocketAddr, uri: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {uri} HTTP/1.1\r\nHost: {PATH_GATEWAY}\r\nTE: trailers\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    String::from_utf8_lossy(&raw).into_owned()
}

#[tokio::test]
async fn test_should_answer_health_checks() {
    let site = site();
    let req = get(PATH_GATEWAY, "/health").body(()).unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(
        body_text(resp).await,
        r#"{"status":"running","service":"gateway"}"#
    );
}

#[tokio::test]
async fn test_should_reject_unsupported_methods() {
    let site = site();
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/object/{}", site.file))
        .header(HOST, PATH_GATEWAY)
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.headers()[http::header::ALLOW], "GET, HEAD, OPTIONS");
}

#[tokio::test]
async fn test_should_serve_file_with_roots_and_etag() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}/digits.txt", site.dir))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
    assert_eq!(resp.headers()[ETAG], format!("\"{}\"", site.file));
    assert_eq!(
        resp.headers()["x-roots"],
        format!("{},{}", site.dir, site.file)
    );
    assert_eq!(
        resp.headers()["x-object-path"],
        format!("/object/{}/digits.txt", site.dir)
    );
    assert_eq!(body_text(resp).await, "0123456789");
}

#[tokio::test]
async fn test_should_report_missing_links() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}/missing", site.dir))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let text = body_text(resp).await;
    assert!(text.starts_with("failed to resolve /object/"));
    assert!(text.contains("no link named \"missing\""));
}

#[tokio::test]
async fn test_should_serve_single_range() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}", site.file))
        .header(RANGE, "bytes=0-4")
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()[CONTENT_RANGE], "bytes 0-4/10");
    assert_eq!(body_text(resp).await, "01234");
}

#[tokio::test]
async fn test_should_answer_not_modified_for_matching_etag() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}", site.file))
        .header(IF_NONE_MATCH, format!("\"{}\"", site.file))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(resp).await.is_empty());
}

#[tokio::test]
async fn test_should_redirect_directories_to_trailing_slash() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}?x=1", site.dir))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        resp.headers()[LOCATION],
        format!("/object/{}/?x=1", site.dir)
    );
}

#[tokio::test]
async fn test_should_serve_index_document() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}/", site.dir))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "text/html");
    assert_eq!(resp.headers()[ETAG], format!("\"{}\"", site.dir));
    assert!(body_text(resp).await.contains("home"));
}

#[tokio::test]
async fn test_should_list_directories_without_index() {
    let backend = MemoryBackend::new();
    let file = backend.add_file("x");
    let dir = backend.add_directory([("a.txt", file)]);
    let req = get(PATH_GATEWAY, &format!("/object/{dir}/")).body(()).unwrap();
    let resp = service(&backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[ETAG], dir_index_etag(&dir));
    assert!(body_text(resp).await.contains("a.txt"));
}

#[tokio::test]
async fn test_should_convert_dag_json_to_dag_cbor() {
    let backend = MemoryBackend::new();
    let json = br#"{"hello":"world","n":[1,2]}"#;
    let doc = backend.put_block(DAG_JSON, &json[..]);
    let req = get(PATH_GATEWAY, &format!("/object/{doc}?format=dag-cbor"))
        .body(())
        .unwrap();
    let resp = service(&backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[CONTENT_TYPE],
        "application/vnd.ipld.dag-cbor"
    );
    assert_eq!(resp.headers()[ETAG], format!("\"{doc}.dag-cbor\""));
    let cbor = body_bytes(resp).await;
    assert_eq!(
        codec::decode(DAG_CBOR, &cbor).unwrap(),
        codec::decode(DAG_JSON, json).unwrap()
    );
}

#[tokio::test]
async fn test_should_fail_only_if_cached_for_remote_content() {
    let site = site();
    site.backend.mark_remote(site.dir);
    let svc = service(&site.backend);

    let req = get(PATH_GATEWAY, &format!("/object/{}?format=car", site.dir))
        .header(CACHE_CONTROL, "only-if-cached")
        .body(())
        .unwrap();
    let resp = svc.handle(req).await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    assert!(body_text(resp).await.contains("not in local datastore"));

    let req = Request::builder()
        .method(Method::HEAD)
        .uri(format!("/object/{}", site.file))
        .header(HOST, PATH_GATEWAY)
        .header(CACHE_CONTROL, "only-if-cached")
        .body(())
        .unwrap();
    let resp = svc.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_bytes(resp).await.is_empty());
}

#[tokio::test]
async fn test_should_export_car_archives() {
    let backend = MemoryBackend::new();
    let a = backend.add_file("first");
    let b = backend.add_file("second");
    let dir = backend.add_directory([("a", a), ("b", b)]);
    let req = get(PATH_GATEWAY, &format!("/object/{dir}"))
        .header(ACCEPT, "application/vnd.ipld.car; version=1")
        .body(())
        .unwrap();
    let resp = service(&backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[CONTENT_TYPE],
        "application/vnd.ipld.car; version=1"
    );
    assert_eq!(resp.headers()["accept-ranges"], "none");
    assert_eq!(resp.headers()[ETAG], format!("W/\"{dir}.car\""));

    let archive = car::decode(&body_bytes(resp).await).unwrap();
    assert_eq!(archive.roots, vec![dir]);
    let cids: Vec<Cid> = archive.blocks.iter().map(|(cid, _)| *cid).collect();
    assert_eq!(cids, vec![dir, a, b]);
}

#[tokio::test]
async fn test_should_reject_unknown_car_versions() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}", site.dir))
        .header(ACCEPT, "application/vnd.ipld.car; version=2")
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(resp).await.contains("only version=1 is supported"));
}

#[tokio::test]
async fn test_should_export_tar_archives() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}?format=tar", site.dir))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/x-tar");
    assert_eq!(resp.headers()[ETAG], format!("W/\"{}.x-tar\"", site.dir));

    let data = body_bytes(resp).await;
    let mut archive = tar::Archive::new(&data[..]);
    let mut found = None;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        if path.ends_with("digits.txt") {
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            found = Some((path, content));
        }
    }
    let (path, content) = found.expect("archive should contain digits.txt");
    assert_eq!(path, format!("{}/digits.txt", site.dir));
    assert_eq!(content, "0123456789");
}

#[tokio::test]
async fn test_should_redirect_path_requests_to_subdomains() {
    let site = site();
    let req = get("localhost", &format!("/object/{}/digits.txt", site.dir))
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        resp.headers()[LOCATION],
        format!("http://{}.object.localhost/digits.txt", site.dir)
    );
}

#[tokio::test]
async fn test_should_serve_subdomain_requests() {
    let site = site();
    let host = format!("{}.object.localhost", site.dir);
    let req = get(&host, "/digits.txt").body(()).unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "0123456789");
}

#[tokio::test]
async fn test_should_apply_redirects_only_on_isolated_origins() {
    let site = site();
    let svc = service(&site.backend);

    let host = format!("{}.object.localhost", site.dir);
    let resp = svc.handle(get(&host, "/old").body(()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers()[LOCATION], "/new.html");

    let uri = format!("/object/{}/old", site.dir);
    let resp = svc.handle(get(PATH_GATEWAY, &uri).body(()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_should_serve_legacy_not_found_page() {
    let backend = MemoryBackend::new();
    let page = backend.add_file("<html>custom 404</html>");
    let dir = backend.add_directory([("object-404.html", page)]);
    let req = get(PATH_GATEWAY, &format!("/object/{dir}/a/b"))
        .header(ACCEPT, "text/html")
        .body(())
        .unwrap();
    let resp = service(&backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(body_text(resp).await.contains("custom 404"));
}

#[tokio::test]
async fn test_should_serve_dnslink_hosts() {
    let site = site();
    site.backend
        .set_dnslink("example.com", ContentPath::from_cid(&site.dir));
    let req = get("example.com", "/digits.txt").body(()).unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["x-object-path"],
        "/name/example.com/digits.txt"
    );
    assert!(resp.headers().contains_key("last-modified"));
    assert!(!resp.headers().contains_key(CACHE_CONTROL));
    assert_eq!(body_text(resp).await, "0123456789");
}

#[tokio::test]
async fn test_should_serve_naming_records() {
    let backend = MemoryBackend::new();
    let key = identity_cid(LIBP2P_KEY, b"test-key").unwrap();
    backend.put_naming_record(&key, &b"signed record"[..]);
    let req = get(PATH_GATEWAY, &format!("/name/{key}?format=ipns-record"))
        .body(())
        .unwrap();
    let resp = service(&backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[CONTENT_TYPE],
        "application/vnd.ipfs.ipns-record"
    );
    assert_eq!(body_text(resp).await, "signed record");
}

#[tokio::test]
async fn test_should_redirect_protocol_handler_uris() {
    let site = site();
    let svc = service(&site.backend);

    let uri = format!("/object/?uri=object%3A%2F%2F{}%2Fdigits.txt", site.dir);
    let resp = svc.handle(get(PATH_GATEWAY, &uri).body(()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        resp.headers()[LOCATION],
        format!("/object/{}/digits.txt", site.dir)
    );

    let resp = svc
        .handle(get(PATH_GATEWAY, "/object/?uri=https%3A%2F%2Fexample.com").body(()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_should_reject_invalid_paths() {
    let site = site();
    let resp = service(&site.backend)
        .handle(get(PATH_GATEWAY, "/object/not-a-cid").body(()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_should_point_superfluous_namespaces_at_corrected_path() {
    let site = site();
    let uri = format!("/object/object/{}", site.file);
    let resp = service(&site.backend)
        .handle(get(PATH_GATEWAY, &uri).body(()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(resp).await.contains(&format!("/object/{}", site.file)));
}

#[tokio::test]
async fn test_should_reject_plain_codecs_for_non_matching_blocks() {
    let site = site();
    let svc = service(&site.backend);

    let uri = format!("/object/{}?format=json", site.file);
    let resp = svc.handle(get(PATH_GATEWAY, &uri).body(()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(resp).await.contains("is not supported"));

    let uri = format!("/object/{}?format=cbor", site.file);
    let resp = svc.handle(get(PATH_GATEWAY, &uri).body(()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = get(PATH_GATEWAY, &format!("/object/{}", site.file))
        .header(ACCEPT, "application/json")
        .body(())
        .unwrap();
    let resp = svc.handle(req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_should_send_car_failure_trailer_over_http1() {
    let backend = MemoryBackend::new();
    let present = backend.add_file("present");
    let dir = backend.add_directory([
        ("present", present),
        ("gone", sha256_cid(RAW, b"never stored")),
    ]);
    let addr = serve_one_connection(service(&backend)).await;

    let raw = raw_get_with_trailers(addr, &format!("/object/{dir}?format=car")).await;
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("trailer: X-Stream-Error"));
    assert!(head.contains("transfer-encoding: chunked"));
    assert!(body.contains("0\r\nx-stream-error: "));
}

#[tokio::test]
async fn test_should_send_tar_failure_trailer_over_http1() {
    let backend = MemoryBackend::new();
    let file = backend.add_file("x");
    let dir = backend.add_directory([("ok.txt", file), ("..", file)]);
    let addr = serve_one_connection(service(&backend)).await;

    let raw = raw_get_with_trailers(addr, &format!("/object/{dir}?format=tar")).await;
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("trailer: X-Stream-Error"));
    assert!(body.contains("0\r\nx-stream-error: "));
    assert!(body.contains("refusing to archive"));
}

#[tokio::test]
async fn test_should_announce_stream_trailer_on_archives() {
    let site = site();
    let svc = service(&site.backend);
    for format in ["car", "tar"] {
        let uri = format!("/object/{}?format={format}", site.dir);
        let resp = svc.handle(get(PATH_GATEWAY, &uri).body(()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[TRAILER], "X-Stream-Error");
    }
}

#[tokio::test]
async fn test_should_apply_redirects_below_dnslink_sub_path() {
    let backend = MemoryBackend::new();
    let index = backend.add_file("<!doctype html><p>app shell</p>");
    let rules = backend.add_file("/* /index.html 200\n");
    let site = backend.add_directory([("_redirects", rules), ("index.html", index)]);
    let root = backend.add_directory([("site", site)]);
    backend.set_dnslink(
        "example.org",
        ContentPath::parse(&format!("/object/{root}/site")).unwrap(),
    );

    let resp = service(&backend)
        .handle(get("example.org", "/missing").body(()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_text(resp).await.contains("app shell"));
}

#[tokio::test]
async fn test_should_reject_zero_length_suffix_range() {
    let site = site();
    let req = get(PATH_GATEWAY, &format!("/object/{}", site.file))
        .header(RANGE, "bytes=-0")
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.headers()[CONTENT_RANGE], "bytes */10");
}

#[tokio::test]
async fn test_should_not_revalidate_across_formats() {
    let site = site();
    let svc = service(&site.backend);

    let req = get(PATH_GATEWAY, &format!("/object/{}/?format=car", site.dir))
        .header(IF_NONE_MATCH, dir_index_etag(&site.dir))
        .body(())
        .unwrap();
    let resp = svc.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[ETAG], format!("W/\"{}.car\"", site.dir));

    let req = get(PATH_GATEWAY, &format!("/object/{}?format=raw", site.file))
        .header(IF_NONE_MATCH, format!("\"{}\"", site.file))
        .body(())
        .unwrap();
    let resp = svc.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_should_keep_caching_headers_on_not_modified() {
    let site = site();
    let etag = format!("W/\"{}.car\"", site.dir);
    let req = get(PATH_GATEWAY, &format!("/object/{}?format=car", site.dir))
        .header(IF_NONE_MATCH, etag.as_str())
        .body(())
        .unwrap();
    let resp = service(&site.backend).handle(req).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(resp.headers()[ETAG], etag.as_str());
    assert!(
        resp.headers()[CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("immutable")
    );
    assert_eq!(resp.headers()["x-roots"], site.dir.to_string());
}
