use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use predicates::prelude::*;

mod openai_stub;

static PHOTO_JPG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0xFF, 0xD9];

fn spawn_site_server() -> (String, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let addr = server.server_addr();
    let base_url = format!("http://{addr}");

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };

            enum Body {
                Html(&'static str),
                Bytes(&'static [u8]),
            }

            let (status, body) = match request.url() {
                "/search" | "/search?page=1" => (
                    200,
                    Body::Html(
                        r#"<!doctype html>
<html><body>
  <h2>Results</h2>
  <article class="card"><a href="/listing/1">Sunny flat</a></article>
  <article class="card"><a href="/listing/2#top">Loft</a></article>
</body></html>
"#,
                    ),
                ),
                "/search?page=2" => (
                    200,
                    Body::Html(
                        r#"<!doctype html>
<html><body>
  <article class="card"><a href="/listing/3">Broken</a></article>
  <article class="card"><a href="/listing/1">Sunny flat (again)</a></article>
</body></html>
"#,
                    ),
                ),
                "/search?page=3" => (
                    200,
                    Body::Html(
                        r#"<!doctype html>
<html><body>
  <article class="card"><a href="/listing/3">Broken</a></article>
</body></html>
"#,
                    ),
                ),
                "/listing/1" => (
                    200,
                    Body::Html(
                        r#"<!doctype html>
<html><body>
  <h1>Sunny flat</h1>
  <div class="price">125 000 €</div>
  <div class="description">Bright two-room flat.</div>
  <div class="gallery"><img src="/img/a.jpg"><img src="/img/missing.jpg"></div>
</body></html>
"#,
                    ),
                ),
                "/listing/2" => (
                    200,
                    Body::Html(
                        r#"<!doctype html>
<html><body>
  <h1>Loft</h1>
  <div class="price">99 000 €</div>
  <div class="gallery"><img src="/img/b.jpg"></div>
</body></html>
"#,
                    ),
                ),
                "/img/a.jpg" | "/img/b.jpg" => (200, Body::Bytes(PHOTO_JPG)),
                "/listing/3" => (500, Body::Html("internal error")),
                _ => (404, Body::Html("not found")),
            };

            let response = match body {
                Body::Html(text) => {
                    let header = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/html; charset=utf-8"[..],
                    )
                    .expect("build header");
                    tiny_http::Response::from_data(text.as_bytes().to_vec()).with_header(header)
                }
                Body::Bytes(bytes) => {
                    let header =
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"image/jpeg"[..])
                            .expect("build header");
                    tiny_http::Response::from_data(bytes.to_vec()).with_header(header)
                }
            };
            let _ = request.respond(response.with_status_code(status));
        }
    });

    (base_url, shutdown_tx, handle)
}

fn write_config(dir: &Path) -> String {
    let path = dir.join("sites.json");
    fs::write(
        &path,
        r#"[
  {
    "website": "127.0.0.1",
    "fields": {
      "Название": {"xpath": "//h1/text()"},
      "Цена": {"xpath": ".price", "transform": "digits"},
      "Описание": {"xpath": ".description"},
      "Фото_ссылки": {"xpath": null},
      "Фото_уникальные_названия": {"xpath": "//div[@class='gallery']/img/@src"}
    },
    "listPageCheck": "article.card a",
    "pageQuery": "page",
    "wait_time": 0
  }
]"#,
    )
    .expect("write config");
    path.to_string_lossy().to_string()
}

fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).expect("open csv");
    let headers = reader
        .headers()
        .expect("csv headers")
        .iter()
        .map(str::to_owned)
        .collect();
    let rows = reader
        .records()
        .map(|row| row.expect("csv row").iter().map(str::to_owned).collect())
        .collect();
    (headers, rows)
}

#[test]
fn harvest_follows_pages_and_fills_gaps_once_per_listing() {
    let (base_url, shutdown_tx, handle) = spawn_site_server();
    let openai = openai_stub::OpenAiStub::spawn(HashMap::from([
        ("Описание".to_owned(), "Loft with terrace.".to_owned()),
        ("Цена".to_owned(), "1".to_owned()),
    ]));

    let temp = tempfile::TempDir::new().expect("create temp dir");
    let configs = write_config(temp.path());
    let out = temp.path().join("out/properties.csv");
    let assets = temp.path().join("images");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("listingharvest");
    cmd.env("OPENAI_API_KEY", "test-key")
        .args([
            "harvest",
            "--url",
            &format!("{base_url}/search?page=1"),
            "--configs",
            &configs,
            "--out",
            out.to_string_lossy().as_ref(),
            "--format",
            "csv",
            "--assets",
            assets.to_string_lossy().as_ref(),
            "--engine",
            "openai",
            "--openai-base-url",
            &openai.base_url,
            "--openai-model",
            "stub-model",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 records"))
        .stderr(predicate::str::contains("/listing/3"));

    let (headers, rows) = read_csv(&out);
    assert_eq!(
        headers,
        vec![
            "source_url",
            "Название",
            "Цена",
            "Описание",
            "Фото_ссылки",
            "Фото_уникальные_названия"
        ]
    );
    assert_eq!(rows.len(), 2);

    let sunny = &rows[0];
    assert_eq!(sunny[0], format!("{base_url}/listing/1"));
    assert_eq!(sunny[1], "Sunny flat");
    assert_eq!(sunny[2], "125000");
    assert_eq!(sunny[3], "Bright two-room flat.");
    assert_eq!(sunny[4], format!("{base_url}/img/a.jpg"));
    assert!(sunny[5].ends_with("_a.jpg"), "{}", sunny[5]);
    assert!(!sunny[5].contains(';'));

    let loft = &rows[1];
    assert_eq!(loft[0], format!("{base_url}/listing/2"));
    assert_eq!(loft[2], "99000");
    assert_eq!(loft[3], "Loft with terrace.");
    assert!(loft[5].ends_with("_b.jpg"), "{}", loft[5]);

    for name in [&sunny[5], &loft[5]] {
        assert_eq!(fs::read(assets.join(name)).expect("read photo"), PHOTO_JPG);
    }

    assert_eq!(openai.calls(), 1);
    assert_eq!(openai.requested(), vec![vec!["Описание".to_owned()]]);

    let _ = shutdown_tx.send(());
    handle.join().expect("join server thread");
}

#[test]
fn detail_mode_without_engine_leaves_error_cells() {
    let (base_url, shutdown_tx, handle) = spawn_site_server();
    let temp = tempfile::TempDir::new().expect("create temp dir");
    let configs = write_config(temp.path());
    let out = temp.path().join("detail.csv");
    let assets = temp.path().join("images");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("listingharvest");
    cmd.args([
        "harvest",
        "--url",
        &format!("{base_url}/listing/2"),
        "--configs",
        &configs,
        "--out",
        out.to_string_lossy().as_ref(),
        "--format",
        "csv",
        "--assets",
        assets.to_string_lossy().as_ref(),
        "--engine",
        "noop",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("1 records, 1 ERROR cells"));

    let (_, rows) = read_csv(&out);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], "Loft");
    assert_eq!(rows[0][3], "ERROR");

    let mut again = assert_cmd::cargo::cargo_bin_cmd!("listingharvest");
    again
        .args([
            "harvest",
            "--url",
            &format!("{base_url}/listing/2"),
            "--configs",
            &configs,
            "--out",
            out.to_string_lossy().as_ref(),
            "--engine",
            "noop",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    let _ = shutdown_tx.send(());
    handle.join().expect("join server thread");
}

#[test]
fn default_export_is_an_xlsx_workbook() {
    let (base_url, shutdown_tx, handle) = spawn_site_server();
    let temp = tempfile::TempDir::new().expect("create temp dir");
    let configs = write_config(temp.path());
    let out = temp.path().join("detail.xlsx");
    let assets = temp.path().join("images");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("listingharvest");
    cmd.args([
        "harvest",
        "--url",
        &format!("{base_url}/listing/2"),
        "--configs",
        &configs,
        "--out",
        out.to_string_lossy().as_ref(),
        "--assets",
        assets.to_string_lossy().as_ref(),
        "--engine",
        "noop",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("1 records, 1 ERROR cells"));

    let bytes = fs::read(&out).expect("read workbook");
    assert!(bytes.starts_with(b"PK"), "xlsx is a zip container");

    let _ = shutdown_tx.send(());
    handle.join().expect("join server thread");
}

#[test]
fn unknown_site_is_rejected() {
    let temp = tempfile::TempDir::new().expect("create temp dir");
    let configs = write_config(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("listingharvest");
    cmd.args([
        "harvest",
        "--url",
        "https://unknown.example/search",
        "--configs",
        &configs,
        "--engine",
        "noop",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("no site config matches"));
}
