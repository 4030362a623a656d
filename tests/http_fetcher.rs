//! HttpFetcher and sitemap enumeration against an in-process site.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use tempfile::TempDir;

use campus_kb::config::{load_config, Config};
use campus_kb::error::{EnumerationError, ExtractionError, FetchError};
use campus_kb::fetch::{HttpFetcher, SourceFetcher};
use campus_kb::models::SourceType;
use campus_kb::sitemap::{SitemapSources, SourceEnumerator};

#[derive(Default)]
struct Site {
    base: String,
    flaky_hits: AtomicUsize,
    missing_hits: AtomicUsize,
}

const FEES_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Fees and Charges</title><script>var tracking = 1;</script></head>
<body>
<nav><a href="/">Home</a> <a href="/menu">Menu</a></nav>
<main>
<h1>Fees and Charges</h1>
<p>Tuition is charged per unit of study.</p>
<p>See the <a href="/files/guide.pdf">fee guide</a> and the
<a href="https://elsewhere.example.com/files/other.pdf">partner guide</a>.</p>
</main>
<footer>Copyright notice</footer>
</body>
</html>"#;

/// Minimal one-page PDF whose content stream shows `phrase`. Offsets and
/// the stream length are computed so pdf-extract can parse it.
fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            stream.len(),
            stream
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

async fn flaky(State(site): State<Arc<Site>>) -> Response {
    if site.flaky_hits.fetch_add(1, Ordering::SeqCst) < 2 {
        (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
    } else {
        Html(FEES_PAGE).into_response()
    }
}

async fn missing(State(site): State<Arc<Site>>) -> Response {
    site.missing_hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "no such page").into_response()
}

async fn sitemap_index(State(site): State<Arc<Site>>) -> Response {
    let body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>{base}/sitemap-pages.xml</loc></sitemap>
  <sitemap><loc>https://elsewhere.example.com/sitemap.xml</loc></sitemap>
</sitemapindex>"#,
        base = site.base
    );
    ([(CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn sitemap_pages(State(site): State<Arc<Site>>) -> Response {
    let body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>{base}/students/fees</loc></url>
  <url><loc>{base}/about/history</loc></url>
  <url><loc>{base}/students/fees</loc></url>
  <url><loc>https://elsewhere.example.com/students/visa</loc></url>
  <url><loc>{base}/study/courses</loc></url>
</urlset>"#,
        base = site.base
    );
    ([(CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn sitemap_unrelated(State(site): State<Arc<Site>>) -> Response {
    let body = format!(
        r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>{base}/about/history</loc></url>
</urlset>"#,
        base = site.base
    );
    ([(CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn spawn_site() -> Arc<Site> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let site = Arc::new(Site {
        base: format!("http://{}", addr),
        ..Default::default()
    });

    let app = Router::new()
        .route("/page", get(|| async { Html(FEES_PAGE) }))
        .route("/flaky", get(flaky))
        .route("/missing", get(missing))
        .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
        .route(
            "/away",
            get(|| async { Redirect::temporary("http://off-site.invalid/landing") }),
        )
        .route("/moved", get(|| async { Redirect::permanent("/page") }))
        .route(
            "/files/guide.pdf",
            get(|| async { ([(CONTENT_TYPE, "application/pdf")], minimal_pdf("campus guide phrase")) }),
        )
        .route(
            "/notes",
            get(|| async { ([(CONTENT_TYPE, "text/plain; charset=utf-8")], "Plain notes for students.") }),
        )
        .route(
            "/logo",
            get(|| async { ([(CONTENT_TYPE, "image/png")], vec![0x89u8, b'P', b'N', b'G']) }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        )
        .route("/sitemap.xml", get(sitemap_index))
        .route("/sitemap-pages.xml", get(sitemap_pages))
        .route("/sitemap-unrelated.xml", get(sitemap_unrelated))
        .with_state(site.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    site
}

fn site_config(tmp: &TempDir, site: &Site, fetch_section: &str) -> Config {
    let path = tmp.path().join("kb.toml");
    std::fs::write(
        &path,
        format!(
            r#"[db]
path = "{root}/kb.sqlite"

[site]
base_url = "{base}"
urls = ["{base}/page"]

[fetch]
{fetch_section}
"#,
            root = tmp.path().display(),
            base = site.base,
        ),
    )
    .unwrap();
    load_config(&path).unwrap()
}

fn fetcher(tmp: &TempDir, site: &Site) -> HttpFetcher {
    let config = site_config(
        tmp,
        site,
        "timeout_secs = 5\nmax_retries = 3\nbackoff_base_ms = 10\nmin_delay_ms = 0",
    );
    HttpFetcher::from_config(&config).unwrap()
}

#[tokio::test]
async fn html_page_is_extracted_with_title_and_on_site_pdf_links() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let doc = fetcher(&tmp, &site)
        .fetch(&format!("{}/page", site.base))
        .await
        .unwrap();

    assert_eq!(doc.source_type, SourceType::Page);
    assert_eq!(doc.title, "Fees and Charges");
    assert!(doc.text.contains("Tuition is charged per unit of study."));
    assert!(!doc.text.contains("tracking"));
    assert!(!doc.text.contains("Copyright notice"));
    assert_eq!(doc.linked_pdfs, vec![format!("{}/files/guide.pdf", site.base)]);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let doc = fetcher(&tmp, &site)
        .fetch(&format!("{}/flaky", site.base))
        .await
        .unwrap();
    assert_eq!(doc.title, "Fees and Charges");
    assert_eq!(site.flaky_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let url = format!("{}/missing", site.base);
    let err = fetcher(&tmp, &site).fetch(&url).await.unwrap_err();
    assert_eq!(err, FetchError::NotFound { url, status: 404 });
    assert_eq!(site.missing_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forbidden_status_is_reported_as_forbidden() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let err = fetcher(&tmp, &site)
        .fetch(&format!("{}/forbidden", site.base))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Forbidden { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn off_site_redirect_is_refused_and_on_site_redirect_followed() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let fetcher = fetcher(&tmp, &site);

    let err = fetcher.fetch(&format!("{}/away", site.base)).await.unwrap_err();
    assert!(matches!(err, FetchError::Forbidden { .. }), "got {:?}", err);

    let doc = fetcher.fetch(&format!("{}/moved", site.base)).await.unwrap();
    assert_eq!(doc.url, format!("{}/moved", site.base));
    assert_eq!(doc.title, "Fees and Charges");
}

#[tokio::test]
async fn pdf_text_is_marked_by_page() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let doc = fetcher(&tmp, &site)
        .fetch(&format!("{}/files/guide.pdf", site.base))
        .await
        .unwrap();
    assert_eq!(doc.source_type, SourceType::Pdf);
    assert_eq!(doc.title, "guide");
    assert!(doc.text.starts_with("[page 1]"), "got {:?}", doc.text);
    assert!(doc.text.contains("guide"));
}

#[tokio::test]
async fn plain_text_is_accepted_and_images_are_not() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let fetcher = fetcher(&tmp, &site);

    let notes = fetcher.fetch(&format!("{}/notes", site.base)).await.unwrap();
    assert_eq!(notes.text, "Plain notes for students.");
    assert_eq!(notes.title, "notes");

    let err = fetcher.fetch(&format!("{}/logo", site.base)).await.unwrap_err();
    match err {
        FetchError::Extraction { ref source, .. } => {
            assert!(matches!(source, ExtractionError::UnsupportedContentType(_)));
        }
        other => panic!("expected extraction failure, got {:?}", other),
    }
    assert_eq!(err.kind(), "corrupt_document");
}

#[tokio::test]
async fn slow_response_times_out() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let config = site_config(
        &tmp,
        &site,
        "timeout_secs = 1\nmax_retries = 0\nmin_delay_ms = 0",
    );
    let fetcher = HttpFetcher::from_config(&config).unwrap();
    let err = fetcher.fetch(&format!("{}/slow", site.base)).await.unwrap_err();
    assert!(matches!(err, FetchError::Timeout { .. }), "got {:?}", err);
    assert!(err.is_transient());
}

#[tokio::test]
async fn sitemap_index_is_followed_and_filtered() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let fetcher = Arc::new(fetcher(&tmp, &site));
    let config = site_config(&tmp, &site, "min_delay_ms = 0");

    let sources = SitemapSources::new(
        fetcher,
        format!("{}/sitemap.xml", site.base),
        &config.site,
    );
    let urls = sources.enumerate().await.unwrap();
    assert_eq!(
        urls,
        vec![
            format!("{}/students/fees", site.base),
            format!("{}/study/courses", site.base),
        ]
    );
}

#[tokio::test]
async fn sitemap_without_keyword_matches_falls_back_to_configured_urls() {
    let tmp = TempDir::new().unwrap();
    let site = spawn_site().await;
    let fetcher = Arc::new(fetcher(&tmp, &site));
    let config = site_config(&tmp, &site, "min_delay_ms = 0");

    let sources = SitemapSources::new(
        fetcher.clone(),
        format!("{}/sitemap-unrelated.xml", site.base),
        &config.site,
    );
    assert_eq!(
        sources.enumerate().await.unwrap(),
        vec![format!("{}/page", site.base)]
    );

    let broken = SitemapSources::new(fetcher, format!("{}/missing", site.base), &config.site);
    assert!(matches!(
        broken.enumerate().await,
        Err(EnumerationError::Unreachable(FetchError::NotFound { .. }))
    ));
}
