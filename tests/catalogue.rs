use cdse_fetch::retry::RetryPolicy;
use cdse_fetch::{
    download_feature, download_features, Catalogue, Credentials, DownloadOptions, Error,
    ErrorKind, Outcome, SearchTerms, Settings,
};
use mockito::{Matcher, Server};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use url::Url;

const SEARCH_PATH: &str = "/resto/api/collections/Sentinel2/search.json";

fn settings_for(server: &Server) -> Settings {
    let mut settings = Settings::default()
        .with_base_url(&Url::parse(&server.url()).unwrap())
        .unwrap();
    settings.retry = RetryPolicy::immediate(3);
    settings
}

fn record(base: &str, id: &str) -> serde_json::Value {
    json!({
        "type": "Feature",
        "id": id,
        "properties": {
            "title": format!("S2A_MSIL1C_{}.SAFE", id),
            "collection": "SENTINEL-2",
            "services": {
                "download": {"url": format!("{}/odata/v1/Products({})/$value", base, id)}
            }
        }
    })
}

fn page_body(base: &str, ids: &[&str], total: usize) -> String {
    json!({
        "type": "FeatureCollection",
        "properties": {"totalResults": total, "itemsPerPage": ids.len()},
        "features": ids.iter().map(|id| record(base, id)).collect::<Vec<_>>(),
    })
    .to_string()
}

fn mock_page(server: &mut Server, max_records: &str, page: &str, body: String) -> mockito::Mock {
    server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("maxRecords".into(), max_records.into()),
            Matcher::UrlEncoded("page".into(), page.into()),
            Matcher::UrlEncoded("startDate".into(), "1999-01-01".into()),
            Matcher::UrlEncoded("processingLevel".into(), "S2MSI1C".into()),
        ]))
        .with_body(body)
}

fn scenario_terms(max_records: &str) -> SearchTerms {
    SearchTerms::new()
        .with("startDate", "1999-01-01")
        .with("processingLevel", "S2MSI1C")
        .with("maxRecords", max_records)
}

fn collect_ids(catalogue: &Catalogue, terms: &SearchTerms) -> Vec<String> {
    catalogue
        .query_features("Sentinel2", terms)
        .unwrap()
        .map(|feature| feature.unwrap().id)
        .collect()
}

fn mock_token(server: &mut Server, grant: &str, access: &str) -> mockito::Mock {
    server
        .mock("POST", "/auth/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), grant.into()))
        .with_body(
            json!({
                "access_token": access,
                "expires_in": 600,
                "refresh_token": "refresh-1",
                "refresh_expires_in": 3600,
            })
            .to_string(),
        )
}

fn download_options(settings: Settings, concurrency: usize) -> DownloadOptions {
    let credentials = Credentials::new("user", "pass", &settings).unwrap();
    DownloadOptions {
        credentials: Some(Arc::new(credentials)),
        concurrency,
        settings,
        ..DownloadOptions::default()
    }
}

fn feature(base: &str, id: &str) -> cdse_fetch::Feature {
    serde_json::from_value(record(base, id)).unwrap()
}

fn asset_path(id: &str) -> String {
    format!("/odata/v1/Products({})/$value", id)
}

fn archive(dest: &Path, id: &str) -> std::path::PathBuf {
    dest.join(format!("S2A_MSIL1C_{}.SAFE.zip", id))
}

#[test]
fn test_pages_are_fetched_lazily_and_in_order() {
    let mut server = Server::new();
    let base = server.url();
    let ids = ["r1", "r2", "r3", "r4", "r5"];
    let pages = [
        mock_page(&mut server, "2", "1", page_body(&base, &ids[0..2], 5))
            .expect(1)
            .create(),
        mock_page(&mut server, "2", "2", page_body(&base, &ids[2..4], 5))
            .expect(1)
            .create(),
        mock_page(&mut server, "2", "3", page_body(&base, &ids[4..5], 5))
            .expect(1)
            .create(),
    ];

    let catalogue = Catalogue::new(&settings_for(&server)).unwrap();
    let mut query = catalogue
        .query_features("Sentinel2", &scenario_terms("2"))
        .unwrap();

    let mut seen = Vec::new();
    while query.has_next().unwrap() {
        seen.push(query.next().unwrap().unwrap().id);
        // Never more than one page ahead of the consumer
        assert!(query.pages_fetched() <= seen.len().div_ceil(2) + 1);
    }
    assert_eq!(seen, ids);
    assert_eq!(query.pages_fetched(), 3);
    for page in pages {
        page.assert();
    }
}

#[test]
fn test_small_pages_match_single_page() {
    let mut server = Server::new();
    let base = server.url();
    let ids = ["r1", "r2", "r3", "r4", "r5"];
    mock_page(&mut server, "2", "1", page_body(&base, &ids[0..2], 5)).create();
    mock_page(&mut server, "2", "2", page_body(&base, &ids[2..4], 5)).create();
    mock_page(&mut server, "2", "3", page_body(&base, &ids[4..5], 5)).create();
    mock_page(&mut server, "2000", "1", page_body(&base, &ids, 5)).create();

    let catalogue = Catalogue::new(&settings_for(&server)).unwrap();
    let paged = collect_ids(&catalogue, &scenario_terms("2"));
    let whole = collect_ids(&catalogue, &scenario_terms("2000"));
    assert_eq!(paged, whole);
    assert_eq!(paged.len(), 5);
}

#[test]
fn test_fresh_query_repeats_results() {
    let mut server = Server::new();
    let base = server.url();
    let ids = ["r1", "r2", "r3"];
    let first = mock_page(&mut server, "2", "1", page_body(&base, &ids[0..2], 3))
        .expect(2)
        .create();
    let second = mock_page(&mut server, "2", "2", page_body(&base, &ids[2..3], 3))
        .expect(2)
        .create();

    let catalogue = Catalogue::new(&settings_for(&server)).unwrap();
    let terms = scenario_terms("2");
    assert_eq!(collect_ids(&catalogue, &terms), collect_ids(&catalogue, &terms));
    first.assert();
    second.assert();
}

#[test]
fn test_out_of_range_max_records_rejected_before_request() {
    let mut server = Server::new();
    let any = server.mock("GET", Matcher::Any).expect(0).create();

    let catalogue = Catalogue::new(&settings_for(&server)).unwrap();
    let result = catalogue.query_features("Sentinel2", &scenario_terms("2001"));
    assert!(matches!(result, Err(Error::InvalidSearchTerms(_))));
    any.assert();
}

#[test]
fn test_describe_unknown_collection() {
    let mut server = Server::new();
    let describe = server
        .mock("GET", "/resto/api/collections/UnknownX/describe.xml")
        .with_status(404)
        .expect(1)
        .create();

    let catalogue = Catalogue::new(&settings_for(&server)).unwrap();
    let err = catalogue.describe_collection("UnknownX").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownCollection);
    describe.assert();
}

#[test]
fn test_download_is_idempotent() {
    let mut server = Server::new();
    let base = server.url();
    let token = mock_token(&mut server, "password", "token-1").expect(1).create();
    let asset = server
        .mock("GET", asset_path("a1").as_str())
        .with_body("product")
        .expect(1)
        .create();

    let dest = tempfile::tempdir().unwrap();
    let options = download_options(settings_for(&server), 1);
    let feature = feature(&base, "a1");

    let first = download_feature(&feature, dest.path(), &options);
    assert_eq!(first.outcome, Outcome::Downloaded(archive(dest.path(), "a1")));
    let second = download_feature(&feature, dest.path(), &options);
    assert_eq!(second.outcome, Outcome::Skipped(archive(dest.path(), "a1")));

    token.assert();
    asset.assert();
}

#[test]
fn test_pool_of_four_over_ten_features() {
    let mut server = Server::new();
    let base = server.url();
    let token = mock_token(&mut server, "password", "token-1").expect(1).create();
    server
        .mock("GET", Matcher::Regex(r"^/odata/v1/Products\(f\d+\)/\$value$".to_string()))
        .with_body("product")
        .expect(10)
        .create();

    let ids: Vec<String> = (0..10).map(|i| format!("f{}", i)).collect();
    let features: Vec<_> = ids.iter().map(|id| feature(&base, id)).collect();
    let dest = tempfile::tempdir().unwrap();

    let results: Vec<_> = download_features(
        features,
        dest.path(),
        download_options(settings_for(&server), 4),
    )
    .unwrap()
    .collect();

    assert_eq!(results.len(), 10);
    let unique: HashSet<&str> = results.iter().map(|r| r.feature_id.as_str()).collect();
    assert_eq!(unique.len(), 10);
    assert_eq!(unique, ids.iter().map(String::as_str).collect());
    for id in &ids {
        assert!(archive(dest.path(), id).exists());
    }
    token.assert();
}

#[test]
fn test_expired_token_is_refreshed_once() {
    let mut server = Server::new();
    let base = server.url();
    mock_token(&mut server, "password", "token-1").expect(1).create();
    let refresh = mock_token(&mut server, "refresh_token", "token-2")
        .expect(1)
        .create();
    let rejected = server
        .mock("GET", asset_path("a1").as_str())
        .match_header("authorization", "Bearer token-1")
        .with_status(401)
        .expect(1)
        .create();
    let accepted = server
        .mock("GET", asset_path("a1").as_str())
        .match_header("authorization", "Bearer token-2")
        .with_body("product")
        .expect(1)
        .create();

    let dest = tempfile::tempdir().unwrap();
    let options = download_options(settings_for(&server), 1);
    let result = download_feature(&feature(&base, "a1"), dest.path(), &options);

    assert!(result.is_success(), "{}", result);
    refresh.assert();
    rejected.assert();
    accepted.assert();
}

#[test]
fn test_not_found_is_isolated() {
    let mut server = Server::new();
    let base = server.url();
    mock_token(&mut server, "password", "token-1").create();
    let missing = server
        .mock("GET", asset_path("gone").as_str())
        .with_status(404)
        .expect(1)
        .create();
    server
        .mock("GET", Matcher::Regex(r"^/odata/v1/Products\(ok\d\)/\$value$".to_string()))
        .with_body("product")
        .expect(3)
        .create();

    let features: Vec<_> = ["ok1", "gone", "ok2", "ok3"]
        .iter()
        .map(|id| feature(&base, id))
        .collect();
    let dest = tempfile::tempdir().unwrap();
    let results: Vec<_> = download_features(
        features,
        dest.path(),
        download_options(settings_for(&server), 2),
    )
    .unwrap()
    .collect();

    let failures: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
    assert_eq!(results.len(), 4);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].feature_id, "gone");
    assert_eq!(failures[0].error_kind(), Some(ErrorKind::DownloadFailed));
    assert!(archive(dest.path(), "ok3").exists());
    missing.assert();
}

#[test]
fn test_query_feeds_download() {
    let mut server = Server::new();
    let base = server.url();
    mock_token(&mut server, "password", "token-1").create();
    let ids = ["r1", "r2", "r3"];
    mock_page(&mut server, "2", "1", page_body(&base, &ids[0..2], 3)).create();
    mock_page(&mut server, "2", "2", page_body(&base, &ids[2..3], 3)).create();
    server
        .mock("GET", Matcher::Regex(r"^/odata/v1/Products\(r\d\)/\$value$".to_string()))
        .with_body("product")
        .expect(3)
        .create();

    let settings = settings_for(&server);
    let catalogue = Catalogue::new(&settings).unwrap();
    let query = catalogue
        .query_features("Sentinel2", &scenario_terms("2"))
        .unwrap();
    let dest = tempfile::tempdir().unwrap();

    let mut downloaded: Vec<String> = download_features(
        query.map(|feature| feature.unwrap()),
        dest.path(),
        download_options(settings, 2),
    )
    .unwrap()
    .map(|r| r.feature_id)
    .collect();
    downloaded.sort();
    assert_eq!(downloaded, ids);
}
