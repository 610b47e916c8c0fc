// tests/openwebif_source.rs
//
// OpenWebif scraper against a local axum server standing in for a receiver.
//
// Covered:
// - bouquet filter, marker services skipped, basic auth sent
// - channel ids/display names/icons and programme details survive the XMLTV round trip
// - an unreachable receiver yields a failed fragment

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use epg_orchestrator::config::OpenWebifConfig;
use epg_orchestrator::sources::openwebif::OpenWebifSource;
use epg_orchestrator::sources::SourceAdapter;

const AUTH: &str = "Basic cm9vdDpwdw=="; // root:pw
const TV_REF: &str = "1:7:1:0:0:0:0:0:0:0:FROM BOUQUET \"userbouquet.favourites.tv\"";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == AUTH)
}

async fn bouquets(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "bouquets": [
            [TV_REF, "Favourites (TV)"],
            ["1:7:2:0:0:0:0:0:0:0:FROM BOUQUET \"userbouquet.radio\"", "Radio"]
        ]
    }))
    .into_response()
}

async fn services(Query(q): Query<HashMap<String, String>>) -> Response {
    assert_eq!(q.get("sRef").map(String::as_str), Some(TV_REF), "radio bouquet must be filtered out");
    Json(json!({
        "services": [
            { "servicereference": "1:64:0:0:0:0:0:0:0:0:", "servicename": "--- News ---", "program": 0, "pos": 0 },
            { "servicereference": "1:0:1:1001:", "servicename": "BBC One &amp; HD", "program": 1001, "pos": 1 },
            { "servicereference": "1:0:1:1002:", "servicename": "Film4", "program": 1002, "pos": 2 }
        ]
    }))
    .into_response()
}

async fn epg(Query(q): Query<HashMap<String, String>>) -> Response {
    let events = match q.get("sRef").map(String::as_str) {
        Some("1:0:1:1001:") => json!([
            {
                "title": "New: Heist",
                "shortdesc": "[Drama] The Job (S2 E5)",
                "longdesc": "A crew plans one last job.",
                "begin_timestamp": 1_709_287_200,
                "duration": 60,
                "picon": "/picon/1_0_1_3E9.png"
            },
            {
                "title": "News at Ten",
                "shortdesc": "[News] Headlines. E1",
                "longdesc": "",
                "begin_timestamp": 1_709_290_800,
                "duration": 30,
                "picon": "/picon/1_0_1_3E9.png"
            }
        ]),
        Some("1:0:1:1002:") => json!([
            {
                "title": "Old Film",
                "shortdesc": "[Movie] First shown 24/12/1999",
                "longdesc": "Classic.\nAnn Director\nBo Lead\nCy Support\n",
                "begin_timestamp": 1_709_287_200,
                "duration": 120
            }
        ]),
        _ => json!([]),
    };
    Json(json!({ "events": events })).into_response()
}

async fn fake_receiver() -> String {
    let app = Router::new()
        .route("/api/bouquets", get(bouquets))
        .route("/api/getservices", get(services))
        .route("/api/epgservice", get(epg));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn scrapes_receiver_into_fragment() {
    let base = fake_receiver().await;
    let cfg = OpenWebifConfig {
        url: format!("{base}/"),
        bouquet: Some("Favourites (TV)".to_string()),
        username: Some("root".to_string()),
        password: Some("pw".to_string()),
    };
    let dir = tempfile::tempdir().unwrap();
    let adapter = SourceAdapter::new(
        Box::new(OpenWebifSource::from_config("receiver", &cfg)),
        Duration::from_secs(10),
        dir.path(),
    );

    let frag = adapter.run(&CancellationToken::new()).await;
    assert!(frag.success, "{:?}", frag.error);
    let ids: Vec<_> = frag.channels.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["1001", "1002"]);

    let bbc = &frag.channels[0];
    assert_eq!(bbc.display_names, vec!["BBC One & HD", "1"]);
    assert_eq!(bbc.icon.as_deref(), Some(format!("{base}/picon/1_0_1_3E9.png").as_str()));
    assert_eq!(bbc.programmes.len(), 2);

    let heist = &bbc.programmes[0];
    assert_eq!(heist.title, "Heist");
    assert!(heist.is_new);
    assert_eq!(heist.sub_title.as_deref(), Some("The Job"));
    assert_eq!(heist.description.as_deref(), Some("A crew plans one last job."));
    assert_eq!(heist.categories, vec!["Drama"]);
    assert_eq!(heist.episode_nums[0].system, "xmltv_ns");
    assert_eq!(heist.episode_nums[0].value, "1.4.");
    assert_eq!((heist.stop - heist.start).num_minutes(), 60);
    assert_eq!(heist.length_minutes, Some(60));
    assert!(heist.credits.is_empty());

    let news = &bbc.programmes[1];
    assert!(news.episode_nums.is_empty());
    assert_eq!(news.description.as_deref(), Some("[News] Headlines. E1"));

    let film = &frag.channels[1];
    assert_eq!(film.icon, None);
    let old = &film.programmes[0];
    assert_eq!(old.categories, vec!["Movie"]);
    assert!(old.episode_nums.is_empty());
    assert_eq!(old.credits.directors, vec!["Ann Director"]);
    assert_eq!(old.credits.actors, vec!["Bo Lead", "Cy Support"]);
    assert_eq!(old.length_minutes, Some(120));
}

#[tokio::test]
async fn wrong_credentials_fail_the_fragment() {
    let base = fake_receiver().await;
    let cfg = OpenWebifConfig {
        url: base,
        bouquet: None,
        username: Some("root".to_string()),
        password: Some("wrong".to_string()),
    };
    let dir = tempfile::tempdir().unwrap();
    let adapter = SourceAdapter::new(
        Box::new(OpenWebifSource::from_config("receiver", &cfg)),
        Duration::from_secs(10),
        dir.path(),
    );
    let frag = adapter.run(&CancellationToken::new()).await;
    assert!(!frag.success);
    assert!(frag.error.unwrap().contains("401"));
}

#[tokio::test]
async fn unreachable_receiver_is_a_fetch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = SourceAdapter::new(
        Box::new(OpenWebifSource::new("receiver", "http://127.0.0.1:9")),
        Duration::from_secs(10),
        dir.path(),
    );
    let frag = adapter.run(&CancellationToken::new()).await;
    assert!(!frag.success);
    assert!(frag.error.unwrap().starts_with("fetch failed"));
}
