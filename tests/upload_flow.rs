use actix_web::{http::StatusCode, test, web, App};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use policy_drive::api;
use policy_drive::app_state::{AppState, ProviderClients};
use policy_drive::config::AppConfig;
use policy_drive::credential::qiniu::sign_request;
use policy_drive::credential::remote::bearer;
use policy_drive::metadata::Group;
use policy_drive::policy::{BackendKind, StoragePolicy};

const MIB: u64 = 1024 * 1024;

fn test_config() -> AppConfig {
    let mut local = StoragePolicy::local(1, "local");
    local.chunk_size = 4;
    local.allowed_origin = Some("https://app.drive.test".into());

    let mut qiniu = StoragePolicy::local(2, "kodo");
    qiniu.kind = BackendKind::Qiniu;
    qiniu.bucket = "media".into();
    qiniu.access_key = "qiniu-ak".into();
    qiniu.secret = "qiniu-sk".into();

    let mut remote = StoragePolicy::local(3, "node");
    remote.kind = BackendKind::Remote;
    remote.endpoint = "http://node.test".into();
    remote.secret = "node-secret".into();
    remote.upload_window_secs = 1;

    let mut config = AppConfig::default();
    config.server.public_base_url = "http://drive.test".into();
    config.policies = vec![local, qiniu, remote];
    config.groups = vec![Group { id: 1, name: "default".into(), max_storage: 5 * MIB, policy_ids: vec![1, 2, 3] }];
    config
}

fn setup() -> (AppState, TempDir) {
    let scratch = TempDir::new().unwrap();
    let state = AppState::new_for_testing(test_config(), scratch.path(), ProviderClients::offline()).unwrap();
    (state, scratch)
}

fn token_request(policy_id: i64, path: &str, size: u64) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/upload/token")
        .insert_header(("User", "7"))
        .set_json(json!({ "policyId": policy_id, "path": path, "size": size }))
}

#[actix_web::test]
async fn test_local_chunked_upload() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;

    let resp = test::call_service(&app, token_request(1, "/notes.txt", 10).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "https://app.drive.test");
    let issued: Value = test::read_body_json(resp).await;
    assert_eq!(issued["credential"]["type"], "local_chunk");
    let sid = issued["sessionId"].as_str().unwrap().to_string();

    // Out of order, chunk 1 retried with different bytes: last write wins.
    for (index, data) in [(1, "XXXX"), (0, "abcd"), (1, "efgh"), (2, "ij")] {
        let req = test::TestRequest::put()
            .uri(&format!("/upload/chunk/{}/{}?total=3", sid, index))
            .insert_header(("User", "7"))
            .set_payload(data)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    let req = test::TestRequest::post()
        .uri(&format!("/upload/finalize/{}", sid))
        .insert_header(("User", "7"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let file: Value = test::read_body_json(resp).await;
    assert_eq!(file["name"], "notes.txt");
    assert_eq!(file["size"], 10);
    assert!(file.get("backendKey").is_none());

    let req = test::TestRequest::get()
        .uri("/files/content?path=/notes.txt")
        .insert_header(("User", "7"))
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(&body[..], b"abcdefghij");

    let req = test::TestRequest::get().uri("/user/quota").insert_header(("User", "7")).to_request();
    let quota: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(quota["used"], 10);
    assert_eq!(quota["reserved"], 0);

    // Someone else cannot finalize or see it.
    let req = test::TestRequest::post()
        .uri(&format!("/upload/finalize/{}", sid))
        .insert_header(("User", "8"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_upload_over_quota_is_refused() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;

    let resp = test::call_service(&app, token_request(1, "/big.iso", 10 * MIB).to_request()).await;
    assert_eq!(resp.status(), StatusCode::INSUFFICIENT_STORAGE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "quota_exceeded");

    let usage = state.store.quota_usage(7).unwrap();
    assert_eq!((usage.used, usage.reserved), (0, 0));

    // Missing identity is a client error, not a crash.
    let req = test::TestRequest::post()
        .uri("/upload/token")
        .set_json(json!({ "policyId": 1, "path": "/a", "size": 1 }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_expired_session_is_swept_and_slot_reused() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;

    let resp = test::call_service(&app, token_request(1, "/report.pdf", MIB).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // The slot is held by the live session.
    let resp = test::call_service(&app, token_request(1, "/report.pdf", MIB).to_request()).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let report = state.sweeper.run_once(Utc::now() + Duration::hours(2)).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(state.store.quota_usage(7).unwrap().reserved, 0);

    let resp = test::call_service(&app, token_request(1, "/report.pdf", MIB).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_provider_callback_commits_once() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;

    let resp = test::call_service(&app, token_request(2, "/photo.jpg", 5).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let issued: Value = test::read_body_json(resp).await;
    assert_eq!(issued["credential"]["type"], "form_post");
    let sid = issued["sessionId"].as_str().unwrap().to_string();
    let key = state.store.get_pending(&sid).unwrap().unwrap().backend_key;

    let path = format!("/callback/qiniu/2/{}", sid);
    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("key", &key)
        .append_pair("fsize", "5")
        .append_pair("hash", "FhQx")
        .finish();
    let policy = state.coordinator.registry().resolve(2).unwrap();
    let authorization = sign_request(&policy, &path, body.as_bytes()).unwrap();
    let callback = || {
        test::TestRequest::post()
            .uri(&path)
            .insert_header(("Authorization", authorization.clone()))
            .insert_header(("Content-Type", "application/x-www-form-urlencoded"))
            .set_payload(body.clone())
            .to_request()
    };

    let first: Value = test::call_and_read_body_json(&app, callback()).await;
    assert_eq!(first["code"], 0);
    assert_eq!(first["data"]["name"], "photo.jpg");

    // Provider retry: same answer, nothing applied twice.
    let second: Value = test::call_and_read_body_json(&app, callback()).await;
    assert_eq!(second["data"]["id"], first["data"]["id"]);
    let usage = state.store.quota_usage(7).unwrap();
    assert_eq!((usage.used, usage.reserved), (5, 0));

    // Forged signature.
    let req = test::TestRequest::post()
        .uri(&path)
        .insert_header(("Authorization", "QBox qiniu-ak:Zm9yZ2Vk"))
        .insert_header(("Content-Type", "application/x-www-form-urlencoded"))
        .set_payload(body.clone())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_callback_over_quota_is_final() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;

    let resp = test::call_service(&app, token_request(2, "/movie.mkv", 5).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("access-control-allow-origin").is_none());
    let issued: Value = test::read_body_json(resp).await;
    let sid = issued["sessionId"].as_str().unwrap().to_string();
    let key = state.store.get_pending(&sid).unwrap().unwrap().backend_key;

    // The provider stored far more than was declared.
    let path = format!("/callback/qiniu/2/{}", sid);
    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("key", &key)
        .append_pair("fsize", &(6 * MIB).to_string())
        .finish();
    let policy = state.coordinator.registry().resolve(2).unwrap();
    let authorization = sign_request(&policy, &path, body.as_bytes()).unwrap();
    let req = test::TestRequest::post()
        .uri(&path)
        .insert_header(("Authorization", authorization))
        .insert_header(("Content-Type", "application/x-www-form-urlencoded"))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let rejected: Value = test::read_body_json(resp).await;
    assert_eq!(rejected["error"], "quota_exceeded");

    let pending = state.store.get_pending(&sid).unwrap().unwrap();
    assert_eq!(pending.status.to_string(), "aborted");
    let usage = state.store.quota_usage(7).unwrap();
    assert_eq!((usage.used, usage.reserved), (0, 0));
}

#[actix_web::test]
async fn test_late_callback_changes_nothing() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;

    let resp = test::call_service(&app, token_request(3, "/late.bin", 3).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let issued: Value = test::read_body_json(resp).await;
    assert_eq!(issued["credential"]["type"], "signed_url");
    let sid = issued["sessionId"].as_str().unwrap().to_string();
    let key = state.store.get_pending(&sid).unwrap().unwrap().backend_key;

    // The node's window is one second.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let path = format!("/callback/remote/3/{}", sid);
    let body = json!({ "key": key, "size": 3 }).to_string();
    let expires = Utc::now().timestamp() + 300;
    let req = test::TestRequest::post()
        .uri(&path)
        .insert_header(("Authorization", bearer("node-secret", "POST", &path, body.as_bytes(), expires).unwrap()))
        .set_payload(body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::GONE);

    let pending = state.store.get_pending(&sid).unwrap().unwrap();
    assert!(pending.committed_file_id.is_none());
    let usage = state.store.quota_usage(7).unwrap();
    assert_eq!((usage.used, usage.reserved), (0, 3));
}

#[actix_web::test]
async fn test_webdav_round_trip() {
    let (state, _scratch) = setup();
    let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(api::configure)).await;
    let dav = |method: &str, uri: &str| {
        test::TestRequest::default()
            .method(actix_web::http::Method::from_bytes(method.as_bytes()).unwrap())
            .uri(uri)
            .insert_header(("User", "7"))
    };

    let req = dav("PUT", "/dav/docs/readme.md").set_payload("# hi").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    let req = dav("MKCOL", "/dav/docs").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

    let req = dav("PUT", "/dav/docs/readme.md").set_payload("# hi").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

    let req = dav("MOVE", "/dav/docs/readme.md")
        .insert_header(("Destination", "http://drive.test/dav/docs/README.md"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

    let req = dav("GET", "/dav/docs/readme.md").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    let req = dav("GET", "/dav/docs/README.md").to_request();
    assert_eq!(&test::call_and_read_body(&app, req).await[..], b"# hi");

    let req = test::TestRequest::get().uri("/files?path=/docs").insert_header(("User", "7")).to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listing["kind"], "directory");
    assert_eq!(listing["children"][0]["name"], "README.md");

    let req = dav("DELETE", "/dav/docs").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(state.store.quota_usage(7).unwrap().used, 0);
}

#[actix_web::test]
async fn test_concurrent_issuance_never_oversubscribes() {
    let (state, _scratch) = setup();
    let paths: Vec<String> = (0..8).map(|i| format!("/part-{}.bin", i)).collect();

    let results = futures::future::join_all(paths.iter().map(|path| state.coordinator.issue(7, 1, path, MIB))).await;
    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 5);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.code() == "quota_exceeded"));

    let usage = state.store.quota_usage(7).unwrap();
    assert_eq!(usage.reserved, 5 * MIB);
    assert!(usage.used + usage.reserved <= usage.quota);
}
