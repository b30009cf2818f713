//! Integration tests for the OCI registry

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use registry::auth::ReadOnly;
use registry::config::RegistryConfig;
use registry::metadata::MetadataStore;
use registry::{Digest, RegistryBuilder};
use serde_json::{Value, json};
use storage::MemoryStorage;
use tower::ServiceExt;

const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

async fn builder() -> RegistryBuilder {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new()
        .storage(storage.into())
        .bucket("test-registry")
        .metadata(MetadataStore::in_memory().await.unwrap())
}

/// Helper to create a test registry
async fn test_registry() -> Router {
    builder().await.build().unwrap().router()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn error_code(response: Response<Body>) -> String {
    body_json(response).await["errors"][0]["code"]
        .as_str()
        .unwrap()
        .to_owned()
}

fn header_str<'r>(response: &'r Response<Body>, name: &str) -> &'r str {
    response.headers()[name].to_str().unwrap()
}

async fn start_upload(app: &Router, repo: &str) -> String {
    let response = send(
        app,
        Request::post(format!("/v2/{repo}/blobs/uploads/"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    header_str(&response, "location").to_owned()
}

/// Push `data` as a blob, returning its digest.
async fn push_blob(app: &Router, repo: &str, data: &[u8]) -> String {
    let digest = Digest::sha256(data).to_string();
    let location = start_upload(app, repo).await;
    let response = send(
        app,
        Request::put(format!("{location}?digest={digest}"))
            .body(Body::from(data.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

fn descriptor(media_type: &str, data: &[u8]) -> Value {
    json!({
        "mediaType": media_type,
        "digest": Digest::sha256(data).to_string(),
        "size": data.len(),
    })
}

fn image(config_type: &str, config: &[u8], layer: &[u8], subject: Option<Value>) -> Vec<u8> {
    let mut manifest = json!({
        "schemaVersion": 2,
        "mediaType": IMAGE_MANIFEST,
        "config": descriptor(config_type, config),
        "layers": [descriptor(LAYER_TYPE, layer)],
    });
    if let Some(subject) = subject {
        manifest["subject"] = subject;
    }
    serde_json::to_vec(&manifest).unwrap()
}

/// Push the config and layer blobs, then the manifest.
async fn push_image(
    app: &Router,
    repo: &str,
    reference: &str,
    config: &[u8],
    subject: Option<Value>,
    config_type: &str,
) -> (Vec<u8>, Response<Body>) {
    push_blob(app, repo, config).await;
    push_blob(app, repo, b"layer").await;
    let body = image(config_type, config, b"layer", subject);
    let response = put_manifest(app, repo, reference, body.clone()).await;
    (body, response)
}

async fn put_manifest(app: &Router, repo: &str, reference: &str, body: Vec<u8>) -> Response<Body> {
    send(
        app,
        Request::put(format!("/v2/{repo}/manifests/{reference}"))
            .header(header::CONTENT_TYPE, IMAGE_MANIFEST)
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry().await;

    let response = send(&app, Request::get("/v2/").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_monolithic_blob_push() {
    let app = test_registry().await;
    let digest = Digest::sha256(b"hello").to_string();

    let response = send(
        &app,
        Request::post("/v2/library/alpine/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-0");
    let uuid = header_str(&response, "docker-upload-uuid").to_owned();
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/library/alpine/blobs/uploads/{uuid}")
    );

    let response = send(
        &app,
        Request::put(format!(
            "/v2/library/alpine/blobs/uploads/{uuid}?digest={digest}"
        ))
        .body(Body::from("hello"))
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/library/alpine/blobs/{digest}")
    );

    let response = send(
        &app,
        Request::head(format!("/v2/library/alpine/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), "5");
    assert_eq!(header_str(&response, "docker-content-digest"), digest);
}

#[tokio::test]
async fn test_chunked_push_rejects_gaps() {
    let app = test_registry().await;
    let location = start_upload(&app, "library/alpine").await;

    let response = send(
        &app,
        Request::patch(&location)
            .header(header::CONTENT_RANGE, "0-4")
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-4");

    let response = send(
        &app,
        Request::patch(&location)
            .header(header::CONTENT_RANGE, "10-14")
            .body(Body::from("world"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    // the session survives the rejected chunk
    let response = send(&app, Request::get(&location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "range"), "0-4");
}

#[tokio::test]
async fn test_chunked_push_matches_monolithic() {
    let app = test_registry().await;
    let digest = Digest::sha256(b"hello").to_string();
    let location = start_upload(&app, "library/alpine").await;

    for (range, chunk) in [("0-2", "hel"), ("3-4", "lo")] {
        let response = send(
            &app,
            Request::patch(&location)
                .header(header::CONTENT_RANGE, range)
                .body(Body::from(chunk))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = send(
        &app,
        Request::put(format!("{location}?digest={digest}"))
            .header(header::CONTENT_LENGTH, "0")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);

    let response = send(
        &app,
        Request::get(format!("/v2/library/alpine/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn test_single_request_upload_and_range_read() {
    let app = test_registry().await;
    let digest = Digest::sha256(b"hello").to_string();

    let response = send(
        &app,
        Request::post(format!("/v2/lib/app/blobs/uploads/?digest={digest}"))
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        Request::get(format!("/v2/lib/app/blobs/{digest}"))
            .header(header::RANGE, "bytes=1-3")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, "content-range"), "bytes 1-3/5");
    assert_eq!(body_bytes(response).await, b"ell");

    let response = send(
        &app,
        Request::get(format!("/v2/lib/app/blobs/{digest}"))
            .header(header::RANGE, "bytes=9-")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_digest_mismatch_leaves_session_abortable() {
    let app = test_registry().await;
    let location = start_upload(&app, "lib/app").await;
    let wrong = Digest::sha256(b"something else");

    let response = send(
        &app,
        Request::put(format!("{location}?digest={wrong}"))
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, Request::delete(&location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, Request::get(&location).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_cross_repository_mount() {
    let app = test_registry().await;
    let digest = push_blob(&app, "lib/source", b"shared").await;

    let response = send(
        &app,
        Request::post(format!(
            "/v2/lib/target/blobs/uploads/?mount={digest}&from=lib/source"
        ))
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);

    // an unknown blob falls back to a fresh session
    let missing = Digest::sha256(b"missing");
    let response = send(
        &app,
        Request::post(format!(
            "/v2/lib/target/blobs/uploads/?mount={missing}&from=lib/source"
        ))
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_manifest_with_missing_blob() {
    let app = test_registry().await;
    push_blob(&app, "x/y", b"layer").await;
    let body = image(CONFIG_TYPE, b"absent config", b"layer", None);

    let response = put_manifest(&app, "x/y", "latest", body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_BLOB_UNKNOWN");

    let response = send(
        &app,
        Request::get("/v2/x/y/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_push_and_pull() {
    let app = test_registry().await;
    let (body, response) = push_image(&app, "lib/app", "v1", b"config", None, CONFIG_TYPE).await;
    let digest = Digest::sha256(&body).to_string();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/lib/app/manifests/{digest}")
    );

    // pushing the same bytes again is idempotent
    let response = put_manifest(&app, "lib/app", "v1", body.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        Request::head("/v2/lib/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-type"), IMAGE_MANIFEST);
    assert_eq!(header_str(&response, "content-length"), body.len().to_string());

    let response = send(
        &app,
        Request::get(format!("/v2/lib/app/manifests/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);
    assert_eq!(body_bytes(response).await, body);

    let response = send(
        &app,
        Request::delete("/v2/lib/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(
        &app,
        Request::get("/v2/lib/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_manifest_digest_mismatch() {
    let app = test_registry().await;
    push_blob(&app, "lib/app", b"config").await;
    push_blob(&app, "lib/app", b"layer").await;
    let body = image(CONFIG_TYPE, b"config", b"layer", None);
    let wrong = Digest::sha256(b"not the manifest");

    let response = put_manifest(&app, "lib/app", &wrong.to_string(), body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
}

#[tokio::test]
async fn test_tag_rebind() {
    let app = test_registry().await;
    let (first, response) = push_image(&app, "repo", "latest", b"config-a", None, CONFIG_TYPE).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let (second, response) = push_image(&app, "repo", "latest", b"config-b", None, CONFIG_TYPE).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_ne!(first, second);

    let response = send(
        &app,
        Request::get("/v2/repo/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, second);

    // the untagged artifact is still addressable by digest
    let response = send(
        &app,
        Request::get(format!("/v2/repo/manifests/{}", Digest::sha256(&first)))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, first);
}

#[tokio::test]
async fn test_referrers() {
    let app = test_registry().await;
    let (subject, _) = push_image(&app, "repo", "v1", b"config", None, CONFIG_TYPE).await;
    let subject_digest = Digest::sha256(&subject).to_string();

    let signature_type = "application/vnd.example.sig";
    let signature = image(
        signature_type,
        b"signature",
        b"layer",
        Some(descriptor(IMAGE_MANIFEST, &subject)),
    );
    let signature_digest = Digest::sha256(&signature).to_string();
    push_blob(&app, "repo", b"signature").await;
    let response = put_manifest(&app, "repo", &signature_digest, signature).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "oci-subject"), subject_digest);

    let response = send(
        &app,
        Request::get(format!(
            "/v2/repo/referrers/{subject_digest}?artifactType={signature_type}"
        ))
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "oci-filters-applied"), signature_type);
    assert_eq!(
        header_str(&response, "content-type"),
        "application/vnd.oci.image.index.v1+json"
    );
    let index = body_json(response).await;
    let manifests = index["manifests"].as_array().unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0]["digest"], signature_digest);
    assert_eq!(manifests[0]["artifactType"], signature_type);

    let response = send(
        &app,
        Request::get(format!(
            "/v2/repo/referrers/{subject_digest}?artifactType=application/vnd.other"
        ))
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert!(body_json(response).await["manifests"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_referrers_of_unknown_subject() {
    let app = test_registry().await;
    let unknown = Digest::sha256(b"nothing refers to this");

    let response = send(
        &app,
        Request::get(format!("/v2/nowhere/referrers/{unknown}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("oci-filters-applied"));
    let index = body_json(response).await;
    assert_eq!(index["schemaVersion"], 2);
    assert_eq!(index["manifests"], json!([]));
}

#[tokio::test]
async fn test_tag_pagination() {
    let app = test_registry().await;
    for tag in ["t1", "t2", "t3", "t4", "t5"] {
        let (_, response) = push_image(&app, "repo", tag, b"config", None, CONFIG_TYPE).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let mut url = "/v2/repo/tags/list?n=2".to_owned();
    let mut pages = Vec::new();
    loop {
        let response = send(&app, Request::get(&url).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let link = response
            .headers()
            .get(header::LINK)
            .map(|link| link.to_str().unwrap().to_owned());
        let body = body_json(response).await;
        assert_eq!(body["name"], "repo");
        pages.push(body["tags"].clone());

        let Some(link) = link else { break };
        assert!(link.ends_with("; rel=\"next\""));
        url = link[1..link.find('>').unwrap()].to_owned();
        if pages.len() == 1 {
            assert_eq!(url, "/v2/repo/tags/list?n=2&last=t2");
        }
    }

    assert_eq!(
        pages,
        [json!(["t1", "t2"]), json!(["t3", "t4"]), json!(["t5"])]
    );
}

#[tokio::test]
async fn test_catalog() {
    let app = test_registry().await;
    push_image(&app, "lib/a", "v1", b"config", None, CONFIG_TYPE).await;
    push_image(&app, "lib/b", "v1", b"config", None, CONFIG_TYPE).await;

    let response = send(&app, Request::get("/v2/_catalog").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["repositories"],
        json!(["lib/a", "lib/b"])
    );

    let response = send(
        &app,
        Request::get("/v2/_catalog?n=0").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::LINK));
    assert_eq!(body_json(response).await["repositories"], json!([]));
}

#[tokio::test]
async fn test_unknown_repository_tags() {
    let app = test_registry().await;
    let response = send(
        &app,
        Request::get("/v2/nobody/tags/list").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_repository_name() {
    let app = test_registry().await;
    let response = send(
        &app,
        Request::post("/v2/Not_Valid/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");
}

#[tokio::test]
async fn test_tag_quota_is_denied() {
    let mut config = RegistryConfig::default();
    config.bucket = "test-registry".into();
    config.namespace.limits.tag_limit = 1;
    let app = builder().await.config(config).build().unwrap().router();

    let (_, response) = push_image(&app, "team/app", "v1", b"config", None, CONFIG_TYPE).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let (_, response) = push_image(&app, "team/app", "v2", b"config", None, CONFIG_TYPE).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "DENIED");
}

#[tokio::test]
async fn test_read_only_registry() {
    let app = builder()
        .await
        .authorizer(Arc::new(ReadOnly))
        .build()
        .unwrap()
        .router();

    let response = send(
        &app,
        Request::post("/v2/lib/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "DENIED");

    let response = send(
        &app,
        Request::get("/v2/lib/app/tags/list").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsupported_method() {
    let app = test_registry().await;
    let response = send(
        &app,
        Request::post("/v2/lib/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        header_str(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
    assert_eq!(error_code(response).await, "UNSUPPORTED");
}

#[tokio::test]
async fn test_concurrent_tag_pushes_have_one_winner() {
    let app = test_registry().await;
    push_blob(&app, "repo", b"config-a").await;
    push_blob(&app, "repo", b"config-b").await;
    push_blob(&app, "repo", b"layer").await;
    let first = image(CONFIG_TYPE, b"config-a", b"layer", None);
    let second = image(CONFIG_TYPE, b"config-b", b"layer", None);

    let (a, b) = tokio::join!(
        put_manifest(&app, "repo", "latest", first.clone()),
        put_manifest(&app, "repo", "latest", second.clone()),
    );
    for status in [a.status(), b.status()] {
        assert!(
            status == StatusCode::CREATED || status == StatusCode::CONFLICT,
            "unexpected status {status}"
        );
    }
    let won: Vec<&Vec<u8>> = [(&a, &first), (&b, &second)]
        .into_iter()
        .filter(|(response, _)| response.status() == StatusCode::CREATED)
        .map(|(_, body)| body)
        .collect();
    assert!(!won.is_empty());

    let response = send(
        &app,
        Request::get("/v2/repo/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let tagged = body_bytes(response).await;
    assert!(won.contains(&&tagged));

    let response = send(
        &app,
        Request::get("/v2/repo/tags/list").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(body_json(response).await["tags"], json!(["latest"]));
}

#[tokio::test]
async fn test_concurrent_patches_conflict() {
    let app = test_registry().await;
    let location = start_upload(&app, "repo").await;

    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, std::io::Error>>();
    tx.unbounded_send(Ok(Bytes::from_static(b"hello"))).unwrap();
    let stalled = {
        let app = app.clone();
        let request = Request::patch(&location)
            .body(Body::from_stream(rx))
            .unwrap();
        tokio::spawn(async move { app.oneshot(request).await.unwrap() })
    };
    // let the first request take the session before the second arrives
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = send(
        &app,
        Request::patch(&location)
            .body(Body::from(&b"world"[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    drop(tx);
    let response = stalled.await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-4");
}
