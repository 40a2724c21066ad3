//! HTTP-level tests for the three smart HTTP endpoints.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
};
use ghb_git::{
    AdvertisedRefs, CapabilityList, Command, Deadline, PackBuilder, PackParser, PktLineWriter,
    ReceivePackResponse, ReferenceUpdateRequest, RefStatus, ShallowUpdate, UploadPackRequest,
    UploadPackResponse,
};
use ghb_server::{Credentials, Server, ServerOptions};
use ghb_storage::{GitObject, GitStore, ObjectId, ObjectType, Repository, TreeEntry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const AUTHOR: &str = "Dana <dana@example.com> 1700000000 +0000";
const UPLOAD_REQUEST: &str = "application/x-git-upload-pack-request";
const RECEIVE_REQUEST: &str = "application/x-git-receive-pack-request";

/// A repository with one commit adding `foo` = `bar` on `refs/heads/main`.
fn foo_bar_repo() -> (Arc<Repository>, ObjectId) {
    let repo = Arc::new(Repository::new());
    let blob = repo.objects.put_blob(b"bar".to_vec());
    let tree = repo.objects.put(GitObject::tree(&[TreeEntry::file("foo", blob)]));
    let tip = repo.commit(&tree, "add foo", AUTHOR, AUTHOR).unwrap();
    (repo, tip)
}

fn server_for(repo: Arc<Repository>, options: ServerOptions) -> Server {
    Server::new(repo, "Alice", "Tools", options).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, content_type: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn json_body(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn push_request(commands: Vec<Command>, objects: Vec<GitObject>) -> ReferenceUpdateRequest {
    let mut builder = PackBuilder::new();
    for object in objects {
        builder.add(object);
    }
    ReferenceUpdateRequest {
        commands,
        capabilities: CapabilityList::parse("report-status side-band-64k"),
        shallows: Vec::new(),
        pack: builder.build().unwrap(),
    }
}

fn encode_push(request: &ReferenceUpdateRequest) -> Vec<u8> {
    let mut body = Vec::new();
    request.encode(&mut body).unwrap();
    body
}

fn commit_on(parent: Option<ObjectId>, content: &str) -> (ObjectId, Vec<GitObject>) {
    let blob = GitObject::blob(content.as_bytes().to_vec());
    let tree = GitObject::tree(&[TreeEntry::file("README", blob.id)]);
    let parents: Vec<ObjectId> = parent.into_iter().collect();
    let commit = GitObject::commit(&tree.id, &parents, AUTHOR, AUTHOR, content);
    (commit.id, vec![blob, tree, commit])
}

#[tokio::test]
async fn test_clone_reconstructs_foo_bar() {
    let (repo, tip) = foo_bar_repo();
    let server = server_for(repo, ServerOptions::default());
    let app = server.router();

    let response = app
        .clone()
        .oneshot(get("/alice/tools.git/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-upload-pack-advertisement"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    let advertised = AdvertisedRefs::decode(&body_bytes(response).await[..]).unwrap();
    assert_eq!(advertised.head, Some(tip));
    assert_eq!(advertised.references.get("refs/heads/main"), Some(&tip));

    let request = UploadPackRequest {
        wants: vec![tip],
        capabilities: CapabilityList::parse("side-band-64k ofs-delta"),
        done: true,
        ..Default::default()
    };
    let mut body = Vec::new();
    request.encode(&mut body).unwrap();

    let response = app
        .oneshot(post("/alice/tools.git/git-upload-pack", UPLOAD_REQUEST, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-upload-pack-result"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let decoded = UploadPackResponse::decode(&body_bytes(response).await[..], &request).unwrap();
    assert_eq!(decoded.common, None);
    let pack = decoded.pack.expect("pack after done");

    let clone = Repository::bare();
    let objects = PackParser::new(&pack)
        .parse(&clone, &Deadline::never())
        .unwrap();
    assert_eq!(objects.len(), 3);
    clone.write_objects(objects).unwrap();

    let commit = clone.read_object(&tip).unwrap().parse_commit().unwrap();
    let entries = clone.read_object(&commit.tree).unwrap().parse_tree().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "foo");
    let blob = clone.read_object(&entries[0].id).unwrap();
    assert_eq!(blob.object_type, ObjectType::Blob);
    assert_eq!(blob.data.as_ref(), b"bar");
}

#[tokio::test]
async fn test_shallow_clone_in_two_rounds() {
    let repo = Arc::new(Repository::new());
    let blob = repo.objects.put_blob(b"one".to_vec());
    let tree = repo.objects.put(GitObject::tree(&[TreeEntry::file("README", blob)]));
    let first = repo.commit(&tree, "one", AUTHOR, AUTHOR).unwrap();
    let blob = repo.objects.put_blob(b"two".to_vec());
    let tree = repo.objects.put(GitObject::tree(&[TreeEntry::file("README", blob)]));
    let tip = repo.commit(&tree, "two", AUTHOR, AUTHOR).unwrap();
    let app = server_for(repo, ServerOptions::default()).router();

    // `git clone --depth 1` first sends its wants and depth with no `done`.
    let mut body = Vec::new();
    let mut writer = PktLineWriter::new(&mut body);
    writer
        .write_line(&format!("want {} side-band-64k ofs-delta no-progress", tip))
        .unwrap();
    writer.write_line("deepen 1").unwrap();
    writer.flush_pkt().unwrap();
    writer.flush_pkt().unwrap();

    let response = app
        .clone()
        .oneshot(post("/alice/tools.git/git-upload-pack", UPLOAD_REQUEST, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut expected = Vec::new();
    let mut writer = PktLineWriter::new(&mut expected);
    writer.write_line(&format!("shallow {}", tip)).unwrap();
    writer.flush_pkt().unwrap();
    writer.write_line("NAK").unwrap();
    assert_eq!(body_bytes(response).await, expected);

    // Then the same wants and depth, ending in `done`.
    let request = UploadPackRequest {
        wants: vec![tip],
        depth: Some(1),
        capabilities: CapabilityList::parse("side-band-64k ofs-delta no-progress"),
        done: true,
        ..Default::default()
    };
    let mut body = Vec::new();
    request.encode(&mut body).unwrap();

    let response = app
        .oneshot(post("/alice/tools.git/git-upload-pack", UPLOAD_REQUEST, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let raw = body_bytes(response).await;

    let nak = expected.len();
    assert_eq!(&raw[..nak], &expected[..]);
    assert_eq!(raw[nak + 4], 1, "pack goes out on band 1");

    let decoded = UploadPackResponse::decode(&raw[..], &request).unwrap();
    assert_eq!(
        decoded.shallow_update,
        Some(ShallowUpdate {
            shallows: vec![tip],
            unshallows: Vec::new(),
        })
    );
    assert_eq!(decoded.common, None);

    let pack = decoded.pack.expect("pack after done");
    let objects = PackParser::new(&pack)
        .parse(&Repository::bare(), &Deadline::never())
        .unwrap();
    assert_eq!(objects.len(), 3);
    assert!(objects.iter().any(|o| o.id == tip));
    assert!(objects.iter().all(|o| o.id != first));
}

#[tokio::test]
async fn test_discovery_rejects_bad_requests() {
    let (repo, _) = foo_bar_repo();
    let app = server_for(repo, ServerOptions::default()).router();

    let cases = [
        ("/alice/tools.git/info/refs", StatusCode::BAD_REQUEST),
        (
            "/alice/tools.git/info/refs?service=git-upload-pack&x=1",
            StatusCode::BAD_REQUEST,
        ),
        (
            "/alice/tools.git/info/refs?service=git-archive",
            StatusCode::FORBIDDEN,
        ),
        ("/alice/tools.git/info/refs?foo=bar", StatusCode::FORBIDDEN),
        ("/someone/else.git/info/refs?service=git-upload-pack", StatusCode::NOT_FOUND),
    ];
    for (uri, expected) in cases {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), expected, "{}", uri);
    }

    let response = app
        .oneshot(post(
            "/alice/tools.git/info/refs?service=git-upload-pack",
            UPLOAD_REQUEST,
            Vec::new(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rpc_requires_post_and_content_type() {
    let (repo, _) = foo_bar_repo();
    let app = server_for(repo, ServerOptions::default()).router();

    let response = app
        .clone()
        .oneshot(get("/alice/tools.git/git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post(
            "/alice/tools.git/git-upload-pack",
            "application/octet-stream",
            b"0000".to_vec(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The receive-pack content type is not accepted by upload-pack.
    let response = app
        .oneshot(post(
            "/alice/tools.git/git-upload-pack",
            RECEIVE_REQUEST,
            b"0000".to_vec(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rejected_push_never_touches_store() {
    let (repo, tip) = foo_bar_repo();
    let app = server_for(
        repo.clone(),
        ServerOptions::default().with_basic_auth("alice", "secret"),
    )
    .router();

    let (new_tip, objects) = commit_on(Some(tip), "second");
    let request = push_request(
        vec![Command {
            old_id: tip,
            new_id: new_tip,
            ref_name: "refs/heads/main".into(),
        }],
        objects,
    );
    let body = encode_push(&request);
    let good_auth = Credentials::new("alice", "secret").to_header_value();

    // Wrong method, even with valid credentials.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/tools.git/git-receive-pack")
                .header(header::AUTHORIZATION, &good_auth)
                .header(header::CONTENT_TYPE, RECEIVE_REQUEST)
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // No credentials.
    let response = app
        .clone()
        .oneshot(post(
            "/alice/tools.git/git-receive-pack",
            RECEIVE_REQUEST,
            body.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong content type.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alice/tools.git/git-receive-pack")
                .header(header::AUTHORIZATION, &good_auth)
                .header(header::CONTENT_TYPE, UPLOAD_REQUEST)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(repo.refs.resolve("refs/heads/main").unwrap(), tip);
    assert!(!repo.objects.contains(&new_tip));
}

#[tokio::test]
async fn test_basic_auth() {
    let (repo, _) = foo_bar_repo();
    let app = server_for(
        repo,
        ServerOptions::default().with_basic_auth("alice", "secret"),
    )
    .router();
    let uri = "/alice/tools.git/info/refs?service=git-upload-pack";

    let response = app.clone().oneshot(get(uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let wrong = Request::builder()
        .uri(uri)
        .header(
            header::AUTHORIZATION,
            Credentials::new("alice", "guess").to_header_value(),
        )
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri(uri)
        .header(
            header::AUTHORIZATION,
            Credentials::new("alice", "secret").to_header_value(),
        )
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(right).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Service validation happens before authentication.
    let response = app
        .oneshot(get("/alice/tools.git/info/refs?service=git-archive"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_push_then_discovery() {
    let repo = Arc::new(Repository::new());
    let app = server_for(repo.clone(), ServerOptions::default()).router();

    let response = app
        .clone()
        .oneshot(get("/alice/tools.git/info/refs?service=git-receive-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-receive-pack-advertisement"
    );
    let body = body_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("capabilities^{}"));

    let (main_tip, mut objects) = commit_on(None, "main");
    let (dev_tip, dev_objects) = commit_on(None, "dev");
    objects.extend(dev_objects);
    let request = push_request(
        vec![
            Command {
                old_id: ObjectId::ZERO,
                new_id: main_tip,
                ref_name: "refs/heads/main".into(),
            },
            // Claims dev already exists, so the create is stale.
            Command {
                old_id: main_tip,
                new_id: dev_tip,
                ref_name: "refs/heads/dev".into(),
            },
        ],
        objects,
    );

    let response = app
        .clone()
        .oneshot(post(
            "/alice/tools.git/git-receive-pack",
            RECEIVE_REQUEST,
            encode_push(&request),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-receive-pack-advertisement"
    );
    let report = ReceivePackResponse::decode(&body_bytes(response).await[..], &request).unwrap();
    assert_eq!(report.statuses[0].status, RefStatus::Ok);
    assert_eq!(
        report.statuses[1].status,
        RefStatus::Rejected("stale info".into())
    );

    let response = app
        .oneshot(get("/alice/tools.git/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    let advertised = AdvertisedRefs::decode(&body_bytes(response).await[..]).unwrap();
    assert_eq!(advertised.head, Some(main_tip));
    assert_eq!(advertised.references.get("refs/heads/main"), Some(&main_tip));
    assert!(!advertised.references.contains_key("refs/heads/dev"));
}

#[tokio::test]
async fn test_unresolvable_head_is_internal_error() {
    let repo = Arc::new(Repository::new());
    repo.refs.set("refs/heads/other", ObjectId::from_bytes([7u8; 20]));
    let app = server_for(repo, ServerOptions::default()).router();

    let response = app
        .oneshot(get("/alice/tools.git/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"], "internal error");
}

#[tokio::test]
async fn test_missing_want_is_internal_error() {
    let (repo, _) = foo_bar_repo();
    let app = server_for(repo, ServerOptions::default()).router();

    let request = UploadPackRequest {
        wants: vec![ObjectId::from_bytes([0xab; 20])],
        done: true,
        ..Default::default()
    };
    let mut body = Vec::new();
    request.encode(&mut body).unwrap();

    let response = app
        .oneshot(post("/alice/tools.git/git-upload-pack", UPLOAD_REQUEST, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let error = json_body(response).await;
    assert_eq!(error["error"], "internal error");
}

#[tokio::test]
async fn test_malformed_body_is_internal_error() {
    let (repo, _) = foo_bar_repo();
    let app = server_for(repo, ServerOptions::default()).router();

    let response = app
        .oneshot(post(
            "/alice/tools.git/git-upload-pack",
            UPLOAD_REQUEST,
            b"zzzzwant".to_vec(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_expired_session_is_internal_error() {
    let (repo, tip) = foo_bar_repo();
    let app = server_for(
        repo,
        ServerOptions::default().with_session_timeout(Duration::ZERO),
    )
    .router();

    let request = UploadPackRequest {
        wants: vec![tip],
        done: true,
        ..Default::default()
    };
    let mut body = Vec::new();
    request.encode(&mut body).unwrap();

    let response = app
        .oneshot(post("/alice/tools.git/git-upload-pack", UPLOAD_REQUEST, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (repo, _) = foo_bar_repo();
    let app = server_for(repo, ServerOptions::default()).router();

    let request = Request::builder()
        .uri("/alice/tools.git/info/refs?service=git-upload-pack")
        .header("x-request-id", "abc-123")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "abc-123");

    let response = app
        .oneshot(get("/alice/tools.git/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_setup_routes_merges_into_existing_router() {
    let (repo, _) = foo_bar_repo();
    let server = server_for(repo, ServerOptions::default());
    let app = server.setup_routes(
        axum::Router::new().route("/health", axum::routing::get(|| async { "ok" })),
    );

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/alice/tools.git/info/refs?service=git-receive-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
