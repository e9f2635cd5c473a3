//! Route table for the file vault.
//!
//! ## Structure
//! - **Health checks**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Uploads** (caller identity required)
//!   - `POST /api/v1/upload`: single multipart file
//!   - `POST /api/v1/upload/chunked`: `chunk.<index>` fields + `fileName`
//!   - `PUT  /api/v1/upload/stream?fileName=`: raw streamed body
//!   - `POST /api/v1/files/{id}/versions`: new version of an existing file
//!
//! - **Downloads**
//!   - `GET  /api/v1/files/{id}/stream`: as the calling user
//!   - `GET  /api/v1/files/{id}/url`: issue a signed link
//!   - `GET  /api/v1/files/{id}/stream-signed?token=`: by signed link
//!   - `GET  /api/v1/placement?key=`: nodes for a storage key
//!
//! - **Node-to-node**
//!   - `POST /internal/replicate`, `GET /internal/cluster`

use crate::{
    handlers::{
        file_handlers::{issue_signed_url, placement_for, stream_file, stream_signed},
        health_handlers::{healthz, readyz},
        identity::identity_from_gateway,
        internal_handlers::{cluster_status, receive_replication},
        upload_handlers::{upload_chunked, upload_single, upload_stream, upload_version},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post, put},
};

/// Multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Build the router. `max_upload_bytes` bounds buffered request bodies;
/// streamed uploads are capped by the upload service instead.
pub fn routes(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route("/upload", post(upload_single))
        .route("/upload/chunked", post(upload_chunked))
        .route("/upload/stream", put(upload_stream))
        .route("/files/{id}/versions", post(upload_version))
        .route("/files/{id}/stream", get(stream_file))
        .route("/files/{id}/url", get(issue_signed_url))
        .route("/files/{id}/stream-signed", get(stream_signed))
        .route("/placement", get(placement_for))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(identity_from_gateway));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/internal/replicate", post(receive_replication))
        .route("/internal/cluster", get(cluster_status))
        .nest("/api/v1", api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::identity::USER_ID_HEADER,
        services::{
            access_token::AccessTokenSigner,
            checksum,
            cluster::{NodeRegistry, PlacementService, ReplicationPlanner},
            delivery::StreamingDelivery,
            metadata::tests::memory_store,
            security::UploadLimits,
            storage::{LocalBackend, StorageBackend, StorageService},
            upload::UploadService,
        },
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "vault-test-boundary";

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    async fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageService::new(StorageBackend::Local(LocalBackend::new(dir.path())));
        let metadata = memory_store().await;
        let registry = Arc::new(NodeRegistry::new("A", &[], None));
        let placement = PlacementService::new(registry.clone(), 2);
        let planner = ReplicationPlanner::new(placement.clone(), reqwest::Client::new());

        let state = AppState {
            metadata: metadata.clone(),
            storage: storage.clone(),
            uploads: UploadService::new(
                storage.clone(),
                metadata.clone(),
                planner,
                UploadLimits::default(),
            ),
            delivery: StreamingDelivery::new(metadata, storage),
            placement,
            registry,
            signer: AccessTokenSigner::new(b"router-test", 900).unwrap(),
            public_base_url: "http://vault.test".into(),
        };

        TestApp {
            router: routes(UploadLimits::default().max_size_bytes).with_state(state),
            _dir: dir,
        }
    }

    fn multipart(parts: &[(&str, Option<&str>, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, content_type, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, user: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(USER_ID_HEADER, user)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get_request(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(router, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn upload_doc(router: &Router, user: &str, data: &[u8]) -> String {
        let body = multipart(&[("file", Some("doc.txt"), "text/plain", data)]);
        let (status, json) = send_json(router, multipart_request("/api/v1/upload", user, body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["file"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn liveness() {
        let app = app().await;
        let (status, json) = send_json(&app.router, get_request("/healthz", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (status, json) = send_json(&app.router, get_request("/readyz", None)).await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["checks"]["sqlite"]["ok"], true);
    }

    #[tokio::test]
    async fn upload_then_download() {
        let app = app().await;
        let body = multipart(&[
            ("file", Some("doc.txt"), "text/plain", b"hello world"),
            ("checksum", None, "", checksum::hash(b"hello world").as_bytes()),
        ]);
        let (status, json) =
            send_json(&app.router, multipart_request("/api/v1/upload", "u1", body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        assert_eq!(json["version"]["versionNumber"], 1);
        assert_eq!(json["placement"]["handledLocally"], true);
        let id = json["file"]["id"].as_str().unwrap();

        let response = app
            .router
            .clone()
            .oneshot(get_request(&format!("/api/v1/files/{id}/stream"), Some("u1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"doc.txt\""
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn checksum_mismatch_is_reported() {
        let app = app().await;
        let body = multipart(&[
            ("file", Some("doc.txt"), "text/plain", b"hello"),
            ("checksum", None, "", checksum::hash(b"other").as_bytes()),
        ]);
        let (status, json) =
            send_json(&app.router, multipart_request("/api/v1/upload", "u1", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["kind"], "checksum_mismatch");
    }

    #[tokio::test]
    async fn upload_requires_identity() {
        let app = app().await;
        let body = multipart(&[("file", Some("doc.txt"), "text/plain", b"x")]);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, json) = send_json(&app.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn chunked_upload_reassembles() {
        let app = app().await;
        let body = multipart(&[
            ("fileName", None, "", b"hw.txt"),
            ("chunk.1", Some("blob"), "text/plain", b" world"),
            ("chunk.0", Some("blob"), "text/plain", b"hello"),
        ]);
        let (status, json) =
            send_json(&app.router, multipart_request("/api/v1/upload/chunked", "u1", body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        assert_eq!(json["version"]["sizeBytes"], 11);
        assert_eq!(json["file"]["name"], "hw.txt");
    }

    #[tokio::test]
    async fn streamed_upload() {
        let app = app().await;
        let request = Request::builder()
            .method("PUT")
            .uri("/api/v1/upload/stream?fileName=notes.txt")
            .header(USER_ID_HEADER, "u1")
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from("streamed bytes"))
            .unwrap();
        let (status, json) = send_json(&app.router, request).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        assert_eq!(json["version"]["sizeBytes"], 14);
        assert_eq!(json["file"]["mimeType"], "text/plain");
    }

    #[tokio::test]
    async fn new_version_is_served() {
        let app = app().await;
        let id = upload_doc(&app.router, "u1", b"first").await;

        let body = multipart(&[("file", Some("doc.txt"), "text/plain", b"second")]);
        let (status, json) = send_json(
            &app.router,
            multipart_request(&format!("/api/v1/files/{id}/versions"), "u1", body),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        assert_eq!(json["version"]["versionNumber"], 2);

        let (status, bytes) = send(
            &app.router,
            get_request(&format!("/api/v1/files/{id}/stream"), Some("u1")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"second");
    }

    #[tokio::test]
    async fn other_users_cannot_read() {
        let app = app().await;
        let id = upload_doc(&app.router, "u1", b"private").await;

        let (status, json) = send_json(
            &app.router,
            get_request(&format!("/api/v1/files/{id}/stream"), Some("u2")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["kind"], "file_not_found");

        let (status, _) = send_json(
            &app.router,
            get_request(&format!("/api/v1/files/{id}/url"), Some("u2")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn signed_link_downloads_without_session() {
        let app = app().await;
        let id = upload_doc(&app.router, "u1", b"shared").await;

        let (status, json) = send_json(
            &app.router,
            get_request(&format!("/api/v1/files/{id}/url?expiresIn=60"), Some("u1")),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        let url = json["url"].as_str().unwrap();
        let token = json["token"].as_str().unwrap();
        assert_eq!(
            url,
            format!("http://vault.test/api/v1/files/{id}/stream-signed?token={token}")
        );

        let path = url.trim_start_matches("http://vault.test");
        let (status, bytes) = send(&app.router, get_request(path, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"shared");

        let mut tampered = token.to_string();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        let (status, json) = send_json(
            &app.router,
            get_request(
                &format!("/api/v1/files/{id}/stream-signed?token={tampered}"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["kind"], "access_denied");
    }

    #[tokio::test]
    async fn signed_link_is_bound_to_its_file() {
        let app = app().await;
        let first = upload_doc(&app.router, "u1", b"one").await;
        let second = upload_doc(&app.router, "u1", b"two").await;

        let (_, json) = send_json(
            &app.router,
            get_request(&format!("/api/v1/files/{first}/url"), Some("u1")),
        )
        .await;
        let token = json["token"].as_str().unwrap();

        let (status, json) = send_json(
            &app.router,
            get_request(
                &format!("/api/v1/files/{second}/stream-signed?token={token}"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["message"], "invalid or expired link");
    }

    #[tokio::test]
    async fn placement_and_cluster_endpoints() {
        let app = app().await;
        let (status, json) = send_json(
            &app.router,
            get_request("/api/v1/placement?key=user/1/uploads/123-doc.txt", Some("u1")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["primary"]["id"], "A");
        assert_eq!(json["replicas"], serde_json::json!([]));

        let (status, json) = send_json(&app.router, get_request("/internal/cluster", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["nodeId"], "A");
        assert_eq!(json["leader"], Value::Null);
    }

    #[tokio::test]
    async fn replication_signal_is_acknowledged() {
        let app = app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/internal/replicate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"storageKey":"user/1/uploads/1-a.txt","mimeType":null,"sizeBytes":3}"#,
            ))
            .unwrap();
        let (status, json) = send_json(&app.router, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["status"], "accepted");
    }
}
