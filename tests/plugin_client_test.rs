use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use repo_transfer::api::{ItemType, PackageType, UploadChunksStatusBody};
use repo_transfer::config::ServerConfig;
use repo_transfer::transfer::chunk::{FileCandidate, ProcessStatus, UploadChunk};
use repo_transfer::{ArtifactoryClient, SourceApi, TargetApi, TransferError};
use serde_json::{json, Value};
use std::collections::HashMap;

const TOKEN: &str = "secret-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn upload_chunk(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    let candidates = body["upload_candidates"].as_array().map_or(0, Vec::len);
    if candidates == 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({})));
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({ "node_id": "node-a", "uuid_token": "tok-1" })),
    )
}

async fn sync_chunks(Json(body): Json<Value>) -> Json<Value> {
    let awaiting = body["awaiting_status_chunks"].clone();
    Json(json!({
        "node_id": "node-a",
        "chunks_status": [{
            "uuid_token": awaiting[0],
            "status": "DONE",
            "files": [{
                "repo": "libs", "path": "org", "name": "a.jar",
                "size_bytes": 12, "status": "SUCCESS"
            }]
        }],
        "deleted_chunks": body["chunks_to_delete"],
    }))
}

async fn store_properties(Json(body): Json<Value>) -> StatusCode {
    if body["repoKey"] == "libs" {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn ping() -> impl IntoResponse {
    ([("x-artifactory-node-id", "node-a")], "OK")
}

async fn repositories(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    if query.get("type").map(String::as_str) == Some("local") {
        Json(json!([
            { "key": "libs", "packageType": "Maven" },
            { "key": "images", "packageType": "Docker" }
        ]))
    } else {
        Json(json!([{ "key": "libs" }]))
    }
}

async fn storage_info() -> Json<Value> {
    Json(json!({
        "repositoriesSummaryList": [
            { "repoKey": "libs", "packageType": "Maven", "filesCount": 3, "usedSpaceInBytes": 300 },
            { "repoKey": "artifactory-build-info", "packageType": "BuildInfo", "filesCount": 7, "usedSpaceInBytes": 70 },
            { "repoKey": "remote-cache", "packageType": "Npm", "filesCount": 1, "usedSpaceInBytes": 1 }
        ]
    }))
}

async fn aql(body: String) -> Json<Value> {
    assert!(body.starts_with("items.find("));
    Json(json!({
        "results": [
            { "repo": "libs", "path": "org", "name": ".", "type": "folder" },
            { "repo": "libs", "path": "org", "name": "acme", "type": "folder" },
            { "repo": "libs", "path": "org", "name": "a.jar", "type": "file", "size": 12 }
        ]
    }))
}

async fn serve() -> anyhow::Result<String> {
    let app = Router::new()
        .route("/api/plugins/execute/uploadChunk", post(upload_chunk))
        .route("/api/plugins/execute/syncChunks", post(sync_chunks))
        .route(
            "/api/plugins/execute/dataTransferVersion",
            get(|| async { Json(json!({ "version": "1.8.0" })) }),
        )
        .route(
            "/api/plugins/execute/stop",
            post(|| async { Json(json!({ "node_id": "node-a" })) }),
        )
        .route("/api/plugins/execute/storeProperties", post(store_properties))
        .route("/api/system/ping", get(ping))
        .route("/api/repositories", get(repositories))
        .route("/api/storageinfo", get(storage_info))
        .route("/api/search/aql", post(aql));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn client(url: &str, token: &str) -> anyhow::Result<ArtifactoryClient> {
    Ok(ArtifactoryClient::new(&ServerConfig {
        url: url.to_string(),
        access_token: token.to_string(),
        ..Default::default()
    })?)
}

fn chunk() -> UploadChunk {
    UploadChunk {
        upload_candidates: vec![FileCandidate::file("libs", "org", "a.jar", 12)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_upload_and_poll_chunk() -> anyhow::Result<()> {
    let url = serve().await?;
    let client = client(&url, TOKEN)?;

    let response = client.upload_chunk(&chunk()).await?;
    assert_eq!(response.node_id, "node-a");
    assert_eq!(response.uuid_token, "tok-1");

    let status = client
        .sync_chunks(&UploadChunksStatusBody {
            awaiting_status_chunks: vec!["tok-1".to_string()],
            chunks_to_delete: vec!["tok-0".to_string()],
        })
        .await?;
    assert_eq!(status.node_id, "node-a");
    assert_eq!(status.deleted_chunks, vec!["tok-0".to_string()]);
    assert_eq!(status.chunks_status.len(), 1);
    assert_eq!(status.chunks_status[0].status, ProcessStatus::Done);
    assert_eq!(status.chunks_status[0].files[0].size_bytes, 12);
    Ok(())
}

#[tokio::test]
async fn test_unexpected_status_is_an_http_error() -> anyhow::Result<()> {
    let url = serve().await?;
    let client = client(&url, "wrong")?;

    let result = client.upload_chunk(&chunk()).await;

    match result {
        Err(TransferError::Http { status, url, .. }) => {
            assert_eq!(status, 401);
            assert!(url.ends_with("api/plugins/execute/uploadChunk"));
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_node_and_version_calls() -> anyhow::Result<()> {
    let url = serve().await?;
    let client = client(&format!("{url}/"), TOKEN)?;

    assert_eq!(client.ping_node().await?, "node-a");
    assert_eq!(client.stop().await?, "node-a");
    assert_eq!(client.data_transfer_version().await?, "1.8.0");
    Ok(())
}

#[tokio::test]
async fn test_repositories_merge_storage_summary() -> anyhow::Result<()> {
    let url = serve().await?;
    let client = client(&url, TOKEN)?;

    let repos = client.repositories().await?;
    assert_eq!(repos.len(), 3);
    assert_eq!(repos[0].key, "libs");
    assert_eq!(repos[0].package_type, PackageType::Maven);
    assert_eq!((repos[0].files_count, repos[0].size_bytes), (3, 300));
    assert_eq!(repos[1].package_type, PackageType::Docker);
    assert_eq!(repos[1].files_count, 0);
    assert!(repos[2].is_build_info());
    assert_eq!(repos[2].files_count, 7);

    assert_eq!(client.repository_keys().await?, vec!["libs".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_list_directory_keeps_page_as_sent() -> anyhow::Result<()> {
    let url = serve().await?;
    let client = client(&url, TOKEN)?;

    // The directory's own row counts toward the page size.
    let items = client.list_directory("libs", "org", 0).await?;
    assert_eq!(items.len(), 3);
    assert!(items[0].is_self_entry());
    assert!(!items[1].is_self_entry());
    assert_eq!(items[1].item_type, ItemType::Folder);
    assert_eq!(items[2].name, "a.jar");
    assert_eq!(items[2].size, 12);
    Ok(())
}

#[tokio::test]
async fn test_store_properties_names_the_repository() -> anyhow::Result<()> {
    let url = serve().await?;
    let client = client(&url, TOKEN)?;

    client.store_properties("libs").await?;
    assert!(client.store_properties("other").await.is_err());
    Ok(())
}
