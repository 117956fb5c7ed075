//! HTTP client for an Artifactory-style server and its data-transfer plugin.

use super::{
    HandlePropertiesDiff, HandlePropertiesDiffResponse, ListItem, PackageType,
    RepoSummary, SourceApi, TargetApi, TargetAuth, UploadChunkResponse, UploadChunksStatusBody,
    UploadChunksStatusResponse, VerifyCompatibilityResponse, PAGINATION_LIMIT,
};
use crate::config::ServerConfig;
use crate::error::{Result, TransferError};
use crate::transfer::chunk::UploadChunk;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PLUGIN_PREFIX: &str = "api/plugins/execute/";
const NODE_ID_HEADER: &str = "x-artifactory-node-id";

#[derive(Debug, Deserialize)]
struct AqlResponse {
    #[serde(default)]
    results: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryEntry {
    key: String,
    #[serde(default)]
    package_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageInfo {
    #[serde(default)]
    repositories_summary_list: Vec<StorageRepoSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageRepoSummary {
    repo_key: String,
    #[serde(default)]
    package_type: String,
    #[serde(default)]
    files_count: u64,
    #[serde(default)]
    used_space_in_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct NodeIdResponse {
    #[serde(default)]
    node_id: String,
}

/// Client for one server. Used as the source (plugin calls, listings) or as
/// the target (repository catalog).
#[derive(Clone)]
pub struct ArtifactoryClient {
    base: String,
    client: reqwest::Client,
    server: ServerConfig,
}

impl ArtifactoryClient {
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        let mut base = server.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            base,
            client,
            server: server.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if !self.server.access_token.is_empty() {
            request.bearer_auth(&self.server.access_token)
        } else if !self.server.user.is_empty() {
            request.basic_auth(&self.server.user, Some(&self.server.password))
        } else {
            request
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str, expected: StatusCode) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status != expected {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(response)
    }

    async fn post_plugin<B, R>(&self, name: &str, body: &B, expected: StatusCode) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(&format!("{PLUGIN_PREFIX}{name}"));
        let response = self
            .send(self.client.post(&url).json(body), &url, expected)
            .await?;
        Ok(response.json().await?)
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.url(path);
        let response = self.send(self.client.get(&url), &url, StatusCode::OK).await?;
        Ok(response.json().await?)
    }

    async fn aql(&self, query: String) -> Result<Vec<ListItem>> {
        let url = self.url("api/search/aql");
        tracing::debug!("AQL: {}", query);
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(query);
        let response = self.send(request, &url, StatusCode::OK).await?;
        let parsed: AqlResponse = response.json().await?;
        Ok(parsed.results)
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn folder_query(repo: &str, path: &str, page: usize) -> String {
    format!(
        r#"items.find({{"type":"any","$or":[{{"$and":[{{"repo":"{repo}","path":{{"$match":"{path}"}},"name":{{"$match":"*"}}}}]}}]}}).include("repo","path","name","type","size").sort({{"$asc":["name"]}}).offset({}).limit({PAGINATION_LIMIT})"#,
        page * PAGINATION_LIMIT
    )
}

fn modified_query(repo: &str, name: &str, from: DateTime<Utc>, to: DateTime<Utc>, page: usize) -> String {
    format!(
        r#"items.find({{"type":"file","modified":{{"$gte":"{}","$lt":"{}"}},"$or":[{{"$and":[{{"repo":"{repo}","path":{{"$match":"*"}},"name":{{"$match":"{name}"}}}}]}}]}}).include("repo","path","name","type","size").sort({{"$asc":["name","path"]}}).offset({}).limit({PAGINATION_LIMIT})"#,
        format_time(from),
        format_time(to),
        page * PAGINATION_LIMIT
    )
}

#[async_trait]
impl SourceApi for ArtifactoryClient {
    async fn upload_chunk(&self, chunk: &UploadChunk) -> Result<UploadChunkResponse> {
        self.post_plugin("uploadChunk", chunk, StatusCode::ACCEPTED).await
    }

    async fn sync_chunks(
        &self,
        body: &UploadChunksStatusBody,
    ) -> Result<UploadChunksStatusResponse> {
        self.post_plugin("syncChunks", body, StatusCode::OK).await
    }

    async fn store_properties(&self, repo_key: &str) -> Result<()> {
        let url = self.url(&format!("{PLUGIN_PREFIX}storeProperties"));
        let body = serde_json::json!({ "repoKey": repo_key });
        self.send(self.client.post(&url).json(&body), &url, StatusCode::OK)
            .await?;
        Ok(())
    }

    async fn handle_properties_diff(
        &self,
        request: &HandlePropertiesDiff,
    ) -> Result<HandlePropertiesDiffResponse> {
        self.post_plugin("handlePropertiesDiff", request, StatusCode::OK)
            .await
    }

    async fn stop(&self) -> Result<String> {
        let response: NodeIdResponse = self
            .post_plugin("stop", &serde_json::json!({}), StatusCode::OK)
            .await?;
        Ok(response.node_id)
    }

    async fn verify_compatibility(&self) -> Result<VerifyCompatibilityResponse> {
        self.post_plugin("verifyCompatibility", &serde_json::json!({}), StatusCode::OK)
            .await
    }

    async fn data_transfer_version(&self) -> Result<String> {
        let response: VerifyCompatibilityResponse = self
            .get_json(&format!("{PLUGIN_PREFIX}dataTransferVersion"))
            .await?;
        Ok(response.version)
    }

    async fn verify_connectivity(&self, auth: &TargetAuth) -> Result<()> {
        let url = self.url(&format!("{PLUGIN_PREFIX}verifySourceTargetConnectivity"));
        self.send(self.client.post(&url).json(auth), &url, StatusCode::OK)
            .await?;
        Ok(())
    }

    async fn ping_node(&self) -> Result<String> {
        let url = self.url("api/system/ping");
        let response = self.send(self.client.get(&url), &url, StatusCode::OK).await?;
        let node_id = response
            .headers()
            .get(NODE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(node_id)
    }

    async fn repositories(&self) -> Result<Vec<RepoSummary>> {
        let local: Vec<RepositoryEntry> = self.get_json("api/repositories?type=local").await?;
        let mut repos: Vec<RepoSummary> = local
            .into_iter()
            .map(|entry| RepoSummary::new(&entry.key, PackageType::parse(&entry.package_type)))
            .collect();

        let storage: StorageInfo = self.get_json("api/storageinfo").await?;
        for summary in storage.repositories_summary_list {
            let (files, bytes) = (summary.files_count, summary.used_space_in_bytes);
            if let Some(repo) = repos.iter_mut().find(|repo| repo.key == summary.repo_key) {
                repo.files_count = files;
                repo.size_bytes = bytes;
                continue;
            }
            let package_type = PackageType::parse(&summary.package_type);
            if package_type == PackageType::BuildInfo {
                repos.push(RepoSummary::new(&summary.repo_key, package_type).with_totals(files, bytes));
            }
        }
        Ok(repos)
    }

    async fn list_directory(&self, repo: &str, path: &str, page: usize) -> Result<Vec<ListItem>> {
        self.aql(folder_query(repo, path, page)).await
    }

    async fn search_modified(
        &self,
        repo: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<ListItem>> {
        self.aql(modified_query(repo, "*", from, to, page)).await
    }

    async fn search_manifests(
        &self,
        repo: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<ListItem>> {
        self.aql(modified_query(repo, "manifest.json", from, to, page))
            .await
    }
}

#[async_trait]
impl TargetApi for ArtifactoryClient {
    async fn repository_keys(&self) -> Result<Vec<String>> {
        let repos: Vec<RepositoryEntry> = self.get_json("api/repositories").await?;
        Ok(repos.into_iter().map(|entry| entry.key).collect())
    }
}
