//! GitHub REST API: default branch, recursive tree, raw contents

use super::{check_response, HostError, RemoteFile, RepoLocator};
use crate::config::RepositoryConfig;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

fn api_url<'a>(
    repos: &RepositoryConfig,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, HostError> {
    let mut url = Url::parse(&repos.github_api_url).map_err(|e| HostError {
        status: None,
        rate_limit_exhausted: false,
        reason: format!("invalid GitHub API URL: {}", e),
    })?;
    url.path_segments_mut()
        .map_err(|_| HostError {
            status: None,
            rate_limit_exhausted: false,
            reason: "GitHub API URL cannot be a base".to_string(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn authorized(client: &Client, repos: &RepositoryConfig, url: Url, accept: &str) -> RequestBuilder {
    let request = client
        .get(url)
        .header("Accept", accept)
        .header("X-GitHub-Api-Version", "2022-11-28");
    match repos.github_token() {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn split_project(project: &str) -> (&str, &str) {
    project.split_once('/').unwrap_or((project, ""))
}

/// Resolve the branch and list every blob path in the repository
pub(crate) async fn list_files(
    client: &Client,
    repos: &RepositoryConfig,
    locator: &RepoLocator,
) -> Result<(String, Vec<String>), HostError> {
    let (owner, repo) = split_project(&locator.project);

    let branch = match &locator.branch {
        Some(branch) => branch.clone(),
        None => {
            let url = api_url(repos, ["repos", owner, repo])?;
            let info: RepoInfo = check_response(
                authorized(client, repos, url, "application/vnd.github+json")
                    .send()
                    .await?,
            )
            .await?
            .json()
            .await?;
            info.default_branch
        }
    };

    let mut url = api_url(repos, ["repos", owner, repo, "git", "trees", branch.as_str()])?;
    url.query_pairs_mut().append_pair("recursive", "1");
    let tree: TreeResponse = check_response(
        authorized(client, repos, url, "application/vnd.github+json")
            .send()
            .await?,
    )
    .await?
    .json()
    .await?;

    if tree.truncated {
        warn!(repo = %locator.project, "GitHub returned a truncated tree; some files are missing");
    }
    debug!(repo = %locator.project, entries = tree.tree.len(), "Fetched tree");

    let paths = tree
        .tree
        .into_iter()
        .filter(|entry| entry.kind == "blob")
        .map(|entry| entry.path)
        .collect();
    Ok((branch, paths))
}

/// Fetch one file through the contents API using the raw media type
pub(crate) async fn fetch_raw(
    client: &Client,
    repos: &RepositoryConfig,
    file: &RemoteFile,
) -> Result<String, HostError> {
    let (owner, repo) = split_project(&file.project);
    let mut url = api_url(
        repos,
        ["repos", owner, repo, "contents"]
            .into_iter()
            .chain(file.path.split('/')),
    )?;
    url.query_pairs_mut().append_pair("ref", &file.branch);

    let response = authorized(client, repos, url, "application/vnd.github.raw")
        .send()
        .await?;
    Ok(check_response(response).await?.text().await?)
}

/// Permanent link shown as provenance
pub(crate) fn view_url(repos: &RepositoryConfig, file: &RemoteFile) -> String {
    format!(
        "{}/{}/blob/{}/{}",
        repos.github_web_url.trim_end_matches('/'),
        file.project,
        file.branch,
        file.path
    )
}
