//! GitLab REST API (v4): project lookup, paginated tree, raw files

use super::{check_response, HostError, RemoteFile, RepoLocator};
use crate::config::RepositoryConfig;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const PER_PAGE: &str = "100";

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// `{base}/api/v4/projects/{project}` followed by `segments`; each piece is one encoded segment
fn project_url<'a>(
    repos: &RepositoryConfig,
    project: &str,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, HostError> {
    let invalid = |reason: String| HostError {
        status: None,
        rate_limit_exhausted: false,
        reason,
    };
    let mut url = Url::parse(&repos.gitlab_base_url)
        .map_err(|e| invalid(format!("invalid GitLab base URL: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| invalid("GitLab base URL cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(["api", "v4", "projects", project])
        .extend(segments);
    Ok(url)
}

fn authorized(client: &Client, repos: &RepositoryConfig, url: Url) -> RequestBuilder {
    let request = client.get(url);
    match repos.gitlab_token() {
        Some(token) => request.header("PRIVATE-TOKEN", token),
        None => request,
    }
}

/// Resolve the branch and walk every page of the recursive tree
pub(crate) async fn list_files(
    client: &Client,
    repos: &RepositoryConfig,
    locator: &RepoLocator,
) -> Result<(String, Vec<String>), HostError> {
    let branch = match &locator.branch {
        Some(branch) => branch.clone(),
        None => {
            let url = project_url(repos, &locator.project, [])?;
            let info: ProjectInfo = check_response(authorized(client, repos, url).send().await?)
                .await?
                .json()
                .await?;
            info.default_branch.unwrap_or_else(|| "main".to_string())
        }
    };

    let mut paths = Vec::new();
    let mut page = "1".to_string();
    loop {
        let mut url = project_url(repos, &locator.project, ["repository", "tree"])?;
        url.query_pairs_mut()
            .append_pair("recursive", "true")
            .append_pair("per_page", PER_PAGE)
            .append_pair("ref", &branch)
            .append_pair("page", &page);

        let response = check_response(authorized(client, repos, url).send().await?).await?;
        let next_page = response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let entries: Vec<TreeEntry> = response.json().await?;
        debug!(project = %locator.project, page = %page, entries = entries.len(), "Fetched tree page");

        paths.extend(
            entries
                .into_iter()
                .filter(|e| e.kind == "blob")
                .map(|e| e.path),
        );

        match next_page {
            Some(next) if next != page => page = next,
            _ => break,
        }
    }

    Ok((branch, paths))
}

pub(crate) async fn fetch_raw(
    client: &Client,
    repos: &RepositoryConfig,
    file: &RemoteFile,
) -> Result<String, HostError> {
    let mut url = project_url(
        repos,
        &file.project,
        ["repository", "files", file.path.as_str(), "raw"],
    )?;
    url.query_pairs_mut().append_pair("ref", &file.branch);
    let response = authorized(client, repos, url).send().await?;
    Ok(check_response(response).await?.text().await?)
}

pub(crate) fn view_url(repos: &RepositoryConfig, file: &RemoteFile) -> String {
    format!(
        "{}/{}/-/blob/{}/{}",
        repos.gitlab_base_url.trim_end_matches('/'),
        file.project,
        file.branch,
        file.path
    )
}
