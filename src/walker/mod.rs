//! Source walking: repository hosts and structured record sources
//!
//! A walk is a lazy stream of [`SourceDocument`]s. Per-document fetch
//! failures arrive as `Err(FetchFailed)` items and the walk continues;
//! a source that cannot be enumerated yields one `Err(EnumerationFailed)`
//! item, which callers treat as fatal. Nothing is cached between calls, so
//! calling [`SourceWalker::list_documents`] again re-fetches from the start.

mod github;
mod gitlab;
mod records;

pub use records::{normalize_fields, record_document, render_record, RecordSource, RecordsReader};

use crate::chunk::compute_text_hash;
use crate::config::{Config, RepositoryConfig};
use crate::error::{EnumerationKind, Error, Result};
use crate::models::{ContentKind, SourceDocument};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Supported repository hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    GitHub,
    GitLab,
}

/// A repository URL resolved to host, project path and optional branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocator {
    pub host: HostKind,
    /// Host name used in origins, e.g. `github.com`
    pub host_name: String,
    /// `owner/repo` or `group/subgroup/project`
    pub project: String,
    pub branch: Option<String>,
    pub url: String,
}

impl RepoLocator {
    /// Resolve a repository URL. `/tree/<branch>` (or GitLab `/-/tree/<branch>`) is honored.
    pub fn parse(raw: &str, repos: &RepositoryConfig) -> Result<Self> {
        let url = Url::parse(raw.trim())?;
        let host_name = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Repository URL has no host: {}", raw)))?
            .to_lowercase();

        let gitlab_host = Url::parse(&repos.gitlab_base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()));
        let host = if host_name == "github.com" || host_name.ends_with(".github.com") {
            HostKind::GitHub
        } else if gitlab_host.as_deref() == Some(host_name.as_str()) || host_name.contains("gitlab") {
            HostKind::GitLab
        } else {
            return Err(Error::Config(format!(
                "Cannot tell which repository host serves {}",
                raw
            )));
        };

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let (project_parts, branch) = match host {
            HostKind::GitHub => match segments.iter().position(|s| *s == "tree") {
                Some(i) => (&segments[..i], segments.get(i + 1..).map(|b| b.join("/"))),
                None => (&segments[..], None),
            },
            HostKind::GitLab => match segments.iter().position(|s| *s == "-") {
                Some(i) if segments.get(i + 1) == Some(&"tree") => {
                    (&segments[..i], segments.get(i + 2..).map(|b| b.join("/")))
                }
                Some(i) => (&segments[..i], None),
                None => (&segments[..], None),
            },
        };

        let well_formed = match host {
            HostKind::GitHub => project_parts.len() == 2,
            HostKind::GitLab => project_parts.len() >= 2,
        };
        if !well_formed {
            return Err(Error::Config(format!(
                "Repository URL must name an owner and a project: {}",
                raw
            )));
        }

        let project = project_parts
            .join("/")
            .trim_end_matches(".git")
            .to_string();

        Ok(Self {
            host,
            host_name,
            project,
            branch: branch.filter(|b| !b.is_empty()),
            url: raw.trim().to_string(),
        })
    }
}

/// What to walk
#[derive(Debug, Clone)]
pub enum SourceDescriptor {
    Repositories(Vec<RepoLocator>),
    Records(RecordSource),
}

impl SourceDescriptor {
    /// Comma-separated repository URLs; hosts may be mixed
    pub fn repositories(list: &str, repos: &RepositoryConfig) -> Result<Self> {
        let locators = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| RepoLocator::parse(s, repos))
            .collect::<Result<Vec<_>>>()?;
        if locators.is_empty() {
            return Err(Error::Config(
                "No repository URLs provided. Pass a comma-separated list.".to_string(),
            ));
        }
        Ok(SourceDescriptor::Repositories(locators))
    }

    pub fn records(selector: &str) -> Result<Self> {
        Ok(SourceDescriptor::Records(RecordSource::parse(selector)?))
    }

    /// Short description for run records
    pub fn describe(&self) -> String {
        match self {
            SourceDescriptor::Repositories(locators) => locators
                .iter()
                .map(|l| l.url.as_str())
                .collect::<Vec<_>>()
                .join(","),
            SourceDescriptor::Records(source) => source.to_string(),
        }
    }
}

/// One documentation file found while enumerating a repository
#[derive(Debug, Clone)]
pub(crate) struct RemoteFile {
    pub host: HostKind,
    pub host_name: String,
    pub project: String,
    pub branch: String,
    pub path: String,
}

impl RemoteFile {
    pub fn origin(&self) -> String {
        format!("{}/{}/{}", self.host_name, self.project, self.path)
    }
}

/// Failure of a repository host call, before it is attributed to a document or a source
#[derive(Debug)]
pub(crate) struct HostError {
    pub status: Option<u16>,
    pub rate_limit_exhausted: bool,
    pub reason: String,
}

impl HostError {
    pub fn enumeration(self, location: &str) -> Error {
        let kind = match self.status {
            Some(status) => EnumerationKind::from_status(status, self.rate_limit_exhausted),
            None => EnumerationKind::Other,
        };
        Error::EnumerationFailed {
            location: location.to_string(),
            kind,
            reason: self.reason,
        }
    }

    pub fn fetch(self, origin: &str) -> Error {
        Error::FetchFailed {
            origin: origin.to_string(),
            reason: self.reason,
        }
    }
}

impl From<reqwest::Error> for HostError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            rate_limit_exhausted: false,
            reason: err.to_string(),
        }
    }
}

/// Check a host response, capturing rate-limit headers on failure
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers();
    let exhausted = ["x-ratelimit-remaining", "ratelimit-remaining"]
        .iter()
        .filter_map(|h| headers.get(*h))
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.trim() == "0");
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(HostError {
        status: Some(status.as_u16()),
        rate_limit_exhausted: exhausted,
        reason: format!("HTTP {} from {}: {}", status.as_u16(), url, truncate(&body, 200)),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Title from the first level-one heading, falling back to the file name
pub fn document_title(content: &str, path: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# ").map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            path.rsplit('/')
                .next()
                .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem).to_string())
        })
}

/// Enumerates and fetches documents from configured sources
pub struct SourceWalker {
    client: Client,
    repos: RepositoryConfig,
    extensions: Vec<String>,
    max_records: usize,
}

impl SourceWalker {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ragweave/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.repositories.timeout_secs))
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            repos: config.repositories.clone(),
            extensions: config
                .ingest
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            max_records: config.ingest.max_records,
        })
    }

    fn is_documentation(&self, path: &str) -> bool {
        path.rsplit_once('.')
            .map(|(_, ext)| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Lazily yield every document the descriptor names.
    ///
    /// A file is fetched only when the consumer asks for the next item, so
    /// the consumer alone bounds how many documents are in flight.
    pub fn list_documents<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
    ) -> BoxStream<'a, Result<SourceDocument>> {
        match descriptor {
            SourceDescriptor::Repositories(locators) => stream::iter(locators.iter())
                .then(move |locator| self.enumerate(locator))
                .flat_map(|listing| match listing {
                    Ok(files) => stream::iter(files.into_iter().map(Ok)).boxed(),
                    Err(e) => stream::once(async move { Err(e) }).boxed(),
                })
                .then(move |file| async move {
                    match file {
                        Ok(file) => self.fetch(file).await,
                        Err(e) => Err(e),
                    }
                })
                .boxed(),
            SourceDescriptor::Records(source) => {
                let reader = RecordsReader::new(source.clone(), self.max_records);
                stream::once(async move { reader.read_all().await })
                    .flat_map(|loaded| match loaded {
                        Ok(docs) => stream::iter(docs).boxed(),
                        Err(e) => stream::once(async move { Err(e) }).boxed(),
                    })
                    .boxed()
            }
        }
    }

    async fn enumerate(&self, locator: &RepoLocator) -> Result<Vec<RemoteFile>> {
        info!(repo = %locator.url, "Enumerating repository");
        let listing = match locator.host {
            HostKind::GitHub => github::list_files(&self.client, &self.repos, locator).await,
            HostKind::GitLab => gitlab::list_files(&self.client, &self.repos, locator).await,
        };

        let (branch, paths) = listing.map_err(|e| e.enumeration(&locator.url))?;
        let mut files: Vec<RemoteFile> = paths
            .into_iter()
            .filter(|p| self.is_documentation(p))
            .map(|path| RemoteFile {
                host: locator.host,
                host_name: locator.host_name.clone(),
                project: locator.project.clone(),
                branch: branch.clone(),
                path,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        if files.len() > self.repos.max_files_per_repo {
            warn!(
                repo = %locator.url,
                found = files.len(),
                limit = self.repos.max_files_per_repo,
                "Truncating documentation file list"
            );
            files.truncate(self.repos.max_files_per_repo);
        }
        debug!(repo = %locator.url, files = files.len(), branch = %branch, "Enumerated documentation files");
        Ok(files)
    }

    async fn fetch(&self, file: RemoteFile) -> Result<SourceDocument> {
        let origin = file.origin();
        let (content, view_url) = match file.host {
            HostKind::GitHub => (
                github::fetch_raw(&self.client, &self.repos, &file).await,
                github::view_url(&self.repos, &file),
            ),
            HostKind::GitLab => (
                gitlab::fetch_raw(&self.client, &self.repos, &file).await,
                gitlab::view_url(&self.repos, &file),
            ),
        };
        let content = content.map_err(|e| {
            warn!(origin = %origin, reason = %e.reason, "Fetch failed");
            e.fetch(&origin)
        })?;

        Ok(SourceDocument {
            source_id: Uuid::new_v5(&Uuid::NAMESPACE_URL, origin.as_bytes()).to_string(),
            title: document_title(&content, &file.path),
            content_hash: compute_text_hash(&content),
            raw_content: content,
            fetched_at: Utc::now(),
            view_url: Some(view_url),
            kind: ContentKind::Markdown,
            origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repos_for(server: &MockServer) -> RepositoryConfig {
        RepositoryConfig {
            github_api_url: server.uri(),
            github_token_env: String::new(),
            gitlab_base_url: server.uri(),
            gitlab_token_env: String::new(),
            ..RepositoryConfig::default()
        }
    }

    fn walker_for(server: &MockServer) -> SourceWalker {
        let mut config = Config::default();
        config.repositories = repos_for(server);
        config.ingest.fan_out = 2;
        SourceWalker::new(&config).unwrap()
    }

    async fn mount_github_repo(server: &MockServer, files: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/docs"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"default_branch": "main"})),
            )
            .mount(server)
            .await;
        let tree: Vec<serde_json::Value> = files
            .iter()
            .map(|p| serde_json::json!({"path": p, "type": "blob"}))
            .chain(std::iter::once(serde_json::json!({"path": "docs", "type": "tree"})))
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/acme/docs/git/trees/main"))
            .and(query_param("recursive", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"tree": tree, "truncated": false})),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_parse_github_locator() {
        let repos = RepositoryConfig::default();
        let loc = RepoLocator::parse("https://github.com/acme/docs", &repos).unwrap();
        assert_eq!(loc.host, HostKind::GitHub);
        assert_eq!(loc.project, "acme/docs");
        assert_eq!(loc.branch, None);

        let loc = RepoLocator::parse("https://github.com/acme/docs.git", &repos).unwrap();
        assert_eq!(loc.project, "acme/docs");

        let loc = RepoLocator::parse("https://github.com/acme/docs/tree/release/v2", &repos).unwrap();
        assert_eq!(loc.branch.as_deref(), Some("release/v2"));

        assert!(RepoLocator::parse("https://github.com/acme", &repos).is_err());
        assert!(RepoLocator::parse("https://example.org/a/b", &repos).is_err());
    }

    #[test]
    fn test_parse_gitlab_locator() {
        let repos = RepositoryConfig::default();
        let loc = RepoLocator::parse("https://gitlab.com/group/sub/project/-/tree/dev", &repos).unwrap();
        assert_eq!(loc.host, HostKind::GitLab);
        assert_eq!(loc.project, "group/sub/project");
        assert_eq!(loc.branch.as_deref(), Some("dev"));
    }

    #[test]
    fn test_descriptor_mixed_hosts() {
        let repos = RepositoryConfig::default();
        let descriptor = SourceDescriptor::repositories(
            "https://github.com/a/b, https://gitlab.com/c/d",
            &repos,
        )
        .unwrap();
        match descriptor {
            SourceDescriptor::Repositories(locators) => {
                assert_eq!(locators.len(), 2);
                assert_eq!(locators[1].host, HostKind::GitLab);
            }
            _ => panic!("expected repositories"),
        }
        assert!(SourceDescriptor::repositories(" , ", &repos).is_err());
    }

    #[test]
    fn test_document_title() {
        assert_eq!(
            document_title("intro\n# Getting Started\n", "docs/a.md").as_deref(),
            Some("Getting Started")
        );
        assert_eq!(document_title("no heading", "docs/setup.md").as_deref(), Some("setup"));
    }

    #[tokio::test]
    async fn test_walk_fetches_only_what_is_pulled() {
        let server = MockServer::start().await;
        let files = ["a.md", "b.md", "c.md"];
        mount_github_repo(&server, &files).await;
        for file in files {
            Mock::given(method("GET"))
                .and(path(format!("/repos/acme/docs/contents/{}", file)))
                .respond_with(ResponseTemplate::new(200).set_body_string("# Doc\nbody"))
                .mount(&server)
                .await;
        }

        let walker = walker_for(&server);
        let descriptor = SourceDescriptor::Repositories(vec![RepoLocator {
            host: HostKind::GitHub,
            host_name: "github.com".to_string(),
            project: "acme/docs".to_string(),
            branch: None,
            url: "https://github.com/acme/docs".to_string(),
        }]);
        let first: Vec<Result<SourceDocument>> =
            walker.list_documents(&descriptor).take(1).collect().await;
        assert_eq!(first.len(), 1);

        let contents = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path().contains("/contents/"))
            .count();
        assert_eq!(contents, 1);
    }

    #[tokio::test]
    async fn test_walk_filters_extensions_and_builds_provenance() {
        let server = MockServer::start().await;
        mount_github_repo(&server, &["README.md", "src/main.rs", "docs/guide.mdx"]).await;
        for (file, body) in [("README.md", "# Readme\nhello"), ("docs/guide.mdx", "guide body")] {
            Mock::given(method("GET"))
                .and(path(format!("/repos/acme/docs/contents/{}", file)))
                .and(query_param("ref", "main"))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }

        let walker = walker_for(&server);
        let descriptor = SourceDescriptor::Repositories(vec![RepoLocator {
            host: HostKind::GitHub,
            host_name: "github.com".to_string(),
            project: "acme/docs".to_string(),
            branch: None,
            url: "https://github.com/acme/docs".to_string(),
        }]);
        let docs: Vec<SourceDocument> = walker.list_documents(&descriptor).try_collect().await.unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].origin, "github.com/acme/docs/README.md");
        assert_eq!(docs[0].title.as_deref(), Some("Readme"));
        assert_eq!(
            docs[0].view_url.as_deref(),
            Some("https://github.com/acme/docs/blob/main/README.md")
        );
        assert_eq!(docs[1].origin, "github.com/acme/docs/docs/guide.mdx");
        assert_eq!(docs[1].content_hash, compute_text_hash("guide body"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_per_document() {
        let server = MockServer::start().await;
        let files = ["a.md", "b.md", "c.md", "d.md", "e.md"];
        mount_github_repo(&server, &files).await;
        for file in files {
            let response = if file == "c.md" {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200).set_body_string(format!("content of {}", file))
            };
            Mock::given(method("GET"))
                .and(path(format!("/repos/acme/docs/contents/{}", file)))
                .respond_with(response)
                .mount(&server)
                .await;
        }

        let walker = walker_for(&server);
        let descriptor =
            SourceDescriptor::repositories("https://github.com/acme/docs", &repos_for(&server)).unwrap();
        let results: Vec<Result<SourceDocument>> = walker.list_documents(&descriptor).collect().await;

        assert_eq!(results.len(), 5);
        let failures: Vec<&Error> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], Error::FetchFailed { origin, .. } if origin.ends_with("c.md")));
        assert!(!failures[0].is_fatal());
    }

    #[tokio::test]
    async fn test_enumeration_failure_kinds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/private"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/busy"))
            .respond_with(ResponseTemplate::new(403).insert_header("x-ratelimit-remaining", "0"))
            .mount(&server)
            .await;

        let walker = walker_for(&server);
        for (repo, expected) in [
            ("private", EnumerationKind::Authentication),
            ("gone", EnumerationKind::NotFound),
            ("busy", EnumerationKind::RateLimit),
        ] {
            let descriptor = SourceDescriptor::repositories(
                &format!("https://github.com/acme/{}", repo),
                &repos_for(&server),
            )
            .unwrap();
            let results: Vec<Result<SourceDocument>> =
                walker.list_documents(&descriptor).collect().await;
            assert_eq!(results.len(), 1);
            match &results[0] {
                Err(err @ Error::EnumerationFailed { kind, .. }) => {
                    assert_eq!(*kind, expected);
                    assert!(err.is_fatal());
                }
                other => panic!("unexpected result: {:?}", other.as_ref().map(|d| &d.origin)),
            }
        }
    }
}
