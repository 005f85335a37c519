use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ContractError, SourceError};
use crate::run::RepositoryDescriptor;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches the raw notebook bytes for a repository at a branch.
pub trait NotebookSource: Send + Sync {
    fn download(
        &self,
        repository: &RepositoryDescriptor,
        branch: &str,
        path: &str,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Splits `https://github.com/<owner>/<repo>[.git][/]` into its parts.
pub fn parse_repo_url(url: &str) -> Result<(String, String), ContractError> {
    let invalid = || ContractError::InvalidRepositoryUrl(url.to_string());
    let rest = url
        .trim()
        .strip_prefix("https://github.com/")
        .or_else(|| url.trim().strip_prefix("http://github.com/"))
        .ok_or_else(invalid)?;
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(invalid()),
    }
}

#[derive(Deserialize)]
struct ContentsResponse {
    content: String,
}

/// Reads notebooks through the GitHub contents API.
pub struct GithubSource {
    client: Client,
    api_url: String,
    token: String,
}

impl GithubSource {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(concat!("mlops-pipeline/", env!("CARGO_PKG_VERSION")))
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|err| SourceError::Network(err.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

impl NotebookSource for GithubSource {
    fn download(
        &self,
        repository: &RepositoryDescriptor,
        branch: &str,
        path: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let (owner, repo) = parse_repo_url(&repository.github_url)?;
        let url = format!("{}/repos/{owner}/{repo}/contents/{path}", self.api_url);
        debug!(url = url.as_str(), branch, "Downloading notebook");

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .query(&[("ref", branch)]);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .map_err(|err| SourceError::Network(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(SourceError::NotFound {
                    path: path.to_string(),
                    branch: branch.to_string(),
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SourceError::Unauthorized {
                    status: response.status().as_u16(),
                });
            }
            status if !status.is_success() => {
                return Err(SourceError::Network(format!("HTTP {status} from {url}")));
            }
            _ => {}
        }

        let body: ContentsResponse = response
            .json()
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        decode_content(&body.content)
    }
}

/// The contents API wraps base64 at 60 columns.
fn decode_content(content: &str) -> Result<Vec<u8>, SourceError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|err| SourceError::Decode(err.to_string()))
}
