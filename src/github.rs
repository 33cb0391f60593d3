use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;
use crate::models::{Ticket, TicketStatus};

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "autocode";

/// REST calls get short timeouts; the long-running work lives in the
/// agents, not here.
const REST_TIMEOUT: Duration = Duration::from_secs(15);

/// GitHub's binary issue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => anyhow::bail!("Unknown GitHub issue state: {}", s),
        }
    }
}

/// A GitHub issue (subset of fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubIssue {
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub html_url: String,
    /// Pull requests also come through the issues endpoint; filter them out.
    pub pull_request: Option<serde_json::Value>,
}

// ── Status mapping policy ─────────────────────────────────────────────

/// GitHub has no notion of "review" or "pending_validation": everything
/// short of `closed` flattens to `open`.
pub fn map_ticket_status_to_github(status: TicketStatus) -> IssueState {
    match status {
        TicketStatus::Closed => IssueState::Closed,
        _ => IssueState::Open,
    }
}

/// Inbound direction. GitHub is the source of truth for "is this done",
/// but the richer workflow state is only tracked locally: an existing
/// ticket keeps its status as long as the remote issue stays open, while a
/// remote close always wins.
pub fn map_github_to_local(
    state: IssueState,
    existing: Option<TicketStatus>,
) -> TicketStatus {
    match (state, existing) {
        (IssueState::Closed, _) => TicketStatus::Closed,
        (IssueState::Open, Some(current)) => current,
        (IssueState::Open, None) => TicketStatus::Open,
    }
}

// ── Client ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl GithubClient {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(token, GITHUB_API_URL)
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn issue_url(&self, repository: &str, issue_number: i64) -> String {
        format!(
            "{}/repos/{}/issues/{}",
            self.base_url, repository, issue_number
        )
    }

    /// List issues for a repository (excludes pull requests).
    /// `state` is `open`, `closed`, or `all`. Paginates automatically.
    pub async fn list_issues(&self, repository: &str, state: &str) -> Result<Vec<GithubIssue>> {
        let url = format!("{}/repos/{}/issues", self.base_url, repository);
        let mut all_issues = Vec::new();
        let mut page = 1u32;

        loop {
            let resp: Vec<GithubIssue> = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", self.token))
                .header("User-Agent", USER_AGENT)
                .query(&[
                    ("state", state),
                    ("per_page", "100"),
                    ("page", &page.to_string()),
                ])
                .send()
                .await
                .context("Failed to send issues request to GitHub")?
                .error_for_status()
                .context("GitHub issues API returned error status")?
                .json()
                .await
                .context("Failed to parse issues response from GitHub")?;

            let count = resp.len();
            all_issues.extend(resp.into_iter().filter(|i| i.pull_request.is_none()));

            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all_issues)
    }

    pub async fn get_issue(&self, repository: &str, issue_number: i64) -> Result<GithubIssue> {
        self.client
            .get(self.issue_url(repository, issue_number))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to send issue request to GitHub")?
            .error_for_status()
            .context("GitHub issue API returned error status")?
            .json()
            .await
            .context("Failed to parse issue response from GitHub")
    }

    /// Push the outbound half of the sync: set the remote issue's binary
    /// state.
    pub async fn set_issue_state(
        &self,
        repository: &str,
        issue_number: i64,
        state: IssueState,
    ) -> Result<()> {
        self.client
            .patch(self.issue_url(repository, issue_number))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({ "state": state.as_str() }))
            .send()
            .await
            .context("Failed to send issue update to GitHub")?
            .error_for_status()
            .context("GitHub issue update returned error status")?;
        Ok(())
    }

    pub async fn create_issue_comment(
        &self,
        repository: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()> {
        let url = format!("{}/comments", self.issue_url(repository, issue_number));
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to send issue comment to GitHub")?
            .error_for_status()
            .context("GitHub issue comment returned error status")?;
        Ok(())
    }
}

// ── Import / sync orchestration ───────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct IssueError {
    pub issue_number: i64,
    pub error: String,
}

/// Batch result for `import_all`: per-item outcomes, never an aborted
/// batch.
#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub imported_count: usize,
    pub skipped_count: usize,
    pub errored_count: usize,
    pub imported: Vec<Ticket>,
    pub skipped: Vec<i64>,
    pub errored: Vec<IssueError>,
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub total_remote: usize,
    pub imported: Vec<Ticket>,
    pub updated: Vec<Ticket>,
    pub unchanged: usize,
    pub errored: Vec<IssueError>,
}

/// Outcome of importing a single issue.
#[derive(Debug)]
pub enum ImportOutcome {
    Imported(Ticket),
    /// A ticket for this issue number already exists.
    Skipped(i64),
}

async fn import_remote_issue(db: &DbHandle, repository: &str, issue: &GithubIssue) -> Result<ImportOutcome> {
    let state = IssueState::parse(&issue.state)?;
    let status = map_github_to_local(state, None);
    let repo = repository.to_string();
    let title = issue.title.clone();
    let body = issue.body.clone().unwrap_or_default();
    let number = issue.number;
    let url = issue.html_url.clone();
    let created = db
        .call(move |store| store.create_from_issue(&repo, &title, &body, number, &url, status))
        .await?;
    Ok(match created {
        Some(ticket) => ImportOutcome::Imported(ticket),
        None => ImportOutcome::Skipped(issue.number),
    })
}

/// Import one remote issue by number. Idempotent: a second import of the
/// same number reports a skip instead of creating a duplicate.
pub async fn import_issue(
    db: &DbHandle,
    github: &GithubClient,
    repository: &str,
    issue_number: i64,
) -> Result<ImportOutcome> {
    let issue = github.get_issue(repository, issue_number).await?;
    import_remote_issue(db, repository, &issue).await
}

/// Import every listed remote issue. One bad issue lands in `errored`;
/// the rest of the batch proceeds.
pub async fn import_issues(
    db: &DbHandle,
    repository: &str,
    issues: &[GithubIssue],
) -> ImportReport {
    let mut report = ImportReport {
        imported_count: 0,
        skipped_count: 0,
        errored_count: 0,
        imported: Vec::new(),
        skipped: Vec::new(),
        errored: Vec::new(),
    };

    for issue in issues {
        match import_remote_issue(db, repository, issue).await {
            Ok(ImportOutcome::Imported(ticket)) => report.imported.push(ticket),
            Ok(ImportOutcome::Skipped(number)) => report.skipped.push(number),
            Err(e) => report.errored.push(IssueError {
                issue_number: issue.number,
                error: e.to_string(),
            }),
        }
    }

    report.imported_count = report.imported.len();
    report.skipped_count = report.skipped.len();
    report.errored_count = report.errored.len();
    report
}

pub async fn import_all(
    db: &DbHandle,
    github: &GithubClient,
    repository: &str,
    state: &str,
) -> Result<ImportReport> {
    let issues = github.list_issues(repository, state).await?;
    Ok(import_issues(db, repository, &issues).await)
}

/// Reconcile remote issues against the local store: unlinked issues are
/// first-imported, linked tickets keep their local status unless the
/// remote issue closed.
pub async fn apply_remote_issues(
    db: &DbHandle,
    repository: &str,
    issues: &[GithubIssue],
) -> SyncReport {
    let mut report = SyncReport {
        total_remote: issues.len(),
        imported: Vec::new(),
        updated: Vec::new(),
        unchanged: 0,
        errored: Vec::new(),
    };

    for issue in issues {
        match reconcile_one(db, repository, issue).await {
            Ok(Reconciled::Imported(ticket)) => report.imported.push(ticket),
            Ok(Reconciled::Updated(ticket)) => report.updated.push(ticket),
            Ok(Reconciled::Unchanged) => report.unchanged += 1,
            Err(e) => report.errored.push(IssueError {
                issue_number: issue.number,
                error: e.to_string(),
            }),
        }
    }

    report
}

enum Reconciled {
    Imported(Ticket),
    Updated(Ticket),
    Unchanged,
}

async fn reconcile_one(db: &DbHandle, repository: &str, issue: &GithubIssue) -> Result<Reconciled> {
    let state = IssueState::parse(&issue.state)?;
    let repo = repository.to_string();
    let number = issue.number;
    let existing = db
        .call(move |store| store.find_by_issue_number(&repo, number))
        .await?;

    match existing {
        None => Ok(match import_remote_issue(db, repository, issue).await? {
            ImportOutcome::Imported(ticket) => Reconciled::Imported(ticket),
            ImportOutcome::Skipped(_) => Reconciled::Unchanged,
        }),
        Some(ticket) => {
            let desired = map_github_to_local(state, Some(ticket.status));
            if desired == ticket.status {
                return Ok(Reconciled::Unchanged);
            }
            let id = ticket.id.clone();
            let updated = db.call(move |store| store.set_status(&id, desired)).await?;
            Ok(Reconciled::Updated(updated))
        }
    }
}

pub async fn sync_repository(
    db: &DbHandle,
    github: &GithubClient,
    repository: &str,
    state: &str,
) -> Result<SyncReport> {
    let issues = github.list_issues(repository, state).await?;
    Ok(apply_remote_issues(db, repository, issues.as_slice()).await)
}
