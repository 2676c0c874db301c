//! Git-workflow hook wrapped around pipeline handlers.
//!
//! The core only defines the contract: before the handler runs, a work
//! branch is created; afterwards, changes are committed, pushed, and a PR
//! is opened using worker-supplied callbacks. Any failure along the way
//! restores the original branch and propagates into the normal retry path.
//! The actual VCS binding lives outside the core; [`DryRunGit`] is the
//! built-in stand-in that only logs.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use super::classifier::JobError;
use super::jobs::{GitMeta, Job, JobContext, JobHandler};

/// Toggles and naming for the workflow.
#[derive(Debug, Clone)]
pub struct GitWorkflowConfig {
    pub enabled: bool,
    pub base_branch: String,
    pub branch_prefix: String,
    pub dry_run: bool,
}

impl Default for GitWorkflowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_branch: "main".to_string(),
            branch_prefix: "alephauto".to_string(),
            dry_run: false,
        }
    }
}

/// Pull-request content produced by a worker's [`GitHooks::pr_context`].
#[derive(Debug, Clone)]
pub struct PrContext {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Worker-supplied callbacks for commit and PR content.
pub trait GitHooks: Send + Sync {
    fn commit_message(&self, job: &Job) -> String;
    fn pr_context(&self, job: &Job) -> PrContext;
}

/// Reasonable defaults when a worker brings no custom hooks.
pub struct DefaultGitHooks;

impl GitHooks for DefaultGitHooks {
    fn commit_message(&self, job: &Job) -> String {
        format!("chore({}): automated update for job {}", job.pipeline_id, job.id)
    }

    fn pr_context(&self, job: &Job) -> PrContext {
        PrContext {
            title: format!("[{}] automated update", job.pipeline_id),
            body: format!("Automated change produced by job `{}`.", job.id),
            labels: vec!["automated".to_string()],
        }
    }
}

/// What [`GitWorkflow::finalize`] reports back.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOutcome {
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
}

/// The VCS contract invoked around a handler. Implementations live outside
/// the core.
#[async_trait::async_trait]
pub trait GitWorkflow: Send + Sync {
    /// Record the current branch and switch to `branch`. Returns the
    /// original branch name.
    async fn prepare(&self, job: &Job, branch: &str) -> Result<String, JobError>;

    /// Paths changed in the working tree since `prepare`.
    async fn changed_files(&self, job: &Job) -> Result<Vec<String>, JobError>;

    /// Commit, push, and open a PR.
    async fn finalize(
        &self,
        job: &Job,
        branch: &str,
        commit_message: &str,
        pr: &PrContext,
    ) -> Result<FinalizeOutcome, JobError>;

    /// Delete `branch` and restore `original_branch`. Called on empty
    /// change sets and on every error path; must be safe to call twice.
    async fn abandon(&self, branch: &str, original_branch: &str) -> Result<(), JobError>;
}

/// Stand-in implementation used for `GIT_DRY_RUN` and tests: every step
/// logs and reports no changes.
pub struct DryRunGit {
    base_branch: String,
}

impl DryRunGit {
    pub fn new(base_branch: impl Into<String>) -> Self {
        Self {
            base_branch: base_branch.into(),
        }
    }
}

#[async_trait::async_trait]
impl GitWorkflow for DryRunGit {
    async fn prepare(&self, job: &Job, branch: &str) -> Result<String, JobError> {
        info!(job_id = %job.id, branch, "dry-run: would create branch");
        Ok(self.base_branch.clone())
    }

    async fn changed_files(&self, job: &Job) -> Result<Vec<String>, JobError> {
        info!(job_id = %job.id, "dry-run: reporting no changes");
        Ok(Vec::new())
    }

    async fn finalize(
        &self,
        job: &Job,
        branch: &str,
        commit_message: &str,
        _pr: &PrContext,
    ) -> Result<FinalizeOutcome, JobError> {
        info!(job_id = %job.id, branch, commit_message, "dry-run: would commit and open PR");
        Ok(FinalizeOutcome::default())
    }

    async fn abandon(&self, branch: &str, original_branch: &str) -> Result<(), JobError> {
        info!(branch, original_branch, "dry-run: would restore original branch");
        Ok(())
    }
}

/// A configured workflow attached to one worker.
#[derive(Clone)]
pub struct GitHook {
    config: GitWorkflowConfig,
    workflow: Arc<dyn GitWorkflow>,
    hooks: Arc<dyn GitHooks>,
}

impl GitHook {
    pub fn new(
        config: GitWorkflowConfig,
        workflow: Arc<dyn GitWorkflow>,
        hooks: Arc<dyn GitHooks>,
    ) -> Self {
        Self {
            config,
            workflow,
            hooks,
        }
    }

    /// Branch name: `<prefix>/<pipeline>/<slug>-<ts>`.
    fn branch_name(&self, job: &Job) -> String {
        format!(
            "{}/{}/{}-{}",
            self.config.branch_prefix,
            job.pipeline_id,
            slugify(&job.id),
            Utc::now().timestamp()
        )
    }

    /// Run `handler` inside the workflow. Returns the handler result plus
    /// git metadata when changes were pushed.
    pub async fn run(
        &self,
        job: &Job,
        handler: &dyn JobHandler,
        ctx: JobContext,
    ) -> Result<(Value, Option<GitMeta>), JobError> {
        let branch = self.branch_name(job);
        let original = self.workflow.prepare(job, &branch).await?;

        let value = match handler.run(job.clone(), ctx).await {
            Ok(value) => value,
            Err(e) => {
                self.try_abandon(&branch, &original).await;
                return Err(e);
            }
        };

        let changed = match self.workflow.changed_files(job).await {
            Ok(changed) => changed,
            Err(e) => {
                self.try_abandon(&branch, &original).await;
                return Err(e);
            }
        };

        if changed.is_empty() {
            // Nothing to ship; clean up and complete normally.
            self.try_abandon(&branch, &original).await;
            return Ok((value, None));
        }

        let message = self.hooks.commit_message(job);
        let pr = self.hooks.pr_context(job);
        match self.workflow.finalize(job, &branch, &message, &pr).await {
            Ok(outcome) => Ok((
                value,
                Some(GitMeta {
                    branch,
                    original_branch: original,
                    commit_sha: outcome.commit_sha,
                    pr_url: outcome.pr_url,
                    changed_files: changed,
                }),
            )),
            Err(e) => {
                self.try_abandon(&branch, &original).await;
                Err(e)
            }
        }
    }

    async fn try_abandon(&self, branch: &str, original: &str) {
        if let Err(e) = self.workflow.abandon(branch, original).await {
            warn!(branch, error = %e, "failed to restore original branch");
        }
    }
}

fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::activity::ActivityFeed;
    use crate::kernel::bus::EventBus;
    use crate::kernel::jobs::{JobEvents, JobStore};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct OkHandler;

    #[async_trait::async_trait]
    impl JobHandler for OkHandler {
        async fn run(&self, _job: Job, _ctx: JobContext) -> Result<Value, JobError> {
            Ok(json!({"ok": true}))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl JobHandler for FailingHandler {
        async fn run(&self, _job: Job, _ctx: JobContext) -> Result<Value, JobError> {
            Err(JobError::new("handler exploded"))
        }
    }

    /// Records the call sequence and serves canned change sets.
    struct RecordingGit {
        calls: Mutex<Vec<String>>,
        changes: Vec<String>,
        fail_finalize: bool,
    }

    impl RecordingGit {
        fn new(changes: Vec<String>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                changes,
                fail_finalize: false,
            }
        }

        fn log(&self, call: &str) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call.to_string());
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl GitWorkflow for RecordingGit {
        async fn prepare(&self, _job: &Job, _branch: &str) -> Result<String, JobError> {
            self.log("prepare");
            Ok("main".to_string())
        }

        async fn changed_files(&self, _job: &Job) -> Result<Vec<String>, JobError> {
            self.log("changed_files");
            Ok(self.changes.clone())
        }

        async fn finalize(
            &self,
            _job: &Job,
            _branch: &str,
            _commit_message: &str,
            _pr: &PrContext,
        ) -> Result<FinalizeOutcome, JobError> {
            self.log("finalize");
            if self.fail_finalize {
                return Err(JobError::new("push rejected"));
            }
            Ok(FinalizeOutcome {
                commit_sha: Some("abc123".to_string()),
                pr_url: Some("https://example.test/pr/1".to_string()),
            })
        }

        async fn abandon(&self, _branch: &str, _original: &str) -> Result<(), JobError> {
            self.log("abandon");
            Ok(())
        }
    }

    async fn ctx(job: &Job) -> JobContext {
        let store = JobStore::in_memory().await.unwrap();
        let events = JobEvents::new(Arc::new(EventBus::new()), Arc::new(ActivityFeed::default()));
        JobContext::new(
            job.id.clone(),
            job.pipeline_id.clone(),
            CancellationToken::new(),
            store,
            events,
        )
    }

    fn hook(workflow: Arc<dyn GitWorkflow>) -> GitHook {
        GitHook::new(
            GitWorkflowConfig {
                enabled: true,
                ..Default::default()
            },
            workflow,
            Arc::new(DefaultGitHooks),
        )
    }

    #[tokio::test]
    async fn changes_produce_git_metadata() {
        let git = Arc::new(RecordingGit::new(vec!["src/lib.rs".to_string()]));
        let hook = hook(git.clone());
        let job = Job::new(Some("j1".into()), "gitignore-manager", json!(null));

        let (value, meta) = hook.run(&job, &OkHandler, ctx(&job).await).await.unwrap();
        assert_eq!(value, json!({"ok": true}));

        let meta = meta.unwrap();
        assert_eq!(meta.original_branch, "main");
        assert_eq!(meta.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(meta.changed_files, vec!["src/lib.rs"]);
        assert!(meta.branch.starts_with("alephauto/gitignore-manager/j1-"));

        assert_eq!(git.calls(), vec!["prepare", "changed_files", "finalize"]);
    }

    #[tokio::test]
    async fn no_changes_abandons_the_branch() {
        let git = Arc::new(RecordingGit::new(Vec::new()));
        let hook = hook(git.clone());
        let job = Job::new(Some("j1".into()), "p", json!(null));

        let (_, meta) = hook.run(&job, &OkHandler, ctx(&job).await).await.unwrap();
        assert!(meta.is_none());
        assert_eq!(git.calls(), vec!["prepare", "changed_files", "abandon"]);
    }

    #[tokio::test]
    async fn handler_error_restores_and_propagates() {
        let git = Arc::new(RecordingGit::new(vec!["x".to_string()]));
        let hook = hook(git.clone());
        let job = Job::new(Some("j1".into()), "p", json!(null));

        let err = hook
            .run(&job, &FailingHandler, ctx(&job).await)
            .await
            .unwrap_err();
        assert!(err.message.contains("handler exploded"));
        assert_eq!(git.calls(), vec!["prepare", "abandon"]);
    }

    #[tokio::test]
    async fn finalize_error_restores_and_propagates() {
        let mut git = RecordingGit::new(vec!["x".to_string()]);
        git.fail_finalize = true;
        let git = Arc::new(git);
        let hook = hook(git.clone());
        let job = Job::new(Some("j1".into()), "p", json!(null));

        let err = hook
            .run(&job, &OkHandler, ctx(&job).await)
            .await
            .unwrap_err();
        assert!(err.message.contains("push rejected"));
        assert_eq!(
            git.calls(),
            vec!["prepare", "changed_files", "finalize", "abandon"]
        );
    }

    #[test]
    fn slugs_are_lowercase_alphanumeric_dashes() {
        assert_eq!(slugify("Scan Repo #42"), "scan-repo-42");
        assert_eq!(slugify("j1"), "j1");
        assert_eq!(slugify("--weird__input--"), "weird-input");
    }

    #[test]
    fn default_hooks_mention_the_job() {
        let job = Job::new(Some("j9".into()), "repomix", json!(null));
        let message = DefaultGitHooks.commit_message(&job);
        assert!(message.contains("repomix"));
        assert!(message.contains("j9"));
        let pr = DefaultGitHooks.pr_context(&job);
        assert!(pr.title.contains("repomix"));
        assert_eq!(pr.labels, vec!["automated"]);
    }
}
