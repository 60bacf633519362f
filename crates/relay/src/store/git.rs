// Git-backed durable store.
//
// One bare repository per project at `{repos_root}/{project_id}.git`, with
// every document committed to `refs/heads/main`. Commits are built with
// plumbing against a throwaway index so nothing ever needs a work tree, and
// the branch only moves through a compare-and-swap `update-ref`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use docsync_common::{Author, DocumentKey, Revision};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DurableStore, StoreError};

const BRANCH_REF: &str = "refs/heads/main";
const MAX_REF_UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, std::io::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, std::io::Error> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }
        let output = child.wait_with_output()?;

        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GitFailure {
    command: String,
    code: Option<i32>,
    stderr: String,
}

impl GitFailure {
    fn into_store_error(self) -> StoreError {
        StoreError::Unavailable(format!(
            "`{}` failed with code {:?}: {}",
            self.command,
            self.code,
            self.stderr.trim()
        ))
    }
}

#[derive(Clone)]
pub struct GitStore<E = ProcessCommandExecutor> {
    repos: Arc<Repos<E>>,
}

struct Repos<E> {
    root: PathBuf,
    executor: E,
}

impl GitStore<ProcessCommandExecutor> {
    pub fn new(repos_root: impl Into<PathBuf>) -> Self {
        Self::with_executor(repos_root, ProcessCommandExecutor)
    }
}

impl<E: CommandExecutor + 'static> GitStore<E> {
    pub fn with_executor(repos_root: impl Into<PathBuf>, executor: E) -> Self {
        Self { repos: Arc::new(Repos { root: repos_root.into(), executor }) }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Repos<E>) -> Result<T, StoreError> + Send + 'static,
    {
        let repos = self.repos.clone();
        tokio::task::spawn_blocking(move || work(repos.as_ref()))
            .await
            .map_err(|error| StoreError::Unavailable(format!("git task failed: {error}")))?
    }
}

impl<E: CommandExecutor> Repos<E> {
    fn repo_dir(&self, key: &DocumentKey) -> PathBuf {
        self.root.join(format!("{}.git", key.project_id()))
    }

    fn git(
        &self,
        repo: &Path,
        args: &[&str],
        env: &[(String, String)],
        stdin: Option<&[u8]>,
    ) -> Result<Result<String, GitFailure>, StoreError> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_string()).collect();
        let command = format!("git {}", args.join(" "));
        let mut env = env.to_vec();
        env.push(("GIT_DIR".to_string(), repo.display().to_string()));

        let result = self
            .executor
            .execute("git", &args, repo, &env, stdin)
            .map_err(|error| StoreError::Unavailable(format!("failed to run `{command}`: {error}")))?;

        if result.success {
            return Ok(Ok(result.stdout));
        }
        let stderr = if result.stderr.trim().is_empty() { result.stdout } else { result.stderr };
        Ok(Err(GitFailure { command, code: result.code, stderr }))
    }

    fn git_ok(&self, repo: &Path, args: &[&str]) -> Result<String, StoreError> {
        self.git(repo, args, &[], None)?.map_err(GitFailure::into_store_error)
    }

    fn ensure_repo(&self, repo: &Path) -> Result<(), StoreError> {
        if repo.join("HEAD").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(repo).map_err(|error| {
            StoreError::Unavailable(format!("failed to create {}: {error}", repo.display()))
        })?;
        self.git_ok(repo, &["init", "--bare", "--quiet"])?;
        self.git_ok(repo, &["symbolic-ref", "HEAD", BRANCH_REF])?;
        info!(repo = %repo.display(), "initialized project repository");
        Ok(())
    }

    fn branch_head(&self, repo: &Path) -> Result<Option<String>, StoreError> {
        let spec = format!("{BRANCH_REF}^{{commit}}");
        match self.git(repo, &["rev-parse", "--verify", "--quiet", &spec], &[], None)? {
            Ok(stdout) => Ok(non_empty(&stdout)),
            Err(_) => Ok(None),
        }
    }

    fn path_head(&self, repo: &Path, path: &str) -> Result<Option<Revision>, StoreError> {
        if self.branch_head(repo)?.is_none() {
            return Ok(None);
        }
        let stdout = self.git_ok(repo, &["rev-list", "-1", BRANCH_REF, "--", path])?;
        Ok(non_empty(&stdout).map(Revision::new))
    }

    fn read(&self, key: &DocumentKey) -> Result<Option<String>, StoreError> {
        let repo = self.repo_dir(key);
        if !repo.join("HEAD").exists() || self.branch_head(&repo)?.is_none() {
            return Ok(None);
        }

        let listing = self.git_ok(&repo, &["ls-tree", BRANCH_REF, "--", key.path()])?;
        let Some(entry) = listing.lines().next() else {
            return Ok(None);
        };
        let mut fields = entry.split_whitespace();
        let (_mode, kind, object) = (fields.next(), fields.next(), fields.next());
        match (kind, object) {
            (Some("blob"), Some(object)) => self.git_ok(&repo, &["cat-file", "blob", object]).map(Some),
            (Some(kind), _) => Err(StoreError::InvalidContent(format!(
                "`{}` is a {kind}, not a file",
                key.path()
            ))),
            _ => Err(StoreError::Unavailable(format!("unexpected ls-tree output: {entry}"))),
        }
    }

    fn head_revision(&self, key: &DocumentKey) -> Result<Option<Revision>, StoreError> {
        let repo = self.repo_dir(key);
        if !repo.join("HEAD").exists() {
            return Ok(None);
        }
        self.path_head(&repo, key.path())
    }

    fn commit(
        &self,
        key: &DocumentKey,
        content: &str,
        author: &Author,
        message: &str,
        base: Option<&Revision>,
    ) -> Result<Revision, StoreError> {
        let repo = self.repo_dir(key);
        self.ensure_repo(&repo)?;

        for attempt in 1..=MAX_REF_UPDATE_ATTEMPTS {
            if let Some(expected) = base {
                let actual = self.path_head(&repo, key.path())?;
                if actual.as_ref() != Some(expected) {
                    return Err(StoreError::StaleBase { expected: expected.clone(), actual });
                }
            }

            let parent = self.branch_head(&repo)?;
            let commit = self.write_commit(&repo, key, content, author, message, parent.as_deref())?;

            let old = parent.clone().unwrap_or_default();
            match self.git(&repo, &["update-ref", BRANCH_REF, &commit, &old], &[], None)? {
                Ok(_) => {
                    debug!(document = %key, revision = %commit, attempt, "committed document");
                    return Ok(Revision::new(commit));
                }
                Err(failure) => {
                    warn!(
                        document = %key,
                        attempt,
                        stderr = %failure.stderr.trim(),
                        "branch moved during commit; retrying"
                    );
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "could not update {BRANCH_REF} for {key} after {MAX_REF_UPDATE_ATTEMPTS} attempts"
        )))
    }

    fn write_commit(
        &self,
        repo: &Path,
        key: &DocumentKey,
        content: &str,
        author: &Author,
        message: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError> {
        let blob = self
            .git(repo, &["hash-object", "-w", "--stdin"], &[], Some(content.as_bytes()))?
            .map_err(GitFailure::into_store_error)?;
        let blob = blob.trim();

        let index_path = repo.join(format!("docsync-index-{}", Uuid::new_v4()));
        let index_env = vec![("GIT_INDEX_FILE".to_string(), index_path.display().to_string())];
        let tree = self.build_tree(repo, &index_env, key.path(), blob, parent);
        if let Err(error) = std::fs::remove_file(&index_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                debug!(index = %index_path.display(), error = %error, "failed to remove temporary index");
            }
        }
        let tree = tree?;

        let identity = vec![
            ("GIT_AUTHOR_NAME".to_string(), author.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), author.email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), author.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), author.email.clone()),
        ];
        let mut args = vec!["commit-tree", tree.as_str(), "-m", message];
        if let Some(parent) = parent {
            args.extend(["-p", parent]);
        }
        let commit = self.git(repo, &args, &identity, None)?.map_err(GitFailure::into_store_error)?;
        non_empty(&commit)
            .ok_or_else(|| StoreError::Unavailable("commit-tree printed no commit id".into()))
    }

    fn build_tree(
        &self,
        repo: &Path,
        index_env: &[(String, String)],
        path: &str,
        blob: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError> {
        let read_tree: Vec<&str> = match parent {
            Some(parent) => vec!["read-tree", parent],
            None => vec!["read-tree", "--empty"],
        };
        self.git(repo, &read_tree, index_env, None)?.map_err(GitFailure::into_store_error)?;

        let cacheinfo = format!("100644,{blob},{path}");
        self.git(repo, &["update-index", "--add", "--cacheinfo", &cacheinfo], index_env, None)?
            .map_err(GitFailure::into_store_error)?;

        let tree =
            self.git(repo, &["write-tree"], index_env, None)?.map_err(GitFailure::into_store_error)?;
        non_empty(&tree).ok_or_else(|| StoreError::Unavailable("write-tree printed no tree id".into()))
    }
}

fn non_empty(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[async_trait]
impl<E: CommandExecutor + 'static> DurableStore for GitStore<E> {
    async fn read(&self, key: &DocumentKey) -> Result<Option<String>, StoreError> {
        let key = key.clone();
        self.blocking(move |repos| repos.read(&key)).await
    }

    async fn commit(
        &self,
        key: &DocumentKey,
        content: &str,
        author: &Author,
        message: &str,
        base: Option<&Revision>,
    ) -> Result<Revision, StoreError> {
        let key = key.clone();
        let content = content.to_string();
        let author = author.clone();
        let message = message.to_string();
        let base = base.cloned();
        self.blocking(move |repos| repos.commit(&key, &content, &author, &message, base.as_ref())).await
    }

    async fn head_revision(&self, key: &DocumentKey) -> Result<Option<Revision>, StoreError> {
        let key = key.clone();
        self.blocking(move |repos| repos.head_revision(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Invocation {
        args: Vec<String>,
        env: Vec<(String, String)>,
        stdin: Option<Vec<u8>>,
    }

    #[derive(Clone)]
    struct MockExecutor {
        calls: Arc<Mutex<Vec<Invocation>>>,
        responses: Arc<Mutex<VecDeque<CommandResult>>>,
    }

    impl MockExecutor {
        fn new(stdouts: Vec<(bool, &str)>) -> Self {
            let responses = stdouts
                .into_iter()
                .map(|(success, stdout)| CommandResult {
                    success,
                    code: Some(if success { 0 } else { 1 }),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                })
                .collect();
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                responses: Arc::new(Mutex::new(responses)),
            }
        }

        fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().expect("mock calls lock poisoned").clone()
        }
    }

    impl CommandExecutor for MockExecutor {
        fn execute(
            &self,
            program: &str,
            args: &[String],
            _cwd: &Path,
            env: &[(String, String)],
            stdin: Option<&[u8]>,
        ) -> Result<CommandResult, std::io::Error> {
            assert_eq!(program, "git");
            self.calls.lock().expect("mock calls lock poisoned").push(Invocation {
                args: args.to_vec(),
                env: env.to_vec(),
                stdin: stdin.map(<[u8]>::to_vec),
            });
            Ok(self
                .responses
                .lock()
                .expect("mock responses lock poisoned")
                .pop_front()
                .expect("missing mock response"))
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::new(Uuid::nil(), path).unwrap()
    }

    fn env_value<'a>(call: &'a Invocation, name: &str) -> Option<&'a str> {
        call.env.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    #[tokio::test]
    async fn commit_builds_tree_against_parent_and_swaps_the_branch() {
        let root = tempfile::tempdir().unwrap();
        let doc = key("notes/a.md");
        std::fs::create_dir_all(root.path().join(format!("{}.git", Uuid::nil()))).unwrap();
        std::fs::write(root.path().join(format!("{}.git/HEAD", Uuid::nil())), "ref: refs/heads/main\n")
            .unwrap();

        let mock = MockExecutor::new(vec![
            (true, "parent111\n"),
            (true, "blob222\n"),
            (true, ""),
            (true, ""),
            (true, "tree333\n"),
            (true, "commit444\n"),
            (true, ""),
        ]);
        let store = GitStore::with_executor(root.path(), mock.clone());

        let revision = store
            .commit(&doc, "hello", &Author::new("Ada", "ada@example.com"), "Save notes/a.md", None)
            .await
            .unwrap();
        assert_eq!(revision, Revision::new("commit444"));

        let calls = mock.calls();
        let args: Vec<Vec<String>> = calls.iter().map(|call| call.args.clone()).collect();
        assert_eq!(args[0], vec!["rev-parse", "--verify", "--quiet", "refs/heads/main^{commit}"]);
        assert_eq!(args[1], vec!["hash-object", "-w", "--stdin"]);
        assert_eq!(calls[1].stdin.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(args[2], vec!["read-tree", "parent111"]);
        assert_eq!(args[3], vec!["update-index", "--add", "--cacheinfo", "100644,blob222,notes/a.md"]);
        assert_eq!(args[4], vec!["write-tree"]);
        assert_eq!(
            args[5],
            vec!["commit-tree", "tree333", "-m", "Save notes/a.md", "-p", "parent111"]
        );
        assert_eq!(args[6], vec!["update-ref", "refs/heads/main", "commit444", "parent111"]);

        let index = env_value(&calls[2], "GIT_INDEX_FILE").expect("temporary index");
        assert_eq!(env_value(&calls[3], "GIT_INDEX_FILE"), Some(index));
        assert_eq!(env_value(&calls[5], "GIT_AUTHOR_NAME"), Some("Ada"));
        assert_eq!(env_value(&calls[5], "GIT_COMMITTER_EMAIL"), Some("ada@example.com"));
        assert!(env_value(&calls[6], "GIT_INDEX_FILE").is_none());
    }

    #[tokio::test]
    async fn lost_branch_race_is_retried() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join(format!("{}.git", Uuid::nil()))).unwrap();
        std::fs::write(root.path().join(format!("{}.git/HEAD", Uuid::nil())), "ref: refs/heads/main\n")
            .unwrap();

        let attempt = |parent: &'static str, swapped: bool| {
            vec![
                (true, parent),
                (true, "blob\n"),
                (true, ""),
                (true, ""),
                (true, "tree\n"),
                (true, "commit\n"),
                (swapped, ""),
            ]
        };
        let mut script = attempt("p1\n", false);
        script.extend(attempt("p2\n", true));
        let mock = MockExecutor::new(script);
        let store = GitStore::with_executor(root.path(), mock.clone());

        let revision =
            store.commit(&key("a.md"), "x", &Author::new("a", "a@b"), "m", None).await.unwrap();
        assert_eq!(revision, Revision::new("commit"));
        assert_eq!(mock.calls().len(), 14);
    }

    #[tokio::test]
    async fn missing_repository_reads_as_empty() {
        let root = tempfile::tempdir().unwrap();
        let mock = MockExecutor::new(Vec::new());
        let store = GitStore::with_executor(root.path(), mock.clone());

        assert_eq!(store.read(&key("a.md")).await.unwrap(), None);
        assert_eq!(store.head_revision(&key("a.md")).await.unwrap(), None);
        assert!(mock.calls().is_empty());
    }

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok_and(|output| output.status.success())
    }

    #[tokio::test]
    async fn real_repository_round_trip() {
        if !git_available() {
            eprintln!("skipping git store test: git binary not found");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let store = GitStore::new(root.path());
        let project = Uuid::new_v4();
        let a = DocumentKey::new(project, "docs/a.md").unwrap();
        let b = DocumentKey::new(project, "b.md").unwrap();
        let author = Author::new("Ada", "ada@example.com");

        assert_eq!(store.read(&a).await.unwrap(), None);

        let first = store.commit(&a, "alpha\n", &author, "Save docs/a.md", None).await.unwrap();
        assert_eq!(store.read(&a).await.unwrap().as_deref(), Some("alpha\n"));
        assert_eq!(store.head_revision(&a).await.unwrap(), Some(first.clone()));
        assert_eq!(store.head_revision(&b).await.unwrap(), None);

        let other = store.commit(&b, "beta", &author, "Save b.md", None).await.unwrap();
        assert_eq!(store.head_revision(&a).await.unwrap(), Some(first.clone()), "head is per document");
        assert_eq!(store.head_revision(&b).await.unwrap(), Some(other));
        assert_eq!(store.read(&a).await.unwrap().as_deref(), Some("alpha\n"));

        let second = store.commit(&a, "alpha 2\n", &author, "Save docs/a.md", Some(&first)).await.unwrap();
        let stale = store.commit(&a, "alpha 3\n", &author, "Save docs/a.md", Some(&first)).await;
        assert_eq!(
            stale,
            Err(StoreError::StaleBase { expected: first, actual: Some(second) })
        );

        let directory = DocumentKey::new(project, "docs").unwrap();
        assert!(matches!(store.read(&directory).await, Err(StoreError::InvalidContent(_))));
    }
}
