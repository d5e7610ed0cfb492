use super::*;
use crate::error::RateLimited;
use crate::reasoning::{
    CompletionRequest, CompletionResponse, ContentPart, ReasoningBackend, TokenUsage,
};
use crate::store::{MemoryTaskStore, MemoryWorkflowStore};
use crate::workflow::plan::GeneratedFile;
use crate::workflow::PhasePayload;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

struct MockBackend {
    responses: Mutex<VecDeque<Result<CompletionResponse>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    fn with(responses: Vec<Result<CompletionResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn planning_call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.messages
                    .first()
                    .map(|m| {
                        m.content.iter().any(|p| {
                            matches!(p, ContentPart::Text { text } if text.contains("Plan the implementation"))
                        })
                    })
                    .unwrap_or(false)
                    && r.messages.len() == 1
            })
            .count()
    }

    fn implementation_requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.messages.iter().any(|m| {
                    m.content.iter().any(|p| {
                        matches!(p, ContentPart::Text { text } if text.contains("Generate the implementation now"))
                    })
                })
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("mock backend exhausted")))
    }
}

fn tool_read(id: &str, path: &str) -> Result<CompletionResponse> {
    Ok(CompletionResponse {
        content: vec![ContentPart::ToolUse {
            id: id.to_string(),
            name: "read_file".to_string(),
            input: serde_json::json!({"path": path}),
        }],
        usage: Some(TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            ..TokenUsage::default()
        }),
        stop_reason: Some("tool_use".to_string()),
    })
}

fn text_response(text: &str) -> Result<CompletionResponse> {
    Ok(CompletionResponse {
        content: vec![ContentPart::Text {
            text: text.to_string(),
        }],
        usage: Some(TokenUsage {
            input_tokens: 400,
            output_tokens: 150,
            ..TokenUsage::default()
        }),
        stop_reason: Some("end_turn".to_string()),
    })
}

const PLAN_TEXT: &str = "\
Summary: Add session expiry handling
Approach: Track an expiry timestamp in the session store
Files:
- src/auth/session.ts — add expiry tracking
- src/auth/store.ts — persist the expiry column
Considerations:
- Existing sessions are grandfathered
Complexity: low
";

const GENERATED_JSON: &str = r#"{
    "files": [
        {"path": "src/auth/session.ts", "content": "export const session = 1;", "action": "modify"},
        {"path": "src/auth/store.ts", "content": "export const store = 2;", "action": "modify"}
    ],
    "commitMessage": "Add session expiry handling",
    "prTitle": "Add session expiry handling",
    "prDescription": "Tracks an expiry timestamp in the session store."
}"#;

fn happy_path_responses() -> Vec<Result<CompletionResponse>> {
    vec![
        tool_read("t1", "src/auth/session.ts"),
        tool_read("t2", "src/auth/store.ts"),
        tool_read("t3", "src/auth/util.ts"),
        text_response(PLAN_TEXT),
        text_response(GENERATED_JSON),
    ]
}

#[derive(Default)]
struct MockVcs {
    files: Mutex<HashMap<String, String>>,
    branches: Mutex<Vec<String>>,
    commits: Mutex<Vec<(String, Vec<GeneratedFile>, String)>>,
    prs: Mutex<Vec<(String, String)>>,
    pr_updates: Mutex<Vec<(u64, String)>>,
}

impl MockVcs {
    fn with_repo() -> Arc<Self> {
        let vcs = Self::default();
        let mut files = HashMap::new();
        for path in [
            "src/auth/session.ts",
            "src/auth/store.ts",
            "src/auth/util.ts",
        ] {
            files.insert(path.to_string(), format!("// contents of {path}"));
        }
        *vcs.files.lock().unwrap() = files;
        Arc::new(vcs)
    }

    fn mutation_count(&self) -> usize {
        self.branches.lock().unwrap().len()
            + self.commits.lock().unwrap().len()
            + self.prs.lock().unwrap().len()
    }
}

#[async_trait]
impl VersionControl for MockVcs {
    async fn read_file(
        &self,
        _repository: &str,
        path: &str,
        _git_ref: &str,
    ) -> Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn list_paths(
        &self,
        _repository: &str,
        _git_ref: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn default_branch(&self, _repository: &str) -> Result<String> {
        Ok("main".to_string())
    }

    async fn create_branch(&self, _repository: &str, branch: &str, _from_ref: &str) -> Result<()> {
        self.branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn commit_files(
        &self,
        _repository: &str,
        branch: &str,
        files: &[GeneratedFile],
        message: &str,
    ) -> Result<()> {
        self.commits
            .lock()
            .unwrap()
            .push((branch.to_string(), files.to_vec(), message.to_string()));
        Ok(())
    }

    async fn open_pull_request(
        &self,
        _repository: &str,
        branch: &str,
        _base: &str,
        title: &str,
        _body: &str,
    ) -> Result<u64> {
        self.prs
            .lock()
            .unwrap()
            .push((branch.to_string(), title.to_string()));
        Ok(42)
    }

    async fn update_pull_request(
        &self,
        _repository: &str,
        number: u64,
        title: &str,
        _body: &str,
    ) -> Result<()> {
        self.pr_updates
            .lock()
            .unwrap()
            .push((number, title.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl crate::notify::Notifier for RecordingNotifier {
    async fn post_status(&self, _task_id: &str, message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

impl RecordingNotifier {
    fn any_containing(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains(needle))
    }
}

struct TestRig {
    engine: Engine,
    store: Arc<MemoryWorkflowStore>,
    tasks: Arc<MemoryTaskStore>,
    vcs: Arc<MockVcs>,
    notifier: Arc<RecordingNotifier>,
}

fn rig(backend: Arc<MockBackend>, config: EngineConfig) -> TestRig {
    let store = Arc::new(MemoryWorkflowStore::new());
    let tasks = Arc::new(MemoryTaskStore::new());
    let vcs = MockVcs::with_repo();
    let notifier = Arc::new(RecordingNotifier::default());
    let backends = Arc::new(crate::reasoning::BackendRegistry::new().register(backend));
    let engine = Engine::new(
        config,
        EngineCollaborators {
            store: store.clone(),
            tasks: tasks.clone(),
            vcs: vcs.clone(),
            notifier: notifier.clone(),
            deployer: None,
            backends,
        },
    );
    TestRig {
        engine,
        store,
        tasks,
        vcs,
        notifier,
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        rate_limit_retry_delay_secs: 1,
        retry_backoff_base_secs: 0,
        ..EngineConfig::default()
    }
}

async fn wait_for_status(
    store: &MemoryWorkflowStore,
    id: Uuid,
    status: WorkflowStatus,
) -> Workflow {
    for _ in 0..200 {
        if let Some(workflow) = store.get(id).await.unwrap() {
            if workflow.status == status {
                return workflow;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let last = store.get(id).await.unwrap();
    panic!("workflow never reached {status:?}; last seen: {last:?}");
}

// Scenario A: budget available, immediate run, 2 planned files from 3
// explored, no approval gate, fresh implementation history, completion with
// branch and PR.
#[tokio::test]
async fn full_run_without_approval_gate() {
    let backend = MockBackend::with(happy_path_responses());
    let r = rig(backend.clone(), test_config());
    r.tasks.active("task-1", "Add session expiry handling");

    let outcome = r
        .engine
        .enqueue("task-1", "alice", "acme/web", Provider::Claude, 0)
        .await
        .unwrap();
    assert!(!outcome.queued, "budget was available, expected immediate run");

    let workflow = r.store.get_by_task("task-1").await.unwrap().unwrap();
    let done = wait_for_status(&r.store, workflow.id, WorkflowStatus::Completed).await;

    assert!(done.branch_name.is_some());
    assert_eq!(done.pr_number, Some(42));

    // Two generated files, both named by the plan.
    let commits = r.vcs.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].1.len(), 2);
    assert!(commits[0].1.iter().all(|f| f.path.starts_with("src/auth/")));

    // The implementation call ran on a fresh instance: one message of
    // history and no planning instructions in its system blocks.
    let impl_requests = backend.implementation_requests();
    assert_eq!(impl_requests.len(), 1);
    assert_eq!(impl_requests[0].messages.len(), 1);
    assert!(impl_requests[0]
        .system_blocks
        .iter()
        .all(|b| !b.text.contains("planning a code change")));

    // Explored snapshots crossed the boundary: 3 files were read, 2 planned.
    match done.payload {
        Some(PhasePayload::Implemented {
            plan,
            explored_files,
            generated,
        }) => {
            assert_eq!(plan.files.len(), 2);
            assert_eq!(explored_files.len(), 3);
            assert_eq!(generated.files.len(), 2);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

// Scenario B: approval required. Planning parks the workflow at the gate
// with no version-control mutation; the approval signal completes it.
#[tokio::test]
async fn approval_gate_suspends_until_signal() {
    let backend = MockBackend::with(happy_path_responses());
    let config = EngineConfig {
        require_plan_approval: true,
        ..test_config()
    };
    let r = rig(backend, config);
    r.tasks.active("task-1", "Add session expiry handling");

    r.engine
        .enqueue("task-1", "alice", "acme/web", Provider::Claude, 0)
        .await
        .unwrap();

    let workflow = r.store.get_by_task("task-1").await.unwrap().unwrap();
    let waiting = wait_for_status(&r.store, workflow.id, WorkflowStatus::AwaitingApproval).await;
    assert!(matches!(waiting.payload, Some(PhasePayload::Planned { .. })));
    assert_eq!(
        r.vcs.mutation_count(),
        0,
        "no branch/commit/PR before approval"
    );

    r.engine.approve_plan(workflow.id).await.unwrap();
    let done = wait_for_status(&r.store, workflow.id, WorkflowStatus::Completed).await;
    assert_eq!(done.pr_number, Some(42));
    assert_eq!(r.vcs.commits.lock().unwrap().len(), 1);
}

// Scenario C: a zero-file plan fails fast with the raw-text diagnostic;
// clarification retry supplies the files and the workflow completes.
#[tokio::test]
async fn zero_file_plan_fails_then_clarification_recovers() {
    let mut responses = vec![text_response(
        "Summary: I was unable to determine which files to change.",
    )];
    responses.extend(happy_path_responses());
    let backend = MockBackend::with(responses);
    let r = rig(backend, test_config());
    r.tasks.active("task-1", "Do something vague");

    r.engine
        .enqueue("task-1", "alice", "acme/web", Provider::Claude, 0)
        .await
        .unwrap();

    let workflow = r.store.get_by_task("task-1").await.unwrap().unwrap();
    let failed = wait_for_status(&r.store, workflow.id, WorkflowStatus::Failed).await;
    match failed.payload {
        Some(PhasePayload::Failed { phase, message, .. }) => {
            assert_eq!(phase, "planning");
            assert!(message.contains("no target files"));
            assert!(message.contains("unable to determine"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    assert!(r.notifier.any_containing("failed during planning"));
    assert_eq!(r.vcs.mutation_count(), 0);

    r.engine
        .retry_with_clarification(workflow.id, "Extend the session store in src/auth")
        .await
        .unwrap();

    let done = wait_for_status(&r.store, workflow.id, WorkflowStatus::Completed).await;
    assert_eq!(done.pr_number, Some(42));
    assert_eq!(done.retry_count, 1);
}

// Scenario D: the first backend call is rate-limited; the queue retries
// after the fixed delay and the second attempt completes. Two attempts
// total.
#[tokio::test]
async fn rate_limited_first_attempt_retries_and_completes() {
    let mut responses: Vec<Result<CompletionResponse>> =
        vec![Err(RateLimited::new("window exhausted").into())];
    responses.extend(happy_path_responses());
    let backend = MockBackend::with(responses);
    let r = rig(backend.clone(), test_config());
    r.tasks.active("task-1", "Add session expiry handling");

    let started = std::time::Instant::now();
    r.engine
        .enqueue("task-1", "alice", "acme/web", Provider::Claude, 0)
        .await
        .unwrap();

    let workflow = r.store.get_by_task("task-1").await.unwrap().unwrap();
    let done = wait_for_status(&r.store, workflow.id, WorkflowStatus::Completed).await;

    assert_eq!(backend.planning_call_count(), 2, "two planning attempts");
    assert_eq!(done.retry_count, 1);
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "retry must wait out the configured long delay"
    );
}

// A task deleted between planning and implementation ends CANCELLED with no
// version-control mutation.
#[tokio::test]
async fn task_deleted_mid_run_cancels_cleanly() {
    // Planning succeeds, but the task disappears before the end-of-phase
    // liveness check.
    struct DeletingBackend {
        inner: Arc<MockBackend>,
        tasks: Arc<MemoryTaskStore>,
    }

    #[async_trait]
    impl ReasoningBackend for DeletingBackend {
        fn provider(&self) -> Provider {
            Provider::Claude
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let response = self.inner.complete(request).await;
            // Delete the task as soon as the plan text has been produced.
            if self.inner.responses.lock().unwrap().is_empty() {
                self.tasks.remove("task-1");
            }
            response
        }
    }

    let store = Arc::new(MemoryWorkflowStore::new());
    let tasks = Arc::new(MemoryTaskStore::new());
    let vcs = MockVcs::with_repo();
    let notifier = Arc::new(RecordingNotifier::default());
    let inner = MockBackend::with(vec![
        tool_read("t1", "src/auth/session.ts"),
        text_response(PLAN_TEXT),
    ]);
    let backend = Arc::new(DeletingBackend {
        inner: inner.clone(),
        tasks: tasks.clone(),
    });
    let backends = Arc::new(crate::reasoning::BackendRegistry::new().register(backend));
    let engine = Engine::new(
        test_config(),
        EngineCollaborators {
            store: store.clone(),
            tasks: tasks.clone(),
            vcs: vcs.clone(),
            notifier: notifier.clone(),
            deployer: None,
            backends,
        },
    );
    tasks.active("task-1", "Add session expiry handling");

    engine
        .enqueue("task-1", "alice", "acme/web", Provider::Claude, 0)
        .await
        .unwrap();

    let workflow = store.get_by_task("task-1").await.unwrap().unwrap();
    let cancelled = wait_for_status(&store, workflow.id, WorkflowStatus::Cancelled).await;
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(vcs.mutation_count(), 0, "no version-control call after abort");
    assert!(!notifier.any_containing("failed"), "clean abort, no failure notice");
}

// Change request: revised plan and code land on the existing branch without
// re-running the state machine.
#[tokio::test]
async fn change_request_recommits_to_existing_branch() {
    let mut responses = happy_path_responses();
    responses.push(text_response(PLAN_TEXT)); // revised plan
    responses.push(text_response(GENERATED_JSON)); // revised code
    let backend = MockBackend::with(responses);
    let r = rig(backend, test_config());
    r.tasks.active("task-1", "Add session expiry handling");

    r.engine
        .enqueue("task-1", "alice", "acme/web", Provider::Claude, 0)
        .await
        .unwrap();
    let workflow = r.store.get_by_task("task-1").await.unwrap().unwrap();
    let done = wait_for_status(&r.store, workflow.id, WorkflowStatus::Completed).await;
    let branch = done.branch_name.clone().unwrap();

    r.engine
        .apply_change_request(workflow.id, "Also grandfather legacy sessions")
        .await
        .unwrap();

    let after = r.store.get(workflow.id).await.unwrap().unwrap();
    assert_eq!(after.status, WorkflowStatus::Completed);

    let commits = r.vcs.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 2, "original commit plus the revision");
    assert_eq!(commits[1].0, branch, "revision lands on the existing branch");
    // Only one branch and one PR were ever created; the PR text was updated
    // in place for the revision.
    assert_eq!(r.vcs.branches.lock().unwrap().len(), 1);
    assert_eq!(r.vcs.prs.lock().unwrap().len(), 1);
    assert_eq!(r.vcs.pr_updates.lock().unwrap().len(), 1);
}
