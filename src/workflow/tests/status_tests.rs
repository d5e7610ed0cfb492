use super::*;
use crate::workflow::plan::{Complexity, PlannedFile};

fn workflow() -> Workflow {
    Workflow::new("task-1", "owner-1", "acme/web", Provider::Claude)
}

#[test]
fn happy_path_transitions() {
    let mut wf = workflow();
    wf.transition(WorkflowStatus::Planning).unwrap();
    wf.transition(WorkflowStatus::Implementing).unwrap();
    wf.transition(WorkflowStatus::GithubOperations).unwrap();
    wf.transition(WorkflowStatus::Completed).unwrap();
    assert!(wf.status.is_terminal());
}

#[test]
fn approval_detour() {
    let mut wf = workflow();
    wf.transition(WorkflowStatus::Planning).unwrap();
    wf.transition(WorkflowStatus::AwaitingApproval).unwrap();
    wf.transition(WorkflowStatus::Implementing).unwrap();
}

#[test]
fn failed_reachable_from_any_non_terminal() {
    for status in [
        WorkflowStatus::Pending,
        WorkflowStatus::Planning,
        WorkflowStatus::AwaitingApproval,
        WorkflowStatus::Implementing,
        WorkflowStatus::GithubOperations,
    ] {
        assert!(status.can_transition_to(WorkflowStatus::Failed), "{status}");
        assert!(
            status.can_transition_to(WorkflowStatus::Cancelled),
            "{status}"
        );
    }
}

#[test]
fn terminal_states_are_sticky() {
    for status in [
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ] {
        assert!(!status.can_transition_to(WorkflowStatus::Planning));
        assert!(!status.can_transition_to(WorkflowStatus::Failed));
    }
}

#[test]
fn skipping_states_is_rejected() {
    let mut wf = workflow();
    assert!(wf.transition(WorkflowStatus::Implementing).is_err());
    assert!(wf.transition(WorkflowStatus::Completed).is_err());
    // Status unchanged after rejected transitions.
    assert_eq!(wf.status, WorkflowStatus::Pending);
}

#[test]
fn backwards_transitions_are_rejected() {
    let mut wf = workflow();
    wf.transition(WorkflowStatus::Planning).unwrap();
    wf.transition(WorkflowStatus::Implementing).unwrap();
    assert!(wf.transition(WorkflowStatus::Planning).is_err());
}

#[test]
fn status_serializes_snake_case() {
    let json = serde_json::to_string(&WorkflowStatus::AwaitingApproval).unwrap();
    assert_eq!(json, "\"awaiting_approval\"");
    let json = serde_json::to_string(&WorkflowStatus::GithubOperations).unwrap();
    assert_eq!(json, "\"github_operations\"");
}

#[test]
fn payload_decodes_expected_variant() {
    let payload = PhasePayload::Planned {
        plan: ImplementationPlan {
            summary: "s".to_string(),
            approach: "a".to_string(),
            files: vec![PlannedFile {
                path: "src/a.ts".to_string(),
                purpose: "p".to_string(),
            }],
            complexity: Complexity::Low,
            caveats: Vec::new(),
            raw_response: None,
        },
        explored_files: Vec::new(),
    };
    let json = serde_json::to_string(&payload).unwrap();
    assert!(json.contains("\"kind\":\"planned\""));

    let decoded: PhasePayload = serde_json::from_str(&json).unwrap();
    assert!(decoded.plan().is_some());
    assert_eq!(decoded.plan().unwrap().files.len(), 1);
}

#[test]
fn workflow_round_trips_through_json() {
    let mut wf = workflow();
    wf.transition(WorkflowStatus::Planning).unwrap();
    wf.branch_name = Some("codegen/task-1-session-expiry".to_string());

    let json = serde_json::to_string(&wf).unwrap();
    let decoded: Workflow = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.status, WorkflowStatus::Planning);
    assert_eq!(decoded.branch_name.as_deref(), Some("codegen/task-1-session-expiry"));
    assert_eq!(decoded.id, wf.id);
}
