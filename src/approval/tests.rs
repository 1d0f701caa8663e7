use super::*;
use crate::agent::PermissionDecision;

fn register(manager: &ApprovalManager, id: &str) -> oneshot::Receiver<PermissionResponse> {
    let (tx, rx) = oneshot::channel();
    manager.add(
        id.to_string(),
        "exec".to_string(),
        serde_json::json!({"command": "rm -rf /"}),
        Some("task-1".to_string()),
        tx,
    );
    rx
}

#[tokio::test]
async fn decide_resolves_and_removes() {
    let manager = ApprovalManager::new();
    let rx = register(&manager, "p1");
    assert_eq!(manager.len(), 1);

    assert!(manager.decide("p1", PermissionDecision::Allow, Some("ok".into())));
    assert!(manager.is_empty());

    let response = rx.await.unwrap();
    assert_eq!(response.decision, PermissionDecision::Allow);
    assert_eq!(response.note.as_deref(), Some("ok"));
}

#[tokio::test]
async fn unknown_id_returns_false() {
    let manager = ApprovalManager::new();
    assert!(!manager.decide("nope", PermissionDecision::Deny, None));
}

#[tokio::test]
async fn double_decide_second_is_false() {
    let manager = ApprovalManager::new();
    let _rx = register(&manager, "p1");
    assert!(manager.decide("p1", PermissionDecision::Deny, None));
    assert!(!manager.decide("p1", PermissionDecision::Deny, None));
}

#[tokio::test]
async fn decide_with_dead_responder_still_removes() {
    let manager = ApprovalManager::new();
    let rx = register(&manager, "p1");
    drop(rx);
    assert!(manager.decide("p1", PermissionDecision::Allow, None));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn pending_snapshot_is_ordered() {
    let manager = ApprovalManager::new();
    let _a = register(&manager, "p1");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let _b = register(&manager, "p2");

    let pending = manager.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].permission_id, "p1");
    assert_eq!(pending[1].permission_id, "p2");
    assert_eq!(pending[0].tool, "exec");
    assert_eq!(pending[0].task_id.as_deref(), Some("task-1"));
}
