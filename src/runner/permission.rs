//! Permission bridge: routes `permission_required` events without ever
//! blocking the scheduler.
//!
//! Policy order: an isolated (remote) sandbox auto-allows everything with an
//! audit note; shell-exec inputs the SafeCommandPolicy vouches for are
//! auto-allowed; everything else is parked in the ApprovalManager and fanned
//! out as an `approval_needed` event for a human decision.

use super::BgTaskRunner;
use crate::agent::{PermissionDecision, PermissionRequest, PermissionResponse};
use crate::bus::BusEvent;
use crate::sandbox::SandboxKind;
use tracing::{debug, warn};

pub(crate) fn route(runner: &BgTaskRunner, task_id: &str, request: PermissionRequest) {
    let PermissionRequest { id, call, respond } = request;

    let sandbox_kind = runner
        .inner
        .registry
        .get(task_id)
        .map(|sandbox| sandbox.kind());
    if sandbox_kind == Some(SandboxKind::Remote) {
        debug!(
            "permission {} auto-allowed (isolated sandbox): {}",
            id, call.name
        );
        if respond
            .send(PermissionResponse {
                decision: PermissionDecision::Allow,
                note: Some("auto-approved: isolated sandbox".to_string()),
            })
            .is_err()
        {
            warn!("permission {} responder was gone", id);
        }
        return;
    }

    if call.name == runner.inner.settings.shell_tool && runner.inner.policy.is_safe(&call.input) {
        debug!("permission {} auto-allowed (safe command)", id);
        if respond
            .send(PermissionResponse {
                decision: PermissionDecision::Allow,
                note: Some("auto-approved: safe command".to_string()),
            })
            .is_err()
        {
            warn!("permission {} responder was gone", id);
        }
        return;
    }

    runner.inner.approvals.add(
        id.clone(),
        call.name.clone(),
        call.input.clone(),
        Some(task_id.to_string()),
        respond,
    );
    runner.inner.bus.send(BusEvent::ApprovalNeeded {
        permission_id: id,
        tool: call.name,
        input_preview: call.input,
        task_id: Some(task_id.to_string()),
    });
}
