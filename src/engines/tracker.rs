//! Per-session registry of tool invocations.

use serde_json::Value;

use crate::events::{ToolCallInfo, ToolCallStatus};

/// Records tool calls in start order. Owned by exactly one parser.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    calls: Vec<ToolCallInfo>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running call. A repeated id replaces the earlier record.
    pub fn start_tool_call(
        &mut self,
        name: impl Into<String>,
        id: impl Into<String>,
        args: Value,
    ) -> ToolCallInfo {
        self.insert(name.into(), id.into(), args, ToolCallStatus::Running)
    }

    /// Registers a call that is waiting on a permission decision. A later
    /// [`start_tool_call`](Self::start_tool_call) with the same id supersedes it.
    pub fn register_pending(
        &mut self,
        name: impl Into<String>,
        id: impl Into<String>,
        args: Value,
    ) -> ToolCallInfo {
        self.insert(name.into(), id.into(), args, ToolCallStatus::Pending)
    }

    fn insert(&mut self, name: String, id: String, args: Value, status: ToolCallStatus) -> ToolCallInfo {
        if self.calls.iter().any(|c| c.id == id) {
            log::debug!("[tracker] tool call id {id} restarted, replacing previous record");
            self.calls.retain(|c| c.id != id);
        }
        let info = ToolCallInfo {
            id,
            name,
            args,
            status,
            result: None,
        };
        self.calls.push(info.clone());
        info
    }

    /// Marks a call finished. Unknown ids and already-finished calls are left alone.
    pub fn end_tool_call(&mut self, id: &str, result: Value, success: bool) -> Option<ToolCallInfo> {
        let next = if success {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Failed
        };
        let call = self.calls.iter_mut().find(|c| c.id == id)?;
        if !call.status.can_transition_to(next) {
            return None;
        }
        call.status = next;
        call.result = Some(result);
        Some(call.clone())
    }

    /// Oldest running call with this name. Used when a backend reports a
    /// completion without the originating id.
    pub fn find_running_by_name(&self, name: &str) -> Option<&ToolCallInfo> {
        self.calls
            .iter()
            .find(|c| c.name == name && c.status == ToolCallStatus::Running)
    }

    pub fn get(&self, id: &str) -> Option<&ToolCallInfo> {
        self.calls.iter().find(|c| c.id == id)
    }

    pub fn get_tool_calls(&self) -> &[ToolCallInfo] {
        &self.calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }
}
