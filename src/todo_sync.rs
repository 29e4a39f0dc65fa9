//! Mirrors todo events from the bus into a [`TodoStore`].
//!
//! Todos can be changed by the user (through the store) and by the agent (through
//! events). A store that publishes its own changes would bounce them straight back,
//! so the sync skips user-sourced events and keeps a set of todo ids it is
//! currently applying; an event for an id already in that set is dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::bus::{EventBus, HandlerResult, Subscription};
use crate::events::{
    create_todo_created, create_todo_deleted, create_todo_updated, AIEvent, AIEventKind,
    AIEventType, TodoSource,
};

pub const DEFAULT_TODO_STATUS: &str = "pending";

/// Tool names agents use to publish their todo list.
const TODO_WRITE_TOOLS: [&str; 2] = ["TodoWrite", "todo_write"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: String,
    pub source: TodoSource,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoPatch {
    pub content: Option<String>,
    pub status: Option<String>,
    pub source: TodoSource,
}

#[derive(Error, Debug)]
pub enum TodoStoreError {
    #[error("todo {0} not found")]
    NotFound(String),
    #[error("todo store error: {0}")]
    Backend(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait TodoStore: Send + Sync {
    fn create(&self, item: TodoItem) -> Result<(), TodoStoreError>;
    fn update(&self, id: &str, patch: TodoPatch) -> Result<(), TodoStoreError>;
    fn delete(&self, id: &str, source: TodoSource) -> Result<(), TodoStoreError>;
    fn get(&self, id: &str) -> Option<TodoItem>;
    fn list(&self) -> Vec<TodoItem>;
}

/// Ordered in-memory store. With a bus attached, every mutation is published as
/// the matching `todo_*` event carrying the mutation's source.
#[derive(Default)]
pub struct InMemoryTodoStore {
    items: Mutex<Vec<TodoItem>>,
    bus: Option<EventBus>,
}

impl InMemoryTodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            bus: Some(bus),
        }
    }

    fn publish(&self, event: Result<AIEvent, crate::events::EventError>) {
        let Some(bus) = &self.bus else {
            return;
        };
        match event {
            Ok(event) => bus.emit(&event),
            Err(e) => log::warn!("[todo] could not publish change: {e}"),
        }
    }
}

impl TodoStore for InMemoryTodoStore {
    fn create(&self, item: TodoItem) -> Result<(), TodoStoreError> {
        let event = create_todo_created(
            item.id.clone(),
            item.content.clone(),
            Some(item.status.clone()),
            item.source,
        );
        {
            let mut items = self.items.lock();
            match items.iter_mut().find(|t| t.id == item.id) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
        }
        self.publish(event);
        Ok(())
    }

    fn update(&self, id: &str, patch: TodoPatch) -> Result<(), TodoStoreError> {
        {
            let mut items = self.items.lock();
            let item = items
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| TodoStoreError::NotFound(id.to_string()))?;
            if let Some(content) = &patch.content {
                item.content = content.clone();
            }
            if let Some(status) = &patch.status {
                item.status = status.clone();
            }
        }
        self.publish(create_todo_updated(id, patch.content, patch.status, patch.source));
        Ok(())
    }

    fn delete(&self, id: &str, source: TodoSource) -> Result<(), TodoStoreError> {
        {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|t| t.id != id);
            if items.len() == before {
                return Err(TodoStoreError::NotFound(id.to_string()));
            }
        }
        self.publish(create_todo_deleted(id, source));
        Ok(())
    }

    fn get(&self, id: &str) -> Option<TodoItem> {
        self.items.lock().iter().find(|t| t.id == id).cloned()
    }

    fn list(&self) -> Vec<TodoItem> {
        self.items.lock().clone()
    }
}

/// Removes its id from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        if !set.lock().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

struct SyncState {
    store: Arc<dyn TodoStore>,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncState {
    fn guarded(
        &self,
        id: &str,
        apply: impl FnOnce(&dyn TodoStore) -> Result<(), TodoStoreError>,
    ) -> HandlerResult {
        let Some(_guard) = InFlight::enter(&self.in_flight, id) else {
            log::warn!("[todo] {id} is already being applied, skipping echoed event");
            return Ok(());
        };
        apply(self.store.as_ref()).map_err(Into::into)
    }

    fn handle(&self, event: &AIEvent) -> HandlerResult {
        match event.kind() {
            AIEventKind::TodoCreated {
                todo_id,
                content,
                status,
                source,
            } if *source != TodoSource::User => self.guarded(todo_id, |store| {
                store.create(TodoItem {
                    id: todo_id.clone(),
                    content: content.clone(),
                    status: status
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TODO_STATUS.to_string()),
                    source: *source,
                })
            }),
            AIEventKind::TodoUpdated {
                todo_id,
                content,
                status,
                source,
            } if *source != TodoSource::User => self.guarded(todo_id, |store| {
                store.update(
                    todo_id,
                    TodoPatch {
                        content: content.clone(),
                        status: status.clone(),
                        source: *source,
                    },
                )
            }),
            AIEventKind::TodoDeleted { todo_id, source } if *source != TodoSource::User => {
                self.guarded(todo_id, |store| store.delete(todo_id, *source))
            }
            AIEventKind::ToolCallStart { name, args, .. }
                if TODO_WRITE_TOOLS.contains(&name.as_str()) =>
            {
                self.mirror_todo_write(event.origin().unwrap_or("ai"), args)
            }
            _ => Ok(()),
        }
    }

    /// Applies an agent's todo list (`args.todos[]`) as AI-sourced todos. Entries
    /// without an id are keyed by their position in the list.
    fn mirror_todo_write(&self, origin: &str, args: &Value) -> HandlerResult {
        let Some(todos) = args.get("todos").and_then(Value::as_array) else {
            return Ok(());
        };
        for (index, todo) in todos.iter().enumerate() {
            let Some(content) = todo
                .get("content")
                .and_then(Value::as_str)
                .filter(|c| !c.trim().is_empty())
            else {
                continue;
            };
            let id = todo
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{origin}-todo-{index}"));
            let status = todo
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TODO_STATUS)
                .to_string();

            self.guarded(&id, |store| match store.get(&id) {
                Some(existing) if existing.content == content && existing.status == status => {
                    Ok(())
                }
                Some(_) => store.update(
                    &id,
                    TodoPatch {
                        content: Some(content.to_string()),
                        status: Some(status.clone()),
                        source: TodoSource::Ai,
                    },
                ),
                None => store.create(TodoItem {
                    id: id.clone(),
                    content: content.to_string(),
                    status: status.clone(),
                    source: TodoSource::Ai,
                }),
            })?;
        }
        Ok(())
    }
}

/// Bus consumer keeping a [`TodoStore`] in step with todo events.
pub struct TodoSync {
    subscriptions: Vec<Subscription>,
}

impl TodoSync {
    pub fn attach(bus: &EventBus, store: Arc<dyn TodoStore>) -> Self {
        let state = Arc::new(SyncState {
            store,
            in_flight: Mutex::new(HashSet::new()),
        });
        let subscriptions = [
            AIEventType::TodoCreated,
            AIEventType::TodoUpdated,
            AIEventType::TodoDeleted,
            AIEventType::ToolCallStart,
        ]
        .into_iter()
        .map(|event_type| {
            let state = Arc::clone(&state);
            bus.on(event_type, move |event| state.handle(event))
        })
        .collect();
        Self { subscriptions }
    }

    pub fn detach(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl Drop for TodoSync {
    fn drop(&mut self) {
        self.detach();
    }
}
