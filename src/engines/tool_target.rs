use serde_json::Value;

/// Input fields worth showing for well-known tools, in preference order.
const KNOWN_TOOL_FIELDS: &[(&str, &[&str])] = &[
    ("Read", &["file_path", "path"]),
    ("Write", &["file_path", "path"]),
    ("Edit", &["file_path", "path"]),
    ("NotebookEdit", &["notebook_path"]),
    ("Glob", &["pattern"]),
    ("Grep", &["pattern"]),
    // Prefer the human-readable description over the raw command.
    ("Bash", &["description", "command"]),
    ("WebSearch", &["query"]),
    ("WebFetch", &["url"]),
    ("Task", &["description", "prompt"]),
    ("Skill", &["skill"]),
];

const GENERIC_FIELDS: &[&str] = &[
    "file_path", "path", "pattern", "command", "url", "query", "prompt", "name",
];

fn first_str<'a>(input: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .find_map(|field| input.get(*field).and_then(Value::as_str))
}

/// Short description of what a tool call targets, used in progress messages.
pub fn describe_tool_target(tool_name: &str, input: &Value) -> String {
    if let Some((_, fields)) = KNOWN_TOOL_FIELDS.iter().find(|(name, _)| *name == tool_name) {
        return first_str(input, fields).unwrap_or(tool_name).to_string();
    }
    match tool_name {
        "TodoWrite" | "todo_write" => input
            .get("todos")
            .and_then(Value::as_array)
            .map(|todos| format!("{} todo(s)", todos.len()))
            .unwrap_or_else(|| "todos".to_string()),
        _ => match first_str(input, GENERIC_FIELDS) {
            Some(value) => format!("{tool_name}: {value}"),
            None => tool_name.to_string(),
        },
    }
}
