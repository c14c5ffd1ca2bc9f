use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigError, Params};

/// How consecutive requests of one paginated sequence differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationConfig {
    /// One request per integer in `start..=end`.
    PageParam { param: String, start: u64, end: u64 },
    /// `offset = start_offset + k * limit` for `k < max_pages`.
    Offset {
        offset_param: String,
        limit_param: String,
        limit: u64,
        max_pages: u32,
        #[serde(default)]
        start_offset: u64,
    },
    /// Next cursor read from each response body at a dotted path.
    Cursor {
        cursor_param: String,
        #[serde(alias = "cursor_field")]
        cursor_field_path: String,
        #[serde(default)]
        initial_cursor: Option<String>,
        #[serde(default = "default_cursor_pages")]
        max_pages: u32,
    },
}

fn default_cursor_pages() -> u32 {
    10
}

impl PaginationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            PaginationConfig::PageParam { .. } => "page_param",
            PaginationConfig::Offset { .. } => "offset",
            PaginationConfig::Cursor { .. } => "cursor",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidPagination(msg.to_string()));
        match self {
            PaginationConfig::PageParam { param, start, end } => {
                if param.trim().is_empty() {
                    return invalid("param is required");
                }
                if *start < 1 || end < start {
                    return invalid("start must be >= 1 and end >= start");
                }
            }
            PaginationConfig::Offset {
                offset_param,
                limit_param,
                limit,
                max_pages,
                ..
            } => {
                if offset_param.trim().is_empty() || limit_param.trim().is_empty() {
                    return invalid("offset_param and limit_param are required");
                }
                if *limit < 1 || *max_pages < 1 {
                    return invalid("limit and max_pages must be >= 1");
                }
            }
            PaginationConfig::Cursor {
                cursor_param,
                cursor_field_path,
                max_pages,
                ..
            } => {
                if cursor_param.trim().is_empty() || cursor_field_path.trim().is_empty() {
                    return invalid("cursor_param and cursor_field_path are required");
                }
                if *max_pages < 1 {
                    return invalid("max_pages must be >= 1");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamChange {
    Set { name: String, value: String },
    Remove { name: String },
}

/// Changes to apply to the base parameters for one request of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mutation {
    /// Zero-based position in the sequence.
    pub page_index: u32,
    pub changes: Vec<ParamChange>,
}

impl Mutation {
    pub fn apply(&self, params: &mut Params) {
        for change in &self.changes {
            match change {
                ParamChange::Set { name, value } => {
                    params.insert(name.clone(), Value::String(value.clone()));
                }
                ParamChange::Remove { name } => {
                    params.remove(name);
                }
            }
        }
    }

    /// Value set for `name` by this mutation, if any.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.changes.iter().find_map(|change| match change {
            ParamChange::Set { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("malformed cursor path '{0}'")]
    MalformedPath(String),
    #[error("response body is not JSON: {0}")]
    NotJson(String),
    #[error("value at '{0}' is not a scalar")]
    NotScalar(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Single request done, or page range exhausted.
    EndReached,
    MaxPages,
    /// Cursor absent, null or empty in the last response.
    CursorExhausted,
    /// The previous page produced no response to read a cursor from.
    PreviousPageFailed,
    CursorUnreadable(CursorError),
    /// Orchestrator-level stop when empty pages end a sequence.
    EmptyPage,
    /// The next offset does not fit in a `u64`.
    OffsetOverflow,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndReached => "end_reached",
            StopReason::MaxPages => "max_pages",
            StopReason::CursorExhausted => "cursor_missing",
            StopReason::PreviousPageFailed => "previous_page_failed",
            StopReason::CursorUnreadable(_) => "cursor_unreadable",
            StopReason::EmptyPage => "empty_page",
            StopReason::OffsetOverflow => "offset_overflow",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StopReason::CursorUnreadable(_) | StopReason::OffsetOverflow
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Request(Mutation),
    Done(StopReason),
}

/// Produces the mutation stream for one paginated sequence.
///
/// Each call to [`PageSequencer::next`] receives the body of the response to
/// the previously emitted mutation (ignored except for cursor pagination).
/// Without a config exactly one empty mutation is emitted.
#[derive(Debug, Clone)]
pub struct PageSequencer {
    config: Option<PaginationConfig>,
    emitted: u32,
    done: bool,
}

impl PageSequencer {
    pub fn new(config: Option<&PaginationConfig>) -> Self {
        Self {
            config: config.cloned(),
            emitted: 0,
            done: false,
        }
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    pub fn next(&mut self, prior: Option<&[u8]>) -> Step {
        if self.done {
            return Step::Done(StopReason::EndReached);
        }
        let step = self.compute(prior);
        match &step {
            Step::Request(_) => self.emitted += 1,
            Step::Done(_) => self.done = true,
        }
        step
    }

    fn compute(&self, prior: Option<&[u8]>) -> Step {
        let k = self.emitted;
        let Some(config) = &self.config else {
            return if k == 0 {
                Step::Request(Mutation::default())
            } else {
                Step::Done(StopReason::EndReached)
            };
        };

        match config {
            PaginationConfig::PageParam { param, start, end } => {
                let value = match start.checked_add(u64::from(k)) {
                    Some(value) if value <= *end => value,
                    _ => return Step::Done(StopReason::EndReached),
                };
                Step::Request(Mutation {
                    page_index: k,
                    changes: vec![ParamChange::Set {
                        name: param.clone(),
                        value: value.to_string(),
                    }],
                })
            }
            PaginationConfig::Offset {
                offset_param,
                limit_param,
                limit,
                max_pages,
                start_offset,
            } => {
                if k >= *max_pages {
                    return Step::Done(StopReason::MaxPages);
                }
                let Some(offset) = u64::from(k)
                    .checked_mul(*limit)
                    .and_then(|step| step.checked_add(*start_offset))
                else {
                    return Step::Done(StopReason::OffsetOverflow);
                };
                Step::Request(Mutation {
                    page_index: k,
                    changes: vec![
                        ParamChange::Set {
                            name: offset_param.clone(),
                            value: offset.to_string(),
                        },
                        ParamChange::Set {
                            name: limit_param.clone(),
                            value: limit.to_string(),
                        },
                    ],
                })
            }
            PaginationConfig::Cursor {
                cursor_param,
                cursor_field_path,
                initial_cursor,
                max_pages,
            } => {
                if k == 0 {
                    let change = match initial_cursor.as_deref().filter(|c| !c.is_empty()) {
                        Some(cursor) => ParamChange::Set {
                            name: cursor_param.clone(),
                            value: cursor.to_string(),
                        },
                        None => ParamChange::Remove {
                            name: cursor_param.clone(),
                        },
                    };
                    return Step::Request(Mutation {
                        page_index: 0,
                        changes: vec![change],
                    });
                }
                if k >= *max_pages {
                    return Step::Done(StopReason::MaxPages);
                }
                let Some(body) = prior else {
                    return Step::Done(StopReason::PreviousPageFailed);
                };
                match next_cursor(body, cursor_field_path) {
                    Ok(Some(cursor)) => Step::Request(Mutation {
                        page_index: k,
                        changes: vec![ParamChange::Set {
                            name: cursor_param.clone(),
                            value: cursor,
                        }],
                    }),
                    Ok(None) => Step::Done(StopReason::CursorExhausted),
                    Err(err) => Step::Done(StopReason::CursorUnreadable(err)),
                }
            }
        }
    }
}

fn next_cursor(body: &[u8], path: &str) -> Result<Option<String>, CursorError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| CursorError::NotJson(err.to_string()))?;
    let cursor = match lookup_path(&value, path)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => return Err(CursorError::NotScalar(path.to_string())),
    };
    Ok(Some(cursor).filter(|c| !c.is_empty()))
}

/// Walks a dot-separated path through nested objects.
///
/// Returns `Ok(None)` when any segment is missing or a non-object is hit
/// midway; empty segments are a malformed path.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Result<Option<&'a Value>, CursorError> {
    let path = path.trim();
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(CursorError::MalformedPath(path.to_string()));
    }
    let mut node = value;
    for segment in path.split('.') {
        match node.get(segment) {
            Some(next) if node.is_object() => node = next,
            _ => return Ok(None),
        }
    }
    Ok(Some(node))
}
