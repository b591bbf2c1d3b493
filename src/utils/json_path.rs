//! Dot-notation JSON paths with array indices and a `[*]` wildcard.
//!
//! Paths are compiled into segments once (at manifest/pipeline build time)
//! and evaluated against frames with no string scanning. The wildcard
//! matches any list element: `first()` returns the first element that
//! resolves, `all()` fans out across every element.

use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cannot set value at path: {0}")]
    CannotSetValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A compiled JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
    raw: String,
}

impl JsonPath {
    /// Parse a path like `$.choices[0].delta.content` or
    /// `choices[*].delta.tool_calls[*].id`. Dot-index segments
    /// (`choices.0.delta`) are accepted too.
    pub fn parse(path: &str) -> Result<JsonPath, PathError> {
        let raw = path.trim();
        let body = raw.strip_prefix("$.").or_else(|| raw.strip_prefix('$')).unwrap_or(raw);
        if body.is_empty() {
            return Err(PathError::InvalidPath(path.to_string()));
        }

        fn flush(segments: &mut Vec<Segment>, current: &mut String) {
            if current.is_empty() {
                return;
            }
            let seg = if let Ok(idx) = current.parse::<usize>() {
                Segment::Index(idx)
            } else if current.as_str() == "*" {
                Segment::Wildcard
            } else {
                Segment::Key(current.clone())
            };
            segments.push(seg);
            current.clear();
        }

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = body.char_indices();

        while let Some((i, ch)) = chars.next() {
            match ch {
                '.' => flush(&mut segments, &mut current),
                '[' => {
                    flush(&mut segments, &mut current);
                    let close = body[i..]
                        .find(']')
                        .map(|off| i + off)
                        .ok_or_else(|| PathError::InvalidPath(path.to_string()))?;
                    let inner = body[i + 1..close].trim();
                    if inner == "*" {
                        segments.push(Segment::Wildcard);
                    } else {
                        let idx = inner
                            .parse::<usize>()
                            .map_err(|_| PathError::InvalidPath(path.to_string()))?;
                        segments.push(Segment::Index(idx));
                    }
                    // Consume up to and including the closing bracket
                    for (j, _) in chars.by_ref() {
                        if j == close {
                            break;
                        }
                    }
                }
                ']' => return Err(PathError::InvalidPath(path.to_string())),
                _ => current.push(ch),
            }
        }
        flush(&mut segments, &mut current);

        if segments.is_empty() {
            return Err(PathError::InvalidPath(path.to_string()));
        }

        Ok(JsonPath {
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First value the path resolves to, or None.
    pub fn first<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        Self::walk(root, &self.segments).into_iter().next()
    }

    /// Every value the path resolves to (wildcards fan out).
    pub fn all<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        Self::walk(root, &self.segments)
    }

    /// True iff the path resolves to at least one non-null value.
    pub fn exists(&self, root: &Value) -> bool {
        self.all(root).iter().any(|v| !v.is_null())
    }

    /// First value rendered as a string (numbers and objects are
    /// stringified, matching lenient provider payloads).
    pub fn first_string(&self, root: &Value) -> Option<String> {
        self.first(root).and_then(|v| {
            if let Some(s) = v.as_str() {
                Some(s.to_string())
            } else if v.is_null() {
                None
            } else {
                serde_json::to_string(v).ok()
            }
        })
    }

    fn walk<'a>(root: &'a Value, segments: &[Segment]) -> Vec<&'a Value> {
        let mut current: Vec<&'a Value> = vec![root];
        for seg in segments {
            let mut next = Vec::new();
            for v in current {
                match seg {
                    Segment::Key(k) => {
                        if let Some(child) = v.as_object().and_then(|m| m.get(k)) {
                            next.push(child);
                        }
                    }
                    Segment::Index(i) => {
                        if let Some(child) = v.as_array().and_then(|a| a.get(*i)) {
                            next.push(child);
                        }
                    }
                    Segment::Wildcard => {
                        if let Some(arr) = v.as_array() {
                            next.extend(arr.iter());
                        }
                    }
                }
            }
            if next.is_empty() {
                return next;
            }
            current = next;
        }
        current
    }
}

/// Convenience wrappers over [`JsonPath`] for one-off string paths.
pub struct PathMapper;

impl PathMapper {
    /// Get the first value at a dot-notation path.
    pub fn get_path<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
        JsonPath::parse(path).ok()?.first(obj)
    }

    /// Get a string at a path (non-strings are stringified).
    pub fn get_string(obj: &Value, path: &str) -> Option<String> {
        JsonPath::parse(path).ok()?.first_string(obj)
    }

    /// Set a value at a nested object path, creating intermediate objects.
    pub fn set_path(obj: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
        let normalized = path.trim().trim_start_matches("$.").to_string();
        let parts: Vec<&str> = normalized.split('.').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return Err(PathError::InvalidPath(path.to_string()));
        }

        if !obj.is_object() {
            *obj = json!({});
        }

        let mut current = obj
            .as_object_mut()
            .ok_or_else(|| PathError::CannotSetValue("root is not an object".to_string()))?;

        for part in parts.iter().take(parts.len() - 1) {
            if !current.contains_key(*part) || !current[*part].is_object() {
                current.insert(part.to_string(), json!({}));
            }
            current = current[*part]
                .as_object_mut()
                .ok_or_else(|| PathError::CannotSetValue(format!("not an object at: {}", part)))?;
        }

        current.insert(parts[parts.len() - 1].to_string(), value);
        Ok(())
    }

    /// Batch set multiple paths.
    pub fn set_paths(obj: &mut Value, paths: &HashMap<String, Value>) -> Result<(), PathError> {
        for (path, value) in paths {
            Self::set_path(obj, path, value.clone())?;
        }
        Ok(())
    }
}
