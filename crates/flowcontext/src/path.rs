//! Property path expressions used as context keys.
//!
//! A key such as `user.address["post code"]` or `readings[3].value` is parsed
//! into [`Segment`]s and evaluated against the JSON object a store keeps for
//! each scope. A key may also carry an explicit store prefix, `#:(file)::key`,
//! which [`split_store`] separates from the path.

use crate::ContextError;
use serde_json::{Map, Value};

/// Largest array index a path may address. Writing past the end of an array
/// pads it with nulls, so the bound caps how far one write can grow it.
pub const MAX_INDEX: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    fn to_key(&self) -> String {
        match self {
            Segment::Key(k) => k.clone(),
            Segment::Index(i) => i.to_string(),
        }
    }

    fn as_index(&self) -> Option<usize> {
        let index = match self {
            Segment::Key(k) => k.parse().ok(),
            Segment::Index(i) => Some(*i),
        };
        index.filter(|i| *i <= MAX_INDEX)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Last {
    Start,
    Name,
    Dot,
    Close,
}

/// Parse a property expression into its segments.
pub fn parse(expr: &str) -> Result<Vec<Segment>, ContextError> {
    let invalid = || ContextError::InvalidExpression(expr.to_string());
    let chars: Vec<char> = expr.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut last = Last::Start;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                match last {
                    Last::Name => segments.push(Segment::Key(std::mem::take(&mut current))),
                    Last::Close => {}
                    _ => return Err(invalid()),
                }
                last = Last::Dot;
                i += 1;
            }
            '[' => {
                match last {
                    Last::Name => segments.push(Segment::Key(std::mem::take(&mut current))),
                    Last::Start | Last::Close => {}
                    Last::Dot => return Err(invalid()),
                }
                let (segment, next) = parse_bracket(&chars, i + 1).ok_or_else(invalid)?;
                segments.push(segment);
                last = Last::Close;
                i = next;
            }
            ']' => return Err(invalid()),
            c => {
                if last == Last::Close {
                    return Err(invalid());
                }
                current.push(c);
                last = Last::Name;
                i += 1;
            }
        }
    }

    match last {
        Last::Start | Last::Dot => Err(invalid()),
        Last::Name => {
            segments.push(Segment::Key(current));
            Ok(segments)
        }
        Last::Close => Ok(segments),
    }
}

/// Parse the inside of `[...]` starting just after the `[`.
/// Returns the segment and the index just after the closing `]`.
fn parse_bracket(chars: &[char], mut i: usize) -> Option<(Segment, usize)> {
    let first = *chars.get(i)?;
    if first == '"' || first == '\'' {
        let mut key = String::new();
        i += 1;
        loop {
            match *chars.get(i)? {
                '\\' => {
                    key.push(*chars.get(i + 1)?);
                    i += 2;
                }
                c if c == first => {
                    i += 1;
                    break;
                }
                c => {
                    key.push(c);
                    i += 1;
                }
            }
        }
        if *chars.get(i)? != ']' {
            return None;
        }
        return Some((Segment::Key(key), i + 1));
    }

    let start = i;
    while chars.get(i)?.is_ascii_digit() {
        i += 1;
    }
    if i == start || chars[i] != ']' {
        return None;
    }
    let index: String = chars[start..i].iter().collect();
    let index: usize = index.parse().ok()?;
    if index > MAX_INDEX {
        return None;
    }
    Some((Segment::Index(index), i + 1))
}

/// Evaluate a parsed path against a value.
pub fn get<'a>(root: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, segment| match value {
        Value::Object(map) => map.get(&segment.to_key()),
        Value::Array(items) => segment.as_index().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Evaluate an unparsed expression against a value.
pub fn get_expr<'a>(root: &'a Value, expr: &str) -> Result<Option<&'a Value>, ContextError> {
    Ok(get(root, &parse(expr)?))
}

/// Write `value` at `path`, creating intermediate containers as needed.
/// A `None` value removes the target instead; missing parents make that a no-op.
pub fn set(root: &mut Value, path: &[Segment], value: Option<Value>) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let create = value.is_some();
    let mut current = root;
    for (i, segment) in parents.iter().enumerate() {
        let Some(slot) = child_mut(current, segment, create) else {
            return;
        };
        if !slot.is_object() && !slot.is_array() {
            if !create {
                return;
            }
            *slot = match path[i + 1] {
                Segment::Index(_) => Value::Array(Vec::new()),
                Segment::Key(_) => Value::Object(Map::new()),
            };
        }
        current = slot;
    }
    match value {
        Some(value) => {
            if let Some(slot) = child_mut(current, last, true) {
                *slot = value;
            }
        }
        None => remove(current, last),
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &Segment, create: bool) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => {
            let key = segment.to_key();
            if create {
                Some(map.entry(key).or_insert(Value::Null))
            } else {
                map.get_mut(&key)
            }
        }
        Value::Array(items) => {
            let i = segment.as_index()?;
            if i >= items.len() {
                if !create {
                    return None;
                }
                items.resize(i.checked_add(1)?, Value::Null);
            }
            items.get_mut(i)
        }
        _ => None,
    }
}

fn remove(value: &mut Value, segment: &Segment) {
    match value {
        Value::Object(map) => {
            map.remove(&segment.to_key());
        }
        Value::Array(items) => {
            if let Some(slot) = segment.as_index().and_then(|i| items.get_mut(i)) {
                *slot = Value::Null;
            }
        }
        _ => {}
    }
}

/// Split an optional `#:(store)::` prefix from a context key.
pub fn split_store(key: &str) -> (Option<&str>, &str) {
    if let Some(rest) = key.strip_prefix("#:(") {
        if let Some(end) = rest.find(")::") {
            let store = &rest[..end];
            if !store.is_empty() && !store.contains(char::is_whitespace) {
                return (Some(store), &rest[end + 3..]);
            }
        }
    }
    (None, key)
}
