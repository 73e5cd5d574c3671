use serde_json::Value;

use crate::error::ExprError;
use crate::path::{PathExpr, Section};

impl PathExpr {
    /// Apply this path to `obj`: set the addressed location(s) to `value`,
    /// or delete them when `value` is `None`.
    ///
    /// Traversal never materializes missing intermediate keys — a path into
    /// a map key that does not exist is a silent no-op. Deleting the last
    /// entry of a map cascades: emptied parent maps are removed from their
    /// parents. Out-of-range positional indices are an error; the bare path
    /// `self` does nothing.
    pub fn apply(&self, obj: &mut Value, value: Option<&Value>) -> Result<(), ExprError> {
        if self.is_root() {
            return Ok(());
        }
        apply_sections(obj, self.sections(), value)?;
        Ok(())
    }
}

/// Returns whether anything was deleted below `node` (drives the cascading
/// cleanup of emptied maps).
fn apply_sections(
    node: &mut Value,
    sections: &[Section],
    value: Option<&Value>,
) -> Result<bool, ExprError> {
    let (section, rest) = match sections.split_first() {
        Some(split) => split,
        None => return Ok(false),
    };
    let last = rest.is_empty();

    match section {
        Section::Field(name) => {
            let map = match node.as_object_mut() {
                Some(m) => m,
                None => return Ok(false),
            };
            if last {
                return Ok(match value {
                    Some(v) => {
                        map.insert(name.clone(), v.clone());
                        false
                    }
                    None => map.remove(name).is_some(),
                });
            }
            let child = match map.get_mut(name) {
                Some(c) => c,
                None => return Ok(false),
            };
            let deleted = apply_sections(child, rest, value)?;
            if deleted && child.as_object().is_some_and(|m| m.is_empty()) {
                map.remove(name);
            }
            Ok(deleted)
        }

        Section::Index(index) => {
            let seq = match node.as_array_mut() {
                Some(s) => s,
                None => return Ok(false),
            };
            if *index >= seq.len() {
                return Err(ExprError::IndexOutOfRange {
                    index: *index,
                    len: seq.len(),
                });
            }
            if last {
                return Ok(match value {
                    Some(v) => {
                        seq[*index] = v.clone();
                        false
                    }
                    None => {
                        seq.remove(*index);
                        true
                    }
                });
            }
            apply_sections(&mut seq[*index], rest, value)
        }

        Section::Wildcard => {
            let seq = match node.as_array_mut() {
                Some(s) => s,
                None => return Ok(false),
            };
            if last {
                return Ok(match value {
                    Some(v) => {
                        for el in seq.iter_mut() {
                            *el = v.clone();
                        }
                        false
                    }
                    None => {
                        let had = !seq.is_empty();
                        seq.clear();
                        had
                    }
                });
            }
            let mut deleted = false;
            for el in seq.iter_mut() {
                deleted |= apply_sections(el, rest, value)?;
            }
            Ok(deleted)
        }

        Section::Match { key, value: want } => {
            let seq = match node.as_array_mut() {
                Some(s) => s,
                None => return Ok(false),
            };
            if last && value.is_none() {
                let before = seq.len();
                seq.retain(|el| !matches_element(el, key, want));
                return Ok(seq.len() != before);
            }
            let mut deleted = false;
            for el in seq.iter_mut() {
                // Matchers only apply to map elements; everything else is skipped.
                if !matches_element(el, key, want) {
                    continue;
                }
                if last {
                    if let Some(v) = value {
                        *el = v.clone();
                    }
                } else {
                    deleted |= apply_sections(el, rest, value)?;
                }
            }
            Ok(deleted)
        }
    }
}

fn matches_element(el: &Value, key: &str, want: &str) -> bool {
    let map = match el.as_object() {
        Some(m) => m,
        None => return false,
    };
    match map.get(key) {
        Some(Value::String(s)) => s == want,
        Some(Value::Number(n)) => n.to_string() == want,
        Some(Value::Bool(b)) => b.to_string() == want,
        _ => false,
    }
}
