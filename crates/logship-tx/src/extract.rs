//! Field extractors
//!
//! Each extractor acts on the raw line or on a named string field of the
//! partial document. A `when` guard skips the extractor when the source
//! doesn't match. `by: regex` is reserved and ignored.

use anyhow::{Context, Result};
use logship_core::{ExtractBy, ExtractSpec};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// An extractor with its patterns compiled
#[derive(Debug)]
pub struct CompiledExtract {
    by: ExtractBy,
    from: Option<String>,
    when: Option<Regex>,
    split_on: Option<Regex>,
    split_parts: Vec<String>,
    into_key: Option<String>,
}

/// Part names that discard their position
fn is_discard(name: &str) -> bool {
    name.eq_ignore_ascii_case("null") || name.eq_ignore_ascii_case("undef")
}

impl CompiledExtract {
    pub fn compile(spec: &ExtractSpec) -> Result<Self> {
        let when = spec
            .when
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("bad when pattern {:?}", spec.when))?;
        let split_on = spec
            .split_on
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("bad split_on pattern {:?}", spec.split_on))?;
        Ok(Self {
            by: spec.by,
            from: spec.from.clone(),
            when,
            split_on,
            split_parts: spec.split_parts.clone(),
            into_key: spec.into_key.clone(),
        })
    }

    pub fn apply(&self, line: &str, doc: &mut Map<String, Value>) {
        if self.by == ExtractBy::Regex {
            // reserved strategy, nothing to do yet
            return;
        }

        // Source is a named string field, or the raw line when unset.
        let source = match &self.from {
            Some(field) => match doc.get(field) {
                Some(Value::String(s)) => s.clone(),
                _ => return,
            },
            None => line.to_string(),
        };

        if let Some(guard) = &self.when {
            if !guard.is_match(&source) {
                return;
            }
        }

        let Some(sep) = &self.split_on else { return };
        let parts: Vec<&str> = sep.split(&source).collect();

        if self.split_parts.is_empty() {
            let Some(dest) = self.into_key.clone().or_else(|| self.from.clone()) else {
                debug!("split extractor has no destination field, skipping");
                return;
            };
            let value = if parts.len() == 1 {
                Value::String(parts[0].to_string())
            } else {
                Value::Array(parts.iter().map(|p| Value::String(p.to_string())).collect())
            };
            doc.insert(dest, value);
            return;
        }

        for (name, part) in self.split_parts.iter().zip(parts.iter()) {
            if is_discard(name) || part.is_empty() {
                continue;
            }
            let value = Value::String(part.to_string());
            match &self.into_key {
                Some(key) => {
                    let slot = doc
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !slot.is_object() {
                        debug!(field = %key, "replacing non-map destination with a nested map");
                        *slot = Value::Object(Map::new());
                    }
                    if let Value::Object(nested) = slot {
                        nested.insert(name.clone(), value);
                    }
                }
                None => {
                    doc.insert(name.clone(), value);
                }
            }
        }
    }
}
