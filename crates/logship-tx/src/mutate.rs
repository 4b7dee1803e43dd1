//! Document mutators
//!
//! Applied once the document is non-empty, always in the same order:
//! copy, rename, remove, append, prune. Map-typed config is flattened to
//! sorted vectors at compile time so behavior doesn't depend on hash
//! iteration order.

use logship_core::MutateSpec;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct CompiledMutate {
    copy: Vec<(String, Vec<String>)>,
    rename: Vec<(String, String)>,
    remove: Vec<String>,
    append: Vec<(String, Value)>,
    prune: bool,
}

impl CompiledMutate {
    pub fn compile(spec: &MutateSpec) -> Self {
        let mut copy: Vec<(String, Vec<String>)> = spec
            .copy
            .iter()
            .map(|(src, dst)| (src.clone(), dst.targets().to_vec()))
            .collect();
        copy.sort_by(|a, b| a.0.cmp(&b.0));

        let mut rename: Vec<(String, String)> = spec
            .rename
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        rename.sort();

        let mut append: Vec<(String, Value)> = spec
            .append
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        append.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            copy,
            rename,
            remove: spec.remove.clone(),
            append,
            prune: spec.prune,
        }
    }

    pub fn apply(&self, doc: &mut Map<String, Value>) {
        // A missing copy source writes null, which prune can sweep later.
        for (src, dsts) in &self.copy {
            let val = doc.get(src).cloned().unwrap_or(Value::Null);
            for dst in dsts {
                doc.insert(dst.clone(), val.clone());
            }
        }

        for (old, new) in &self.rename {
            if let Some(v) = doc.remove(old) {
                doc.insert(new.clone(), v);
            }
        }

        for key in &self.remove {
            doc.remove(key);
        }

        for (key, value) in &self.append {
            doc.insert(key.clone(), value.clone());
        }

        if self.prune {
            doc.retain(|_, v| !v.is_null() && v.as_str() != Some(""));
        }
    }
}
