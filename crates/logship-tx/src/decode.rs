//! Line decoders
//!
//! Decoders run in configured order and grow the document left-to-right:
//! `json` merges the object decoded from the first `{` onward, `syslog`
//! replaces whatever came before it. A decoder that fails to parse skips
//! itself without aborting the line.

use logship_core::Decoder;
use serde_json::{Map, Value};

use crate::syslog;

pub fn apply(decoders: &[Decoder], line: &str, doc: &mut Map<String, Value>) {
    for decoder in decoders {
        match decoder {
            Decoder::Json => {
                let Some(pos) = line.find('{') else { continue };
                match serde_json::from_str::<Value>(&line[pos..]) {
                    Ok(Value::Object(obj)) => {
                        for (k, v) in obj {
                            doc.insert(k, v);
                        }
                    }
                    _ => continue,
                }
            }
            Decoder::Syslog => {
                if let Some(parsed) = syslog::parse(line) {
                    *doc = parsed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_decodes_from_first_brace() {
        let mut doc = Map::new();
        apply(&[Decoder::Json], r#"prefix {"a":1}"#, &mut doc);
        assert_eq!(doc["a"], json!(1));
    }

    #[test]
    fn json_failure_skips_decoder() {
        let mut doc = Map::new();
        doc.insert("kept".into(), json!(true));
        apply(&[Decoder::Json], "no json here {broken", &mut doc);
        assert_eq!(doc.len(), 1);
        assert_eq!(doc["kept"], json!(true));
    }

    #[test]
    fn json_merges_left_to_right() {
        let mut doc = Map::new();
        doc.insert("a".into(), json!("old"));
        doc.insert("b".into(), json!(2));
        apply(&[Decoder::Json], r#"{"a":"new"}"#, &mut doc);
        assert_eq!(doc["a"], json!("new"));
        assert_eq!(doc["b"], json!(2));
    }

    #[test]
    fn syslog_replaces_prior_document() {
        let mut doc = Map::new();
        doc.insert("stale".into(), json!(1));
        apply(
            &[Decoder::Syslog],
            "Mar 14 09:26:53 web01 sshd[1]: hello",
            &mut doc,
        );
        assert!(doc.get("stale").is_none());
        assert_eq!(doc["host"], json!("web01"));
    }

    #[test]
    fn trailing_garbage_after_object_is_a_decode_failure() {
        let mut doc = Map::new();
        apply(&[Decoder::Json], r#"{"a":1} suffix"#, &mut doc);
        assert!(doc.is_empty());
    }

    #[test]
    fn non_object_json_is_skipped() {
        let mut doc = Map::new();
        apply(&[Decoder::Json], "level=info {count} [1,2,3]", &mut doc);
        assert!(doc.is_empty());
    }
}
