//! `FilterEngine` — literal substring redaction applied to outgoing request
//! bodies (spec §4.2).
//!
//! No regex, no escaping: rules are plain substring `replace`/`remove`,
//! applied left-to-right so later rules see earlier rules' output.

use crate::config::{FilterOp, FilterRule};

/// Apply `rules` to `body` in declared order. Rules with an empty `source`
/// are skipped. Never alters byte length outside matched spans (spec
/// invariant 5: idempotent when no rule's `source` occurs in the input).
pub fn apply(body: &str, rules: &[FilterRule]) -> String {
    let mut out = body.to_string();
    for rule in rules {
        if rule.source.is_empty() {
            continue;
        }
        match rule.op {
            FilterOp::Replace => {
                let target = rule.target.as_deref().unwrap_or("");
                out = out.replace(&rule.source, target);
            }
            FilterOp::Remove => {
                out = out.replace(&rule.source, "");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_redacts_every_occurrence() {
        let rules = vec![FilterRule {
            source: "sk-live-XYZ".into(),
            op: FilterOp::Replace,
            target: Some("sk-***".into()),
        }];
        let body = r#"{"key":"sk-live-XYZ","other":"sk-live-XYZ"}"#;
        let out = apply(body, &rules);
        assert_eq!(out, r#"{"key":"sk-***","other":"sk-***"}"#);
    }

    #[test]
    fn remove_deletes_every_occurrence() {
        let rules = vec![FilterRule {
            source: "secret".into(),
            op: FilterOp::Remove,
            target: None,
        }];
        assert_eq!(apply("a secret b secret c", &rules), "a  b  c");
    }

    #[test]
    fn empty_source_rule_is_skipped() {
        let rules = vec![FilterRule {
            source: "".into(),
            op: FilterOp::Remove,
            target: None,
        }];
        assert_eq!(apply("unchanged", &rules), "unchanged");
    }

    #[test]
    fn idempotent_when_no_source_present() {
        let rules = vec![FilterRule {
            source: "not-present".into(),
            op: FilterOp::Replace,
            target: Some("x".into()),
        }];
        let body = "completely unrelated content";
        assert_eq!(apply(body, &rules), body);
    }

    #[test]
    fn rules_apply_left_to_right_on_prior_output() {
        let rules = vec![
            FilterRule {
                source: "a".into(),
                op: FilterOp::Replace,
                target: Some("b".into()),
            },
            FilterRule {
                source: "b".into(),
                op: FilterOp::Replace,
                target: Some("c".into()),
            },
        ];
        assert_eq!(apply("a", &rules), "c");
    }
}
