//! Operational transform for widget changes.
//!
//! Pure functions: the same incoming change and the same ordered concurrent
//! set always produce the same result.
//!
//! | kind       | rule                                                   |
//! |------------|--------------------------------------------------------|
//! | `position` | shallow merge, incoming fields win                     |
//! | `size`     | `width`/`height` from incoming if present, else prior  |
//! | `config`   | recursive map merge, arrays and scalars replaced       |
//! | `content`  | last write wins (no text merge)                        |

use crate::change::{Change, ChangeKind};
use crate::value::Value;

const SIZE_FIELDS: [&str; 2] = ["width", "height"];

/// Reconcile `incoming` against one prior `existing` change.
///
/// Changes on different widgets or of different kinds cannot conflict and
/// `incoming` is returned unchanged.
pub fn transform(incoming: &Change, existing: &Change) -> Change {
    if incoming.widget_id != existing.widget_id || incoming.change_type != existing.change_type {
        return incoming.clone();
    }

    let new_value = match incoming.change_type {
        ChangeKind::Position => merge_position(&existing.new_value, &incoming.new_value),
        ChangeKind::Size => merge_size(&existing.new_value, &incoming.new_value),
        ChangeKind::Config => Value::deep_merge(&existing.new_value, &incoming.new_value),
        ChangeKind::Content => incoming.new_value.clone(),
    };

    Change {
        new_value,
        ..incoming.clone()
    }
}

/// Left-fold `incoming` over `concurrent` (expected oldest first).
pub fn transform_all(incoming: &Change, concurrent: &[Change]) -> Change {
    concurrent
        .iter()
        .fold(incoming.clone(), |acc, prior| transform(&acc, prior))
}

fn merge_position(existing: &Value, incoming: &Value) -> Value {
    Value::shallow_merge(existing, incoming).unwrap_or_else(|| incoming.clone())
}

fn merge_size(existing: &Value, incoming: &Value) -> Value {
    let (Some(prior), Some(next)) = (existing.as_map(), incoming.as_map()) else {
        return incoming.clone();
    };

    let mut out = next.clone();
    for field in SIZE_FIELDS {
        let chosen = next
            .get(field)
            .filter(|v| !v.is_null())
            .or_else(|| prior.get(field));
        if let Some(v) = chosen {
            out.insert(field.to_string(), v.clone());
        }
    }
    Value::Map(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    fn change(user: &str, kind: ChangeKind, value: &str, ts: u64) -> Change {
        Change::new("w1", kind, json(value), user, ts)
    }

    #[test]
    fn test_position_merges_fields() {
        let a = change("a", ChangeKind::Position, r#"{"x": 10}"#, 100);
        let b = change("b", ChangeKind::Position, r#"{"y": 20}"#, 150);
        let out = transform(&b, &a);
        assert_eq!(out.new_value, json(r#"{"x": 10, "y": 20}"#));
        assert_eq!(out.user_id, "b");
        assert_eq!(out.timestamp, 150);
    }

    #[test]
    fn test_position_incoming_wins_on_collision() {
        let a = change("a", ChangeKind::Position, r#"{"x": 10, "y": 1}"#, 100);
        let b = change("b", ChangeKind::Position, r#"{"x": 99}"#, 150);
        assert_eq!(transform(&b, &a).new_value, json(r#"{"x": 99, "y": 1}"#));
    }

    #[test]
    fn test_size_falls_back_to_existing() {
        let a = change("a", ChangeKind::Size, r#"{"width": 300, "height": 200}"#, 100);
        let b = change("b", ChangeKind::Size, r#"{"width": 400}"#, 150);
        assert_eq!(
            transform(&b, &a).new_value,
            json(r#"{"width": 400, "height": 200}"#)
        );
    }

    #[test]
    fn test_size_ignores_other_existing_fields() {
        let a = change("a", ChangeKind::Size, r#"{"width": 300, "depth": 5}"#, 100);
        let b = change("b", ChangeKind::Size, r#"{"height": 50}"#, 150);
        assert_eq!(
            transform(&b, &a).new_value,
            json(r#"{"width": 300, "height": 50}"#)
        );
    }

    #[test]
    fn test_config_deep_merge() {
        let a = change("a", ChangeKind::Config, r#"{"axis": {"min": 0, "max": 10}, "series": [1]}"#, 100);
        let b = change("b", ChangeKind::Config, r#"{"axis": {"max": 50}, "series": [2, 3]}"#, 150);
        assert_eq!(
            transform(&b, &a).new_value,
            json(r#"{"axis": {"min": 0, "max": 50}, "series": [2, 3]}"#)
        );
    }

    #[test]
    fn test_config_merge_idempotent() {
        let c = change("a", ChangeKind::Config, r#"{"title": "CPU", "axis": {"min": 0, "ticks": [1, 2]}}"#, 100);
        assert_eq!(transform(&c, &c).new_value, c.new_value);
    }

    #[test]
    fn test_content_last_write_wins() {
        let a = change("a", ChangeKind::Content, r#"{"text": "hello", "style": "bold"}"#, 10);
        let b = change("b", ChangeKind::Content, r#"{"text": "world"}"#, 20);
        assert_eq!(transform(&b, &a).new_value, json(r#"{"text": "world"}"#));
    }

    #[test]
    fn test_different_kinds_do_not_conflict() {
        let a = change("a", ChangeKind::Size, r#"{"width": 1}"#, 100);
        let b = change("b", ChangeKind::Position, r#"{"x": 1}"#, 150);
        assert_eq!(transform(&b, &a), b);
    }

    #[test]
    fn test_different_widgets_do_not_conflict() {
        let a = Change::new("w2", ChangeKind::Position, json(r#"{"x": 1}"#), "a", 100);
        let b = change("b", ChangeKind::Position, r#"{"y": 1}"#, 150);
        assert_eq!(transform(&b, &a), b);
    }

    #[test]
    fn test_non_map_values_incoming_wins() {
        let a = change("a", ChangeKind::Position, r#"{"x": 1}"#, 100);
        let b = change("b", ChangeKind::Position, r#"[1, 2]"#, 150);
        assert_eq!(transform(&b, &a).new_value, json("[1, 2]"));
    }

    #[test]
    fn test_transform_all_folds_in_order() {
        let a = change("a", ChangeKind::Position, r#"{"x": 1, "z": 1}"#, 100);
        let c = change("c", ChangeKind::Position, r#"{"x": 2}"#, 120);
        let b = change("b", ChangeKind::Position, r#"{"y": 3}"#, 150);
        // Fields picked up from `a` belong to the accumulator, so `c` only fills gaps.
        let out = transform_all(&b, &[a, c]);
        assert_eq!(out.new_value, json(r#"{"x": 1, "y": 3, "z": 1}"#));
    }

    #[test]
    fn test_transform_all_deterministic() {
        let prior = vec![
            change("a", ChangeKind::Config, r#"{"a": {"b": 1}}"#, 1),
            change("c", ChangeKind::Config, r#"{"a": {"c": [1]}, "d": true}"#, 2),
        ];
        let incoming = change("b", ChangeKind::Config, r#"{"a": {"b": 2}}"#, 3);
        let first = transform_all(&incoming, &prior);
        for _ in 0..50 {
            assert_eq!(transform_all(&incoming, &prior), first);
        }
    }

    #[test]
    fn test_transform_all_empty_set() {
        let b = change("b", ChangeKind::Content, r#""text""#, 1);
        assert_eq!(transform_all(&b, &[]), b);
    }
}
