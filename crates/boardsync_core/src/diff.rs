//! Structural diff between JSON snapshots.
//!
//! This is the draft-and-diff step behind [`Observable::update`]
//! (crate::observable::Observable::update): clone the value, let the
//! mutation closure run, then compare before/after snapshots into a list of
//! [`Patch`]es and the inverse list that undoes them. Objects diff by key,
//! arrays by index with tail insertion/removal; anything else that differs
//! becomes a `replace`.
//!
//! The inverse list is ordered so that applying it front to back restores
//! the base snapshot exactly.

use serde_json::Value;

use crate::patch::{Patch, Path};

/// Compute `(patches, inverse)` turning `base` into `next`.
///
/// Applying `patches` to `base` (in order) yields `next`; applying `inverse`
/// to `next` yields `base`. Equal snapshots produce two empty lists.
pub fn diff_values(base: &Value, next: &Value) -> (Vec<Patch>, Vec<Patch>) {
    let mut patches = Vec::new();
    let mut inverse_steps = Vec::new();
    diff_at(base, next, &Path::root(), &mut patches, &mut inverse_steps);
    inverse_steps.reverse();
    (patches, inverse_steps)
}

fn diff_at(
    base: &Value,
    next: &Value,
    path: &Path,
    patches: &mut Vec<Patch>,
    inverse_steps: &mut Vec<Patch>,
) {
    if base == next {
        return;
    }

    match (base, next) {
        (Value::Object(base_map), Value::Object(next_map)) => {
            for (key, base_value) in base_map {
                if !next_map.contains_key(key) {
                    let child = path.clone().key(key.clone());
                    patches.push(Patch::remove(child.clone()));
                    inverse_steps.push(Patch::add(child, base_value.clone()));
                }
            }
            for (key, next_value) in next_map {
                let child = path.clone().key(key.clone());
                match base_map.get(key) {
                    None => {
                        patches.push(Patch::add(child.clone(), next_value.clone()));
                        inverse_steps.push(Patch::remove(child));
                    }
                    Some(base_value) => {
                        diff_at(base_value, next_value, &child, patches, inverse_steps);
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(next_items)) => {
            let shared = base_items.len().min(next_items.len());
            for i in 0..shared {
                let child = path.clone().index(i);
                diff_at(&base_items[i], &next_items[i], &child, patches, inverse_steps);
            }
            // Tail removals run highest-index-first so each one stays valid.
            for i in (shared..base_items.len()).rev() {
                let child = path.clone().index(i);
                patches.push(Patch::remove(child.clone()));
                inverse_steps.push(Patch::add(child, base_items[i].clone()));
            }
            for (i, item) in next_items.iter().enumerate().skip(shared) {
                let child = path.clone().index(i);
                patches.push(Patch::add(child.clone(), item.clone()));
                inverse_steps.push(Patch::remove(child));
            }
        }
        _ => {
            patches.push(Patch::replace(path.clone(), next.clone()));
            inverse_steps.push(Patch::replace(path.clone(), base.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::apply_patches;
    use serde_json::json;

    fn roundtrip(base: Value, next: Value) {
        let (patches, inverse) = diff_values(&base, &next);

        let mut forward = base.clone();
        apply_patches(&mut forward, &patches).unwrap();
        assert_eq!(forward, next, "forward patches must produce `next`");

        let mut backward = next.clone();
        apply_patches(&mut backward, &inverse).unwrap();
        assert_eq!(backward, base, "inverse patches must restore `base`");
    }

    #[test]
    fn test_equal_values_produce_nothing() {
        let value = json!({"boards": {"b1": {"title": "t"}}});
        let (patches, inverse) = diff_values(&value, &value.clone());
        assert!(patches.is_empty());
        assert!(inverse.is_empty());
    }

    #[test]
    fn test_object_add_remove_change() {
        roundtrip(
            json!({"boards": {"b1": {"id": "b1", "title": "old"}}}),
            json!({"boards": {"b2": {"id": "b2"}, "b1": {"id": "b1", "title": "new"}}}),
        );
    }

    #[test]
    fn test_field_change_is_a_deep_replace() {
        let base = json!({"boards": {"b1": {"id": "b1", "title": "old"}}});
        let next = json!({"boards": {"b1": {"id": "b1", "title": "new"}}});
        let (patches, _) = diff_values(&base, &next);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path.to_string(), "/boards/b1/title");
    }

    #[test]
    fn test_array_growth_and_shrink() {
        roundtrip(json!({"order": ["a", "b", "c"]}), json!({"order": ["a"]}));
        roundtrip(json!({"order": ["a"]}), json!({"order": ["a", "b", "c"]}));
        roundtrip(json!({"order": ["a", "b"]}), json!({"order": ["b", "a", "c"]}));
    }

    #[test]
    fn test_type_change_replaces_whole_subtree() {
        roundtrip(
            json!({"selection": ["c1", "c2"]}),
            json!({"selection": null}),
        );
    }

    #[test]
    fn test_nested_mixed_changes() {
        roundtrip(
            json!({
                "boards": {"b1": {"id": "b1", "title": "t"}},
                "cards": {"c1": {"id": "c1", "text": "hi", "position": {"x": 0, "y": 0}}}
            }),
            json!({
                "boards": {"b1": {"id": "b1", "title": "t2"}},
                "cards": {
                    "c1": {"id": "c1", "text": "hi", "position": {"x": 4, "y": 0}},
                    "c2": {"id": "c2", "text": "new"}
                }
            }),
        );
    }
}
