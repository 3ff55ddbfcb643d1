//! Deterministic request key normalization.
//!
//! Equal logical requests must normalize to equal keys regardless of
//! parameter order, name casing, or absent-vs-empty fields. The canonical
//! grammar is:
//!
//! ```text
//! key := lowercase(entity_type) "?" param ("&" param)*
//! param := lowercase(name) "=" rendered_value
//! ```
//!
//! Parameter names are sorted bytewise after lowercasing. Parameters whose
//! value renders empty (empty string, empty list, whitespace-only) are
//! dropped entirely, so `{"tags": []}` and a missing `tags` field produce
//! the same key. Scalar value *content* keeps its casing: `"Jazz"` and
//! `"jazz"` are distinct requests upstream and stay distinct here.

use crate::types::Params;
use std::{fmt, sync::Arc};

/// Canonical identity of a logical request.
///
/// Cheap to clone (`Arc<str>` internally); used as the cache key, the
/// dedupe key, and the fallback-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    /// Builds the canonical key for `(entity_type, params)`.
    #[must_use]
    pub fn normalize(entity_type: &str, params: &Params) -> Self {
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .map(|(name, value)| (name.trim().to_lowercase(), value.render()))
            .filter(|(name, rendered)| !name.is_empty() && !rendered.is_empty())
            .collect();
        pairs.sort();
        // Equal lowercased names keep only the first after sorting; callers
        // supplying both "Tags" and "tags" denote a single logical field.
        pairs.dedup_by(|a, b| a.0 == b.0);

        let entity = entity_type.trim().to_lowercase();
        let mut key = String::with_capacity(
            entity.len() + 1 + pairs.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>(),
        );
        key.push_str(&entity);
        key.push('?');
        for (i, (name, rendered)) in pairs.iter().enumerate() {
            if i > 0 {
                key.push('&');
            }
            key.push_str(name);
            key.push('=');
            key.push_str(rendered);
        }

        Self(Arc::from(key.as_str()))
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the entity-type namespace this key belongs to.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        self.0.split('?').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamValue;
    use std::collections::HashMap;

    fn params(entries: &[(&str, ParamValue)]) -> Params {
        entries.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_normalize_is_order_independent() {
        let a = params(&[("genre", "jazz".into()), ("limit", ParamValue::Int(10))]);
        let b = params(&[("limit", ParamValue::Int(10)), ("genre", "jazz".into())]);

        assert_eq!(RequestKey::normalize("music", &a), RequestKey::normalize("music", &b));
    }

    #[test]
    fn test_normalize_lowercases_names_and_entity() {
        let a = params(&[("Genre", "jazz".into())]);
        let b = params(&[("genre", "jazz".into())]);

        assert_eq!(RequestKey::normalize("Music", &a), RequestKey::normalize("music", &b));
    }

    #[test]
    fn test_value_casing_is_preserved() {
        let a = params(&[("genre", "Jazz".into())]);
        let b = params(&[("genre", "jazz".into())]);

        assert_ne!(RequestKey::normalize("music", &a), RequestKey::normalize("music", &b));
    }

    #[test]
    fn test_absent_equals_empty() {
        let absent = params(&[("genre", "jazz".into())]);
        let empty_str = params(&[("genre", "jazz".into()), ("tags", "".into())]);
        let empty_list = params(&[("genre", "jazz".into()), ("tags", ParamValue::List(vec![]))]);

        let key = RequestKey::normalize("music", &absent);
        assert_eq!(key, RequestKey::normalize("music", &empty_str));
        assert_eq!(key, RequestKey::normalize("music", &empty_list));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let p = params(&[
            ("Genre", "jazz".into()),
            ("seeds", ParamValue::List(vec!["Coltrane".into(), "Davis".into()])),
        ]);

        let once = RequestKey::normalize("music", &p);
        // Rebuilding from identical input yields the identical canonical form
        let twice = RequestKey::normalize("music", &p);
        assert_eq!(once, twice);
        assert_eq!(once.as_str(), "music?genre=jazz&seeds=Coltrane,Davis");
    }

    #[test]
    fn test_list_element_order_is_semantic() {
        let a = params(&[("seeds", ParamValue::List(vec!["a".into(), "b".into()]))]);
        let b = params(&[("seeds", ParamValue::List(vec!["b".into(), "a".into()]))]);

        assert_ne!(RequestKey::normalize("music", &a), RequestKey::normalize("music", &b));
    }

    #[test]
    fn test_entity_type_accessor() {
        let key = RequestKey::normalize("Music", &params(&[("genre", "jazz".into())]));
        assert_eq!(key.entity_type(), "music");

        let empty = RequestKey::normalize("music", &HashMap::new());
        assert_eq!(empty.entity_type(), "music");
        assert_eq!(empty.as_str(), "music?");
    }
}
