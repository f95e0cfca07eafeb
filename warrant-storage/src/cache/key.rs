//! Versioned cache keys for materialized expressions.
//!
//! Every key embeds the namespace version. Bumping the version makes every
//! previously written entry unreachable at once, without a scan; stale
//! entries then age out by TTL (or `purge_other_namespaces` on LMDB).

use warrant_core::{ActionPk, SubjectPk};

const KEY_PREFIX: &str = "warrant";
const EXPRESSION_SEGMENT: &str = "expr";

/// Cache key for one (subject, action) expression.
///
/// # Format
///
/// `warrant:{version}:expr:{subject_pk}:{action_pk}` as UTF-8 bytes. The
/// private inner struct means a key can only be built with a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectActionKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyInner {
    version: String,
    subject_pk: SubjectPk,
    action_pk: ActionPk,
}

impl SubjectActionKey {
    pub fn new(version: impl Into<String>, subject_pk: SubjectPk, action_pk: ActionPk) -> Self {
        Self {
            inner: KeyInner {
                version: version.into(),
                subject_pk,
                action_pk,
            },
        }
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn subject_pk(&self) -> SubjectPk {
        self.inner.subject_pk
    }

    pub fn action_pk(&self) -> ActionPk {
        self.inner.action_pk
    }

    pub fn pair(&self) -> (SubjectPk, ActionPk) {
        (self.inner.subject_pk, self.inner.action_pk)
    }

    /// Encode for backend storage.
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}{}:{}",
            namespace_prefix_str(&self.inner.version),
            self.inner.subject_pk,
            self.inner.action_pk
        )
        .into_bytes()
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` for anything not produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut parts = text.split(':');
        if parts.next()? != KEY_PREFIX {
            return None;
        }
        let version = parts.next()?;
        if version.is_empty() || parts.next()? != EXPRESSION_SEGMENT {
            return None;
        }
        let subject_pk = parts.next()?.parse().ok()?;
        let action_pk = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(version, subject_pk, action_pk))
    }

    /// Prefix shared by every expression key of a namespace version.
    pub fn namespace_prefix(version: &str) -> Vec<u8> {
        namespace_prefix_str(version).into_bytes()
    }
}

fn namespace_prefix_str(version: &str) -> String {
    format!("{}:{}:{}:", KEY_PREFIX, version, EXPRESSION_SEGMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_format() {
        let key = SubjectActionKey::new("1", 7, 3);
        assert_eq!(key.encode(), b"warrant:1:expr:7:3".to_vec());
    }

    #[test]
    fn test_versions_do_not_collide() {
        let v1 = SubjectActionKey::new("1", 7, 3);
        let v2 = SubjectActionKey::new("2", 7, 3);
        assert_ne!(v1.encode(), v2.encode());
        assert!(v1.encode().starts_with(&SubjectActionKey::namespace_prefix("1")));
        assert!(!v2.encode().starts_with(&SubjectActionKey::namespace_prefix("1")));
    }

    #[test]
    fn test_decode_rejects_foreign_keys() {
        assert!(SubjectActionKey::decode(b"warrant:1:lock:subject_action:7:3").is_none());
        assert!(SubjectActionKey::decode(b"warrant:1:expr:7").is_none());
        assert!(SubjectActionKey::decode(b"warrant:1:expr:7:3:9").is_none());
        assert!(SubjectActionKey::decode(b"other:1:expr:7:3").is_none());
        assert!(SubjectActionKey::decode(&[0xff, 0xfe]).is_none());
    }

    proptest! {
        #[test]
        fn prop_encode_decode(version in "[a-z0-9]{1,4}", s in any::<i64>(), a in any::<i64>()) {
            let key = SubjectActionKey::new(version, s, a);
            prop_assert_eq!(SubjectActionKey::decode(&key.encode()), Some(key));
        }
    }
}
