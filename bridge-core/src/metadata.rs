//! The Metadata Bag (§3, §4.1): a mutable, case-insensitive multimap from
//! header name to an ordered list of string values. Two canonical slots
//! exist per call (request-header, response-header) plus trailers; all
//! three are instances of this same type.
//!
//! Binary-suffixed keys (`-bin`) are carried verbatim — this bag never
//! base64-encodes or decodes a value on their behalf (§4.1, §6 Wire
//! Mapping). That transcoding, if any is needed, belongs to whatever sits
//! above the bridge on the JS side.

use tonic::metadata::{AsciiMetadataValue, BinaryMetadataValue, MetadataMap};

/// Mutable, case-insensitive, order-preserving multimap of header values.
#[derive(Debug, Clone, Default)]
pub struct MetadataBag {
    // Keys are stored lowercased; the first insertion of a key fixes its
    // position in iteration order, matching §3's "insertion order is
    // preserved across forEach".
    entries: Vec<(String, Vec<String>)>,
}

impl MetadataBag {
    /// `grpc.metadata.create()`.
    pub fn create() -> Self {
        MetadataBag::default()
    }

    fn find(&self, name: &str) -> Option<usize> {
        let key = name.to_ascii_lowercase();
        self.entries.iter().position(|(k, _)| *k == key)
    }

    /// First value for `name`, or `None` if absent (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.find(name)
            .and_then(|i| self.entries[i].1.first())
            .map(String::as_str)
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.find(name)
            .map(|i| self.entries[i].1.clone())
            .unwrap_or_default()
    }

    /// Replace all values for `name` with a single value, inserting it if
    /// absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let key = name.to_ascii_lowercase();
        match self.find(name) {
            Some(i) => self.entries[i].1 = vec![value.into()],
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    /// Append a value for `name` without disturbing existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let key = name.to_ascii_lowercase();
        match self.find(name) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    /// Remove every value stored under `name` (case-insensitive). No-op if
    /// absent (P2: `bag.delete(lower(k))` removes the entry set under k).
    pub fn delete(&mut self, name: &str) {
        if let Some(i) = self.find(name) {
            self.entries.remove(i);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Distinct keys in first-insertion order, lowercased.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Invoke `cb(value, key)` for every `(key, value)` pair, in insertion
    /// order, firing once per value for multi-valued keys.
    pub fn for_each(&self, mut cb: impl FnMut(&str, &str)) {
        for (key, values) in &self.entries {
            for value in values {
                cb(key, value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, v)| v.is_empty())
    }

    /// Merge another bag's entries into this one, append-style. Used for
    /// `call.setTrailer(md)` (§4.4 step 5: "merges into the trailer bag").
    pub fn merge(&mut self, other: &MetadataBag) {
        other.for_each(|key, value| self.append(key, value.to_string()));
    }

    /// Copy into transport-owned form at send time (§4.1 "Conversion
    /// contracts"). `-bin` keys are mapped through tonic's binary value
    /// type without any base64 pass; ASCII keys through the ascii type.
    pub fn to_tonic(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        self.for_each(|key, value| {
            if key.ends_with("-bin") {
                if let Ok(tonic_key) = tonic::metadata::BinaryMetadataKey::from_bytes(key.as_bytes()) {
                    let val = BinaryMetadataValue::from_bytes(value.as_bytes());
                    map.append_bin(tonic_key, val);
                }
            } else if let Ok(val) = value.parse::<AsciiMetadataValue>() {
                if let Ok(tonic_key) = tonic::metadata::AsciiMetadataKey::from_bytes(key.as_bytes()) {
                    map.append(tonic_key, val);
                }
            }
        });
        map
    }

    /// Snapshot transport-delivered metadata into an owned bag (§5
    /// "Cross-thread boundary": metadata is snapshotted before it becomes
    /// visible to JS).
    pub fn from_tonic(map: &MetadataMap) -> Self {
        let mut bag = MetadataBag::create();
        for kv in map.iter() {
            match kv {
                tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                    if let Ok(s) = value.to_str() {
                        bag.append(key.as_str(), s.to_string());
                    }
                }
                tonic::metadata::KeyAndValueRef::Binary(key, value) => {
                    if let Ok(bytes) = value.to_bytes() {
                        if let Ok(s) = String::from_utf8(bytes.to_vec()) {
                            bag.append(key.as_str(), s);
                        }
                    }
                }
            }
        }
        bag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2_case_insensitive_set_get() {
        let mut bag = MetadataBag::create();
        bag.set("X-Auth", "valid-token");
        assert_eq!(bag.get("x-auth"), Some("valid-token"));
        assert_eq!(bag.get("X-AUTH"), Some("valid-token"));
    }

    #[test]
    fn p2_delete_removes_entry_set_under_different_case() {
        let mut bag = MetadataBag::create();
        bag.set("X-Auth", "valid-token");
        bag.delete("x-auth");
        assert!(!bag.has("X-Auth"));
        assert_eq!(bag.get("x-auth"), None);
    }

    #[test]
    fn append_preserves_multiple_values_in_order() {
        let mut bag = MetadataBag::create();
        bag.append("x-tag", "one".to_string());
        bag.append("x-tag", "two".to_string());
        assert_eq!(bag.get_all("x-tag"), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn set_replaces_all_existing_values() {
        let mut bag = MetadataBag::create();
        bag.append("x-tag", "one".to_string());
        bag.append("x-tag", "two".to_string());
        bag.set("x-tag", "three");
        assert_eq!(bag.get_all("x-tag"), vec!["three".to_string()]);
    }

    #[test]
    fn for_each_preserves_insertion_order() {
        let mut bag = MetadataBag::create();
        bag.set("x-beta", "2");
        bag.set("x-alpha", "1");
        let mut seen = Vec::new();
        bag.for_each(|k, v| seen.push((k.to_string(), v.to_string())));
        assert_eq!(
            seen,
            vec![
                ("x-beta".to_string(), "2".to_string()),
                ("x-alpha".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn binary_suffixed_values_round_trip_without_base64() {
        let mut bag = MetadataBag::create();
        bag.set("x-data-bin", "rawbytes");
        let tonic_map = bag.to_tonic();
        let back = MetadataBag::from_tonic(&tonic_map);
        assert_eq!(back.get("x-data-bin"), Some("rawbytes"));
    }

    #[test]
    fn merge_appends_rather_than_replaces() {
        let mut a = MetadataBag::create();
        a.set("x-existing", "base");
        let mut b = MetadataBag::create();
        b.set("x-existing", "extra");
        a.merge(&b);
        assert_eq!(a.get_all("x-existing"), vec!["base".to_string(), "extra".to_string()]);
    }

    #[test]
    fn keys_lists_distinct_names_in_insertion_order() {
        let mut bag = MetadataBag::create();
        bag.set("x-first", "1");
        bag.append("x-first", "1b".to_string());
        bag.set("x-second", "2");
        assert_eq!(bag.keys(), vec!["x-first".to_string(), "x-second".to_string()]);
    }
}
