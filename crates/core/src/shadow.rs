//! Shadow documents: the per-node (desire, report) pair and the merge/diff
//! algorithms of the reconciliation protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::AppInfo;

/// A semi-structured sync document shared with the edge agent.
///
/// The well-known keys are typed; anything else (telemetry, future additions)
/// rides in the flattened `ext` bag and never participates in diffs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sysapps: Vec<AppInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_props: BTreeMap<String, String>,
    #[serde(flatten)]
    pub ext: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
            && self.sysapps.is_empty()
            && self.node_props.is_empty()
            && self.ext.is_empty()
    }

    /// Merge `new` into `self`.
    ///
    /// App lists are upserted by name: entries in `new` replace same-named
    /// existing entries in place, new names are appended, and names the most
    /// recent partial document didn't mention are kept. Every other key is a
    /// plain overwrite when present in `new`.
    pub fn merge(&mut self, new: &Document) {
        upsert_by_name(&mut self.apps, &new.apps);
        upsert_by_name(&mut self.sysapps, &new.sysapps);
        if !new.node_props.is_empty() {
            self.node_props = new.node_props.clone();
        }
        for (k, v) in &new.ext {
            self.ext.insert(k.clone(), v.clone());
        }
    }

    /// Compute the delta a node must still converge to: every desired app
    /// entry whose exact {name, version} the report does not confirm, plus
    /// the non-app desire fields passed through unconditionally.
    pub fn diff(&self, report: &Document) -> Document {
        Document {
            apps: missing_from(&self.apps, &report.apps),
            sysapps: missing_from(&self.sysapps, &report.sysapps),
            node_props: self.node_props.clone(),
            ext: self.ext.clone(),
        }
    }

    /// The subset of a report that participates in desire diffs: apps,
    /// sysapps, and node properties. Telemetry and other extension keys are
    /// excluded.
    pub fn comparable(&self) -> Document {
        Document {
            apps: self.apps.clone(),
            sysapps: self.sysapps.clone(),
            node_props: self.node_props.clone(),
            ext: serde_json::Map::new(),
        }
    }

    /// Insert-or-replace a single app entry in the proper list.
    pub fn upsert_app(&mut self, info: AppInfo, system: bool) {
        let list = if system { &mut self.sysapps } else { &mut self.apps };
        match list.iter_mut().find(|a| a.name == info.name) {
            Some(slot) => *slot = info,
            None => list.push(info),
        }
    }

    /// Remove a single app entry by name from both lists.
    pub fn remove_app(&mut self, name: &str) {
        self.apps.retain(|a| a.name != name);
        self.sysapps.retain(|a| a.name != name);
    }
}

fn upsert_by_name(existing: &mut Vec<AppInfo>, new: &[AppInfo]) {
    for n in new {
        match existing.iter_mut().find(|e| e.name == n.name) {
            Some(slot) => *slot = n.clone(),
            None => existing.push(n.clone()),
        }
    }
}

fn missing_from(desired: &[AppInfo], reported: &[AppInfo]) -> Vec<AppInfo> {
    desired
        .iter()
        .filter(|d| !reported.iter().any(|r| r.name == d.name && r.version == d.version))
        .cloned()
        .collect()
}

/// The (desire, report) pair for one node, same identity as the node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Shadow {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub desire: Document,
    #[serde(default)]
    pub report: Document,
}

impl Shadow {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            desire: Document::default(),
            report: Document::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(apps: &[(&str, &str)], sysapps: &[(&str, &str)]) -> Document {
        Document {
            apps: apps.iter().map(|(n, v)| AppInfo::new(*n, *v)).collect(),
            sysapps: sysapps.iter().map(|(n, v)| AppInfo::new(*n, *v)).collect(),
            ..Default::default()
        }
    }

    fn names(list: &[AppInfo]) -> Vec<&str> {
        list.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn merge_unions_disjoint_app_names() {
        let mut r1 = doc(&[("a", "1")], &[]);
        let r2 = doc(&[("b", "2")], &[]);
        r1.merge(&r2);
        assert_eq!(names(&r1.apps), vec!["a", "b"]);
    }

    #[test]
    fn merge_adopts_new_version_without_duplicating() {
        let mut r1 = doc(&[("a", "1"), ("b", "1")], &[]);
        let r2 = doc(&[("b", "7")], &[]);
        r1.merge(&r2);
        assert_eq!(r1.apps.len(), 2);
        assert_eq!(r1.apps[1], AppInfo::new("b", "7"));
    }

    #[test]
    fn merge_keeps_entries_a_partial_report_omits() {
        let mut report = doc(&[("a", "1"), ("b", "1")], &[("core", "1")]);
        // Most recent partial report only mentions "a".
        report.merge(&doc(&[("a", "2")], &[]));
        assert_eq!(names(&report.apps), vec!["a", "b"]);
        assert_eq!(report.apps[0].version, "2");
        assert_eq!(names(&report.sysapps), vec!["core"]);
    }

    #[test]
    fn merge_overwrites_non_app_keys() {
        let mut d = Document::default();
        d.node_props.insert("k".into(), "old".into());
        d.ext.insert("telemetry".into(), serde_json::json!({"cpu": 1}));
        let mut new = Document::default();
        new.node_props.insert("k".into(), "new".into());
        new.ext.insert("telemetry".into(), serde_json::json!({"cpu": 2}));
        d.merge(&new);
        assert_eq!(d.node_props["k"], "new");
        assert_eq!(d.ext["telemetry"]["cpu"], 2);
    }

    #[test]
    fn diff_is_empty_when_report_matches_desire() {
        let desire = doc(&[("a", "1")], &[("core", "2")]);
        let report = doc(&[("a", "1")], &[("core", "2")]);
        let delta = desire.diff(&report);
        assert!(delta.apps.is_empty());
        assert!(delta.sysapps.is_empty());
    }

    #[test]
    fn diff_includes_version_mismatch_and_absence() {
        let desire = doc(&[("a", "2"), ("b", "1")], &[]);
        let report = doc(&[("a", "1")], &[]);
        let delta = desire.diff(&report);
        assert_eq!(names(&delta.apps), vec!["a", "b"]);
    }

    #[test]
    fn diff_passes_node_props_through() {
        let mut desire = doc(&[], &[]);
        desire.node_props.insert("role".into(), "gateway".into());
        let delta = desire.diff(&Document::default());
        assert_eq!(delta.node_props["role"], "gateway");
    }

    #[test]
    fn comparable_drops_extension_keys() {
        let mut report = doc(&[("a", "1")], &[]);
        report.ext.insert("telemetry".into(), serde_json::json!({"mem": 42}));
        let cmp = report.comparable();
        assert_eq!(names(&cmp.apps), vec!["a"]);
        assert!(cmp.ext.is_empty());
    }

    #[test]
    fn upsert_and_remove_edit_single_entries() {
        let mut d = doc(&[("a", "1")], &[("core", "1")]);
        d.upsert_app(AppInfo::new("a", "9"), false);
        d.upsert_app(AppInfo::new("agent", "1"), true);
        assert_eq!(d.apps, vec![AppInfo::new("a", "9")]);
        assert_eq!(names(&d.sysapps), vec!["core", "agent"]);
        d.remove_app("core");
        assert_eq!(names(&d.sysapps), vec!["agent"]);
    }

    #[test]
    fn unknown_json_keys_round_trip_through_ext() {
        let raw = serde_json::json!({
            "apps": [{"name": "a", "version": "1"}],
            "telemetry": {"cpu": 0.5}
        });
        let d: Document = serde_json::from_value(raw).unwrap();
        assert_eq!(d.apps.len(), 1);
        assert_eq!(d.ext["telemetry"]["cpu"], 0.5);
        let back = serde_json::to_value(&d).unwrap();
        assert!(back.get("telemetry").is_some());
    }
}
