use std::collections::BTreeMap;
use std::collections::HashSet;

use serde_json::Value;

use crate::space::{AddressSpace, Error, Flags};

/// Name of the canonical operand property set by processor plugins: the
/// operand's [`OpType`](crate::insn::OpType) as a JSON number, controlling
/// how the operand is rendered.
pub const PROP_TYPE: &str = "type";

/// A label is either a user-supplied string or an auto marker whose string
/// is generated on demand from the address and the current flag class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Auto,
    User(String),
}

impl AddressSpace {
    fn default_label_prefix(&self, ea: u64) -> Result<&'static str, Error> {
        let fl = self.get_flags(ea)?;
        Ok(if fl == Flags::CODE {
            "loc_"
        } else if fl.contains(Flags::DATA) {
            "dat_"
        } else {
            "unk_"
        })
    }

    /// The auto-label string for `ea`: `loc_`/`dat_`/`unk_` by unit type,
    /// followed by the zero-padded hex address.
    #[must_use]
    pub fn get_default_label(&self, ea: u64) -> String {
        let prefix = self.default_label_prefix(ea).unwrap_or("unk_");
        format!("{prefix}{ea:08x}")
    }

    /// Store a default-style label at `ea` unless one already exists. The
    /// prefix defaults by unit type; the stored string never changes
    /// afterwards (unlike [`make_auto_label`](Self::make_auto_label)).
    pub fn make_label(&mut self, prefix: Option<&str>, ea: u64) -> Result<(), Error> {
        if self.labels.contains_key(&ea) {
            return Ok(());
        }
        let prefix = match prefix {
            Some(p) => p,
            None => self.default_label_prefix(ea)?,
        };
        self.labels.insert(ea, Label::User(format!("{prefix}{ea:08x}")));
        Ok(())
    }

    /// Store the auto marker at `ea` unless a label already exists; the
    /// rendered prefix tracks the unit type at the address.
    pub fn make_auto_label(&mut self, ea: u64) {
        self.labels.entry(ea).or_insert(Label::Auto);
    }

    /// Materialize the label string at `ea`, if any.
    #[must_use]
    pub fn get_label(&self, ea: u64) -> Option<String> {
        match self.labels.get(&ea)? {
            Label::Auto => Some(self.get_default_label(ea)),
            Label::User(s) => Some(s.clone()),
        }
    }

    #[must_use]
    pub fn has_label(&self, ea: u64) -> bool {
        self.labels.contains_key(&ea)
    }

    /// Force-replace the label at `ea`. Does not check for collisions; use
    /// [`make_unique_label`](Self::make_unique_label) for that.
    pub fn set_label(&mut self, ea: u64, label: impl Into<String>) {
        self.labels.insert(ea, Label::User(label.into()));
    }

    /// Store `base` at `ea`, suffixed `_1`, `_2`, … until the result is
    /// absent from the set of all label strings; returns the chosen string.
    pub fn make_unique_label(&mut self, ea: u64, base: &str) -> String {
        let existing = self.label_set();
        let mut cnt = 0usize;
        loop {
            let label = if cnt == 0 {
                base.to_string()
            } else {
                format!("{base}_{cnt}")
            };
            if !existing.contains(&label) {
                self.labels.insert(ea, Label::User(label.clone()));
                return label;
            }
            cnt += 1;
        }
    }

    /// All label strings, materialized and sorted.
    #[must_use]
    pub fn get_label_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self
            .labels
            .iter()
            .map(|(ea, l)| self.materialize(*ea, l))
            .collect();
        list.sort();
        list
    }

    fn label_set(&self) -> HashSet<String> {
        self.labels
            .iter()
            .map(|(ea, l)| self.materialize(*ea, l))
            .collect()
    }

    fn materialize(&self, ea: u64, label: &Label) -> String {
        match label {
            Label::Auto => self.get_default_label(ea),
            Label::User(s) => s.clone(),
        }
    }

    #[must_use]
    pub fn label_exists(&self, label: &str) -> bool {
        self.labels
            .iter()
            .any(|(ea, l)| self.materialize(*ea, l) == label)
    }

    /// Reverse lookup across both user strings and materialized auto-labels.
    #[must_use]
    pub fn resolve_label(&self, label: &str) -> Option<u64> {
        self.labels
            .iter()
            .find(|(ea, l)| self.materialize(**ea, l) == label)
            .map(|(ea, _)| *ea)
    }

    #[must_use]
    pub fn get_comment(&self, ea: u64) -> Option<&str> {
        self.comments.get(&ea).map(String::as_str)
    }

    pub fn set_comment(&mut self, ea: u64, comment: impl Into<String>) {
        self.comments.insert(ea, comment.into());
    }

    /// Record a cross-reference edge; at most one edge per (source, target),
    /// a repeated add replaces the tag.
    pub fn add_xref(&mut self, from_ea: u64, to_ea: u64, tag: impl Into<String>) {
        self.xrefs
            .entry(to_ea)
            .or_default()
            .insert(from_ea, tag.into());
    }

    /// Remove the edge `(from_ea, to_ea)`; the recorded tag must match.
    pub fn del_xref(&mut self, from_ea: u64, to_ea: u64, tag: &str) {
        if let Some(sources) = self.xrefs.get_mut(&to_ea) {
            let old = sources.remove(&from_ea);
            assert_eq!(
                old.as_deref(),
                Some(tag),
                "xref 0x{from_ea:08x} -> 0x{to_ea:08x} tag mismatch"
            );
        }
    }

    /// Source → tag mapping for all xrefs anchored at `ea`.
    #[must_use]
    pub fn get_xrefs(&self, ea: u64) -> Option<&BTreeMap<u64, String>> {
        self.xrefs.get(&ea)
    }

    pub fn set_arg_prop(&mut self, ea: u64, arg_no: u32, prop: impl Into<String>, val: Value) {
        self.arg_props
            .entry(ea)
            .or_default()
            .entry(arg_no)
            .or_default()
            .insert(prop.into(), val);
    }

    #[must_use]
    pub fn get_arg_prop(&self, ea: u64, arg_no: u32, prop: &str) -> Option<&Value> {
        self.arg_props.get(&ea)?.get(&arg_no)?.get(prop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::AreaProps;

    fn space_with_area() -> AddressSpace {
        let mut space = AddressSpace::new();
        space.add_area(0x1000, 0x1fff, AreaProps::default());
        space
    }

    #[test]
    fn auto_label_tracks_unit_type() {
        let mut space = space_with_area();
        space.make_code(0x1234, 1).unwrap();
        space.make_auto_label(0x1234);
        assert_eq!(space.get_label(0x1234).unwrap(), "loc_00001234");

        space.make_undefined(0x1234, 1).unwrap();
        space.make_data(0x1234, 1).unwrap();
        assert_eq!(space.get_label(0x1234).unwrap(), "dat_00001234");
        assert_eq!(space.resolve_label("dat_00001234"), Some(0x1234));
        assert_eq!(space.resolve_label("loc_00001234"), None);
    }

    #[test]
    fn make_label_is_idempotent_set_label_is_not() {
        let mut space = space_with_area();
        space.make_label(None, 0x1100).unwrap();
        assert_eq!(space.get_label(0x1100).unwrap(), "unk_00001100");
        // An existing label wins over a later make_label.
        space.make_label(Some("loc_"), 0x1100).unwrap();
        assert_eq!(space.get_label(0x1100).unwrap(), "unk_00001100");

        space.set_label(0x1100, "entry");
        assert_eq!(space.get_label(0x1100).unwrap(), "entry");
        assert_eq!(space.resolve_label("entry"), Some(0x1100));
    }

    #[test]
    fn unique_labels_are_suffixed() {
        let mut space = space_with_area();
        space.set_label(0x1000, "foo");
        assert_eq!(space.make_unique_label(0x1001, "foo"), "foo_1");
        assert_eq!(space.make_unique_label(0x1002, "foo"), "foo_2");
        assert_eq!(space.make_unique_label(0x1003, "bar"), "bar");
        assert!(space.label_exists("foo_2"));
        assert_eq!(
            space.get_label_list(),
            vec!["bar", "foo", "foo_1", "foo_2"]
        );
    }

    #[test]
    fn xref_edges() {
        let mut space = space_with_area();
        space.add_xref(0x1000, 0x1008, "c");
        space.add_xref(0x1004, 0x1008, "j");
        let xrefs = space.get_xrefs(0x1008).unwrap();
        assert_eq!(xrefs.get(&0x1000).map(String::as_str), Some("c"));
        assert_eq!(xrefs.get(&0x1004).map(String::as_str), Some("j"));

        space.del_xref(0x1000, 0x1008, "c");
        assert!(!space.get_xrefs(0x1008).unwrap().contains_key(&0x1000));
        // Absent target is a no-op.
        space.del_xref(0x1000, 0x2000, "c");
    }

    #[test]
    #[should_panic(expected = "tag mismatch")]
    fn del_xref_checks_tag() {
        let mut space = space_with_area();
        space.add_xref(0x1000, 0x1008, "c");
        space.del_xref(0x1000, 0x1008, "j");
    }

    #[test]
    fn arg_props() {
        let mut space = space_with_area();
        assert_eq!(space.get_arg_prop(0x1000, 0, PROP_TYPE), None);
        space.set_arg_prop(0x1000, 0, PROP_TYPE, Value::from(2));
        space.set_arg_prop(0x1000, 1, "base", Value::from(16));
        assert_eq!(
            space.get_arg_prop(0x1000, 0, PROP_TYPE),
            Some(&Value::from(2))
        );
        assert_eq!(space.get_arg_prop(0x1000, 0, "base"), None);
        assert_eq!(
            space.get_arg_prop(0x1000, 1, "base"),
            Some(&Value::from(16))
        );
    }

    #[test]
    fn comments() {
        let mut space = space_with_area();
        assert_eq!(space.get_comment(0x1000), None);
        space.set_comment(0x1000, "reset vector");
        assert_eq!(space.get_comment(0x1000), Some("reset vector"));
    }
}
