use std::collections::HashMap;

/// Classifier label, display name, diagram path.
const TOOL_LABELS: &[(&str, &str, &str)] = &[
    ("1-2", "Tool 1-2", "./mouth-diagrams/1-2.png"),
    ("7-8", "Tool 7-8", "./mouth-diagrams/7-8.png"),
    ("9-10", "Tool 9-10", "./mouth-diagrams/9-10.png"),
    ("11-12", "Tool 11-12", "./mouth-diagrams/11-12.png"),
    ("13-14", "Tool 13-14", "./mouth-diagrams/13-14.png"),
    ("17-18", "Tool 17-18", "./mouth-diagrams/17-18.png"),
    ("00-no", "No Tool", "./mouth-diagrams/00-no.png"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    /// Classifier output label this entry answers to
    pub key: String,
    /// Human-readable name shown for the label
    pub display_name: String,
    /// Path of the illustrative diagram for the label
    pub diagram: String,
}

/// Immutable lookup from classifier label to display entry.
///
/// Labels missing from the registry are not an error here; the
/// classification loop decides how to present them.
#[derive(Debug, Clone)]
pub struct LabelRegistry {
    entries: HashMap<String, LabelEntry>,
}

impl LabelRegistry {
    /// Registry holding the built-in tool table.
    pub fn tools() -> Self {
        Self::from_entries(TOOL_LABELS.iter().map(|(key, name, diagram)| LabelEntry {
            key: key.to_string(),
            display_name: name.to_string(),
            diagram: diagram.to_string(),
        }))
    }

    pub fn from_entries<I: IntoIterator<Item = LabelEntry>>(entries: I) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, label: &str) -> Option<&LabelEntry> {
        self.entries.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered labels, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Labels from `labels` that have no entry, in input order.
    pub fn unregistered<'a>(&self, labels: &'a [String]) -> Vec<&'a str> {
        labels
            .iter()
            .map(String::as_str)
            .filter(|label| !self.contains(label))
            .collect()
    }
}

impl Default for LabelRegistry {
    fn default() -> Self {
        Self::tools()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_table_is_fully_populated() {
        let registry = LabelRegistry::tools();
        assert_eq!(registry.len(), 7);

        let entry = registry.lookup("1-2").unwrap();
        assert_eq!(entry.display_name, "Tool 1-2");
        assert_eq!(entry.diagram, "./mouth-diagrams/1-2.png");

        let none = registry.lookup("00-no").unwrap();
        assert_eq!(none.display_name, "No Tool");
    }

    #[test]
    fn every_entry_has_a_distinct_diagram() {
        let registry = LabelRegistry::tools();
        let mut diagrams: Vec<&str> = registry
            .keys()
            .into_iter()
            .filter_map(|key| registry.lookup(key))
            .map(|entry| entry.diagram.as_str())
            .collect();
        diagrams.sort_unstable();
        diagrams.dedup();
        assert_eq!(diagrams.len(), registry.len());
    }

    #[test]
    fn unknown_labels_are_absent() {
        let registry = LabelRegistry::tools();
        assert!(registry.lookup("unknown-x").is_none());
        assert!(registry.lookup("").is_none());
        // Keys are exact matches
        assert!(registry.lookup("Tool 1-2").is_none());
    }

    #[test]
    fn unregistered_keeps_input_order() {
        let registry = LabelRegistry::tools();
        let labels = vec![
            "zeta".to_string(),
            "1-2".to_string(),
            "alpha".to_string(),
        ];
        assert_eq!(registry.unregistered(&labels), vec!["zeta", "alpha"]);
    }
}
