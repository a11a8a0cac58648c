use std::collections::HashMap;

/// Forest of nested execution contexts, used to attribute unlabeled records
/// to the nearest labeled ancestor.
///
/// Positive resolutions are cached for every context on the walked path, so
/// repeated lookups under the same sub-task are amortized O(1). Contexts with
/// no labeled ancestor fall back to the most recently labeled context and are
/// not cached, since a label may still show up for them later.
#[derive(Debug, Default)]
pub struct Ancestry {
    parent: HashMap<String, String>,
    label: HashMap<String, String>,
    nearest: HashMap<String, String>,
    last_labeled: Option<String>,
}

impl Ancestry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a context and its ancestry (`parent_ids` runs from the root to
    /// the immediate parent). A `label` marks the context as a sub-task.
    pub fn observe(&mut self, run_id: &str, parent_ids: &[String], label: Option<&str>) {
        for pair in parent_ids.windows(2) {
            self.link(&pair[1], &pair[0]);
        }
        if let Some(parent) = parent_ids.last() {
            self.link(run_id, parent);
        }

        if let Some(label) = label.filter(|l| !l.is_empty()) {
            if !run_id.is_empty() {
                self.label.insert(run_id.to_string(), label.to_string());
            }
            self.last_labeled = Some(label.to_string());
        }
    }

    fn link(&mut self, child: &str, parent: &str) {
        if child.is_empty() || parent.is_empty() || child == parent {
            return;
        }
        self.parent
            .entry(child.to_string())
            .or_insert_with(|| parent.to_string());
    }

    /// Nearest labeled context at or above `run_id`.
    pub fn resolve(&mut self, run_id: &str) -> Option<String> {
        if let Some(found) = self.lookup(run_id) {
            return Some(found);
        }

        let mut path = vec![run_id.to_string()];
        let mut current = self.parent.get(run_id).cloned();
        let mut found = None;

        while let Some(ctx) = current {
            if let Some(hit) = self.lookup(&ctx) {
                found = Some(hit);
                break;
            }
            // Guard against malformed cycles in reported ancestry.
            if path.contains(&ctx) {
                break;
            }
            current = self.parent.get(&ctx).cloned();
            path.push(ctx);
        }

        match found {
            Some(label) => {
                for ctx in path {
                    self.nearest.insert(ctx, label.clone());
                }
                Some(label)
            }
            None => self.last_labeled.clone(),
        }
    }

    fn lookup(&self, run_id: &str) -> Option<String> {
        self.label
            .get(run_id)
            .or_else(|| self.nearest.get(run_id))
            .cloned()
    }

    pub fn last_labeled(&self) -> Option<&str> {
        self.last_labeled.as_deref()
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty() && self.label.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn own_label_wins() {
        let mut a = Ancestry::new();
        a.observe("n1", &ids(&["root"]), Some("alpha"));
        assert_eq!(a.resolve("n1").as_deref(), Some("alpha"));
    }

    #[test]
    fn walks_up_to_labeled_ancestor() {
        let mut a = Ancestry::new();
        a.observe("root", &[], None);
        a.observe("node", &ids(&["root"]), Some("alpha"));
        a.observe("chain", &ids(&["root", "node"]), None);
        a.observe("llm", &ids(&["root", "node", "chain"]), None);

        assert_eq!(a.resolve("llm").as_deref(), Some("alpha"));
        // Path is now cached.
        assert_eq!(a.lookup("chain").as_deref(), Some("alpha"));
    }

    #[test]
    fn parent_chain_alone_is_enough() {
        // The intermediate context never sent its own record.
        let mut a = Ancestry::new();
        a.observe("node", &ids(&["root"]), Some("beta"));
        a.observe("llm", &ids(&["root", "node", "hidden"]), None);
        assert_eq!(a.resolve("llm").as_deref(), Some("beta"));
    }

    #[test]
    fn falls_back_to_last_labeled() {
        let mut a = Ancestry::new();
        a.observe("a", &ids(&["root"]), Some("alpha"));
        a.observe("b", &ids(&["root"]), Some("beta"));
        a.observe("orphan", &ids(&["elsewhere"]), None);
        assert_eq!(a.resolve("orphan").as_deref(), Some("beta"));
        assert_eq!(a.last_labeled(), Some("beta"));
    }

    #[test]
    fn nothing_labeled_resolves_to_none() {
        let mut a = Ancestry::new();
        a.observe("x", &ids(&["root"]), None);
        assert_eq!(a.resolve("x"), None);
        assert_eq!(a.resolve("unknown"), None);
    }

    #[test]
    fn concurrent_siblings_resolve_independently() {
        let mut a = Ancestry::new();
        a.observe("A", &ids(&["root"]), Some("A"));
        a.observe("B", &ids(&["root"]), Some("B"));
        a.observe("a-llm", &ids(&["root", "A"]), None);
        a.observe("b-llm", &ids(&["root", "B"]), None);

        assert_eq!(a.resolve("a-llm").as_deref(), Some("A"));
        assert_eq!(a.resolve("b-llm").as_deref(), Some("B"));
        assert_eq!(a.resolve("a-llm").as_deref(), Some("A"));
    }

    #[test]
    fn cyclic_ancestry_terminates() {
        let mut a = Ancestry::new();
        a.observe("x", &ids(&["y"]), None);
        a.observe("y", &ids(&["x"]), None);
        assert_eq!(a.resolve("x"), None);
    }
}
