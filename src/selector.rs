//! Instance selection policy for grouping descriptors.
//!
//! Selection is a pure function over an ordered list of named instances:
//! the output is always an order-preserving subsequence of the input.
//! Every name comparison folds ASCII case only.

use serde::{Deserialize, Serialize};

/// Name of the aggregate instance every counter category exposes.
pub const TOTAL_INSTANCE: &str = "_Total";

/// Which subset of the enumerated instances a descriptor targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorMode {
    /// First instance only
    Single,
    /// Every instance
    #[default]
    Each,
    /// 1-based position taken from the selector value
    Index,
    /// Case-insensitive exact name match against the selector value
    Name,
    /// The aggregate `_Total` instance
    Total,
    /// Every instance whose name contains none of the exclusions
    Except,
    /// Anything this agent does not know about; behaves like `Each`
    #[serde(other)]
    Unknown,
}

/// Mode plus its optional arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub mode: SelectorMode,
    /// Only meaningful for `Index` and `Name`
    #[serde(default)]
    pub value: Option<String>,
    /// Only applied in `Except` mode
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl Selector {
    pub fn new(mode: SelectorMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_exclusions<I, S>(mut self, exclusions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions = exclusions.into_iter().map(Into::into).collect();
        self
    }

    /// Filters `items`, using `name_of` to read each instance name.
    pub fn apply<T, F>(&self, items: Vec<T>, name_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        match self.mode {
            SelectorMode::Single => items.into_iter().take(1).collect(),
            SelectorMode::Each | SelectorMode::Unknown => items,
            SelectorMode::Index => {
                let position = self
                    .value
                    .as_deref()
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .filter(|i| *i >= 1);
                match position {
                    Some(i) => items.into_iter().skip(i - 1).take(1).collect(),
                    None => Vec::new(),
                }
            }
            SelectorMode::Name => match self.value.as_deref() {
                Some(wanted) => items
                    .into_iter()
                    .filter(|item| name_of(item).eq_ignore_ascii_case(wanted))
                    .collect(),
                None => Vec::new(),
            },
            SelectorMode::Total => items
                .into_iter()
                .filter(|item| name_of(item).eq_ignore_ascii_case(TOTAL_INSTANCE))
                .collect(),
            SelectorMode::Except => {
                let excluded: Vec<String> =
                    self.exclusions.iter().map(|e| e.to_ascii_lowercase()).collect();
                items
                    .into_iter()
                    .filter(|item| {
                        let name = name_of(item).to_ascii_lowercase();
                        !excluded.iter().any(|e| name.contains(e.as_str()))
                    })
                    .collect()
            }
        }
    }

    /// Convenience for plain name lists.
    pub fn apply_names(&self, names: &[String]) -> Vec<String> {
        self.apply(names.to_vec(), |n| n.as_str())
    }
}

/// Keeps only instances whose name equals `scalar` exactly.
pub fn restrict_to<T, F>(items: Vec<T>, scalar: &str, name_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    items.into_iter().filter(|item| name_of(item) == scalar).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn is_subsequence(sub: &[String], full: &[String]) -> bool {
        let mut it = full.iter();
        sub.iter().all(|s| it.any(|f| f == s))
    }

    #[test]
    fn every_mode_returns_order_preserving_subsequence() {
        let input = names(&["sda", "_Total", "nvme0n1", "loop0", "SDB"]);
        let selectors = [
            Selector::new(SelectorMode::Single),
            Selector::new(SelectorMode::Each),
            Selector::new(SelectorMode::Index).with_value("3"),
            Selector::new(SelectorMode::Name).with_value("sdb"),
            Selector::new(SelectorMode::Total),
            Selector::new(SelectorMode::Except).with_exclusions(["loop", "_total"]),
            Selector::new(SelectorMode::Unknown),
        ];

        for selector in &selectors {
            let out = selector.apply_names(&input);
            assert!(out.len() <= input.len(), "{:?}", selector.mode);
            assert!(is_subsequence(&out, &input), "{:?}", selector.mode);
        }
    }

    #[test]
    fn index_is_one_based_and_bounded() {
        let input = names(&["a", "b", "c"]);
        for i in 1..=3 {
            let out = Selector::new(SelectorMode::Index)
                .with_value(i.to_string())
                .apply_names(&input);
            assert_eq!(out, vec![input[i - 1].clone()]);
        }
        for bad in ["0", "4", "-1", "x"] {
            let out = Selector::new(SelectorMode::Index)
                .with_value(bad)
                .apply_names(&input);
            assert!(out.is_empty(), "index {bad}");
        }
        assert!(Selector::new(SelectorMode::Index).apply_names(&input).is_empty());
    }

    #[test]
    fn except_drops_total_case_insensitively() {
        let out = Selector::new(SelectorMode::Except)
            .with_exclusions(["_total"])
            .apply_names(&names(&["Disk0", "_Total"]));
        assert_eq!(out, names(&["Disk0"]));
    }

    #[test]
    fn name_and_total_ignore_case() {
        let input = names(&["eth0", "ETH1", "_TOTAL"]);
        assert_eq!(
            Selector::new(SelectorMode::Name).with_value("eth1").apply_names(&input),
            names(&["ETH1"])
        );
        assert_eq!(
            Selector::new(SelectorMode::Total).apply_names(&input),
            names(&["_TOTAL"])
        );
    }

    #[test]
    fn name_and_except_fold_case_the_same_way() {
        let input = names(&["ÉTH0", "Eth1"]);
        let matches = |wanted: &str| {
            let named = Selector::new(SelectorMode::Name).with_value(wanted).apply_names(&input);
            let excepted = Selector::new(SelectorMode::Except)
                .with_exclusions([wanted])
                .apply_names(&input);
            // Except keeps exactly what Name would drop for a full-name exclusion
            assert_eq!(named.len() + excepted.len(), input.len(), "{wanted}");
            !named.is_empty()
        };
        assert!(matches("eth1"));
        assert!(matches("ÉTH0"));
        assert!(!matches("éth0"));
    }

    #[test]
    fn exclusions_are_ignored_outside_except_mode() {
        let input = names(&["loop0", "sda"]);
        let out = Selector::new(SelectorMode::Each)
            .with_exclusions(["loop"])
            .apply_names(&input);
        assert_eq!(out, input);
    }

    #[test]
    fn unknown_mode_deserializes_to_identity() {
        let selector: Selector = toml::from_str("mode = \"sideways\"").unwrap();
        assert_eq!(selector.mode, SelectorMode::Unknown);
        let input = names(&["a", "b"]);
        assert_eq!(selector.apply_names(&input), input);
    }

    #[test]
    fn selection_is_deterministic() {
        let input = names(&["a", "b", "c", "b2"]);
        let selector = Selector::new(SelectorMode::Except).with_exclusions(["b"]);
        assert_eq!(selector.apply_names(&input), selector.apply_names(&input));
    }

    #[test]
    fn restrict_to_uses_exact_match() {
        let input = names(&["eth0", "ETH0", "wlan0"]);
        assert_eq!(restrict_to(input, "eth0", |n| n.as_str()), names(&["eth0"]));
    }
}
