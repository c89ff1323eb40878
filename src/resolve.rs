use std::collections::HashSet;

use crate::document::{Document, PathError, SelectorPath};
use crate::formats::FieldRule;
use crate::transform::{TransformError, apply_transform};

/// Separator placed between matched fragments before the transform runs.
pub const FRAGMENT_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Resolved(String),
    Unresolved(Unresolved),
}

impl ExtractionOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ExtractionOutcome::Resolved(_))
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            ExtractionOutcome::Resolved(value) => Some(value),
            ExtractionOutcome::Unresolved(_) => None,
        }
    }
}

/// Why a field needs the fallback. Kept for diagnostics only; every variant
/// ends up as the same record cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    MissingPath,
    InvalidPath(PathError),
    PathNotFound,
    Empty,
    Transform(TransformError),
    NoAssets,
}

impl std::fmt::Display for Unresolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unresolved::MissingPath => f.write_str("no path configured"),
            Unresolved::InvalidPath(err) => write!(f, "{err}"),
            Unresolved::PathNotFound => f.write_str("path matched nothing"),
            Unresolved::Empty => f.write_str("value is empty"),
            Unresolved::Transform(err) => write!(f, "{err}"),
            Unresolved::NoAssets => f.write_str("no asset could be retrieved"),
        }
    }
}

/// Resolves one scalar field against a parsed document.
pub fn resolve_field(document: &Document, rule: &FieldRule) -> ExtractionOutcome {
    let fragments = match select_fragments(document, rule) {
        Ok(fragments) => fragments,
        Err(reason) => return ExtractionOutcome::Unresolved(reason),
    };

    let combined = join_unique(&fragments);
    if combined.trim().is_empty() {
        return ExtractionOutcome::Unresolved(Unresolved::Empty);
    }

    match apply_transform(&combined, rule.transform.as_deref()) {
        Ok(Some(value)) if !value.trim().is_empty() => ExtractionOutcome::Resolved(value),
        Ok(_) => ExtractionOutcome::Unresolved(Unresolved::Empty),
        Err(err) => ExtractionOutcome::Unresolved(Unresolved::Transform(err)),
    }
}

/// Evaluates the rule's path. Zero matches is reported as [`Unresolved::PathNotFound`].
pub fn select_fragments(document: &Document, rule: &FieldRule) -> Result<Vec<String>, Unresolved> {
    let Some(path) = rule.path.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Err(Unresolved::MissingPath);
    };
    let path = SelectorPath::parse(path).map_err(Unresolved::InvalidPath)?;
    let fragments = document.select(&path);
    if fragments.is_empty() {
        return Err(Unresolved::PathNotFound);
    }
    Ok(fragments)
}

/// Joins fragments in document order, keeping only the first copy of each.
pub fn join_unique(fragments: &[String]) -> String {
    let mut seen = HashSet::new();
    fragments
        .iter()
        .map(String::as_str)
        .filter(|fragment| seen.insert(*fragment))
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"
<html><body>
  <div class="price"><span>1 234 €</span></div>
  <section id="features">
    <ul><li><a>Pool</a></li><li><span>Garden</span></li></ul>
    <ul><li><a>Pool</a></li></ul>
    <ul><li><span>Pool</span></li></ul>
  </section>
  <div class="blank">   </div>
  <p class="address">Rua Augusta 12, Lisbon</p>
</body></html>
"#;

    fn resolve(rule: FieldRule) -> ExtractionOutcome {
        resolve_field(&Document::parse(HTML), &rule)
    }

    #[test]
    fn legacy_xpath_rule_resolves() -> anyhow::Result<()> {
        let rule: FieldRule = serde_json::from_str(
            r#"{"xpath": "//div[contains(@class,'price')]/span/text()", "transform": "digits"}"#,
        )?;
        assert_eq!(resolve(rule), ExtractionOutcome::Resolved("1234".to_owned()));
        Ok(())
    }

    #[test]
    fn price_is_cleaned_by_transform() {
        let outcome = resolve(FieldRule::new(".price span").with_transform("digits"));
        assert_eq!(outcome, ExtractionOutcome::Resolved("1234".to_owned()));
    }

    #[test]
    fn repeated_fragments_collapse_to_one() {
        let outcome = resolve(FieldRule::new("#features li a, #features li span"));
        assert_eq!(
            outcome,
            ExtractionOutcome::Resolved("Pool\nGarden".to_owned())
        );
    }

    #[test]
    fn untransformed_value_is_kept_verbatim() {
        let outcome = resolve(FieldRule::new("p.address"));
        assert_eq!(outcome.value(), Some("Rua Augusta 12, Lisbon"));
    }

    #[test]
    fn every_failure_cause_is_unresolved() {
        let cases = [
            (FieldRule::default(), "missing path"),
            (FieldRule::new(".description"), "no match"),
            (FieldRule::new("div.blank"), "blank text"),
            (
                FieldRule::new(".price span").with_transform("first_of('$')"),
                "transform yields no value",
            ),
            (
                FieldRule::new("p.address").with_transform("split(';', 4)"),
                "transform error",
            ),
            (FieldRule::new("//h1[normalize-space()]"), "invalid path"),
        ];

        for (rule, label) in cases {
            let outcome = resolve(rule);
            assert!(!outcome.is_resolved(), "{label}: {outcome:?}");
            assert_eq!(outcome.value(), None, "{label}");
        }
    }

    #[test]
    fn transform_error_keeps_expression_for_diagnostics() {
        let outcome = resolve(FieldRule::new("p.address").with_transform("split(';', 4)"));
        let ExtractionOutcome::Unresolved(Unresolved::Transform(err)) = outcome else {
            panic!("expected transform error, got {outcome:?}");
        };
        assert_eq!(err.expr, "split(';', 4)");
    }
}
