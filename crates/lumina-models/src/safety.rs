//! Keyword-based content-safety filter.
//!
//! Items whose title, description or tags match a blocked pattern are
//! rejected before any generation work is scheduled, since the provider
//! would refuse them anyway and each refusal costs quota.

use lumina_abstraction::{CatalogItem, SafetyFilter, SafetyVerdict};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

const BLOCKED_PATTERNS: &[&str] = &[
    // Adult content
    r"\b(sex|sexy|erotic|adult|xxx|porn|nude|naked)\b",
    r"\b(vibrator|dildo|massager|pleasure|intimate)\b",
    r"\b(lingerie|bra|panties|thong|g-string)\b",
    r"\b(bdsm|fetish|bondage|kink)\b",
    // Controlled substances
    r"\b(cbd|thc|cannabis|marijuana|weed|hemp)\b",
    r"\b(vape|vaping|e-cigarette|nicotine|tobacco)\b",
    r"\b(alcohol|wine|beer|whiskey|vodka|liquor)\b",
    // Weapons
    r"\b(gun|rifle|pistol|firearm|ammunition|bullet)\b",
    r"\b(weapon|sword|knife|dagger|taser|stun)\b",
    // Medical
    r"\b(prescription|pharmaceutical|drug|medicine)\b",
    r"\b(syringe|needle|injection)\b",
];

const BLOCKED_KEYWORDS: &[&str] = &["adult toy", "sensual", "arousal"];

#[allow(clippy::expect_used)] // Static pattern list, verified by tests
static DEFAULT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("(?i){}", BLOCKED_PATTERNS.join("|"))).expect("valid blocked patterns")
});

/// Regex and keyword filter over an item's text fields.
#[derive(Debug, Clone)]
pub struct PatternSafetyFilter {
    pattern: Regex,
    keywords: Vec<String>,
}

impl Default for PatternSafetyFilter {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.clone(),
            keywords: BLOCKED_KEYWORDS.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

impl PatternSafetyFilter {
    /// Builds a filter from custom patterns and keywords.
    ///
    /// # Errors
    /// Returns a `regex::Error` if any pattern fails to compile.
    pub fn new(patterns: &[String], keywords: &[String]) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("(?i){}", patterns.join("|")))?;
        Ok(Self { pattern, keywords: keywords.iter().map(|k| k.to_lowercase()).collect() })
    }

    /// Adds extra keywords to the default set.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(|k| k.into().to_lowercase()));
        self
    }
}

impl SafetyFilter for PatternSafetyFilter {
    fn check(&self, item: &CatalogItem) -> SafetyVerdict {
        let text =
            format!("{} {} {}", item.title, item.description, item.tags.join(" ")).to_lowercase();

        if let Some(found) = self.pattern.find(&text) {
            debug!(item_id = %item.id, matched = found.as_str(), "Item blocked by pattern");
            return SafetyVerdict::blocked(format!("Blocked pattern: '{}'", found.as_str()));
        }

        if let Some(keyword) = self.keywords.iter().find(|k| text.contains(k.as_str())) {
            debug!(item_id = %item.id, keyword = %keyword, "Item blocked by keyword");
            return SafetyVerdict::blocked(format!("Blocked keyword: '{}'", keyword));
        }

        SafetyVerdict::safe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_item_passes() {
        let filter = PatternSafetyFilter::default();
        let item = CatalogItem::new("1", "Ceramic Coffee Mug").with_description("Holds 350ml");
        assert_eq!(filter.check(&item), SafetyVerdict::safe());
    }

    #[test]
    fn test_pattern_match_in_tags_blocks() {
        let filter = PatternSafetyFilter::default();
        let item = CatalogItem::new("2", "Travel Pouch").with_tag("Vape");
        let verdict = filter.check(&item);
        assert!(!verdict.is_safe);
        assert_eq!(verdict.reason, "Blocked pattern: 'vape'");
    }

    #[test]
    fn test_word_boundaries_are_respected() {
        let filter = PatternSafetyFilter::default();
        // "gunmetal" and "brass" must not trip "gun" / "bra".
        let item = CatalogItem::new("3", "Gunmetal Brass Lamp");
        assert!(filter.check(&item).is_safe);
    }

    #[test]
    fn test_keyword_match_blocks() {
        let filter = PatternSafetyFilter::default().with_keywords(["Novelty Item"]);
        let item = CatalogItem::new("4", "Funny novelty item for parties");
        let verdict = filter.check(&item);
        assert!(!verdict.is_safe);
        assert_eq!(verdict.reason, "Blocked keyword: 'novelty item'");
    }

    #[test]
    fn test_custom_patterns() {
        let filter = PatternSafetyFilter::new(&[r"\bfireworks?\b".to_string()], &[]).unwrap();
        assert!(!filter.check(&CatalogItem::new("5", "Fireworks Pack")).is_safe);
        assert!(filter.check(&CatalogItem::new("6", "Vape Case")).is_safe);
        assert!(PatternSafetyFilter::new(&["(".to_string()], &[]).is_err());
    }
}
