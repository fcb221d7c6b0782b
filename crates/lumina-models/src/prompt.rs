//! Category detection and prompt construction.
//!
//! An item's category is resolved once, before scheduling, into a closed
//! [`ProductCategory`]. Prompt text is then built by a single match over the
//! variants, with [`ProductCategory::General`] as the fallback.

use lumina_abstraction::CatalogItem;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Product category driving the photography style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    /// Clothing worn on the body.
    Apparel,
    /// Shoes, boots, sandals.
    Footwear,
    /// Rings, necklaces, watches.
    Jewelry,
    /// Handbags, backpacks, wallets.
    Bags,
    /// Furniture, decor, kitchenware.
    Home,
    /// Cosmetics and skincare.
    Beauty,
    /// Gadgets and accessories.
    Electronics,
    /// Toys and games.
    Toys,
    /// Anything else.
    General,
}

#[allow(clippy::expect_used)] // Static patterns, verified by tests
static CATEGORY_PATTERNS: Lazy<Vec<(ProductCategory, Regex)>> = Lazy::new(|| {
    [
        (ProductCategory::Footwear, r"\b(shoes?|sneakers?|boots?|sandals?|heels|loafers?|slippers?)\b"),
        (ProductCategory::Jewelry, r"\b(rings?|necklaces?|bracelets?|earrings?|pendants?|watch(es)?|jewelry)\b"),
        (ProductCategory::Bags, r"\b(bags?|handbags?|backpacks?|wallets?|purses?|totes?|clutch)\b"),
        (ProductCategory::Apparel, r"\b(shirts?|t-shirts?|dress(es)?|jackets?|coats?|hoodies?|sweaters?|cardigans?|jeans|pants|skirts?|tops?|blouses?)\b"),
        (ProductCategory::Beauty, r"\b(lipstick|mascara|serum|moisturi[sz]er|skincare|makeup|perfume|nail polish)\b"),
        (ProductCategory::Electronics, r"\b(headphones?|earbuds?|chargers?|speakers?|cables?|phone case|keyboards?|mouse)\b"),
        (ProductCategory::Toys, r"\b(toys?|plush|puzzles?|lego|dolls?|board games?)\b"),
        (ProductCategory::Home, r"\b(mugs?|lamps?|vases?|pillows?|cushions?|candles?|rugs?|chairs?|tables?|kitchen|decor)\b"),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        (category, Regex::new(&format!("(?i){}", pattern)).expect("valid category pattern"))
    })
    .collect()
});

impl ProductCategory {
    /// Detects the category from an item's title, tags and description, in
    /// that order of precedence.
    #[must_use]
    pub fn detect(item: &CatalogItem) -> Self {
        let fields = [item.title.as_str(), &item.tags.join(" "), item.description.as_str()];
        for field in fields {
            if let Some((category, _)) =
                CATEGORY_PATTERNS.iter().find(|(_, pattern)| pattern.is_match(field))
            {
                return *category;
            }
        }
        Self::General
    }

    /// Short label used in logs and reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Apparel => "apparel",
            Self::Footwear => "footwear",
            Self::Jewelry => "jewelry",
            Self::Bags => "bags",
            Self::Home => "home",
            Self::Beauty => "beauty",
            Self::Electronics => "electronics",
            Self::Toys => "toys",
            Self::General => "general",
        }
    }
}

const VARIANT_ANGLES: &[&str] = &[
    "front view, centered composition",
    "three-quarter angle with soft shadows",
    "close-up detail shot highlighting texture",
    "lifestyle setting in natural light",
];

/// Builds generation prompts for catalog items.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    description_limit: usize,
}

impl PromptBuilder {
    /// Creates a builder that truncates descriptions to 200 characters.
    #[must_use]
    pub fn new() -> Self {
        Self { description_limit: 200 }
    }

    fn scene(category: ProductCategory) -> &'static str {
        match category {
            ProductCategory::Apparel => {
                "worn by a professional model in a bright studio, full outfit visible, fabric drape and fit clearly shown"
            }
            ProductCategory::Footwear => {
                "on a clean light-grey surface at a low angle, laces and sole detail visible"
            }
            ProductCategory::Jewelry => {
                "on a dark velvet display with macro lighting that brings out metal and stone reflections"
            }
            ProductCategory::Bags => {
                "standing upright on a minimal pedestal, straps arranged neatly, hardware in focus"
            }
            ProductCategory::Home => "styled in a modern, uncluttered interior with warm ambient light",
            ProductCategory::Beauty => {
                "on a marble counter with soft diffused light and subtle water droplets"
            }
            ProductCategory::Electronics => {
                "on a matte desk surface with crisp edge lighting and a subtle gradient backdrop"
            }
            ProductCategory::Toys => "in a playful, colourful setting with soft even lighting",
            ProductCategory::General => "on a clean white studio background with professional lighting",
        }
    }

    /// Builds the prompt for one variant of an item.
    #[must_use]
    pub fn build(
        &self,
        item: &CatalogItem,
        category: ProductCategory,
        variant_index: usize,
        has_reference: bool,
    ) -> String {
        let angle = VARIANT_ANGLES[variant_index % VARIANT_ANGLES.len()];
        let limit = if self.description_limit == 0 { 200 } else { self.description_limit };
        let description: String = item.description.chars().take(limit).collect();

        let mut prompt = format!(
            "Create a professional e-commerce product photograph of \"{}\" {}. Shot: {}.",
            item.title,
            Self::scene(category),
            angle
        );
        if !description.trim().is_empty() {
            prompt.push_str(&format!("\nProduct details: {}", description.trim()));
        }
        prompt.push_str(
            "\nRequirements: photorealistic, sharp focus, high resolution, no text, no watermarks, no logos.",
        );
        if has_reference {
            prompt.push_str(
                "\nUse the provided reference image to match the product's exact appearance, colours and details. Generate a new photograph, not a copy.",
            );
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_prefers_title() {
        let item = CatalogItem::new("1", "Leather Ankle Boots").with_description("Pairs well with a dress");
        assert_eq!(ProductCategory::detect(&item), ProductCategory::Footwear);
    }

    #[test]
    fn test_detect_falls_back_to_tags_and_description() {
        let tagged = CatalogItem::new("2", "The Wanderer").with_tag("backpack");
        assert_eq!(ProductCategory::detect(&tagged), ProductCategory::Bags);

        let described = CatalogItem::new("3", "Nimbus").with_description("A soft plush companion");
        assert_eq!(ProductCategory::detect(&described), ProductCategory::Toys);

        let unknown = CatalogItem::new("4", "Gift Card");
        assert_eq!(ProductCategory::detect(&unknown), ProductCategory::General);
    }

    #[test]
    fn test_prompt_mentions_reference_only_when_present() {
        let builder = PromptBuilder::new();
        let item = CatalogItem::new("5", "Ceramic Mug").with_description("Stoneware, 350ml");

        let with_ref = builder.build(&item, ProductCategory::Home, 0, true);
        assert!(with_ref.contains("\"Ceramic Mug\""));
        assert!(with_ref.contains("reference image"));
        assert!(with_ref.contains("Stoneware, 350ml"));

        let text_only = builder.build(&item, ProductCategory::Home, 0, false);
        assert!(!text_only.contains("reference image"));
    }

    #[test]
    fn test_variants_use_different_angles() {
        let builder = PromptBuilder::new();
        let item = CatalogItem::new("6", "Desk Lamp");
        let first = builder.build(&item, ProductCategory::Home, 0, false);
        let second = builder.build(&item, ProductCategory::Home, 1, false);
        assert_ne!(first, second);
    }

    #[test]
    fn test_description_is_truncated() {
        let builder = PromptBuilder::new();
        let item = CatalogItem::new("7", "Vase").with_description("x".repeat(500));
        let prompt = builder.build(&item, ProductCategory::Home, 0, false);
        assert!(prompt.contains(&"x".repeat(200)));
        assert!(!prompt.contains(&"x".repeat(201)));
    }

    #[test]
    fn test_labels() {
        assert_eq!(ProductCategory::Footwear.label(), "footwear");
        assert_eq!(ProductCategory::General.label(), "general");
    }
}
