//! Builders for catalog fixtures.

#![allow(dead_code)]

use subsearch::catalog::CandidateItem;

/// Builder for `CandidateItem` fixtures.
pub struct CatalogItemBuilder {
    item: CandidateItem,
}

impl CatalogItemBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            item: CandidateItem::new(name),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.item.title = Some(title.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.item.description = Some(description.to_string());
        self
    }

    pub fn subscribers(mut self, count: u64) -> Self {
        self.item.subscribers = Some(count);
        self
    }

    pub fn nsfw(mut self) -> Self {
        self.item.over18 = true;
        self
    }

    pub fn build(self) -> CandidateItem {
        self.item
    }
}

/// `count` items named `<prefix>0..`, each with a distinct subscriber count.
pub fn numbered_items(prefix: &str, count: usize) -> Vec<CandidateItem> {
    (0..count)
        .map(|i| {
            CatalogItemBuilder::new(&format!("{}{}", prefix, i))
                .subscribers(1_000 + i as u64)
                .build()
        })
        .collect()
}
