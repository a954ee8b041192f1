//! Paged listing with a per-task item budget.

use std::future::Future;

use harvest_core::DynamicObject;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{AccessError, ObjectPage};

/// Page size for each request and the most items a task keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBudget {
    pub page_limit: u32,
    pub max_items: usize,
}

impl PageBudget {
    pub fn new(page_limit: u32, max_items: usize) -> Self { Self { page_limit: page_limit.max(1), max_items } }
}

impl Default for PageBudget {
    fn default() -> Self { Self::new(500, 5000) }
}

/// Items kept from a paged listing plus what had to be left out.
#[derive(Debug, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    /// Items the server returned, kept or not.
    pub total: usize,
    pub truncated: bool,
    /// Items dropped because they did not decode.
    pub skipped: Vec<String>,
    pub max_items: usize,
}

impl<T> Default for Paged<T> {
    fn default() -> Self { Self { items: Vec::new(), total: 0, truncated: false, skipped: Vec::new(), max_items: 0 } }
}

impl<T> Paged<T> {
    /// Warning for a budget breach, if any.
    pub fn limit_warning(&self) -> Option<String> {
        self.truncated.then(|| format!("found {} resources, limit ({}) reached", self.total, self.max_items))
    }

    /// All non-fatal conditions: budget breach first, then undecodable items.
    pub fn warnings(&self) -> Vec<String> {
        let mut out: Vec<String> = self.limit_warning().into_iter().collect();
        out.extend(self.skipped.iter().cloned());
        out
    }
}

impl Paged<DynamicObject> {
    /// Decode into a typed model; items that do not fit are skipped and reported.
    pub fn decode<T: DeserializeOwned>(self) -> Paged<T> {
        let mut skipped = self.skipped;
        let mut items = Vec::with_capacity(self.items.len());
        for o in self.items {
            let label = format!("{}/{}", o.namespace().unwrap_or_default(), o.name());
            match serde_json::from_value::<T>(o.into_value()) {
                Ok(t) => items.push(t),
                Err(e) => skipped.push(format!("skipping malformed item {label}: {e}")),
            }
        }
        Paged { items, total: self.total, truncated: self.truncated, skipped, max_items: self.max_items }
    }
}

/// Follow continue tokens until the listing is exhausted. Past the budget,
/// pages are still read so the total is exact.
pub async fn collect_pages<F, Fut>(budget: PageBudget, mut fetch: F) -> Result<Paged<DynamicObject>, AccessError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ObjectPage, AccessError>>,
{
    let mut out = Paged { max_items: budget.max_items, ..Paged::default() };
    let mut token: Option<String> = None;
    let mut pages = 0usize;
    loop {
        let page = fetch(token.take()).await?;
        pages += 1;
        out.total += page.items.len();
        for item in page.items {
            if out.items.len() < budget.max_items {
                out.items.push(item);
            } else {
                out.truncated = true;
            }
        }
        match page.continue_token {
            Some(t) if !t.is_empty() => token = Some(t),
            _ => break,
        }
    }
    debug!(pages, total = out.total, kept = out.items.len(), "kubehub: paged listing done");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(i: usize) -> DynamicObject { DynamicObject::new(json!({"metadata": {"name": format!("o{i}")}})) }

    #[tokio::test]
    async fn keeps_budget_but_counts_everything() {
        let budget = PageBudget::new(2, 3);
        let paged = collect_pages(budget, |tok| async move {
            let start: usize = tok.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
            let end = (start + 2).min(5);
            Ok(ObjectPage {
                items: (start..end).map(obj).collect(),
                continue_token: (end < 5).then(|| end.to_string()),
                remaining: None,
            })
        })
        .await
        .expect("paged");
        assert_eq!(paged.items.len(), 3);
        assert_eq!(paged.total, 5);
        assert_eq!(paged.limit_warning().as_deref(), Some("found 5 resources, limit (3) reached"));
    }

    #[tokio::test]
    async fn exact_budget_is_not_truncated() {
        let paged = collect_pages(PageBudget::new(10, 2), |_| async {
            Ok(ObjectPage { items: vec![obj(0), obj(1)], continue_token: None, remaining: None })
        })
        .await
        .expect("paged");
        assert!(!paged.truncated);
        assert!(paged.warnings().is_empty());
    }

    #[test]
    fn decode_skips_malformed() {
        #[derive(serde::Deserialize)]
        struct Named {
            metadata: Meta,
        }
        #[derive(serde::Deserialize)]
        struct Meta {
            #[allow(dead_code)]
            name: String,
        }
        let p = Paged {
            items: vec![obj(1), DynamicObject::new(json!({"metadata": {"name": 7}}))],
            total: 2,
            ..Paged::default()
        };
        let typed: Paged<Named> = p.decode();
        assert_eq!(typed.items.len(), 1);
        assert_eq!(typed.skipped.len(), 1);
        let _ = &typed.items[0].metadata;
    }
}
