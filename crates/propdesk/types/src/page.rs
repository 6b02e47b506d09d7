use serde::{Deserialize, Serialize};

/// One-based page selector used by every list operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: usize = 10;
    pub const MAX_LIMIT: usize = 100;
    pub const MAX_PAGE: usize = 1_000_000;

    /// Build a page selector, clamping `page` into `1..=MAX_PAGE` and `limit`
    /// into `1..=MAX_LIMIT`.
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.clamp(1, Self::MAX_PAGE),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    /// Rows to skip. Saturates for selectors built without [`Self::new`].
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_LIMIT)
    }
}

/// A page of results plus the totals needed to render pagination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub pages: usize,
    pub current_page: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: usize, request: PageRequest) -> Self {
        Self {
            items,
            total,
            pages: total.div_ceil(request.limit),
            current_page: request.page,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            pages: self.pages,
            current_page: self.current_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_is_clamped() {
        let request = PageRequest::new(0, 1_000);
        assert_eq!(request.page, 1);
        assert_eq!(request.limit, PageRequest::MAX_LIMIT);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
    }

    #[test]
    fn huge_pages_do_not_overflow_the_offset() {
        let request = PageRequest::new(usize::MAX, PageRequest::MAX_LIMIT);
        assert_eq!(request.page, PageRequest::MAX_PAGE);
        assert_eq!(request.offset(), (PageRequest::MAX_PAGE - 1) * PageRequest::MAX_LIMIT);

        let raw = PageRequest {
            page: usize::MAX,
            limit: usize::MAX,
        };
        assert_eq!(raw.offset(), usize::MAX);
        let zero = PageRequest { page: 0, limit: 10 };
        assert_eq!(zero.offset(), 0);
    }

    #[test]
    fn page_count_rounds_up() {
        let page = Page::new(vec![1, 2, 3], 21, PageRequest::new(1, 10));
        assert_eq!(page.pages, 3);
        assert_eq!(page.current_page, 1);
    }
}
