use serde::{Deserialize, Serialize};

/// Query parameters for paged listings. `index` starts at 1.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Pagination {
    pub index: u64,
    pub size: u64,
}

const MAX_PAGE_SIZE: u64 = 100;

impl Default for Pagination {
    fn default() -> Self {
        Self { index: 1, size: 20 }
    }
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        (self.index - 1) * self.size
    }

    pub fn limit(&self) -> u64 {
        self.size
    }

    pub fn check(&self) -> Self {
        if self.index < 1 || self.size < 1 {
            return Self::default();
        }
        Self {
            index: self.index,
            size: self.size.min(MAX_PAGE_SIZE),
        }
    }
}
