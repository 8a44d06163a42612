//! Forward-only paged search cursor

use super::errors::WalletResult;
use super::profile::Profile;
use super::record::{StorageRecord, TagFilter};
use std::collections::VecDeque;

const DEFAULT_PAGE_SIZE: usize = 64;

/// Lazily fetched sequence of matching records
///
/// Records are pulled from the backend one page at a time. The cursor cannot
/// be rewound; start a new search to iterate again.
pub struct RecordSearch {
    profile: Profile,
    record_type: String,
    filter: TagFilter,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<StorageRecord>,
    exhausted: bool,
}

impl RecordSearch {
    pub(crate) fn new(profile: Profile, record_type: String, filter: TagFilter) -> Self {
        Self {
            profile,
            record_type,
            filter,
            page_size: DEFAULT_PAGE_SIZE,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn next(&mut self) -> WalletResult<Option<StorageRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .profile
                .scan_page(&self.record_type, &self.filter, self.offset, self.page_size)
                .await?;
            self.offset += page.len();
            self.exhausted = page.len() < self.page_size;
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    pub async fn fetch_all(mut self) -> WalletResult<Vec<StorageRecord>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::core_wallet::{StorageRecord, TagFilter, TenantManager, ProfileSettings};

    #[tokio::test]
    async fn test_cursor_pages_through_results() {
        let tenants = TenantManager::in_memory();
        let profile = tenants.create_profile("alice", ProfileSettings::unprotected()).await.unwrap();
        for i in 0..7 {
            let record = StorageRecord::new("note", format!("n{}", i), "{}").with_tag("kind", "a");
            profile.add(record).await.unwrap();
        }
        profile.add(StorageRecord::new("note", "other", "{}").with_tag("kind", "b")).await.unwrap();

        let mut search = profile.search("note", TagFilter::eq("kind", "a")).unwrap().page_size(3);
        let mut ids = Vec::new();
        while let Some(record) = search.next().await.unwrap() {
            ids.push(record.id);
        }
        assert_eq!(ids.len(), 7);
        assert_eq!(ids.first().map(String::as_str), Some("n0"));

        // Exhausted cursors stay exhausted
        assert!(search.next().await.unwrap().is_none());
    }
}
