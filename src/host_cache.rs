use std::net::SocketAddr;
use tracing::debug;
use crate::error::HostCacheFull;

/// Display names are shown in a fixed width column, this is the longest name that fits.
pub const MAX_HOST_NAME_LEN: usize = 15;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostCacheEntry {
    /// display name, unique within the cache
    pub name: String,
    pub map: String,
    pub users: u8,
    pub max_users: u8,
    pub driver: usize,
    pub addr: SocketAddr,
    /// string form of the address that the driver can resolve again for connecting
    pub canonical_name: String,
}

/// Servers found by the most recent discovery round, bounded in size. Entries are unique by
///  address, and display names are made unique by changing their last character.
pub struct HostCache {
    entries: Vec<HostCacheEntry>,
    capacity: usize,
}

impl HostCache {
    pub fn new(capacity: usize) -> HostCache {
        HostCache {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HostCacheEntry] {
        &self.entries
    }

    /// case insensitive lookup by display name
    pub fn find_by_name(&self, name: &str) -> Option<&HostCacheEntry> {
        self.entries.iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn contains_addr(&self, addr: SocketAddr) -> bool {
        self.entries.iter().any(|e| e.addr == addr)
    }

    /// Adds an entry unless one with the same address exists already. Returns the new entry's
    ///  index, or `None` for a known address.
    pub fn insert(&mut self, mut entry: HostCacheEntry) -> Result<Option<usize>, HostCacheFull> {
        if self.contains_addr(entry.addr) {
            return Ok(None);
        }
        if self.entries.len() >= self.capacity {
            debug!("host cache is full, ignoring {:?}", entry.addr);
            return Err(HostCacheFull);
        }

        while self.find_by_name(&entry.name).is_some() {
            entry.name = Self::next_candidate_name(&entry.name);
        }

        self.entries.push(entry);
        Ok(Some(self.entries.len() - 1))
    }

    /// Derives a new name for a name clash: a short name whose last character is above '8'
    ///  gets a '0' appended, otherwise the last character is incremented. Starting from "arena"
    ///  this yields "arena0", "arena1", ... "arena9", "arena90", ...
    fn next_candidate_name(name: &str) -> String {
        let mut chars = name.chars().collect::<Vec<_>>();
        match chars.last().copied() {
            None => "0".to_string(),
            Some(last) if chars.len() < MAX_HOST_NAME_LEN && last > '8' => {
                chars.push('0');
                chars.into_iter().collect()
            }
            Some(last) => {
                let len = chars.len();
                chars[len - 1] = char::from_u32(last as u32 + 1).unwrap_or('0');
                chars.into_iter().collect()
            }
        }
    }

    /// The display name for a server that speaks a different protocol version: it is marked
    ///  with a leading '*' and shortened to fit.
    pub fn version_mismatch_name(name: &str) -> String {
        let mut result = String::from("*");
        result.extend(name.chars().take(MAX_HOST_NAME_LEN - 1));
        result
    }
}
