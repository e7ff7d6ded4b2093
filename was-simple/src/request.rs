//! Per-request state.
//!
//! A `RequestState` is created when a REQUEST packet arrives, mutated by
//! further control packets and by API calls, and dropped wholesale on the
//! next accept. All request-scoped strings live in it, so the drop
//! reclaims everything at once.

use std::collections::HashMap;

use protocol_was::Method;

use crate::input::Input;
use crate::output::Output;

/// Which accounting path the application has chosen for a body pipe.
///
/// The raw-descriptor path (`received`/`sent`) and the wrapped path
/// (`read`/`write`) are mutually exclusive per request: once the wrapped
/// path has run, raw accounting calls are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Accounting {
    #[default]
    Unset,
    Raw,
    Wrapped,
}

#[derive(Default)]
pub(crate) struct RequestState {
    pub method: Method,
    pub uri: String,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub remote_host: Option<String>,
    /// Request headers in arrival order; names compared case-insensitively.
    pub headers: Vec<(String, String)>,
    /// WAS parameters; names are case-sensitive, later packets overwrite.
    pub parameters: HashMap<String, String>,
    pub want_metrics: bool,
    /// DATA or NO_DATA has arrived; accept may hand the request out.
    pub complete: bool,
    /// LENGTH that arrived before DATA, applied when DATA arrives.
    pub pending_length: Option<u64>,
    pub input: Input,
    pub output: Output,
}

impl RequestState {
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An iterator over header or parameter pairs.
///
/// The pairs are snapshotted at construction, so the iterator stays
/// valid while the request is mutated and is independent of any other
/// iterator. Dropping it releases the snapshot.
pub struct PairIter {
    items: std::vec::IntoIter<(String, String)>,
}

impl PairIter {
    pub(crate) fn new(items: Vec<(String, String)>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for PairIter {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}
