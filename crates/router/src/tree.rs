//! Compressed prefix tree over registered URL patterns.
//!
//! Every registered URL is normalized first: each `{name}` segment is
//! rewritten to the `{}` placeholder while the original key and its segment
//! index are kept aside. The tree itself stores normalized fragments;
//! lookup walks fragments in lockstep with the request path, skipping a
//! whole segment on both sides whenever it stands on a `{}` placeholder.
//! Exact matches always beat wildcard matches for the same input.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use http::Method;

use crate::error::RouteError;
use crate::route::Route;

const PARAM_PLACEHOLDER: &str = "/{}";

/// Path parameters extracted from a request URL.
pub type PathParams = HashMap<String, String>;

/// A wildcard key together with the segment index it was declared at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Param {
    key: String,
    index: usize,
}

struct NodeValue {
    params: Vec<Param>,
    route: Arc<Route>,
}

struct Node {
    /// The stored part of the normalized URL.
    fragment: String,
    /// One binding per HTTP method.
    values: HashMap<Method, NodeValue>,
    children: Vec<Node>,
}

impl Node {
    fn new() -> Self {
        Self { fragment: String::new(), values: HashMap::new(), children: Vec::new() }
    }

    fn leaf(fragment: &str, method: Method, params: Vec<Param>, route: Arc<Route>) -> Self {
        let mut values = HashMap::new();
        values.insert(method, NodeValue { params, route });
        Self { fragment: fragment.to_string(), values, children: Vec::new() }
    }

    fn bind(&mut self, method: Method, params: Vec<Param>, route: Arc<Route>) -> Result<(), RouteError> {
        if self.values.contains_key(&method) {
            return Err(RouteError::UrlAlreadyStored);
        }
        self.values.insert(method, NodeValue { params, route });
        Ok(())
    }
}

/// The routing tree. Mutated only while the router is being configured.
pub(crate) struct Tree {
    root: Node,
}

impl Tree {
    pub(crate) fn new() -> Self {
        Self { root: Node::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root.fragment.is_empty() && self.root.values.is_empty() && self.root.children.is_empty()
    }

    /// Binds `route` under `(method, url)`. The URL is normalized first;
    /// malformed patterns and duplicate bindings are reported to the
    /// caller and leave the tree untouched.
    pub(crate) fn insert(&mut self, method: Method, url: &str, route: Arc<Route>) -> Result<(), RouteError> {
        let (normalized, params) = normalize_url(url)?;

        // An empty tree stores the whole URL in the root.
        if self.is_empty() {
            self.root.fragment = normalized;
            self.root.values.insert(method, NodeValue { params, route });
            return Ok(());
        }

        insert_at(&mut self.root, &normalized, method, params, route)
    }

    /// Looks up the route bound under `(method, url)` and extracts the
    /// wildcard parameters from the concrete path.
    pub(crate) fn find(&self, method: &Method, url: &str) -> Option<(Arc<Route>, PathParams)> {
        if self.is_empty() {
            return None;
        }

        let mut queue: VecDeque<(&Node, &str, bool)> = VecDeque::new();
        queue.push_back((&self.root, url, false));

        let mut candidate: Option<&Node> = None;

        while let Some((node, search, walk_has_wildcard)) = queue.pop_front() {
            let (stored_offset, search_offset, fragment_has_wildcard) = matching_offsets(&node.fragment, search);

            // The whole fragment has to be consumed for this subtree to stay
            // a candidate.
            if stored_offset != node.fragment.len() {
                continue;
            }

            let remaining = &search[search_offset..];
            let has_wildcard = walk_has_wildcard || fragment_has_wildcard;

            if remaining.is_empty() {
                candidate = Some(node);

                // Exact URL matches are prioritized: a wildcard candidate
                // stays provisional because a later exact match supersedes
                // it.
                if !has_wildcard {
                    break;
                }
                continue;
            }

            for child in &node.children {
                queue.push_back((child, remaining, has_wildcard));
            }
        }

        let value = candidate?.values.get(method)?;

        let mut params = PathParams::new();
        if !value.params.is_empty() {
            let stripped = url.strip_prefix('/').unwrap_or(url);
            let segments: Vec<&str> = stripped.split('/').collect();
            for param in &value.params {
                let segment = segments.get(param.index).copied().unwrap_or_default();
                params.insert(param.key.clone(), segment.to_string());
            }
        }

        Some((Arc::clone(&value.route), params))
    }
}

fn insert_at(
    node: &mut Node,
    search: &str,
    method: Method,
    params: Vec<Param>,
    route: Arc<Route>,
) -> Result<(), RouteError> {
    // What is left of the URL equals the stored fragment: bind here.
    if search == node.fragment {
        return node.bind(method, params, route);
    }

    let lcp = longest_common_prefix(&node.fragment, search);

    if lcp == node.fragment.len() {
        // The fragment is fully covered: continue below this node with the
        // rest of the URL.
        let remaining = &search[lcp..];

        if let Some(child) = node.children.iter_mut().find(|child| longest_common_prefix(&child.fragment, remaining) > 0) {
            return insert_at(child, remaining, method, params, route);
        }

        node.children.push(Node::leaf(remaining, method, params, route));
        return Ok(());
    }

    // The fragment and the URL diverge inside the fragment: split the node
    // at the common prefix. The new child inherits everything the node
    // stored.
    let split_off = Node {
        fragment: node.fragment[lcp..].to_string(),
        values: std::mem::take(&mut node.values),
        children: std::mem::take(&mut node.children),
    };

    node.fragment.truncate(lcp);
    node.children.push(split_off);

    let remaining = &search[lcp..];
    if remaining.is_empty() {
        return node.bind(method, params, route);
    }

    node.children.push(Node::leaf(remaining, method, params, route));
    Ok(())
}

/// Rewrites a pattern URL so every `{name}` segment becomes the `{}`
/// placeholder, recording each key with the index of the segment it came
/// from.
pub(crate) fn normalize_url(url: &str) -> Result<(String, Vec<Param>), RouteError> {
    if url.is_empty() {
        return Err(RouteError::EmptyUrl);
    }

    let Some(stripped) = url.strip_prefix('/') else {
        return Err(RouteError::MalformedUrl);
    };

    let mut normalized = String::with_capacity(url.len());
    let mut params = Vec::new();

    for (index, segment) in stripped.split('/').enumerate() {
        let Some(inner) = segment.strip_prefix('{') else {
            normalized.push('/');
            normalized.push_str(segment);
            continue;
        };

        let Some(key) = inner.strip_suffix('}') else {
            return Err(RouteError::MalformedParam);
        };

        normalized.push_str(PARAM_PLACEHOLDER);
        params.push(Param { key: key.to_string(), index });
    }

    Ok((normalized, params))
}

/// Length in bytes of the common prefix of two normalized URLs, floored to
/// a character boundary.
fn longest_common_prefix(url1: &str, url2: &str) -> usize {
    let mut lcp = url1.as_bytes().iter().zip(url2.as_bytes()).take_while(|(a, b)| a == b).count();
    while !url1.is_char_boundary(lcp) {
        lcp -= 1;
    }
    lcp
}

/// Advances through a stored fragment and a request path in lockstep.
///
/// On a mismatch where the fragment stands on `{`, both sides skip to
/// their next `/` (or their end) and the scan continues; the returned flag
/// records that a wildcard was crossed. The first offset tells how much of
/// the fragment was consumed, the second how much of the search string.
fn matching_offsets(stored: &str, search: &str) -> (usize, usize, bool) {
    let stored_bytes = stored.as_bytes();
    let search_bytes = search.as_bytes();

    let mut stored_offset = 0;
    let mut search_offset = 0;
    let mut includes_wildcard = false;

    while stored_offset < stored_bytes.len() && search_offset < search_bytes.len() {
        if stored_bytes[stored_offset] == search_bytes[search_offset] {
            stored_offset += 1;
            search_offset += 1;
            continue;
        }

        // The two strings cannot match any further unless the fragment
        // stands on a parameter placeholder.
        if stored_bytes[stored_offset] != b'{' {
            break;
        }

        includes_wildcard = true;

        stored_offset = match stored[stored_offset..].find('/') {
            Some(slash) => stored_offset + slash,
            None => stored_bytes.len(),
        };
        search_offset = match search[search_offset..].find('/') {
            Some(slash) => search_offset + slash,
            None => search_bytes.len(),
        };
    }

    while !stored.is_char_boundary(stored_offset) {
        stored_offset -= 1;
    }
    while !search.is_char_boundary(search_offset) {
        search_offset -= 1;
    }

    (stored_offset, search_offset, includes_wildcard)
}
