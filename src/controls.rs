//!
//! Query-state helpers
//! -------------------
//! Pure translations between a request's query string and normalized
//! search/order/page state, plus the inverse direction: link descriptors
//! for column-sort and pagination controls. Nothing here touches storage.

use serde::Serialize;

/// Rows per page everywhere a table is listed.
pub const PAGE_SIZE: usize = 10;

/// An ordered multimap over query parameters. Parsing and re-encoding
/// preserve parameter order so generated links stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryString {
    pairs: Vec<(String, String)>,
}

impl QueryString {
    /// Parse a raw query string (no leading `?`). Malformed pairs are kept
    /// best-effort: a bare key gets an empty value, undecodable percent
    /// escapes pass through verbatim.
    pub fn parse(raw: &str) -> Self {
        let mut pairs = Vec::new();
        for part in raw.split('&') {
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k, v),
                None => (part, ""),
            };
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            pairs.push((decode(key), decode(value)));
        }
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing an existing value or appending.
    pub fn with_param(&self, key: &str, value: &str) -> Self {
        let mut out = self.clone();
        match out.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => out.pairs.push((key.to_string(), value.to_string())),
        }
        out
    }

    /// Remove every occurrence of a parameter.
    pub fn without_param(&self, key: &str) -> Self {
        let mut out = self.clone();
        out.pairs.retain(|(k, _)| k != key);
        out
    }

    /// Encode back to a query string, `?` included, or the empty string
    /// when no parameters remain.
    pub fn encode(&self) -> String {
        if self.pairs.is_empty() {
            return String::new();
        }
        let encoded: Vec<String> = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        format!("?{}", encoded.join("&"))
    }
}

/// Read the `page` parameter as a positive integer, defaulting to 1.
pub fn get_page_number(query: &QueryString) -> usize {
    query
        .get("page")
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|p| *p >= 1)
        .unwrap_or(1)
}

/// Read the `search` parameter verbatim, empty when absent.
pub fn get_search_term(query: &QueryString) -> String {
    query.get("search").unwrap_or("").to_string()
}

/// Determine the column ordering from the `order` parameter. A leading `-`
/// means descending. Unknown column identities discard the ordering.
pub fn get_ordering(query: &QueryString, allowed_column_ids: &[String]) -> (Option<String>, bool) {
    let ordering = query.get("order").unwrap_or("");
    let column = ordering.trim_start_matches('-');
    let reverse = ordering.starts_with('-');
    if !allowed_column_ids.iter().any(|id| id == column) {
        return (None, false);
    }
    (Some(column.to_string()), reverse)
}

/// Total pages for a row count, never less than one.
pub fn total_pages(count: usize, page_size: usize) -> usize {
    std::cmp::max(count.div_ceil(page_size), 1)
}

/// Clamp a requested page into `1..=total_pages`.
pub fn clamp_page(page: usize, total_pages: usize) -> usize {
    std::cmp::max(std::cmp::min(page, total_pages), 1)
}

/// Sort-toggle link for one displayed column.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ColumnControl {
    pub id: String,
    pub text: String,
    pub url: String,
    pub is_forward_sorted: bool,
    pub is_reverse_sorted: bool,
}

impl ColumnControl {
    pub fn is_sorted(&self) -> bool {
        self.is_forward_sorted || self.is_reverse_sorted
    }
}

/// Build the sort-toggle link per column. Each link cycles the column
/// through unsorted, ascending and descending, and always strips `page`
/// since changing the sort resets pagination.
pub fn get_column_controls(
    path: &str,
    query: &QueryString,
    columns: &[(String, String)],
    order_column: Option<&str>,
    is_reverse: bool,
) -> Vec<ColumnControl> {
    let mut controls = Vec::with_capacity(columns.len());
    for (column_id, text) in columns {
        let selected = order_column == Some(column_id.as_str());
        let linked = if !selected {
            query.with_param("order", column_id)
        } else if !is_reverse {
            query.with_param("order", &format!("-{}", column_id))
        } else {
            query.without_param("order")
        };
        let linked = linked.without_param("page");
        controls.push(ColumnControl {
            id: column_id.clone(),
            text: text.clone(),
            url: format!("{}{}", path, linked.encode()),
            is_forward_sorted: selected && !is_reverse,
            is_reverse_sorted: selected && is_reverse,
        });
    }
    controls
}

/// One pagination link: previous, a numbered page, or next.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageControl {
    pub text: String,
    pub url: String,
    pub is_active: bool,
    pub is_disabled: bool,
}

/// Build previous / numbered / next links around the current page,
/// preserving all other query parameters. Page 1 links drop the `page`
/// parameter instead of carrying `page=1`.
pub fn get_page_controls(
    path: &str,
    query: &QueryString,
    current_page: usize,
    total_pages: usize,
) -> Vec<PageControl> {
    let link_to = |page: usize| {
        let q = if page <= 1 {
            query.without_param("page")
        } else {
            query.with_param("page", &page.to_string())
        };
        format!("{}{}", path, q.encode())
    };

    let mut controls = Vec::with_capacity(total_pages + 2);
    controls.push(PageControl {
        text: "Previous".to_string(),
        url: link_to(current_page.saturating_sub(1)),
        is_active: false,
        is_disabled: current_page <= 1,
    });
    for page in 1..=total_pages {
        controls.push(PageControl {
            text: page.to_string(),
            url: link_to(page),
            is_active: page == current_page,
            is_disabled: false,
        });
    }
    controls.push(PageControl {
        text: "Next".to_string(),
        url: link_to(std::cmp::min(current_page + 1, total_pages)),
        is_active: false,
        is_disabled: current_page >= total_pages,
    });
    controls
}
