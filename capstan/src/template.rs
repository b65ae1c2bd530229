//! Query template embedding.
//!
//! Query templates are plain PromQL written without any knowledge of the
//! clusters they will run against. Embedding inserts two marker tokens into
//! the template text:
//!
//! - [`FILTER_MARKER`] where the cluster selector clauses belong
//! - [`NAMES_MARKER`] at the end of every `by (...)` grouping clause
//!
//! Materialization later swaps the markers for a [`LabelFilter`] and runs a
//! cleanup pass that removes the punctuation left behind by empty
//! substitutions. No PromQL parser is involved: the template's structural
//! shape is guessed from its delimiters.
//!
//! | Shape        | Detected by       | Marker placement                              |
//! |--------------|-------------------|-----------------------------------------------|
//! | `Labeled`    | one or more `}`   | `,marker` before every `}`                    |
//! | `Aggregator` | a `)` but no `}`  | `{,marker}` after the first call argument,    |
//! |              |                   | ahead of its `[...]` range window if any      |
//! | `Plain`      | neither           | `{,marker}` appended                          |
//!
//! # Examples
//!
//! ```rust
//! use capstan::labels::LabelFilter;
//! use capstan::template::embed;
//!
//! let embedded = embed("sum(metric{}) by (pod)").unwrap();
//! let filter = LabelFilter {
//!     label_names: "env".to_string(),
//!     labels: r#"env="prod""#.to_string(),
//! };
//! assert_eq!(
//!     embedded.materialize(&filter),
//!     r#"sum(metric{env="prod"}) by (pod,env)"#
//! );
//! assert_eq!(embedded.materialize(&LabelFilter::empty()), "sum(metric) by (pod)");
//! ```

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;

use crate::error::TemplateError;
use crate::labels::LabelFilter;

/// Marker replaced by the selector clauses of a [`LabelFilter`].
pub const FILTER_MARKER: &str = "$__cluster_filter";

/// Marker replaced by the identifying label names of a [`LabelFilter`].
pub const NAMES_MARKER: &str = "$__cluster_labels";

/// Opening of a `by (...)` grouping clause.
static GROUPING_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bby\s*\(").expect("Invalid regex for grouping clause"));

/// A `by ()` clause emptied by substitution, with its leading whitespace.
static EMPTY_GROUPING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\bby\s*\(\s*\)").expect("Invalid regex for empty grouping clause")
});

/// `()` that is not a call or a matching clause such as `on()`.
static BARE_PARENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^\w\s])\s*\(\s*\)").expect("Invalid regex for bare parentheses")
});

/// Structural shape of a query template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryShape {
    /// No selector and no call, e.g. `up`.
    Plain,
    /// A call without selector braces, e.g. `sum(kube_pod_info)`.
    Aggregator,
    /// One or more `{...}` selector blocks.
    Labeled,
}

impl QueryShape {
    /// Classifies a template and returns its shape with the number of
    /// selector blocks it will carry.
    pub fn classify(template: &str) -> (Self, usize) {
        let braces = template.matches('}').count();
        if braces > 0 {
            (Self::Labeled, braces)
        } else if template.contains(')') {
            (Self::Aggregator, 1)
        } else {
            (Self::Plain, 1)
        }
    }
}

/// Inserts markers for one (shape, occurrence count) combination.
#[derive(Debug)]
pub struct Embedder {
    shape: QueryShape,
    occurrences: usize,
}

impl Embedder {
    fn new(shape: QueryShape, occurrences: usize) -> Self {
        Self { shape, occurrences }
    }

    /// The shape this embedder handles.
    pub fn shape(&self) -> QueryShape {
        self.shape
    }

    /// The number of selector blocks this embedder produces.
    pub fn occurrences(&self) -> usize {
        self.occurrences
    }

    fn apply(&self, template: &str) -> Result<EmbeddedQuery, TemplateError> {
        let groupings = grouping_closes(template)?;
        let mut inserts: Vec<(usize, String)> = Vec::new();

        match self.shape {
            QueryShape::Labeled => {
                let positions: Vec<usize> = template.match_indices('}').map(|(i, _)| i).collect();
                if positions.len() != self.occurrences {
                    return Err(delimiter_count(template, '}', self.occurrences, positions.len()));
                }
                inserts.extend(positions.into_iter().map(|i| (i, format!(",{FILTER_MARKER}"))));
            }
            QueryShape::Aggregator => {
                let first = template
                    .match_indices(')')
                    .map(|(i, _)| i)
                    .find(|i| !groupings.contains(i))
                    .ok_or_else(|| delimiter_count(template, ')', 1, 0))?;
                inserts.push((selector_end(template, first), format!("{{,{FILTER_MARKER}}}")));
            }
            QueryShape::Plain => {
                inserts.push((template.len(), format!("{{,{FILTER_MARKER}}}")));
            }
        }
        inserts.extend(groupings.into_iter().map(|i| (i, format!(",{NAMES_MARKER}"))));

        // Insert from the back so earlier offsets stay valid.
        inserts.sort_by(|a, b| b.0.cmp(&a.0));
        let mut text = template.to_string();
        for (offset, marker) in inserts {
            text.insert_str(offset, &marker);
        }

        Ok(EmbeddedQuery {
            template: template.to_string(),
            text,
            shape: self.shape,
            blocks: self.occurrences,
        })
    }
}

/// Thread-safe memo of embedders keyed by shape and occurrence count.
///
/// Templates recur with a handful of shapes, so embedders are built once
/// and shared.
#[derive(Debug, Default)]
pub struct EmbedderCache {
    embedders: Mutex<HashMap<(QueryShape, usize), Arc<Embedder>>>,
}

impl EmbedderCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the embedder for a shape, creating it on first use.
    pub fn get(&self, shape: QueryShape, occurrences: usize) -> Arc<Embedder> {
        let mut embedders = self
            .embedders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            embedders
                .entry((shape, occurrences))
                .or_insert_with(|| Arc::new(Embedder::new(shape, occurrences))),
        )
    }

    /// Number of distinct embedders built so far.
    pub fn len(&self) -> usize {
        self.embedders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no embedder has been built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validates and embeds a template using a cached embedder.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] if the template is empty, already carries
    /// a marker, has unbalanced braces or parentheses, or has an
    /// unterminated grouping clause.
    pub fn embed(&self, template: &str) -> Result<EmbeddedQuery, TemplateError> {
        validate(template)?;
        let (shape, occurrences) = QueryShape::classify(template);
        self.get(shape, occurrences).apply(template)
    }
}

/// Embeds a template without caching the embedder.
///
/// # Errors
///
/// See [`EmbedderCache::embed`].
pub fn embed(template: &str) -> Result<EmbeddedQuery, TemplateError> {
    validate(template)?;
    let (shape, occurrences) = QueryShape::classify(template);
    Embedder::new(shape, occurrences).apply(template)
}

/// A template with markers inserted, ready to be materialized per cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedQuery {
    template: String,
    text: String,
    shape: QueryShape,
    blocks: usize,
}

impl EmbeddedQuery {
    /// The template as written.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The marker-bearing text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The detected shape.
    pub fn shape(&self) -> QueryShape {
        self.shape
    }

    /// Number of selector blocks that receive the filter.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Substitutes one filter into every selector block and cleans up.
    ///
    /// With [`LabelFilter::empty`] the result is the template itself, minus
    /// any empty `{}` it was written with.
    pub fn materialize(&self, filter: &LabelFilter) -> String {
        let text = self
            .text
            .replace(FILTER_MARKER, &filter.labels)
            .replace(NAMES_MARKER, &filter.label_names);
        cleanup(&text)
    }

    /// Substitutes a different filter into each selector block, in order.
    ///
    /// Blocks beyond the end of `filters` receive an empty filter. Grouping
    /// clauses receive the label names of the first filter.
    pub fn materialize_blocks(&self, filters: &[LabelFilter]) -> String {
        let mut out = String::with_capacity(self.text.len());
        for (i, piece) in self.text.split(FILTER_MARKER).enumerate() {
            if i > 0 {
                out.push_str(filters.get(i - 1).map_or("", |f| f.labels.as_str()));
            }
            out.push_str(piece);
        }
        let names = filters.first().map_or("", |f| f.label_names.as_str());
        cleanup(&out.replace(NAMES_MARKER, names))
    }
}

/// Removes punctuation left behind by empty marker substitutions.
///
/// Collapses `{,` `,}` `(,` `,)` and `,,` until none remain, then removes
/// empty selectors `{}`, empty ` by ()` clauses and bare `()`. String
/// literals are copied as written.
///
/// # Examples
///
/// ```rust
/// use capstan::template::cleanup;
///
/// assert_eq!(cleanup("sum(up{,}) by (,)"), "sum(up)");
/// assert_eq!(cleanup(r#"rate(x{job="a",}[5m])"#), r#"rate(x{job="a"}[5m])"#);
/// assert_eq!(cleanup(r#"x{path=~"a,,b|(,c)",}"#), r#"x{path=~"a,,b|(,c)"}"#);
/// ```
pub fn cleanup(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'"' | b'\'' | b'`') {
            let end = closing_quote(bytes, i).map_or(bytes.len(), |e| e + 1);
            out.push_str(&cleanup_unquoted(&text[last..i]));
            out.push_str(&text[i..end]);
            last = end;
            i = end;
        } else {
            i += 1;
        }
    }
    out.push_str(&cleanup_unquoted(&text[last..]));
    out
}

/// Index of the quote closing the one at `open`, honouring `\` escapes.
pub(crate) fn closing_quote(bytes: &[u8], open: usize) -> Option<usize> {
    let quote = bytes[open];
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote != b'`' => i += 2,
            b if b == quote => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn cleanup_unquoted(text: &str) -> String {
    const COLLAPSE: [(&str, &str); 5] = [
        (",,", ","),
        ("{,", "{"),
        (",}", "}"),
        ("(,", "("),
        (",)", ")"),
    ];

    let mut out = text.to_string();
    loop {
        let before = out.len();
        for (from, to) in COLLAPSE {
            out = out.replace(from, to);
        }
        if out.len() == before {
            break;
        }
    }

    let out = out.replace("{}", "");
    let out = EMPTY_GROUPING.replace_all(&out, "");
    BARE_PARENS.replace_all(&out, "$1").into_owned()
}

fn validate(template: &str) -> Result<(), TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty);
    }
    for marker in [FILTER_MARKER, NAMES_MARKER] {
        if template.contains(marker) {
            return Err(TemplateError::ReservedMarker {
                template: template.to_string(),
                marker,
            });
        }
    }
    for (open, close) in [('{', '}'), ('(', ')')] {
        let opens = template.matches(open).count();
        let closes = template.matches(close).count();
        if opens != closes {
            return Err(delimiter_count(template, close, opens, closes));
        }
    }
    Ok(())
}

/// Byte offsets of the closing parenthesis of every `by (...)` clause.
fn grouping_closes(template: &str) -> Result<Vec<usize>, TemplateError> {
    let mut closes = Vec::new();
    for m in GROUPING_OPEN.find_iter(template) {
        let open = m.end() - 1;
        let close = matching_paren(template, open).ok_or_else(|| {
            TemplateError::UnterminatedGrouping {
                template: template.to_string(),
                offset: open,
            }
        })?;
        closes.push(close);
    }
    Ok(closes)
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Where the selector of the argument closed at `close` belongs: before a
/// trailing `[...]` range window, otherwise right after the argument.
fn selector_end(template: &str, close: usize) -> usize {
    let argument = template[..close].trim_end();
    if argument.ends_with(']')
        && let Some(open) = argument.rfind('[')
    {
        return open;
    }
    argument.len()
}

fn delimiter_count(template: &str, delimiter: char, expected: usize, found: usize) -> TemplateError {
    TemplateError::DelimiterCount {
        template: template.to_string(),
        delimiter,
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(names: &str, labels: &str) -> LabelFilter {
        LabelFilter {
            label_names: names.to_string(),
            labels: labels.to_string(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(QueryShape::classify("up"), (QueryShape::Plain, 1));
        assert_eq!(QueryShape::classify("sum(up)"), (QueryShape::Aggregator, 1));
        assert_eq!(QueryShape::classify("a{} / b{}"), (QueryShape::Labeled, 2));
    }

    #[test]
    fn test_embed_plain() {
        let e = embed("kube_node_info").unwrap();
        assert_eq!(e.shape(), QueryShape::Plain);
        assert_eq!(e.text(), format!("kube_node_info{{,{FILTER_MARKER}}}"));
    }

    #[test]
    fn test_embed_aggregator() {
        let e = embed("sum(kube_pod_info) by (namespace)").unwrap();
        assert_eq!(e.shape(), QueryShape::Aggregator);
        assert_eq!(
            e.text(),
            format!("sum(kube_pod_info{{,{FILTER_MARKER}}}) by (namespace,{NAMES_MARKER})")
        );
    }

    #[test]
    fn test_embed_aggregator_skips_prefix_grouping() {
        let e = embed("sum by (namespace) (kube_pod_info)").unwrap();
        assert_eq!(
            e.materialize(&filter("env", r#"env="a""#)),
            r#"sum by (namespace,env) (kube_pod_info{env="a"})"#
        );
    }

    #[test]
    fn test_embed_aggregator_before_range_window() {
        let e = embed("sum(rate(metric[5m])) by (pod)").unwrap();
        assert_eq!(
            e.materialize(&filter("env", r#"env="a""#)),
            r#"sum(rate(metric{env="a"}[5m])) by (pod,env)"#
        );
        assert_eq!(e.materialize(&LabelFilter::empty()), "sum(rate(metric[5m])) by (pod)");
    }

    #[test]
    fn test_embed_labeled() {
        let e = embed(r#"rate(x{job="a"}[5m]) / y{}"#).unwrap();
        assert_eq!(e.shape(), QueryShape::Labeled);
        assert_eq!(e.blocks(), 2);
        assert_eq!(
            e.materialize(&filter("env", r#"env="p""#)),
            r#"rate(x{job="a",env="p"}[5m]) / y{env="p"}"#
        );
    }

    #[test]
    fn test_empty_filter_restores_template() {
        for template in [
            "up",
            "sum(kube_pod_info) by (namespace)",
            "sum by (namespace) (kube_pod_info)",
            r#"rate(container_cpu_usage_seconds_total{container!=""}[5m])"#,
            r#"max(count_over_time(up{job="a"}[1h])) by (job)"#,
            r#"a{x="1"} * on() group_left b{y="2"}"#,
        ] {
            let e = embed(template).unwrap();
            assert_eq!(e.materialize(&LabelFilter::empty()), template, "template {template}");
        }
    }

    #[test]
    fn test_blocks_materialize_in_order() {
        let e = embed(r#"a{x="1"} + b{} + c{y="2"}"#).unwrap();
        let filters = [
            filter("env", r#"env="one""#),
            filter("env", r#"env="two""#),
            filter("env", r#"env="three""#),
        ];
        assert_eq!(
            e.materialize_blocks(&filters),
            r#"a{x="1",env="one"} + b{env="two"} + c{y="2",env="three"}"#
        );
    }

    #[test]
    fn test_embed_errors() {
        assert_eq!(embed("  "), Err(TemplateError::Empty));
        assert!(matches!(
            embed(&format!("up{{{FILTER_MARKER}}}")),
            Err(TemplateError::ReservedMarker { .. })
        ));
        assert!(matches!(
            embed("sum(up{)"),
            Err(TemplateError::DelimiterCount { delimiter: '}', expected: 1, found: 0, .. })
        ));
        assert!(matches!(
            embed("sum(up"),
            Err(TemplateError::DelimiterCount { delimiter: ')', .. })
        ));
        assert!(matches!(
            embed("sum(up) by (job"),
            Err(TemplateError::DelimiterCount { .. })
        ));
        assert!(matches!(
            embed(") by ("),
            Err(TemplateError::UnterminatedGrouping { .. })
        ));
    }

    #[test]
    fn test_cleanup_artifacts() {
        assert_eq!(cleanup("x{,,}"), "x");
        assert_eq!(cleanup("sum(x) by ( )"), "sum(x)");
        assert_eq!(cleanup("x + ()"), "x +");
        assert_eq!(cleanup("sum(x) by (a,,b,)"), "sum(x) by (a,b)");
        assert_eq!(cleanup("vector(1) * on() x"), "vector(1) * on() x");
    }

    #[test]
    fn test_cleanup_keeps_string_literals() {
        assert_eq!(cleanup(r#"x{path=~"a,,b|(,c)",}"#), r#"x{path=~"a,,b|(,c)"}"#);
        let relabel = r#"label_replace(x, "dst", "$1", "src", "()")"#;
        assert_eq!(cleanup(relabel), relabel);
        assert_eq!(cleanup(r#"x{a="{}",,b='(,)'}"#), r#"x{a="{}",b='(,)'}"#);
    }

    #[test]
    fn test_cache_reuses_embedders() {
        let cache = EmbedderCache::new();
        cache.embed("a{}").unwrap();
        cache.embed("b{}").unwrap();
        cache.embed("a{} + b{}").unwrap();
        cache.embed("sum(up)").unwrap();
        assert_eq!(cache.len(), 3);
        assert!(Arc::ptr_eq(
            &cache.get(QueryShape::Labeled, 1),
            &cache.get(QueryShape::Labeled, 1)
        ));
    }
}
