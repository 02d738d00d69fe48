//! Result assembly: multi-key sort, pagination and live-quote enrichment

use crate::providers::QuoteLookup;
use crate::types::{FieldValue, ScreenedRow, SortDirection, SortKey};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Sort applied when a request names none, on either route
pub const DEFAULT_SORT_FIELD: &str = "total_mv";

/// Keys a result set is actually ordered by: `total_mv` descending when none
/// are given, then `symbol` ascending to break ties as the store does
pub fn effective_sort(keys: &[SortKey]) -> Vec<SortKey> {
    let mut effective = if keys.is_empty() {
        vec![SortKey::desc(DEFAULT_SORT_FIELD)]
    } else {
        keys.to_vec()
    };
    if !effective.iter().any(|k| k.field == "symbol") {
        effective.push(SortKey::asc("symbol"));
    }
    effective
}

/// Sort rows by `keys`, first key taking priority.
///
/// Later keys are applied first with a stable sort so earlier keys win.
/// Rows missing a key (or holding NaN) always go last, whatever the
/// direction. Numbers order before text when a field mixes both.
pub fn sort_rows(rows: &mut [ScreenedRow], keys: &[SortKey]) {
    for key in keys.iter().rev() {
        rows.sort_by(|a, b| compare_field(a, b, key));
    }
}

fn compare_field(a: &ScreenedRow, b: &ScreenedRow, key: &SortKey) -> Ordering {
    let value = |row: &ScreenedRow| -> Option<FieldValue> {
        if key.field == "symbol" {
            return Some(FieldValue::Text(row.symbol.clone()));
        }
        row.get(&key.field).filter(|v| !v.is_nan()).cloned()
    };

    match (value(a), value(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ord = compare_values(&x, &y);
            match key.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        }
    }
}

fn compare_values(a: &FieldValue, b: &FieldValue) -> Ordering {
    match (a, b) {
        (FieldValue::Number(x), FieldValue::Number(y)) => x.total_cmp(y),
        (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
        (FieldValue::Number(_), FieldValue::Text(_)) => Ordering::Less,
        (FieldValue::Text(_), FieldValue::Number(_)) => Ordering::Greater,
    }
}

/// Contiguous page starting at `offset`, at most `limit` long
pub fn paginate(rows: Vec<ScreenedRow>, limit: u64, offset: u64) -> Vec<ScreenedRow> {
    let saturate = |n: u64| usize::try_from(n).unwrap_or(usize::MAX);
    rows.into_iter()
        .skip(saturate(offset))
        .take(saturate(limit))
        .collect()
}

/// Sort all matches by `effective_sort(keys)` and cut one page; `total`
/// counts every match
pub fn assemble(
    mut matches: Vec<ScreenedRow>,
    keys: &[SortKey],
    limit: u64,
    offset: u64,
) -> (Vec<ScreenedRow>, u64) {
    let total = matches.len() as u64;
    sort_rows(&mut matches, &effective_sort(keys));
    (paginate(matches, limit, offset), total)
}

/// Refresh price fields from live quotes. A lookup failure is logged and the
/// rows are returned untouched.
pub async fn enrich_with_quotes(rows: &mut [ScreenedRow], quotes: &dyn QuoteLookup) {
    if rows.is_empty() {
        return;
    }

    let symbols: Vec<String> = rows.iter().map(|r| r.symbol.clone()).collect();
    match quotes.batch_get(&symbols).await {
        Ok(found) => {
            for row in rows.iter_mut() {
                if let Some(quote) = found.get(&row.symbol) {
                    quote.apply_to(row);
                }
            }
            debug!(rows = rows.len(), quoted = found.len(), "Enriched rows with live quotes");
        }
        Err(e) => {
            warn!(rows = rows.len(), error = %e, "Quote enrichment failed, returning rows as-is");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Quote;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn row(symbol: &str, pe: Option<f64>, industry: &str) -> ScreenedRow {
        let mut r = ScreenedRow::new(symbol);
        if let Some(pe) = pe {
            r.set("pe", pe.into());
        }
        r.set("industry", industry.into());
        r
    }

    fn symbols(rows: &[ScreenedRow]) -> Vec<&str> {
        rows.iter().map(|r| r.symbol.as_str()).collect()
    }

    #[test]
    fn test_none_sorts_last_both_directions() {
        let mut rows = vec![
            row("a", None, "x"),
            row("b", Some(3.0), "x"),
            row("c", Some(f64::NAN), "x"),
            row("d", Some(1.0), "x"),
        ];
        sort_rows(&mut rows, &[SortKey::asc("pe")]);
        assert_eq!(&symbols(&rows)[..2], &["d", "b"]);
        sort_rows(&mut rows, &[SortKey::desc("pe")]);
        assert_eq!(&symbols(&rows)[..2], &["b", "d"]);
        assert!(symbols(&rows)[2..].iter().all(|s| *s == "a" || *s == "c"));
    }

    #[test]
    fn test_earlier_keys_take_priority() {
        let mut rows = vec![
            row("a", Some(2.0), "银行"),
            row("b", Some(1.0), "保险"),
            row("c", Some(3.0), "银行"),
            row("d", Some(0.5), "保险"),
        ];
        sort_rows(&mut rows, &[SortKey::asc("industry"), SortKey::desc("pe")]);
        assert_eq!(symbols(&rows), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn test_pagination_invariant() {
        let rows: Vec<ScreenedRow> = (0..7)
            .map(|i| row(&format!("{i:06}"), Some(i as f64), "x"))
            .collect();
        let (full, total) = assemble(rows.clone(), &[SortKey::asc("pe")], 100, 0);
        for (limit, offset) in [(3, 0), (3, 3), (3, 6), (5, 10), (0, 2)] {
            let (page, t) = assemble(rows.clone(), &[SortKey::asc("pe")], limit, offset);
            assert_eq!(t, total);
            assert!(page.len() as u64 <= limit);
            let start = (offset as usize).min(full.len());
            assert_eq!(page, full[start..(start + page.len())].to_vec());
        }
        assert_eq!(total, 7);
    }

    #[test]
    fn test_default_order_and_tie_break() {
        let mut rows = vec![
            row("600000", Some(1.0), "x"),
            row("000002", Some(1.0), "x"),
            row("000001", Some(1.0), "x"),
        ];
        rows[0].set("total_mv", 15.0.into());
        rows[1].set("total_mv", 900.0.into());
        let (page, total) = assemble(rows.clone(), &[], 10, 0);
        assert_eq!(total, 3);
        assert_eq!(symbols(&page), vec!["000002", "600000", "000001"]);

        let (page, _) = assemble(rows, &[SortKey::asc("pe")], 10, 0);
        assert_eq!(symbols(&page), vec!["000001", "000002", "600000"]);

        assert_eq!(
            effective_sort(&[SortKey::desc("symbol")]),
            vec![SortKey::desc("symbol")]
        );
    }

    #[test]
    fn test_huge_offset_is_empty() {
        let rows = vec![row("a", Some(1.0), "x")];
        assert!(assemble(rows, &[], 10, u64::MAX).0.is_empty());
    }

    struct FakeQuotes(Option<HashMap<String, Quote>>);

    #[async_trait]
    impl QuoteLookup for FakeQuotes {
        async fn batch_get(&self, _symbols: &[String]) -> anyhow::Result<HashMap<String, Quote>> {
            self.0.clone().ok_or_else(|| anyhow::anyhow!("quote feed down"))
        }
    }

    #[tokio::test]
    async fn test_enrichment_missing_and_failed() {
        let mut rows = vec![row("a", Some(1.0), "x"), row("b", Some(2.0), "x")];
        let quotes = FakeQuotes(Some(HashMap::from([(
            "a".to_string(),
            Quote {
                close: Some(10.0),
                ..Default::default()
            },
        )])));
        enrich_with_quotes(&mut rows, &quotes).await;
        assert_eq!(rows[0].get("close"), Some(&FieldValue::Number(10.0)));
        assert!(rows[1].get("close").is_none());

        let before = rows.clone();
        enrich_with_quotes(&mut rows, &FakeQuotes(None)).await;
        assert_eq!(rows, before);
    }
}
