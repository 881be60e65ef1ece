//! Row selection for one grid axis.
//!
//! An explicit index list narrows the axis first; a limit then truncates
//! the result. Selected rows keep their original file index so ledger
//! coordinates stay stable across different selections.

use crate::error::CoreError;

/// One selected row together with its index in the source file.
#[derive(Debug, Clone)]
pub struct SelectedRow<T> {
    pub index: usize,
    pub value: T,
}

/// Parse a comma-separated index list.
///
/// Returns `None` when no list was given. Duplicates are removed while
/// preserving first-seen order; anything other than a non-negative
/// integer is a validation error.
pub fn parse_indexes(raw: Option<&str>, axis: &str) -> Result<Option<Vec<usize>>, CoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let tokens: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();
    if tokens.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let mut unique = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for token in tokens {
        let value: usize = token
            .parse()
            .ok()
            .filter(|_| token.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "--{axis}-indexes only accepts non-negative integers: {raw}"
                ))
            })?;
        if seen.insert(value) {
            unique.push(value);
        }
    }
    Ok(Some(unique))
}

/// Select rows for one axis: explicit indexes first, then limit.
pub fn select_rows<T: Clone>(
    rows: &[T],
    limit: Option<usize>,
    indexes_raw: Option<&str>,
    axis: &str,
) -> Result<Vec<SelectedRow<T>>, CoreError> {
    let mut selected: Vec<SelectedRow<T>> = match parse_indexes(indexes_raw, axis)? {
        Some(indexes) => {
            let mut picked = Vec::with_capacity(indexes.len());
            for index in indexes {
                if index >= rows.len() {
                    return Err(CoreError::Validation(format!(
                        "--{axis}-indexes contains an out-of-range index: {index} (max {})",
                        rows.len().saturating_sub(1)
                    )));
                }
                picked.push(SelectedRow {
                    index,
                    value: rows[index].clone(),
                });
            }
            picked
        }
        None => rows
            .iter()
            .enumerate()
            .map(|(index, value)| SelectedRow {
                index,
                value: value.clone(),
            })
            .collect(),
    };

    if let Some(limit) = limit {
        selected.truncate(limit);
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_selection_keeps_all_rows_in_order() {
        let rows = vec!["a", "b", "c"];
        let selected = select_rows(&rows, None, None, "x").unwrap();
        let indexes: Vec<usize> = selected.iter().map(|row| row.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn index_list_dedups_and_preserves_order() {
        let parsed = parse_indexes(Some("2, 0,2, 1"), "x").unwrap().unwrap();
        assert_eq!(parsed, vec![2, 0, 1]);
    }

    #[test]
    fn empty_index_list_selects_nothing() {
        let rows = vec!["a", "b"];
        let selected = select_rows(&rows, None, Some(" , "), "y").unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let rows = vec!["a", "b"];
        let err = select_rows(&rows, None, Some("5"), "y").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn negative_or_garbage_index_is_rejected() {
        assert!(parse_indexes(Some("-1"), "x").is_err());
        assert!(parse_indexes(Some("two"), "x").is_err());
    }

    #[test]
    fn limit_truncates_after_index_selection() {
        let rows = vec!["a", "b", "c", "d"];
        let selected = select_rows(&rows, Some(2), Some("3,1,0"), "x").unwrap();
        let indexes: Vec<usize> = selected.iter().map(|row| row.index).collect();
        assert_eq!(indexes, vec![3, 1]);
    }
}
