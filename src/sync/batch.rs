//! Fixed-size batching of subscriber sets, bounding upstream fan-out.

/// Split `items` into groups of `size`, last group possibly smaller.
/// Ordering is preserved. A zero size is a contract violation.
pub fn batch<T>(items: Vec<T>, size: usize) -> anyhow::Result<Vec<Vec<T>>> {
    if size == 0 {
        anyhow::bail!("batch size must be greater than zero");
    }

    let mut groups = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            groups.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_determinism() {
        let groups = batch(vec![1, 2, 3, 4, 5, 6, 7], 3).unwrap();
        assert_eq!(groups, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[test]
    fn test_exact_multiple_has_no_short_tail() {
        let groups = batch(vec![1, 2, 3, 4], 2).unwrap();
        assert_eq!(groups, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_empty_input_yields_no_groups() {
        let groups = batch(Vec::<i32>::new(), 5).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_zero_size_fails_fast() {
        assert!(batch(vec![1, 2, 3], 0).is_err());
    }
}
