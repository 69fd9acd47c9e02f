/// Splits items into at most `n` contiguous batches of `ceil(len / n)`.
///
/// Fewer than `n` batches come back when there are not enough items; no
/// batch is ever empty. `n == 0` is treated as 1.
pub fn split_into_n_batches<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let n = n.max(1);
    let size = items.len().div_ceil(n);
    items.chunks(size).map(<[T]>::to_vec).collect()
}

/// Splits items into contiguous batches of at most `size`.
pub fn split_into_batches<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split() {
        let items: Vec<_> = (0..12).collect();
        let batches = split_into_n_batches(&items, 3);
        assert_eq!(batches, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9, 10, 11]]);
    }

    #[test]
    fn uneven_split_uses_ceiling() {
        let items: Vec<_> = (0..10).collect();
        let sizes: Vec<_> = split_into_n_batches(&items, 4).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn fewer_items_than_batches() {
        let items: Vec<_> = (0..5).collect();
        let batches = split_into_n_batches(&items, 4);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| !b.is_empty()));

        let batches = split_into_n_batches(&[1, 2], 8);
        assert_eq!(batches, vec![vec![1], vec![2]]);
    }

    #[test]
    fn preserves_order_and_items() {
        let items: Vec<_> = (0..37).collect();
        let flat: Vec<_> = split_into_n_batches(&items, 5).into_iter().flatten().collect();
        assert_eq!(flat, items);
    }

    #[test]
    fn empty_and_zero() {
        assert!(split_into_n_batches::<u8>(&[], 4).is_empty());
        assert_eq!(split_into_n_batches(&[1, 2, 3], 0), vec![vec![1, 2, 3]]);
        assert_eq!(split_into_batches(&[1, 2, 3, 4, 5], 2), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }
}
