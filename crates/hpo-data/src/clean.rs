use hpo_types::Frame;

/// Drop every row that has at least one missing field.
///
/// Partition boundaries are kept, so a partition may end up empty.
pub fn drop_missing(frame: &Frame) -> Frame {
    frame.map_partitions(|part| part.filter_rows(|r| part.row_is_complete(r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::Partition;

    #[test]
    fn drops_incomplete_rows_in_every_partition() {
        let p0 = Partition::new(vec![
            vec![Some(1.0), None, Some(3.0)],
            vec![Some(0.0), Some(1.0), Some(1.0)],
        ])
        .unwrap();
        let p1 = Partition::new(vec![vec![None], vec![Some(0.0)]]).unwrap();
        let frame = Frame::new(vec!["a".into(), "y".into()], vec![p0, p1]).unwrap();

        let clean = drop_missing(&frame);
        assert_eq!(clean.n_partitions(), 2);
        assert_eq!(clean.len(), 2);
        assert!(clean.partitions()[1].is_empty());
        assert_eq!(clean.partitions()[0].column(0), &[Some(1.0), Some(3.0)]);
        // source frame is untouched
        assert_eq!(frame.len(), 4);
    }
}
