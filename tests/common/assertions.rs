use quiver::error::{ErrorKind, QuiverError};

/// Assert that `result` failed with an `InvalidArgument`-kind error.
pub fn assert_invalid<T: std::fmt::Debug>(result: Result<T, QuiverError>) {
    match result {
        Err(e) => assert_eq!(
            e.kind(),
            ErrorKind::InvalidArgument,
            "expected an invalid-argument error, got: {e}"
        ),
        Ok(v) => panic!("expected an invalid-argument error, got Ok({v:?})"),
    }
}

/// Assert that `result` failed with an engine-kind error whose message
/// contains `needle`.
pub fn assert_engine_error<T: std::fmt::Debug>(result: Result<T, QuiverError>, needle: &str) {
    match result {
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::Engine, "expected an engine error, got: {e}");
            assert!(
                e.to_string().contains(needle),
                "engine error '{e}' does not mention '{needle}'"
            );
        }
        Ok(v) => panic!("expected an engine error, got Ok({v:?})"),
    }
}

/// Assert that recall@k is at least `min_recall`.
pub fn assert_recall_at_k(results: &[i64], ground_truth: &[i64], k: usize, min_recall: f64) {
    let truth = &ground_truth[..k.min(ground_truth.len())];
    let found = results
        .iter()
        .take(k)
        .filter(|id| truth.contains(id))
        .count();
    let recall = found as f64 / truth.len() as f64;
    assert!(
        recall >= min_recall,
        "recall@{k} = {recall:.3}, expected >= {min_recall:.3} (found {found}/{})",
        truth.len()
    );
}
