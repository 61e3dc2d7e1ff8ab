#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("arity mismatch: {left} {left_name} vs {right} {right_name}")]
    ArityMismatch {
        left_name: &'static str,
        left: usize,
        right_name: &'static str,
        right: usize,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fails with [`Error::ArityMismatch`] unless both slices have the same length.
pub fn check_arity<A, B>(
    left_name: &'static str,
    left: &[A],
    right_name: &'static str,
    right: &[B],
) -> Result<(), Error> {
    if left.len() != right.len() {
        return Err(Error::ArityMismatch {
            left_name,
            left: left.len(),
            right_name,
            right: right.len(),
        });
    }
    Ok(())
}
