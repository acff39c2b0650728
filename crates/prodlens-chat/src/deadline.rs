use std::future::Future;
use std::time::Duration;

use prodlens_core::error::{ProdLensError, Result};

/// Run a collaborator call with an upper bound on its duration.
///
/// Expiry is reported as [`ProdLensError::Timeout`] so callers treat it like
/// any other failure of that call.
pub(crate) async fn bounded<T, F>(secs: u64, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), call).await {
        Ok(result) => result,
        Err(_) => Err(ProdLensError::Timeout(secs)),
    }
}
