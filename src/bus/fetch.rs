use crate::errors::GatewayError;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use tokio::sync::OnceCell;

type FetchFn = Box<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>, GatewayError>> + Send + Sync>;

/// A deferred, single-execution image fetch: constructed without executing,
/// executed at most once, result cached for repeat access. A failed fetch is
/// not cached, so a later caller may observe a retry.
pub struct CardImageFetch {
    fetch: FetchFn,
    cached: OnceCell<Vec<u8>>,
}

impl CardImageFetch {
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, GatewayError>> + Send + 'static,
    {
        Self {
            fetch: Box::new(move || Box::pin(fetch())),
            cached: OnceCell::new(),
        }
    }

    /// Binary image data, downloading on first access only.
    pub async fn bytes(&self) -> Result<&[u8], GatewayError> {
        self.cached
            .get_or_try_init(|| (self.fetch)())
            .await
            .map(Vec::as_slice)
    }
}

impl fmt::Debug for CardImageFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardImageFetch")
            .field("fetched", &self.cached.initialized())
            .finish_non_exhaustive()
    }
}
