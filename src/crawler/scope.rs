// Cancellation scope: children run concurrently, the first failure aborts the rest.

use std::future::Future;

use tokio::task::JoinSet;

use super::CrawlError;

pub struct TaskScope<T> {
    set: JoinSet<Result<T, CrawlError>>,
}

impl<T: Send + 'static> Default for TaskScope<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskScope<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Result<T, CrawlError>> + Send + 'static,
    {
        self.set.spawn(fut);
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Next finished child in completion order; `None` once the scope is empty.
    /// An error (or a panicked child) aborts every outstanding sibling before it is returned.
    pub async fn next(&mut self) -> Option<Result<T, CrawlError>> {
        let joined = self.set.join_next().await?;
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(CrawlError::Join(e.to_string())),
        };
        if result.is_err() {
            self.set.abort_all();
        }
        Some(result)
    }
}
