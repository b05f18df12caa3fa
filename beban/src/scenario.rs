use std::marker::PhantomData;

use typed_builder::TypedBuilder;

use crate::{error::IterationResult, threshold::Thresholds, vu::Vu};

/// A named iteration function plus the thresholds that judge it.
///
/// ```rust,no_run
/// use beban::{IterationError, Scenario, Vu};
///
/// let scenario = Scenario::builder()
///     .name("read item list")
///     .action(|vu: Vu| async move {
///         let outcome = vu.get("/items").await?;
///         vu.check_that("Status is 200", outcome.status == 200);
///         Ok::<_, IterationError>(())
///     })
///     .build();
/// # let _ = scenario;
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    #[builder(default)]
    pub thresholds: Thresholds,
    #[builder(default, setter(skip))]
    iteration: PhantomData<fn() -> Fut>,
}
