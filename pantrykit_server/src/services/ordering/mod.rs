pub mod driver;
pub mod pipeline;
pub mod ranking;

#[cfg(test)]
pub mod test_support;

pub use driver::{AutomationDriver, ProductCandidate, SavedOption};
pub use pipeline::{
  CheckoutSelection, FailureKind, ListNormalizer, OrderingOrchestrator, OrderingReport,
  OrderingRequest, PassthroughNormalizer,
};
pub use ranking::{rank_candidates, RankingContext};
