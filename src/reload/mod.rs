//! Build-in-progress coordination shared by the stream lifecycle's
//! debounce/classify pipeline (spec.md §4.8.1).

pub mod guard;

pub use guard::BuildGuard;
