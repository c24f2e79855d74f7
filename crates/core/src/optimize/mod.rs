pub mod constant_fold;
pub mod matcher;
pub mod rewriter;
