pub(crate) mod interval;
mod random;
mod solution;

pub use interval::Interval;
pub use random::Random;
pub use solution::Solution;

#[cfg(test)]
pub(crate) use random::tests::TestRandom;
