pub mod launcher;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;
