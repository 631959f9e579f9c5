// Consolidated integration test harness.
//
// Each `tests/*.rs` file becomes a separate integration test binary, so the crate
// keeps a single harness file that `mod`s the rest of the suite.
mod harness;
mod suite;
