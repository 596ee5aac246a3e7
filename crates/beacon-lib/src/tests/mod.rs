pub use test_utils::*;
