//! Integration tests for the Silt cores.
//!
//! All tests live in `tests/`; this library is intentionally empty.
