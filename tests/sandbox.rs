//! Integration tests for `src/sandbox/`.

#[path = "sandbox/materialize_test.rs"]
mod materialize_test;
#[path = "sandbox/topology_test.rs"]
mod topology_test;
