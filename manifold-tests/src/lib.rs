//! End-to-end tests for the Manifold proxy live under `tests/`.
