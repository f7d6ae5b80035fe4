//! Scenario stories against a real mesh
//!
//! # Test Organization
//!
//! - `live_scenarios`: Stories about the built-in pod client/server suite,
//!   run through the Kubernetes environment and `kubectl exec`
//!
//! # Running These Tests
//!
//! ```bash
//! # Everything (~4 minutes per scenario in the worst case)
//! cargo test --test kind -- --ignored --nocapture
//!
//! # One protocol only
//! cargo test --test kind tcp -- --ignored --nocapture
//! ```

mod live_scenarios;
