// Test modules for Natmapper
// Network-facing pieces are exercised against the in-process fakes in `support`

mod support;

mod events_tests;
mod monitor_tests;
mod nat_tests;
mod service_tests;
mod storage_tests;
