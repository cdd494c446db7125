mod common;

mod ordering_tests;
mod peer_manager_tests;
mod service_tests;
