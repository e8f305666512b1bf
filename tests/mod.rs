mod common;

mod dedup_tests;
mod orchestrator_tests;
