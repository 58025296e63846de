//! Test doubles for the sandbox backend and the reasoning capabilities

pub mod mock_backend;
pub mod mock_capabilities;

pub use mock_backend::{MockBackend, MockInvocation, MockRun, MockState};
pub use mock_capabilities::{
    GeneratorCalls, MockCapabilities, MockClassifier, MockGenerator, MockRanker, MockReporter,
};
