pub mod aggregate;
pub mod collaborators;
pub mod compliance;
pub mod correlation;
pub mod extraction;
pub mod fraud;
pub mod market;
pub mod orchestrator;
pub mod reconciliation;

pub use collaborators::{
    AdvisoryModel, HttpAdvisoryModel, HttpNarrator, HttpOcrClient, ModelAssessment,
    NarrativeCollaborator, OcrCollaborator, OcrResponse,
};
pub use correlation::{Correlation, PaymentBook};
pub use extraction::{validate_request, ExtractionStage};
pub use orchestrator::{Collaborators, Orchestrator};
