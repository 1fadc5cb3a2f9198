pub mod invoice;
pub mod job;
pub mod result;
pub mod verdict;

pub use invoice::{normalize_product_key, InvoiceDraft, LineItem};
pub use job::{JobKind, JobPayload, JobRequest, JobState, Payment};
pub use result::{
    AuditEntry, Decision, DecisionLookup, DecisionStatus, Impairment, ReasonCode, StageKind,
    StageOutcome, StageResults,
};
pub use verdict::{
    Anomaly, AnomalyType, ComplianceVerdict, FraudSignal, MarketVerdict, MatchType,
    ReconciliationMatch, Recommendation, Severity, TaxLine,
};
