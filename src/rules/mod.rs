pub mod store;
pub mod tables;

pub use store::RuleStore;
pub use tables::{
    CrossBorderRule, FraudPolicy, Jurisdiction, MarketPolicy, ReconciliationPolicy, RuleTables,
    TaxComponent,
};
