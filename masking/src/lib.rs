//! TLS-aware payload masking for TCP streams in capture files.
//!
//! Two halves cooperate:
//!
//! - [`mark::analyze`] reads a (preferably reassembled) capture and derives a
//!   [`ruleset::KeepRuleSet`]: for every TCP flow direction, the absolute
//!   sequence ranges whose payload bytes must survive. TLS record headers
//!   and non-ApplicationData records are kept, ApplicationData bodies are
//!   not.
//! - [`apply::apply`] streams the *original* capture and rewrites every TCP
//!   payload byte not covered by a keep range to zero, leaving frame count,
//!   ordering, lengths, headers, and timestamps untouched and recomputing
//!   the checksums that cover the rewritten bytes.

pub mod apply;
pub mod flow;
pub mod mark;
pub mod ruleset;
pub mod stream;
pub mod tls;

pub use crate::{
    apply::{apply, ApplyConfig, ApplyStats, Cancelled, UnanalyzedPolicy},
    flow::{BidiKey, FlowKey},
    mark::{analyze, MarkStats, RecordTypeCounts},
    ruleset::{KeepRule, KeepRuleSet, RuleSetBuilder},
};
