//! API DTOs used by the host-agent.

pub use common::api::{
    ApplyReportRequest, ApplyReportResponse, ApplyStatus, ErrorBody, Plan, Protocol, TlsMode,
    Transport, VersionPollResponse, error_codes,
};
