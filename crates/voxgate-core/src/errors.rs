/// Why a high-level action was refused. Classifies failures the way callers
/// need to handle them: fix the request, wait for a chat, or wait for the
/// reconnect loop. Actions are never queued on the caller's behalf.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("upstream engine unavailable")]
    UpstreamUnavailable,
}

impl ActionError {
    /// Short classification string for wire responses and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::UpstreamUnavailable => "upstream_unavailable",
        }
    }
}
